//! Ordered, bounded, optionally persistent queue of formatted entries.
//!
//! The buffer is an actor pair, the same shape as the rest of the agent's
//! services: a [`BufferService`] task exclusively owns the storage backend
//! and processes commands sequentially, while cloneable [`BufferHandle`]s
//! let any number of producers hand entries off without blocking.
//!
//! ```text
//!    producers ──store──►┐
//!                        │  command channel (FIFO)
//!    dispatcher ──fetch──┼──────────► BufferService ──► BufferBackend
//!               ──delete─┘                               (disk | memory)
//! ```
//!
//! Sequential command processing gives the ordering guarantees for free:
//! inserts, overflow evictions and delivery deletes never interleave, and
//! a reader always observes the keyspace as of some point in the command
//! stream.
//!
//! # Overflow
//!
//! When the buffer already holds `max_buffer_size` entries, the next
//! insert first evicts the oldest tenth (at least one entry) in a single
//! batch. Producers never see an error; drops are counted in
//! [`BufferStats`] and logged.

mod backend;
mod disk;
pub mod key;
mod memory;

pub use backend::BufferError;
pub use key::{BufferKey, KeyGenerator};

pub(crate) use backend::BufferBackend;
pub(crate) use disk::DiskBuffer;
pub(crate) use memory::MemoryBuffer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::event::Level;

/// The unit of buffered work: one formatted log line plus its Loki
/// stream identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Nanoseconds since epoch.
    pub timestamp_ns: i64,
    /// Severity the entry was logged at.
    pub level: Level,
    /// Rendered message text.
    pub message: String,
    /// Stream identity; low cardinality, never empty.
    pub labels: BTreeMap<String, String>,
    /// Non-indexed per-line metadata; emitted only when non-empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub structured_metadata: BTreeMap<String, String>,
}

/// Monotonic counters describing buffer traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Entries accepted by `store`.
    pub stored: u64,
    /// Entries evicted by the overflow policy.
    pub dropped: u64,
    /// Entries removed after a successful push.
    pub delivered: u64,
}

enum BufferCommand {
    Store(Entry),
    FetchBatch {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<(BufferKey, Entry)>, BufferError>>,
    },
    DeleteUpTo {
        key: BufferKey,
        reply: oneshot::Sender<Result<usize, BufferError>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<BufferStats>,
    },
    SetMaxSize(usize),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for talking to a running buffer service.
#[derive(Clone, Debug)]
pub struct BufferHandle {
    tx: mpsc::UnboundedSender<BufferCommand>,
}

impl BufferHandle {
    /// Stores an entry. Non-blocking, fire-and-forget: a fresh key is
    /// assigned and overflow enforced inside the service task, and
    /// failures never reach the producer.
    pub fn store(&self, entry: Entry) {
        if self.tx.send(BufferCommand::Store(entry)).is_err() {
            warn!("buffer service stopped; dropping entry");
        }
    }

    /// Returns the `limit` smallest-keyed entries in ascending order
    /// without removing them.
    pub async fn fetch_batch(&self, limit: usize) -> Result<Vec<(BufferKey, Entry)>, BufferError> {
        self.request(|reply| BufferCommand::FetchBatch { limit, reply })
            .await?
    }

    /// Deletes every entry with key `<= key`; returns how many were
    /// removed.
    pub async fn delete_up_to(&self, key: BufferKey) -> Result<usize, BufferError> {
        self.request(|reply| BufferCommand::DeleteUpTo { key, reply })
            .await?
    }

    /// Current number of buffered entries.
    pub async fn count(&self) -> Result<usize, BufferError> {
        self.request(|reply| BufferCommand::Count { reply }).await
    }

    /// Traffic counters since the service started.
    pub async fn stats(&self) -> Result<BufferStats, BufferError> {
        self.request(|reply| BufferCommand::Stats { reply }).await
    }

    /// Updates the overflow threshold on the running service.
    pub fn set_max_size(&self, max_buffer_size: usize) {
        let _ = self.tx.send(BufferCommand::SetMaxSize(max_buffer_size));
    }

    /// Stops the service and releases backend resources; resolves once
    /// the backend is closed. Safe to call on an already-stopped service.
    pub async fn shutdown(&self) -> Result<(), BufferError> {
        match self.request(|reply| BufferCommand::Shutdown { reply }).await {
            Ok(()) => Ok(()),
            // Already gone: shutdown is idempotent.
            Err(BufferError::ServiceStopped) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> BufferCommand,
    ) -> Result<T, BufferError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .map_err(|_| BufferError::ServiceStopped)?;
        reply_rx.await.map_err(|_| BufferError::ServiceStopped)
    }
}

/// Service task owning the storage backend and the key generator.
pub(crate) struct BufferService {
    backend: Box<dyn BufferBackend>,
    keys: KeyGenerator,
    max_buffer_size: usize,
    stats: BufferStats,
    rx: mpsc::UnboundedReceiver<BufferCommand>,
}

impl BufferService {
    /// Spawns a service over the given backend and returns its handle.
    pub(crate) fn spawn(
        backend: Box<dyn BufferBackend>,
        keys: KeyGenerator,
        max_buffer_size: usize,
    ) -> BufferHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = BufferService {
            backend,
            keys,
            max_buffer_size,
            stats: BufferStats::default(),
            rx,
        };
        tokio::spawn(service.run());
        BufferHandle { tx }
    }

    async fn run(mut self) {
        debug!("buffer service started");
        while let Some(command) = self.rx.recv().await {
            match command {
                BufferCommand::Store(entry) => self.store(entry),
                BufferCommand::FetchBatch { limit, reply } => {
                    let _ = reply.send(self.backend.fetch_batch(limit));
                }
                BufferCommand::DeleteUpTo { key, reply } => {
                    let result = self.backend.delete_up_to(key);
                    if let Ok(removed) = &result {
                        self.stats.delivered += *removed as u64;
                    }
                    let _ = reply.send(result);
                }
                BufferCommand::Count { reply } => {
                    let _ = reply.send(self.backend.count());
                }
                BufferCommand::Stats { reply } => {
                    let _ = reply.send(self.stats);
                }
                BufferCommand::SetMaxSize(max) => {
                    self.max_buffer_size = max;
                }
                BufferCommand::Shutdown { reply } => {
                    self.close();
                    let _ = reply.send(());
                    return;
                }
            }
        }
        // All handles dropped without an explicit shutdown.
        self.close();
    }

    fn store(&mut self, entry: Entry) {
        if self.backend.count() >= self.max_buffer_size {
            let evict = (self.max_buffer_size / 10).max(1);
            match self.backend.evict_smallest(evict) {
                Ok(evicted) => {
                    self.stats.dropped += evicted as u64;
                    warn!(
                        evicted,
                        max_buffer_size = self.max_buffer_size,
                        "buffer full, dropped oldest entries"
                    );
                }
                Err(e) => error!(error = %e, "buffer eviction failed"),
            }
        }

        let key = self.keys.next_key();
        match self.backend.insert(key, &entry) {
            Ok(()) => self.stats.stored += 1,
            Err(e) => error!(error = %e, "failed to store entry"),
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.backend.stop() {
            error!(error = %e, "failed to close buffer backend");
        }
        // The backend (and any file lock it holds) must be gone before a
        // shutdown reply lets the same directory be reopened.
        self.backend = Box::new(MemoryBuffer::new());
        debug!("buffer service stopped");
    }
}
