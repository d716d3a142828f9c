//! Timer-driven batch dispatcher.
//!
//! Each handler runs one dispatcher task. On every wake-up it claims the
//! smallest-keyed prefix of the buffer, pushes it to Loki, and deletes
//! the prefix only after the push succeeded, so delivery is at-least-once.
//! Failures leave the buffer untouched and stretch the next wake-up
//! exponentially.
//!
//! ```text
//!          ┌────────── sleep(next_interval) ──────────┐
//!          ▼                                          │
//!   count → fetch_batch → push ──ok──► delete prefix ─┤ failures := 0
//!                           │                         │
//!                           └─err──► failures += 1 ───┘ backoff
//! ```
//!
//! External calls (`flush`, `get_state`, `reconfigure`) arrive over the
//! command channel and are serialized against timer ticks by the single
//! service loop; there is never more than one push in flight per handler.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{BufferHandle, Entry};
use crate::client::{DeliveryError, LokiClient};
use crate::config::HandlerConfig;

/// Smallest flush fetch limit, used when `max_buffer_size` is lower.
const MIN_FLUSH_LIMIT: usize = 10_000;

/// Floor for the per-request HTTP timeout.
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The dispatcher task is no longer running (the handler is detaching or
/// already detached).
#[derive(Debug, Error)]
#[error("dispatcher service is not running")]
pub struct DispatcherStopped;

/// Parameter snapshot a dispatcher runs with; replaced on reconfigure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherParams {
    /// Maximum entries per timed push.
    pub batch_size: usize,
    /// Wake-up interval while pushes succeed.
    pub batch_interval: Duration,
    /// First retry delay after a failure.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
    /// Fetch limit for `flush`.
    pub flush_limit: usize,
}

impl DispatcherParams {
    /// Derives the snapshot from a handler configuration.
    #[must_use]
    pub fn from_config(config: &HandlerConfig) -> Self {
        DispatcherParams {
            batch_size: config.batch_size,
            batch_interval: Duration::from_millis(config.batch_interval_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            flush_limit: config.max_buffer_size.max(MIN_FLUSH_LIMIT),
        }
    }

    /// Per-request HTTP timeout: twice the batch interval, at least 5 s.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        (self.batch_interval * 2).max(MIN_REQUEST_TIMEOUT)
    }
}

/// Observable dispatcher state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherState {
    /// Failed pushes since the last success.
    pub consecutive_failures: u32,
    /// Delay the next wake-up will be scheduled with.
    pub next_interval: Duration,
}

/// Next wake-up delay: the batch interval while healthy, otherwise
/// `min(backoff_base × 2^min(n−1, 10), backoff_max)`. The exponent cap
/// keeps long outages from overflowing the shift.
fn backoff_interval(params: &DispatcherParams, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return params.batch_interval;
    }
    let exponent = (consecutive_failures - 1).min(10);
    params
        .backoff_base
        .saturating_mul(1u32 << exponent)
        .min(params.backoff_max)
}

enum DispatcherCommand {
    Flush {
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    GetState {
        reply: oneshot::Sender<DispatcherState>,
    },
    Reconfigure {
        params: DispatcherParams,
        client: LokiClient,
        reply: oneshot::Sender<()>,
    },
}

/// Handle owned by the handler instance; stops the task on shutdown.
#[derive(Debug)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    /// Fetches a large prefix and attempts one push, blocking the caller
    /// until the attempt resolves. An empty buffer succeeds immediately.
    /// Does not reset or reschedule the timer.
    pub async fn flush(&self) -> Result<Result<(), DeliveryError>, DispatcherStopped> {
        self.request(|reply| DispatcherCommand::Flush { reply })
            .await
    }

    /// Reads the failure counter and the upcoming interval.
    pub async fn get_state(&self) -> Result<DispatcherState, DispatcherStopped> {
        self.request(|reply| DispatcherCommand::GetState { reply })
            .await
    }

    /// Swaps the parameter snapshot and the push client. Takes effect
    /// from the next tick.
    pub async fn reconfigure(
        &self,
        params: DispatcherParams,
        client: LokiClient,
    ) -> Result<(), DispatcherStopped> {
        self.request(|reply| DispatcherCommand::Reconfigure {
            params,
            client,
            reply,
        })
        .await
    }

    /// Cancels the service and waits up to `grace` for it to finish; an
    /// in-flight push still running after the grace period is abandoned.
    /// Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("dispatcher did not stop within grace period, abandoning in-flight push");
                task.abort();
            }
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DispatcherCommand,
    ) -> Result<T, DispatcherStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .map_err(|_| DispatcherStopped)?;
        reply_rx.await.map_err(|_| DispatcherStopped)
    }
}

/// Service task; owns the push client and the failure counter.
pub(crate) struct DispatcherService {
    buffer: BufferHandle,
    client: LokiClient,
    params: DispatcherParams,
    consecutive_failures: u32,
    rx: mpsc::UnboundedReceiver<DispatcherCommand>,
    cancel: CancellationToken,
}

impl DispatcherService {
    /// Spawns a dispatcher over the given buffer and returns its handle.
    pub(crate) fn spawn(
        buffer: BufferHandle,
        client: LokiClient,
        params: DispatcherParams,
    ) -> DispatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let service = DispatcherService {
            buffer,
            client,
            params,
            consecutive_failures: 0,
            rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(service.run());
        DispatcherHandle {
            tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) {
        debug!("dispatcher started");
        let mut deadline = Instant::now() + self.params.batch_interval;
        loop {
            tokio::select! {
                () = sleep_until(deadline) => {
                    self.tick().await;
                    deadline = Instant::now() + self.next_interval();
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                () = self.cancel.cancelled() => break,
            }
        }
        debug!("dispatcher stopped");
    }

    async fn handle_command(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::Flush { reply } => {
                let result = self.dispatch(self.params.flush_limit).await;
                let _ = reply.send(result);
            }
            DispatcherCommand::GetState { reply } => {
                let _ = reply.send(DispatcherState {
                    consecutive_failures: self.consecutive_failures,
                    next_interval: self.next_interval(),
                });
            }
            DispatcherCommand::Reconfigure {
                params,
                client,
                reply,
            } => {
                self.params = params;
                self.client = client;
                let _ = reply.send(());
            }
        }
    }

    async fn tick(&mut self) {
        match self.buffer.count().await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "buffer unavailable, skipping tick");
                return;
            }
        }
        if let Err(e) = self.dispatch(self.params.batch_size).await {
            warn!(
                error = %e,
                consecutive_failures = self.consecutive_failures,
                next_interval_ms = self.next_interval().as_millis(),
                "push failed, backing off"
            );
        }
    }

    /// Claims up to `limit` entries, attempts one push, and reconciles
    /// the buffer with the outcome.
    async fn dispatch(&mut self, limit: usize) -> Result<(), DeliveryError> {
        let batch = match self.buffer.fetch_batch(limit).await {
            Ok(batch) => batch,
            Err(e) => {
                // Only happens while the handler is tearing down.
                warn!(error = %e, "buffer fetch failed, skipping push");
                return Ok(());
            }
        };
        let Some((last_key, _)) = batch.last() else {
            return Ok(());
        };
        let last_key = *last_key;

        let entries: Vec<Entry> = batch.into_iter().map(|(_, entry)| entry).collect();
        match self.client.push(&entries).await {
            Ok(()) => {
                // Delete only what was pushed; entries stored meanwhile
                // have larger keys and stay.
                if let Err(e) = self.buffer.delete_up_to(last_key).await {
                    warn!(error = %e, "failed to delete delivered prefix");
                }
                self.consecutive_failures = 0;
                debug!(delivered = entries.len(), "pushed batch");
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                Err(e)
            }
        }
    }

    fn next_interval(&self) -> Duration {
        backoff_interval(&self.params, self.consecutive_failures)
    }
}
