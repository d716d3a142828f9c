//! Storage capability behind the buffer service.

use thiserror::Error;

use super::key::BufferKey;
use super::Entry;

/// Errors surfaced by buffer storage and the buffer service.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The embedded store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    /// Filesystem preparation failed.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted entry could not be encoded or decoded.
    #[error("entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// The buffer service task is no longer running.
    #[error("buffer service is not running")]
    ServiceStopped,
}

/// Ordered keyed storage for buffered entries.
///
/// Implementations are exclusively owned by one buffer service task, so
/// methods take `&mut self` and need no internal locking. Keys iterate in
/// ascending order everywhere.
pub(crate) trait BufferBackend: Send {
    /// Inserts an entry under the given key.
    fn insert(&mut self, key: BufferKey, entry: &Entry) -> Result<(), BufferError>;

    /// Returns up to `limit` smallest-keyed entries, ascending.
    fn fetch_batch(&mut self, limit: usize) -> Result<Vec<(BufferKey, Entry)>, BufferError>;

    /// Deletes every entry with key `<= key`; returns how many were removed.
    fn delete_up_to(&mut self, key: BufferKey) -> Result<usize, BufferError>;

    /// Removes the `n` smallest-keyed entries; returns how many were removed.
    fn evict_smallest(&mut self, n: usize) -> Result<usize, BufferError>;

    /// Current number of entries.
    fn count(&self) -> usize;

    /// Releases backend resources. The backend is unusable afterwards.
    fn stop(&mut self) -> Result<(), BufferError>;
}
