//! Persistent buffer backend over an embedded sled tree.
//!
//! Entries are stored under their 16-byte key encoding (sled iterates in
//! byte order, which matches key order) with serde_json values. Deletes
//! and evictions go through `sled::Batch` so a prefix disappears
//! atomically. The data directory is created if absent and a single sled
//! instance serves one handler.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::backend::{BufferBackend, BufferError};
use super::key::BufferKey;
use super::Entry;

/// Tree holding the buffered entries.
const ENTRIES_TREE: &str = "entries";

/// Sled read cache; buffered entries are written once and read once.
const CACHE_CAPACITY_BYTES: u64 = 8 * 1024 * 1024;

/// Disk-backed buffer storage surviving process restarts.
#[derive(Debug)]
pub(crate) struct DiskBuffer {
    db: sled::Db,
    tree: sled::Tree,
    len: usize,
    path: PathBuf,
}

impl DiskBuffer {
    /// Opens (or creates) the buffer store at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self, BufferError> {
        fs::create_dir_all(path)?;
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(CACHE_CAPACITY_BYTES)
            .open()?;
        let tree = db.open_tree(ENTRIES_TREE)?;
        let len = tree.len();
        debug!(path = %path.display(), entries = len, "opened disk buffer");
        Ok(DiskBuffer {
            db,
            tree,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Largest persisted key, if any. Used to floor the key generator so
    /// keys assigned after a restart stay above everything already stored.
    pub(crate) fn last_key(&self) -> Result<Option<BufferKey>, BufferError> {
        Ok(self
            .tree
            .last()?
            .and_then(|(key, _)| BufferKey::from_bytes(&key)))
    }

    /// Directory backing this buffer.
    #[allow(dead_code)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn remove_keys(&mut self, keys: Vec<sled::IVec>) -> Result<usize, BufferError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = keys.len();
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        self.len = self.len.saturating_sub(removed);
        Ok(removed)
    }
}

impl BufferBackend for DiskBuffer {
    fn insert(&mut self, key: BufferKey, entry: &Entry) -> Result<(), BufferError> {
        let value = serde_json::to_vec(entry)?;
        let previous = self.tree.insert(key.to_bytes(), value)?;
        if previous.is_none() {
            self.len += 1;
        }
        Ok(())
    }

    fn fetch_batch(&mut self, limit: usize) -> Result<Vec<(BufferKey, Entry)>, BufferError> {
        let mut entries = Vec::with_capacity(limit.min(self.len));
        for item in self.tree.iter().take(limit) {
            let (key_bytes, value) = item?;
            let Some(key) = BufferKey::from_bytes(&key_bytes) else {
                continue;
            };
            let entry: Entry = serde_json::from_slice(&value)?;
            entries.push((key, entry));
        }
        Ok(entries)
    }

    fn delete_up_to(&mut self, key: BufferKey) -> Result<usize, BufferError> {
        let mut keys = Vec::new();
        for item in self.tree.range(..=key.to_bytes()) {
            let (key_bytes, _) = item?;
            keys.push(key_bytes);
        }
        self.remove_keys(keys)
    }

    fn evict_smallest(&mut self, n: usize) -> Result<usize, BufferError> {
        let mut keys = Vec::with_capacity(n);
        for item in self.tree.iter().take(n) {
            let (key_bytes, _) = item?;
            keys.push(key_bytes);
        }
        self.remove_keys(keys)
    }

    fn count(&self) -> usize {
        self.len
    }

    fn stop(&mut self) -> Result<(), BufferError> {
        self.db.flush()?;
        Ok(())
    }
}
