//! Volatile buffer backend over an in-process ordered map.

use std::collections::BTreeMap;

use super::backend::{BufferBackend, BufferError};
use super::key::BufferKey;
use super::Entry;

/// Memory-backed buffer storage. Gives up persistence for throughput;
/// freed fully on stop.
#[derive(Debug, Default)]
pub(crate) struct MemoryBuffer {
    entries: BTreeMap<BufferKey, Entry>,
}

impl MemoryBuffer {
    pub(crate) fn new() -> Self {
        MemoryBuffer::default()
    }
}

impl BufferBackend for MemoryBuffer {
    fn insert(&mut self, key: BufferKey, entry: &Entry) -> Result<(), BufferError> {
        self.entries.insert(key, entry.clone());
        Ok(())
    }

    fn fetch_batch(&mut self, limit: usize) -> Result<Vec<(BufferKey, Entry)>, BufferError> {
        Ok(self
            .entries
            .iter()
            .take(limit)
            .map(|(key, entry)| (*key, entry.clone()))
            .collect())
    }

    fn delete_up_to(&mut self, key: BufferKey) -> Result<usize, BufferError> {
        // split_off leaves keys < `key` behind; the boundary key itself is
        // part of the deleted prefix.
        let mut kept = self.entries.split_off(&key);
        let boundary = kept.remove(&key).is_some();
        let removed = self.entries.len() + usize::from(boundary);
        self.entries = kept;
        Ok(removed)
    }

    fn evict_smallest(&mut self, n: usize) -> Result<usize, BufferError> {
        let mut removed = 0;
        while removed < n {
            if self.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    fn stop(&mut self) -> Result<(), BufferError> {
        self.entries = BTreeMap::new();
        Ok(())
    }
}
