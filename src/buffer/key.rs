//! Composite buffer keys and their generator.
//!
//! Keys are `(monotonic_ns, counter)` pairs ordered lexicographically.
//! The nanosecond component comes from a monotonic clock (never the wall
//! clock, which can step backward); the counter is a process-wide atomic
//! that breaks ties when clock resolution collides. The 16-byte big-endian
//! encoding preserves ordering byte-wise, so the persistent backend can
//! rely on its native key order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide tie-breaker. Strictly positive, strictly increasing;
/// wrapping past `u64::MAX` is treated as unreachable.
static NEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Ordered, duplicate-free key for a buffered entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferKey {
    /// Nanoseconds on the generator's monotonic clock at assignment time.
    pub monotonic_ns: u64,
    /// Process-wide insertion counter.
    pub counter: u64,
}

impl BufferKey {
    /// Length of the byte encoding.
    pub const ENCODED_LEN: usize = 16;

    /// Big-endian `monotonic_ns ++ counter`; byte order equals key order.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..8].copy_from_slice(&self.monotonic_ns.to_be_bytes());
        bytes[8..].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    /// Decodes a key previously produced by [`BufferKey::to_bytes`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut ns = [0u8; 8];
        let mut counter = [0u8; 8];
        ns.copy_from_slice(&bytes[..8]);
        counter.copy_from_slice(&bytes[8..]);
        Some(BufferKey {
            monotonic_ns: u64::from_be_bytes(ns),
            counter: u64::from_be_bytes(counter),
        })
    }
}

/// Produces strictly increasing [`BufferKey`]s.
///
/// For any two calls where the first returns before the second starts,
/// the first key compares smaller. The clock component is derived from a
/// process-local [`Instant`], offset by `floor_ns` so a handler reopening
/// a persistent buffer can keep new keys above everything already stored.
#[derive(Debug)]
pub struct KeyGenerator {
    origin: Instant,
    floor_ns: u64,
}

impl KeyGenerator {
    /// Generator starting at the current monotonic instant.
    #[must_use]
    pub fn new() -> Self {
        Self::with_floor(0)
    }

    /// Generator whose clock component starts strictly above `floor_ns`.
    #[must_use]
    pub fn with_floor(floor_ns: u64) -> Self {
        KeyGenerator {
            origin: Instant::now(),
            // +1 keeps even a zero-elapsed first key above the floor.
            floor_ns: floor_ns.saturating_add(1),
        }
    }

    /// Assigns the next key.
    #[must_use]
    pub fn next_key(&self) -> BufferKey {
        let elapsed = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        BufferKey {
            monotonic_ns: self.floor_ns.saturating_add(elapsed),
            counter: NEXT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}
