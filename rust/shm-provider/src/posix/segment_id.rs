//! SegmentId generation.
//!
//! Ids double as part of the OS object name, so a collision with a live
//! segment (ours or another process's) shows up as `EEXIST` on create. The
//! generator only has to make collisions rare; the backend retries on them.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::SegmentId;

/// How many ids a backend tries before giving up on creating a segment.
pub const MAX_ID_ATTEMPTS: usize = 16;

/// Pseudo-random SegmentId source, seeded per process.
#[derive(Debug)]
pub struct SegmentIdGenerator {
    random_state: RandomState,
    counter: AtomicU64,
}

impl SegmentIdGenerator {
    pub fn new() -> Self {
        Self {
            random_state: RandomState::new(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> SegmentId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = self.random_state.build_hasher();
        std::process::id().hash(&mut hasher);
        counter.hash(&mut hasher);
        let hash = hasher.finish();
        (hash ^ (hash >> 32)) as SegmentId
    }
}

impl Default for SegmentIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
