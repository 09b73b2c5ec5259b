//! Surrogate id generators.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of 64-bit surrogate ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Random non-negative 63-bit ids.
///
/// Collisions are possible but rare enough at namespace scope; the mapping
/// service retries with a fresh id if one ever happens.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> u64 {
        rand::random::<u64>() & (u64::MAX >> 1)
    }
}

/// Counter-based ids, starting at a caller supplied value
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    #[must_use]
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Resume after the highest id already handed out
    #[must_use]
    pub fn resume_after(highest: Option<u64>) -> Self {
        Self::new(highest.map_or(0, |id| id + 1))
    }

    /// Value the next call to [`IdGenerator::next_id`] returns
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
