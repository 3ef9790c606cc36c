//! Generation tokens and the shared watermark clock.
//!
//! Two monotonic counters order everything asynchronous in the engine:
//!
//! - A per-partition [`Generation`], bumped by every filter change. Fetches
//!   are tagged with the generation active when they started, and results
//!   tagged with an older generation are discarded.
//! - A global [`Watermark`], ticked by every fetch start, invalidation and
//!   received push event. Comparing watermarks tells whether cached data was
//!   fetched before or after a given invalidation.

use mosaic_core::Partition;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Filter generation of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Check if this generation was replaced by `current`.
    pub fn is_superseded_by(&self, current: Generation) -> bool {
        self.0 < current.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A point in the global sequence of fetch starts, invalidations and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(u64);

impl Watermark {
    /// The beginning of time. Every ticked watermark is newer.
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: Watermark) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Lock-free clock shared by the filter store, the cache and the invalidator.
#[derive(Debug, Default)]
pub struct GenerationClock {
    generations: [AtomicU64; 2],
    watermark: AtomicU64,
}

impl GenerationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generation currently active for a partition.
    pub fn current(&self, partition: Partition) -> Generation {
        Generation(self.generations[partition.index()].load(Ordering::Acquire))
    }

    /// Bump a partition's generation and return the new value.
    pub fn advance(&self, partition: Partition) -> Generation {
        let previous = self.generations[partition.index()].fetch_add(1, Ordering::AcqRel);
        Generation(previous + 1)
    }

    /// Issue the next watermark.
    pub fn tick(&self) -> Watermark {
        Watermark(self.watermark.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// The most recently issued watermark.
    pub fn latest(&self) -> Watermark {
        Watermark(self.watermark.load(Ordering::Acquire))
    }
}
