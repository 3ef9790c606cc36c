//! Freshness metadata for cache reads.
//!
//! Every read out of the query cache is wrapped in a [`CacheRead`] so the
//! caller always knows whether it is looking at authoritative data or at a
//! last-known value that is being revalidated.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::generation::Watermark;

/// Whether a cache entry is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Fetched after the latest invalidation that touched the entry.
    Fresh,
    /// Invalidated (or past its TTL) since it was fetched. Still displayable.
    Stale,
    /// Nothing cached yet.
    #[default]
    Absent,
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    freshness: Freshness,
    /// When the underlying data was fetched from the source.
    fetched_at: DateTime<Utc>,
    /// The watermark at which that fetch started.
    watermark: Option<Watermark>,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// A read served from an existing entry without a network round trip.
    pub fn from_cache(
        value: T,
        freshness: Freshness,
        fetched_at: DateTime<Utc>,
        watermark: Option<Watermark>,
    ) -> Self {
        Self {
            value,
            freshness,
            fetched_at,
            watermark,
            was_cache_hit: true,
        }
    }

    /// A read produced by a fetch this call started or joined.
    pub fn from_source(
        value: T,
        freshness: Freshness,
        fetched_at: DateTime<Utc>,
        watermark: Option<Watermark>,
    ) -> Self {
        Self {
            value,
            freshness,
            fetched_at,
            watermark,
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness.is_fresh()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn watermark(&self) -> Option<Watermark> {
        self.watermark
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    /// How long ago the data was fetched.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            freshness: self.freshness,
            fetched_at: self.fetched_at,
            watermark: self.watermark,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
