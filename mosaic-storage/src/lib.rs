//! Mosaic Storage
//!
//! Two shared mutable resources live here, and both are only reachable
//! through their methods:
//!
//! - [`filter_store`]: per-user, per-partition filter criteria with durable
//!   persistence backends.
//! - [`cache`]: the query cache that resolves composite keys to accumulated
//!   or paged items, with request coalescing, staleness tracking and the
//!   generation/watermark clock shared with the real-time invalidator.

pub mod cache;
pub mod filter_store;

pub use cache::{
    CacheKey, CacheRead, CacheStats, EntryLease, Freshness, Generation, GenerationClock,
    MutationReport, PageView, PendingFetch, QueryCache, Resolved, Watermark,
};
pub use filter_store::{
    FilterPersistence, FilterStateStore, InMemoryFilterPersistence, JsonFileFilterPersistence,
    KeyedCriteria, LmdbFilterPersistence, PersistedFilters, UserContext, UserScopedKey,
};
