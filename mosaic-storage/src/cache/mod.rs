//! Query cache with explicit freshness and generation discipline.
//!
//! Reads return [`CacheRead<T>`], which says whether the data is fresh, stale
//! (shown while a revalidation runs) or absent. Entries are keyed by
//! [`CacheKey`], which cannot be built without a user id, so one account's
//! entries are never served to another.
//!
//! # Example
//!
//! ```ignore
//! let lease = cache.lease(&keyed.key);
//! let read = cache.resolve(&keyed, PageRequest::first(keyed.page_size)).await?;
//! if !read.is_fresh() {
//!     // last-known data, a revalidation is already running
//! }
//! ```

pub mod entry;
pub mod freshness;
pub mod generation;
pub mod key;
pub mod ledger;
pub mod query_cache;
pub mod stats;

pub use entry::PageView;
pub use freshness::{CacheRead, Freshness};
pub use generation::{Generation, GenerationClock, Watermark};
pub use key::CacheKey;
pub use ledger::PlacementLedger;
pub use query_cache::{EntryLease, MutationReport, PendingFetch, QueryCache, Resolved};
pub use stats::CacheStats;
