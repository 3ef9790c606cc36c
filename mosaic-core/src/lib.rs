//! Mosaic Core - Listing Types
//!
//! Pure data structures shared by every Mosaic crate: items, partitions,
//! filter criteria, pages, push events and the error taxonomy. The only
//! behavior here is validation, serialization and the [`ItemSource`] seam
//! that the cache fetches through.

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod item;
pub mod page;
pub mod search;
pub mod source;

pub use config::EngineConfig;
pub use error::{
    ConfigError, ListingError, MosaicError, MosaicResult, StorageError, ValidationError,
};
pub use event::{ChannelSignal, ItemEvent, Placement};
pub use filter::{
    DateRange, FilterCriteria, FilterPatch, SortDirection, SortField, SortSpec, StatusFilter,
};
pub use item::{Item, ItemId, ItemStatus, PageStrategy, Partition, Timestamp, UserId};
pub use page::{ListQuery, ListResponse, Page, PageRequest};
pub use search::{FuzzyIndex, LocalSearch, SearchField, SearchHit, SearchOptions};
pub use source::ItemSource;
