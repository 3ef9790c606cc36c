//! Remote item source trait.
//!
//! Abstracts the list and mutation endpoints so the cache can run against
//! the HTTP client in production and an in-memory mock in tests.

use crate::error::ListingError;
use crate::item::ItemId;
use crate::page::{ListQuery, ListResponse};
use async_trait::async_trait;

/// Remote paginated data source plus the mutations the dashboard exposes.
///
/// Implementations report transport failures as [`ListingError::Network`],
/// non-success responses as [`ListingError::Server`], and mutations on items
/// that are no longer where the caller expected as [`ListingError::Conflict`].
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Fetch one page of items.
    async fn list(&self, query: &ListQuery) -> Result<ListResponse, ListingError>;

    /// Re-run generation for a failed item.
    async fn retry(&self, id: &ItemId) -> Result<(), ListingError>;

    /// Move an active item to the trash.
    async fn archive(&self, id: &ItemId) -> Result<(), ListingError>;

    /// Move a trashed item back to the active partition.
    async fn restore(&self, id: &ItemId) -> Result<(), ListingError>;

    /// Permanently delete a single trashed item.
    async fn delete(&self, id: &ItemId) -> Result<(), ListingError>;

    /// Permanently delete everything in the trash.
    async fn delete_all(&self) -> Result<(), ListingError>;
}
