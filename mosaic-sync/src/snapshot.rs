//! Read-only view state published to renderers.

use std::sync::Arc;

use mosaic_core::{FuzzyIndex, Item, ItemId, ListingError, Partition, SearchOptions};
use mosaic_storage::{CacheRead, Freshness, Generation, KeyedCriteria, PageView};

/// Everything a list renderer needs for one partition.
///
/// `items` is shared; a new allocation is only published when the visible
/// list actually changed, so [`FuzzyIndex::refresh`] can key off identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot {
    pub partition: Partition,
    pub items: Arc<[Item]>,
    pub is_loading: bool,
    pub has_more: bool,
    /// Last load failure, kept until dismissed or a later load succeeds.
    pub error: Option<ListingError>,
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub freshness: Freshness,
    pub generation: Generation,
}

impl ListSnapshot {
    pub fn empty(partition: Partition, keyed: &KeyedCriteria) -> Self {
        Self {
            partition,
            items: Arc::from(Vec::new()),
            is_loading: false,
            has_more: false,
            error: None,
            page: 0,
            page_size: keyed.page_size,
            total_items: 0,
            total_pages: 0,
            freshness: Freshness::Absent,
            generation: keyed.generation,
        }
    }

    pub(crate) fn build(
        partition: Partition,
        keyed: &KeyedCriteria,
        read: Option<CacheRead<PageView>>,
        is_loading: bool,
        error: Option<ListingError>,
    ) -> Self {
        let mut snapshot = match read {
            Some(read) => {
                let freshness = read.freshness();
                let view = read.into_value();
                Self {
                    partition,
                    items: Arc::from(view.items),
                    is_loading: false,
                    has_more: view.has_more,
                    error: None,
                    page: view.page,
                    page_size: view.page_size,
                    total_items: view.total_items,
                    total_pages: view.total_pages,
                    freshness,
                    generation: keyed.generation,
                }
            }
            None => Self::empty(partition, keyed),
        };
        snapshot.is_loading = is_loading;
        snapshot.error = error;
        snapshot
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.iter().any(|item| &item.id == id)
    }

    /// Whether every matching item is held locally.
    pub fn is_complete(&self) -> bool {
        !self.has_more && !self.freshness.is_absent()
    }

    /// Fuzzy index over the visible items, reusing `previous` when the list
    /// is unchanged. Returns `None` while more pages remain on the server.
    pub fn local_index(
        &self,
        previous: Option<FuzzyIndex>,
        options: &SearchOptions,
    ) -> Option<FuzzyIndex> {
        if !self.is_complete() {
            return None;
        }
        Some(match previous {
            Some(index) => index.refresh(&self.items),
            None => FuzzyIndex::build(Arc::clone(&self.items), options.clone()),
        })
    }
}
