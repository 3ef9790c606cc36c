//! Mosaic Test Utilities
//!
//! Shared test infrastructure for the Mosaic workspace:
//! - An in-memory [`MockItemSource`] that filters, sorts and paginates like
//!   the real list endpoint, with latency and failure injection
//! - Fixtures for common item sets
//! - Proptest generators
//! - Assertions for listing invariants

pub use mosaic_core::{
    DateRange, EngineConfig, FilterCriteria, FilterPatch, Item, ItemEvent, ItemId, ItemSource,
    ItemStatus, ListQuery, ListResponse, ListingError, Partition, SortDirection, SortField,
    SortSpec, StatusFilter, Timestamp, UserId,
};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK ITEM SOURCE
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    items: Vec<Item>,
    latency: Duration,
    /// Extra delay keyed by the `status` list parameter (`None` = all).
    status_latency: HashMap<Option<String>, Duration>,
    list_failure: Option<ListingError>,
    mutation_failure: Option<ListingError>,
    queries: Vec<ListQuery>,
}

/// In-memory stand-in for the remote list and mutation endpoints.
#[derive(Debug, Default)]
pub struct MockItemSource {
    state: Mutex<MockState>,
    list_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
}

impl MockItemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Item>) -> Self {
        let source = Self::default();
        source.state().items = items;
        source
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, item: Item) {
        self.state().items.push(item);
    }

    pub fn items(&self) -> Vec<Item> {
        self.state().items.clone()
    }

    pub fn item(&self, id: &str) -> Option<Item> {
        self.state().items.iter().find(|i| i.id.as_str() == id).cloned()
    }

    /// Change an item's status as the generation backend would.
    pub fn set_status(&self, id: &str, status: ItemStatus) {
        if let Some(item) = self.state().items.iter_mut().find(|i| i.id.as_str() == id) {
            item.status = status;
            item.updated_at = Utc::now();
        }
    }

    /// Move an item between partitions without going through a mutation.
    pub fn set_archived(&self, id: &str, archived: bool) {
        if let Some(item) = self.state().items.iter_mut().find(|i| i.id.as_str() == id) {
            item.archived = archived;
            item.archive_date = archived.then(Utc::now);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Delay list calls filtered by `status` (`None` for unfiltered calls).
    pub fn delay_status(&self, status: Option<&str>, delay: Duration) {
        self.state()
            .status_latency
            .insert(status.map(str::to_string), delay);
    }

    pub fn fail_lists(&self, error: ListingError) {
        self.state().list_failure = Some(error);
    }

    pub fn fail_mutations(&self, error: ListingError) {
        self.state().mutation_failure = Some(error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.list_failure = None;
        state.mutation_failure = None;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    /// Every list query received, in arrival order.
    pub fn queries(&self) -> Vec<ListQuery> {
        self.state().queries.clone()
    }

    fn respond(&self, query: &ListQuery) -> Result<ListResponse, ListingError> {
        let state = self.state();
        if let Some(err) = &state.list_failure {
            return Err(err.clone());
        }

        let needle = query.q.as_deref().map(str::to_lowercase);
        let mut matching: Vec<Item> = state
            .items
            .iter()
            .filter(|item| item.archived == query.is_archived)
            .filter(|item| item.created_at >= query.start && item.created_at <= query.end)
            .filter(|item| status_matches(query.status.as_deref(), item.status))
            .filter(|item| needle.as_deref().map_or(true, |q| text_matches(item, q)))
            .cloned()
            .collect();
        sort_items(&mut matching, &query.sort);

        let total = matching.len();
        let limit = query.limit.max(1) as usize;
        let offset = (query.page.max(1) as usize - 1) * limit;
        let data: Vec<Item> = matching.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + data.len() < total;

        Ok(ListResponse {
            data,
            page: query.page,
            total_pages: total.div_ceil(limit) as u32,
            has_more,
            total_items: total as u64,
        })
    }

    fn mutate<F>(&self, id: Option<&ItemId>, apply: F) -> Result<(), ListingError>
    where
        F: FnOnce(&mut Vec<Item>) -> Result<(), String>,
    {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = &state.mutation_failure {
            return Err(err.clone());
        }
        apply(&mut state.items).map_err(|reason| ListingError::conflict(id.cloned(), reason))
    }
}

fn status_matches(filter: Option<&str>, status: ItemStatus) -> bool {
    match filter {
        None => true,
        Some("complete") => status == ItemStatus::Complete,
        Some("pending") => matches!(status, ItemStatus::Pending | ItemStatus::InProgress),
        Some("failed") => status == ItemStatus::Failed,
        Some(_) => false,
    }
}

fn text_matches(item: &Item, needle: &str) -> bool {
    item.title.to_lowercase().contains(needle)
        || item
            .prompt
            .as_deref()
            .is_some_and(|p| p.to_lowercase().contains(needle))
        || item.keywords.iter().any(|k| k.to_lowercase().contains(needle))
}

fn sort_items(items: &mut [Item], sort: &str) {
    let (field, descending) = match sort.strip_prefix('-') {
        Some(field) => (field, true),
        None => (sort, false),
    };
    items.sort_by(|a, b| {
        let ordering = match field {
            "createdAt" => a.created_at.cmp(&b.created_at),
            "title" => a.title.cmp(&b.title),
            "status" => a.status.as_str().cmp(b.status.as_str()),
            _ => a.updated_at.cmp(&b.updated_at),
        }
        .then_with(|| a.id.cmp(&b.id));
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn find_mut<'a>(items: &'a mut [Item], id: &ItemId) -> Result<&'a mut Item, String> {
    items
        .iter_mut()
        .find(|item| &item.id == id)
        .ok_or_else(|| "item not found".to_string())
}

#[async_trait]
impl ItemSource for MockItemSource {
    async fn list(&self, query: &ListQuery) -> Result<ListResponse, ListingError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut state = self.state();
            state.queries.push(query.clone());
            state.latency
                + state
                    .status_latency
                    .get(&query.status)
                    .copied()
                    .unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.respond(query)
    }

    async fn retry(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Some(id), |items| {
            let item = find_mut(items, id)?;
            if item.status != ItemStatus::Failed {
                return Err("only failed items can be retried".to_string());
            }
            item.status = ItemStatus::Pending;
            item.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn archive(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Some(id), |items| {
            let item = find_mut(items, id)?;
            if item.archived {
                return Err("item is already archived".to_string());
            }
            item.archived = true;
            item.archive_date = Some(Utc::now());
            Ok(())
        })
    }

    async fn restore(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Some(id), |items| {
            let item = find_mut(items, id)?;
            if !item.archived {
                return Err("item is not archived".to_string());
            }
            item.archived = false;
            item.archive_date = None;
            Ok(())
        })
    }

    async fn delete(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Some(id), |items| {
            let index = items
                .iter()
                .position(|item| &item.id == id && item.archived)
                .ok_or_else(|| "item is not in the trash".to_string())?;
            items.remove(index);
            Ok(())
        })
    }

    async fn delete_all(&self) -> Result<(), ListingError> {
        self.mutate(None, |items| {
            items.retain(|item| !item.archived);
            Ok(())
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Mosaic types.

    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    /// Generate a Timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a valid date range, either bounded (end >= start) or open.
    pub fn arb_date_range() -> impl Strategy<Value = DateRange> {
        prop_oneof![
            3 => (arb_timestamp(), 0i64..(400 * 86_400)).prop_map(|(start, span)| {
                DateRange::new(start, start + ChronoDuration::seconds(span))
            }),
            1 => arb_timestamp().prop_map(DateRange::since),
        ]
    }

    pub fn arb_item_status() -> impl Strategy<Value = ItemStatus> {
        prop_oneof![
            Just(ItemStatus::Pending),
            Just(ItemStatus::InProgress),
            Just(ItemStatus::Complete),
            Just(ItemStatus::Failed),
        ]
    }

    pub fn arb_status_filter() -> impl Strategy<Value = StatusFilter> {
        prop_oneof![
            Just(StatusFilter::All),
            Just(StatusFilter::Complete),
            Just(StatusFilter::Pending),
            Just(StatusFilter::Failed),
        ]
    }

    pub fn arb_sort_spec() -> impl Strategy<Value = SortSpec> {
        let field = prop_oneof![
            Just(SortField::UpdatedAt),
            Just(SortField::CreatedAt),
            Just(SortField::Title),
            Just(SortField::Status),
        ];
        let direction = prop_oneof![Just(SortDirection::Asc), Just(SortDirection::Desc)];
        (field, direction).prop_map(|(field, direction)| SortSpec::new(field, direction))
    }

    /// Generate a free-text query, sometimes padded or blank.
    pub fn arb_query() -> impl Strategy<Value = String> {
        prop_oneof![Just(String::new()), "[a-z ]{1,16}", " [a-z]{1,8} "]
    }

    /// Generate a patch whose merge result always validates.
    pub fn arb_filter_patch() -> impl Strategy<Value = FilterPatch> {
        (
            proptest::option::of(arb_date_range()),
            proptest::option::of(arb_query()),
            proptest::option::of(arb_status_filter()),
            proptest::option::of(arb_sort_spec()),
        )
            .prop_map(|(date_range, query, status, sort)| FilterPatch {
                date_range,
                query,
                status,
                sort,
            })
    }

    pub fn arb_item_id() -> impl Strategy<Value = ItemId> {
        "[a-z0-9]{4,12}".prop_map(ItemId::new)
    }

    /// Generate an item in the given partition.
    pub fn arb_item(partition: Partition) -> impl Strategy<Value = Item> {
        (arb_item_id(), arb_item_status(), arb_timestamp(), "[A-Za-z ]{0,24}").prop_map(
            move |(id, status, created_at, title)| Item {
                id,
                status,
                created_at,
                updated_at: created_at,
                archived: partition.is_archived(),
                archive_date: partition.is_archived().then_some(created_at),
                title,
                prompt: None,
                keywords: Vec::new(),
            },
        )
    }

    pub fn arb_item_event() -> impl Strategy<Value = ItemEvent> {
        (arb_item_id(), 0u8..4, proptest::option::of(arb_item_status())).prop_map(
            |(id, kind, status)| match kind {
                0 => ItemEvent::StatusChanged { id, status },
                1 => ItemEvent::Archived { id },
                2 => ItemEvent::Restored { id },
                _ => ItemEvent::Deleted { id },
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common listing scenarios.

    use super::*;
    use chrono::Duration as ChronoDuration;

    /// Factory for test items.
    pub struct ItemFixture;

    impl ItemFixture {
        /// An item created `minutes_ago` minutes before now.
        pub fn item(id: &str, status: ItemStatus, archived: bool, minutes_ago: i64) -> Item {
            let created_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
            Item {
                id: ItemId::new(id),
                status,
                created_at,
                updated_at: created_at,
                archived,
                archive_date: archived.then_some(created_at),
                title: format!("Item {id}"),
                prompt: Some(format!("prompt for {id}")),
                keywords: Vec::new(),
            }
        }

        /// An active item with a random v7 id.
        pub fn random(status: ItemStatus) -> Item {
            Self::item(&uuid::Uuid::now_v7().to_string(), status, false, 1)
        }

        /// `count` complete active items `active-0..`, newest first.
        pub fn active_batch(count: usize) -> Vec<Item> {
            (0..count)
                .map(|i| Self::item(&format!("active-{i}"), ItemStatus::Complete, false, i as i64 + 1))
                .collect()
        }

        /// `count` complete trashed items `trashed-0..`, newest first.
        pub fn trashed_batch(count: usize) -> Vec<Item> {
            (0..count)
                .map(|i| Self::item(&format!("trashed-{i}"), ItemStatus::Complete, true, i as i64 + 1))
                .collect()
        }

        /// Active items cycling through every status.
        pub fn mixed_statuses(count: usize) -> Vec<Item> {
            const STATUSES: [ItemStatus; 4] = [
                ItemStatus::Complete,
                ItemStatus::Failed,
                ItemStatus::Pending,
                ItemStatus::InProgress,
            ];
            (0..count)
                .map(|i| {
                    Self::item(
                        &format!("mixed-{i}"),
                        STATUSES[i % STATUSES.len()],
                        false,
                        i as i64 + 1,
                    )
                })
                .collect()
        }
    }

    /// The account every fixture belongs to, created a year ago.
    pub fn test_user() -> (UserId, Timestamp) {
        (UserId::new("user-1"), Utc::now() - ChronoDuration::days(365))
    }

    /// Engine settings with short timeouts for tests.
    pub fn fast_config() -> EngineConfig {
        EngineConfig::default().with_fetch_timeout(Duration::from_secs(2))
    }
}

pub use fixtures::ItemFixture;

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for listing invariants.

    use super::*;
    use std::collections::HashSet;

    /// Assert that no id appears twice.
    #[track_caller]
    pub fn assert_no_duplicate_ids(items: &[Item]) {
        let mut seen = HashSet::new();
        for item in items {
            assert!(seen.insert(&item.id), "Duplicate id in list: {}", item.id);
        }
    }

    /// Assert that no id is shown in both partitions.
    #[track_caller]
    pub fn assert_disjoint(active: &[Item], trashed: &[Item]) {
        let active_ids: HashSet<&ItemId> = active.iter().map(|i| &i.id).collect();
        for item in trashed {
            assert!(
                !active_ids.contains(&item.id),
                "Item {} shown in both partitions",
                item.id
            );
        }
    }

    /// Assert that every item matches the status filter.
    #[track_caller]
    pub fn assert_all_match(items: &[Item], filter: StatusFilter) {
        for item in items {
            assert!(
                filter.matches(item.status),
                "Item {} with status {:?} does not match {:?}",
                item.id,
                item.status,
                filter
            );
        }
    }
}
