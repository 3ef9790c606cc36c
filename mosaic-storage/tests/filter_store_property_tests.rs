//! Property-Based Tests for Filter Persistence
//!
//! **Property: Persistence Round-Trip**
//!
//! For any sequence of filter patches applied to a partition, a fresh store
//! opened over the same durable storage SHALL reproduce exactly the criteria
//! and page size the first store ended with.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use mosaic_core::{EngineConfig, Partition, Timestamp, UserId};
use mosaic_storage::{
    FilterPersistence, FilterStateStore, GenerationClock, InMemoryFilterPersistence,
    JsonFileFilterPersistence, LmdbFilterPersistence, UserContext,
};
use mosaic_test_utils::generators::arb_filter_patch;
use proptest::prelude::*;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn created() -> Timestamp {
    Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap()
}

fn open<P: FilterPersistence>(persistence: P) -> FilterStateStore<P> {
    FilterStateStore::new(
        UserContext::new(UserId::new("user@example.com"), created()),
        persistence,
        Arc::new(GenerationClock::new()),
        EngineConfig::default(),
    )
}

fn arb_partition() -> impl Strategy<Value = Partition> {
    prop_oneof![Just(Partition::Active), Just(Partition::Trashed)]
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_set_then_reload_reproduces_criteria(
        partition in arb_partition(),
        patches in prop::collection::vec(arb_filter_patch(), 1..5),
    ) {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        let store = open(Arc::clone(&persistence));
        let mut last = store.get(partition);
        for patch in &patches {
            last = store.set(partition, patch).unwrap();
        }

        let reloaded = open(persistence).get(partition);
        prop_assert_eq!(&reloaded.criteria, &last.criteria);
        prop_assert_eq!(&reloaded.key, &last.key);
        prop_assert_eq!(reloaded.page_size, last.page_size);
    }

    #[test]
    fn prop_json_file_round_trip(
        patch in arb_filter_patch(),
        size in prop::sample::select(vec![10u32, 25, 50, 100]),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = open(JsonFileFilterPersistence::new(dir.path()));
        let set = store.set(Partition::Trashed, &patch).unwrap();
        store.set_page_size(Partition::Trashed, size).unwrap();

        let reloaded = open(JsonFileFilterPersistence::new(dir.path())).get(Partition::Trashed);
        prop_assert_eq!(reloaded.criteria, set.criteria);
        prop_assert_eq!(reloaded.page_size, size);
    }

    #[test]
    fn prop_set_always_bumps_only_its_partition(
        partition in arb_partition(),
        patch in arb_filter_patch(),
    ) {
        let store = open(InMemoryFilterPersistence::new());
        let before = store.get(partition);
        let other = store.get(partition.other());

        let after = store.set(partition, &patch).unwrap();
        prop_assert!(before.generation.is_superseded_by(after.generation));
        prop_assert_eq!(store.get(partition.other()).generation, other.generation);
    }
}

#[test]
fn test_lmdb_round_trip_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let patch = mosaic_core::FilterPatch::new()
        .with_query("  neon city  ")
        .with_status(mosaic_core::StatusFilter::Complete);

    let set = {
        let store = open(LmdbFilterPersistence::open(dir.path(), 10).unwrap());
        store.set(Partition::Active, &patch).unwrap()
    };
    assert_eq!(set.criteria.query, "neon city");

    let reloaded = open(LmdbFilterPersistence::open(dir.path(), 10).unwrap());
    assert_eq!(reloaded.get(Partition::Active).criteria, set.criteria);
    assert_eq!(
        reloaded.get(Partition::Trashed).criteria,
        mosaic_core::FilterCriteria::defaults(created())
    );
}
