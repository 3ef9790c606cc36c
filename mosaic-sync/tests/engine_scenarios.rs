//! End-to-end listing scenarios: engine, cache, filter store and invalidator
//! running against the in-memory item source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use mosaic_core::{
    ChannelSignal, DateRange, EngineConfig, FilterPatch, ItemEvent, ItemId, ItemStatus, ListingError,
    Partition, StatusFilter, UserId,
};
use mosaic_storage::{Freshness, InMemoryFilterPersistence, UserContext};
use mosaic_sync::{ListSnapshot, ListingEngine, Verdict};
use mosaic_test_utils::assertions::{assert_all_match, assert_disjoint, assert_no_duplicate_ids};
use mosaic_test_utils::{ItemFixture, MockItemSource};
use tokio::sync::{mpsc, watch};

type Engine = ListingEngine<InMemoryFilterPersistence, MockItemSource>;

fn engine(source: &Arc<MockItemSource>, config: EngineConfig) -> Engine {
    ListingEngine::new(
        UserContext::new(UserId::new("u1"), Utc::now() - ChronoDuration::days(30)),
        InMemoryFilterPersistence::new(),
        Arc::clone(source),
        config,
    )
    .unwrap()
}

fn fast_debounce() -> EngineConfig {
    EngineConfig::default()
        .with_debounce(Duration::from_millis(20))
        .with_max_debounce(Duration::from_millis(100))
}

async fn wait_for(
    rx: &mut watch::Receiver<ListSnapshot>,
    condition: impl FnMut(&ListSnapshot) -> bool,
) -> ListSnapshot {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
        .await
        .expect("snapshot condition not reached in time")
        .expect("engine dropped")
        .clone()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_archived_event_moves_item_between_views() {
    let mut items = ItemFixture::active_batch(3);
    items.extend(ItemFixture::trashed_batch(1));
    let source = Arc::new(MockItemSource::with_items(items));
    let engine = engine(&source, fast_debounce());
    engine.open(Partition::Active).await.unwrap();
    engine.open(Partition::Trashed).await.unwrap();

    let x = ItemId::new("active-1");
    assert!(engine.snapshot(Partition::Active).contains(&x));

    let (tx, rx) = mpsc::channel(16);
    let _invalidator = engine.attach(rx);
    tx.send(ChannelSignal::Connected).await.unwrap();
    source.set_archived("active-1", true);
    tx.send(ChannelSignal::Event(ItemEvent::Archived { id: x.clone() }))
        .await
        .unwrap();

    let mut active = engine.subscribe(Partition::Active);
    let mut trashed = engine.subscribe(Partition::Trashed);
    let hidden = wait_for(&mut active, |s| !s.contains(&x)).await;
    assert_disjoint(&hidden.items, &engine.snapshot(Partition::Trashed).items);

    let moved = wait_for(&mut trashed, |s| s.contains(&x) && s.freshness.is_fresh()).await;
    let active_now = wait_for(&mut active, |s| s.freshness.is_fresh() && !s.is_loading).await;
    assert_eq!(active_now.len(), 2);
    assert_eq!(moved.len(), 2);
    assert_disjoint(&active_now.items, &moved.items);
}

#[tokio::test]
async fn test_superseded_filter_results_are_never_published() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::mixed_statuses(12)));
    let engine = engine(&source, fast_debounce());
    engine.open(Partition::Active).await.unwrap();
    let initial = engine.snapshot(Partition::Active).generation;

    let published = Arc::new(Mutex::new(Vec::<ListSnapshot>::new()));
    let mut watcher = engine.subscribe(Partition::Active);
    let sink = Arc::clone(&published);
    let collector = tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let snapshot = watcher.borrow_and_update().clone();
            sink.lock().unwrap().push(snapshot);
        }
    });

    source.delay_status(Some("failed"), Duration::from_millis(200));
    let slow = engine.clone();
    let failed = tokio::spawn(async move {
        slow.set_filters(Partition::Active, &FilterPatch::new().with_status(StatusFilter::Failed))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine
        .set_filters(Partition::Active, &FilterPatch::new().with_status(StatusFilter::Complete))
        .await
        .unwrap();

    // The slow response lands after the switch and is dropped.
    failed.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    collector.abort();

    let last = engine.snapshot(Partition::Active);
    assert_eq!(last.len(), 3);
    assert_all_match(&last.items, StatusFilter::Complete);
    assert!(source
        .queries()
        .iter()
        .any(|q| q.status.as_deref() == Some("failed")));

    let published = published.lock().unwrap();
    assert!(!published.is_empty());
    for snapshot in published.iter().filter(|s| initial.is_superseded_by(s.generation)) {
        assert!(
            snapshot.items.iter().all(|item| item.status != ItemStatus::Failed),
            "failed item published at generation {}",
            snapshot.generation
        );
    }
}

#[tokio::test]
async fn test_items_created_after_open_appear_on_refresh() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(2)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    let opened = engine.criteria(Partition::Active);
    assert!(opened.criteria.date_range.is_open());

    tokio::time::sleep(Duration::from_millis(5)).await;
    source.insert(ItemFixture::item("fresh", ItemStatus::Pending, false, 0));
    engine.refresh(Partition::Active).await.unwrap();

    let snapshot = engine.snapshot(Partition::Active);
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.contains(&ItemId::new("fresh")));
    assert_eq!(engine.criteria(Partition::Active).key, opened.key);
}

#[tokio::test]
async fn test_stale_open_follows_a_single_revalidation() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    let key = engine.criteria(Partition::Active).key;

    assert!(engine.cache().invalidate(&key));
    engine.open(Partition::Active).await.unwrap();
    assert_eq!(engine.snapshot(Partition::Active).len(), 5);

    let mut rx = engine.subscribe(Partition::Active);
    wait_for(&mut rx, |s| s.freshness.is_fresh() && !s.is_loading).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.list_calls(), 2);
}

#[tokio::test]
async fn test_status_events_never_publish_items_outside_the_filter() {
    let mut items = ItemFixture::active_batch(4);
    items.push(ItemFixture::item("x", ItemStatus::InProgress, false, 2));
    let source = Arc::new(MockItemSource::with_items(items));
    let engine = engine(&source, fast_debounce());
    engine
        .set_filters(Partition::Active, &FilterPatch::new().with_status(StatusFilter::Complete))
        .await
        .unwrap();
    engine.open(Partition::Active).await.unwrap();
    assert_eq!(engine.snapshot(Partition::Active).len(), 4);

    let published = Arc::new(Mutex::new(Vec::<ListSnapshot>::new()));
    let mut watcher = engine.subscribe(Partition::Active);
    let sink = Arc::clone(&published);
    let collector = tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let snapshot = watcher.borrow_and_update().clone();
            sink.lock().unwrap().push(snapshot);
        }
    });

    let (tx, rx) = mpsc::channel(16);
    let _invalidator = engine.attach(rx);
    tx.send(ChannelSignal::Connected).await.unwrap();
    for status in [ItemStatus::Failed, ItemStatus::Complete] {
        source.set_status("x", status);
        tx.send(ChannelSignal::Event(ItemEvent::StatusChanged {
            id: ItemId::new("x"),
            status: Some(status),
        }))
        .await
        .unwrap();
    }

    let mut rx = engine.subscribe(Partition::Active);
    let done = wait_for(&mut rx, |s| s.contains(&ItemId::new("x"))).await;
    assert_eq!(done.len(), 5);
    collector.abort();

    for snapshot in published.lock().unwrap().iter() {
        assert_all_match(&snapshot.items, StatusFilter::Complete);
    }
}

#[tokio::test]
async fn test_reset_restores_defaults_in_the_view() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::mixed_statuses(8)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    engine
        .set_filters(
            Partition::Active,
            &FilterPatch::new()
                .with_status(StatusFilter::Failed)
                .with_query("mixed-1"),
        )
        .await
        .unwrap();
    assert_eq!(engine.snapshot(Partition::Active).len(), 1);

    engine.reset_filters(Partition::Active).await.unwrap();
    let keyed = engine.criteria(Partition::Active);
    assert_eq!(keyed.criteria.status, StatusFilter::All);
    assert_eq!(keyed.criteria.query, "");
    assert!(keyed.criteria.date_range.is_open());
    assert_eq!(keyed.generation.value(), 2);

    let snapshot = engine.snapshot(Partition::Active);
    assert_eq!(snapshot.len(), 8);
    assert_eq!(snapshot.generation, keyed.generation);
}

#[tokio::test(start_paused = true)]
async fn test_two_events_within_debounce_refetch_once() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
    let engine = engine(
        &source,
        EngineConfig::default().with_debounce(Duration::from_millis(300)),
    );
    engine.open(Partition::Active).await.unwrap();
    assert_eq!(source.list_calls(), 1);

    let (tx, rx) = mpsc::channel(16);
    let invalidator = engine.attach(rx);
    tx.send(ChannelSignal::Connected).await.unwrap();
    let event = ChannelSignal::Event(ItemEvent::StatusChanged {
        id: ItemId::new("active-0"),
        status: Some(ItemStatus::Complete),
    });
    tx.send(event.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(event).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(source.list_calls(), 2);
    let report = (*invalidator.flushes().borrow()).unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.verdict, Verdict::Invalidate);
    assert!(engine.snapshot(Partition::Active).freshness.is_fresh());
}

// ============================================================================
// ENGINE BEHAVIOR
// ============================================================================

#[tokio::test]
async fn test_event_for_fresh_data_is_ignored() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(2)));
    let engine = engine(&source, fast_debounce());
    let (tx, rx) = mpsc::channel(16);
    let invalidator = engine.attach(rx);
    tx.send(ChannelSignal::Connected).await.unwrap();
    tx.send(ChannelSignal::Event(ItemEvent::Deleted {
        id: ItemId::new("elsewhere"),
    }))
    .await
    .unwrap();

    let mut flushes = invalidator.flushes();
    let flushed = tokio::time::timeout(Duration::from_secs(5), flushes.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();
    let report = (*flushed).unwrap();
    drop(flushed);
    assert_eq!(report.verdict, Verdict::Ignore);

    // Opened after the event: nothing to invalidate.
    engine.open(Partition::Active).await.unwrap();
    assert!(engine.snapshot(Partition::Active).freshness.is_fresh());
    assert_eq!(source.list_calls(), 1);
}

#[tokio::test]
async fn test_invalidating_stale_entry_twice_fetches_once() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    let key = engine.criteria(Partition::Active).key;

    assert!(engine.cache().invalidate(&key));
    assert!(!engine.cache().invalidate(&key));
    engine.refresh(Partition::Active).await.unwrap();

    assert_eq!(source.list_calls(), 2);
    assert!(engine.snapshot(Partition::Active).freshness.is_fresh());
}

#[tokio::test]
async fn test_filter_change_evicts_previous_entry() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::mixed_statuses(12)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    let before = engine.criteria(Partition::Active);

    engine
        .set_filters(Partition::Active, &FilterPatch::new().with_status(StatusFilter::Failed))
        .await
        .unwrap();
    let snapshot = engine.snapshot(Partition::Active);
    assert_eq!(snapshot.len(), 3);
    assert_all_match(&snapshot.items, StatusFilter::Failed);
    assert!(before.generation.is_superseded_by(snapshot.generation));
    assert!(engine.cache().read(&before.key).is_none());
    assert_eq!(engine.cache().stats().evictions, 1);
}

#[tokio::test]
async fn test_invalid_filters_are_reported_and_nothing_changes() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(2)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    let before = engine.criteria(Partition::Active);

    let now = Utc::now();
    let err = engine
        .set_filters(
            Partition::Active,
            &FilterPatch::new().with_date_range(DateRange::new(now, now - ChronoDuration::days(1))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ListingError::Validation(_)));
    assert_eq!(engine.criteria(Partition::Active), before);

    let snapshot = engine.snapshot(Partition::Active);
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.error.is_some());
    engine.dismiss_error(Partition::Active);
    assert!(engine.snapshot(Partition::Active).error.is_none());
}

#[tokio::test]
async fn test_failed_refresh_keeps_displayed_items() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();

    source.fail_lists(ListingError::server(503, "maintenance"));
    let err = engine.refresh(Partition::Active).await.unwrap_err();
    assert!(err.is_recoverable());

    let snapshot = engine.snapshot(Partition::Active);
    assert_eq!(snapshot.len(), 5);
    assert_eq!(snapshot.freshness, Freshness::Stale);
    assert_eq!(snapshot.error, Some(err));
    assert!(!snapshot.is_loading);

    source.clear_failures();
    engine.refresh(Partition::Active).await.unwrap();
    let snapshot = engine.snapshot(Partition::Active);
    assert!(snapshot.error.is_none());
    assert!(snapshot.freshness.is_fresh());
}

#[tokio::test]
async fn test_active_view_accumulates_without_duplicates() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(42)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    engine.load_more(Partition::Active).await.unwrap();
    engine.load_more(Partition::Active).await.unwrap();

    let snapshot = engine.snapshot(Partition::Active);
    assert_eq!(snapshot.len(), 42);
    assert!(!snapshot.has_more);
    assert_no_duplicate_ids(&snapshot.items);
    assert!(engine.go_to_page(Partition::Active, 2).await.is_err());
}

#[tokio::test]
async fn test_trashed_view_pages_and_page_size() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::trashed_batch(25)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Trashed).await.unwrap();
    assert_eq!(engine.snapshot(Partition::Trashed).len(), 10);

    engine.go_to_page(Partition::Trashed, 3).await.unwrap();
    let page3 = engine.snapshot(Partition::Trashed);
    assert_eq!(page3.page, 3);
    assert_eq!(page3.len(), 5);
    assert!(!page3.has_more);

    let calls = source.list_calls();
    engine.load_more(Partition::Trashed).await.unwrap();
    assert_eq!(source.list_calls(), calls);

    engine.set_page_size(Partition::Trashed, 25).await.unwrap();
    let resized = engine.snapshot(Partition::Trashed);
    assert_eq!(resized.page, 1);
    assert_eq!(resized.page_size, 25);
    assert_eq!(resized.len(), 25);
    assert!(engine.set_page_size(Partition::Trashed, 30).await.is_err());
}

#[tokio::test]
async fn test_mutations_refetch_both_views() {
    let mut items = ItemFixture::active_batch(3);
    items.extend(ItemFixture::trashed_batch(2));
    let source = Arc::new(MockItemSource::with_items(items));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    engine.open(Partition::Trashed).await.unwrap();

    engine.archive(&ItemId::new("active-0")).await.unwrap();
    let active = engine.snapshot(Partition::Active);
    let trashed = engine.snapshot(Partition::Trashed);
    assert_eq!(active.len(), 2);
    assert_eq!(trashed.len(), 3);
    assert_disjoint(&active.items, &trashed.items);

    engine.restore(&ItemId::new("trashed-0")).await.unwrap();
    assert!(engine.snapshot(Partition::Active).contains(&ItemId::new("trashed-0")));

    assert!(engine.restore(&ItemId::new("active-1")).await.is_err());

    engine.delete(&ItemId::new("trashed-1")).await.unwrap();
    assert_eq!(engine.snapshot(Partition::Trashed).len(), 1);

    source.fail_mutations(ListingError::server(500, "boom"));
    assert!(engine.delete_all().await.is_err());
    assert_eq!(engine.snapshot(Partition::Trashed).len(), 1);

    source.clear_failures();
    engine.delete_all().await.unwrap();
    assert!(engine.snapshot(Partition::Trashed).is_empty());
    assert_eq!(engine.snapshot(Partition::Active).len(), 3);
}

#[tokio::test]
async fn test_closing_a_view_releases_its_entry() {
    let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(2)));
    let engine = engine(&source, EngineConfig::default());
    engine.open(Partition::Active).await.unwrap();
    assert!(engine.is_open(Partition::Active));

    engine.close(Partition::Active);
    assert!(!engine.is_open(Partition::Active));
    assert!(engine.snapshot(Partition::Active).is_empty());
    assert_eq!(engine.cache().stats().entry_count, 0);
}
