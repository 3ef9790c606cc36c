//! The query cache.
//!
//! Resolves a [`KeyedCriteria`] plus page request to cached items, issuing at
//! most one source call per `(key, page request)` slot at a time. Results are
//! tagged with the partition generation and the watermark at which the fetch
//! started:
//!
//! - a result whose generation was superseded is dropped, never stored;
//! - a result whose fetch started before an invalidation lands stale.
//!
//! Mutations are confirm-then-invalidate: the cache is only touched after
//! the source acknowledged the change.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use mosaic_core::{
    EngineConfig, ItemId, ItemSource, ListQuery, ListResponse, ListingError, Page, PageRequest,
    Partition, Placement,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{Applied, CacheEntry, PageView};
use super::freshness::CacheRead;
use super::generation::{Generation, GenerationClock, Watermark};
use super::key::CacheKey;
use super::ledger::PlacementLedger;
use super::stats::{CacheStats, StatCounters};
use crate::filter_store::KeyedCriteria;

type FetchResult = Result<CacheRead<PageView>, ListingError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Handle on a fetch another caller already started; awaiting it never
/// issues a request of its own.
pub type PendingFetch = SharedFetch;

/// A stale-while-revalidate read together with the revalidation it started
/// or joined, if the entry was stale.
pub struct Resolved {
    pub read: CacheRead<PageView>,
    pub revalidation: Option<PendingFetch>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("read", &self.read)
            .field("revalidating", &self.revalidation.is_some())
            .finish()
    }
}

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SlotKind {
    Page(PageRequest),
    Revalidate,
}

/// One coalescing slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchSlot {
    key: CacheKey,
    kind: SlotKind,
}

#[derive(Debug, Clone, Copy)]
struct FetchTag {
    id: u64,
    generation: Generation,
    started: Watermark,
}

struct InFlight {
    tag: FetchTag,
    future: SharedFetch,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<FetchSlot, InFlight>,
    ledger: PlacementLedger,
    next_fetch_id: u64,
}

impl CacheState {
    fn issue_tag(&mut self, generation: Generation, clock: &GenerationClock) -> FetchTag {
        self.next_fetch_id += 1;
        FetchTag {
            id: self.next_fetch_id,
            generation,
            started: clock.tick(),
        }
    }

    /// Free a slot, unless a newer fetch already took it over.
    fn release_slot(&mut self, slot: &FetchSlot, id: u64) {
        if self.in_flight.get(slot).is_some_and(|f| f.tag.id == id) {
            self.in_flight.remove(slot);
        }
    }

    fn has_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.keys().any(|slot| &slot.key == key)
    }

    /// Oldest watermark any cached or pending data is based on.
    fn oldest_live(&self) -> Option<Watermark> {
        let cached = self
            .entries
            .values()
            .filter(|e| e.has_data())
            .filter_map(CacheEntry::fetched_from);
        let pending = self.in_flight.values().map(|f| f.tag.started);
        cached.chain(pending).min()
    }

    fn read(&self, key: &CacheKey, config: &EngineConfig) -> Option<CacheRead<PageView>> {
        let entry = self.entries.get(key).filter(|e| e.has_data())?;
        Some(CacheRead::from_cache(
            entry.view(&self.ledger, default_page_size(key.partition(), config)),
            entry.freshness(config.entry_ttl),
            entry.fetched_at().unwrap_or_default(),
            entry.fetched_from(),
        ))
    }
}

struct CacheShared {
    config: EngineConfig,
    clock: Arc<GenerationClock>,
    state: Mutex<CacheState>,
    updates: broadcast::Sender<CacheKey>,
    stats: StatCounters,
}

impl CacheShared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, key: CacheKey) {
        // No subscribers is fine.
        let _ = self.updates.send(key);
    }

    fn superseded(&self, tag: FetchTag) -> ListingError {
        StatCounters::bump(&self.stats.discarded);
        ListingError::Superseded {
            generation: tag.generation.value(),
        }
    }

    fn land_page(
        &self,
        slot: &FetchSlot,
        tag: FetchTag,
        request: PageRequest,
        result: Result<ListResponse, ListingError>,
    ) -> FetchResult {
        let key = &slot.key;
        let partition = key.partition();
        let mut guard = self.lock();
        let state = &mut *guard;
        state.release_slot(slot, tag.id);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(key = %key, page = request.page, error = %err, "Page fetch failed");
                return Err(err);
            }
        };

        if tag.generation.is_superseded_by(self.clock.current(partition)) {
            debug!(key = %key, generation = %tag.generation, "Discarding superseded page");
            return Err(self.superseded(tag));
        }
        let Some(entry) = state.entries.get_mut(key) else {
            debug!(key = %key, "Discarding page for evicted entry");
            return Err(self.superseded(tag));
        };

        match entry.apply_page(partition.strategy(), request, Page::from(response), tag.started) {
            Applied::Rejected => {
                debug!(key = %key, page = request.page, "Discarding out-of-order page");
                return Err(self.superseded(tag));
            }
            Applied::Redundant => StatCounters::bump(&self.stats.discarded),
            Applied::Stored => {}
        }

        let read = CacheRead::from_source(
            entry.view(&state.ledger, default_page_size(partition, &self.config)),
            entry.freshness(self.config.entry_ttl),
            entry.fetched_at().unwrap_or_default(),
            entry.fetched_from(),
        );
        let oldest = state.oldest_live();
        state.ledger.prune(oldest);
        drop(guard);

        debug!(
            key = %key,
            page = request.page,
            items = read.value().items.len(),
            freshness = ?read.freshness(),
            "Page stored"
        );
        self.publish(key.clone());
        Ok(read)
    }

    fn land_revalidation(
        &self,
        slot: &FetchSlot,
        tag: FetchTag,
        result: Result<Vec<(PageRequest, Page)>, ListingError>,
    ) -> FetchResult {
        let key = &slot.key;
        let partition = key.partition();
        let mut guard = self.lock();
        let state = &mut *guard;
        state.release_slot(slot, tag.id);

        let pages = match result {
            Ok(pages) => pages,
            Err(err) => {
                warn!(key = %key, error = %err, "Revalidation failed, keeping last-known data");
                return Err(err);
            }
        };

        if tag.generation.is_superseded_by(self.clock.current(partition)) {
            return Err(self.superseded(tag));
        }
        let Some(entry) = state.entries.get_mut(key) else {
            return Err(self.superseded(tag));
        };
        if entry.replace_all(partition.strategy(), pages, tag.started) == Applied::Rejected {
            return Err(self.superseded(tag));
        }

        let read = CacheRead::from_source(
            entry.view(&state.ledger, default_page_size(partition, &self.config)),
            entry.freshness(self.config.entry_ttl),
            entry.fetched_at().unwrap_or_default(),
            entry.fetched_from(),
        );
        let oldest = state.oldest_live();
        state.ledger.prune(oldest);
        drop(guard);

        debug!(key = %key, freshness = ?read.freshness(), "Revalidated");
        self.publish(key.clone());
        Ok(read)
    }

    fn invalidate_partition(&self, partition: Partition, since: Watermark) -> usize {
        let mut touched = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            for (key, entry) in state.entries.iter_mut() {
                if key.partition() != partition {
                    continue;
                }
                let data_before = entry.has_data()
                    && entry
                        .fetched_from()
                        .is_some_and(|from| since.is_newer_than(from));
                let pending_before = state
                    .in_flight
                    .iter()
                    .any(|(slot, f)| &slot.key == key && since.is_newer_than(f.tag.started));
                if (data_before || pending_before) && entry.invalidate(since) {
                    touched.push(key.clone());
                }
            }
        }

        StatCounters::add(&self.stats.invalidations, touched.len() as u64);
        let count = touched.len();
        if count > 0 {
            debug!(partition = %partition, since = %since, entries = count, "Invalidated partition");
        }
        for key in touched {
            self.publish(key);
        }
        count
    }

    fn release_lease(&self, key: &CacheKey) {
        let evicted = {
            let mut state = self.lock();
            match state.entries.get_mut(key) {
                Some(entry) if entry.leases > 1 => {
                    entry.leases -= 1;
                    false
                }
                Some(_) => {
                    state.entries.remove(key);
                    true
                }
                None => false,
            }
        };
        if evicted {
            StatCounters::bump(&self.stats.evictions);
            debug!(key = %key, "Evicted entry after last lease dropped");
            self.publish(key.clone());
        }
    }
}

fn default_page_size(partition: Partition, config: &EngineConfig) -> u32 {
    match partition {
        Partition::Active => config.active_page_size,
        Partition::Trashed => config.default_trashed_page_size,
    }
}

/// Bound a source call by the fetch timeout, surfacing expiry as `Network`.
async fn timed<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ListingError>>,
) -> Result<T, ListingError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ListingError::network(format!(
            "request timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

fn share(task: JoinHandle<FetchResult>) -> SharedFetch {
    async move {
        task.await.unwrap_or_else(|err| {
            Err(ListingError::network(format!("fetch task failed: {err}")))
        })
    }
    .boxed()
    .shared()
}

/// Held by every subscriber of a key; the entry lives while any lease does.
pub struct EntryLease {
    key: CacheKey,
    cache: Weak<CacheShared>,
}

impl EntryLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl std::fmt::Debug for EntryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLease").field("key", &self.key).finish()
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.release_lease(&self.key);
        }
    }
}

/// Per-item outcome of a bulk mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationReport {
    pub succeeded: Vec<ItemId>,
    pub failed: Vec<(ItemId, ListingError)>,
}

impl MutationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Query cache over an [`ItemSource`].
pub struct QueryCache<S: ItemSource + ?Sized + 'static = dyn ItemSource> {
    shared: Arc<CacheShared>,
    source: Arc<S>,
}

impl<S: ItemSource + ?Sized + 'static> Clone for QueryCache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
        }
    }
}

impl<S: ItemSource + ?Sized + 'static> QueryCache<S> {
    pub fn new(source: Arc<S>, clock: Arc<GenerationClock>, config: EngineConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let ledger = PlacementLedger::new(config.max_placements);
        Self {
            shared: Arc::new(CacheShared {
                config,
                clock,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    ledger,
                    next_fetch_id: 0,
                }),
                updates,
                stats: StatCounters::default(),
            }),
            source,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<GenerationClock> {
        &self.shared.clock
    }

    /// Keys whose visible contents changed: stored results, invalidations
    /// and evictions.
    pub fn updates(&self) -> broadcast::Receiver<CacheKey> {
        self.shared.updates.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.shared.lock().entries.len();
        self.shared.stats.snapshot(entries)
    }

    /// Validate criteria and reject superseded generations before any I/O.
    fn check(&self, keyed: &KeyedCriteria) -> Result<(), ListingError> {
        keyed.criteria.validate()?;
        let current = self.shared.clock.current(keyed.key.partition());
        if keyed.generation.is_superseded_by(current) {
            return Err(ListingError::Superseded {
                generation: keyed.generation.value(),
            });
        }
        Ok(())
    }

    /// Create or retain the entry for `key`.
    pub fn lease(&self, key: &CacheKey) -> EntryLease {
        let mut state = self.shared.lock();
        state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.partition()))
            .leases += 1;
        EntryLease {
            key: key.clone(),
            cache: Arc::downgrade(&self.shared),
        }
    }

    /// Peek at an entry without fetching.
    pub fn read(&self, key: &CacheKey) -> Option<CacheRead<PageView>> {
        self.shared.lock().read(key, &self.shared.config)
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.shared.lock().has_in_flight(key)
    }

    /// Fetch one page and store it per the partition's page strategy.
    pub async fn fetch_page(&self, keyed: &KeyedCriteria, request: PageRequest) -> FetchResult {
        self.check(keyed)?;
        StatCounters::bump(&self.shared.stats.misses);
        self.page_fetch(keyed, request).await
    }

    fn page_fetch(&self, keyed: &KeyedCriteria, request: PageRequest) -> SharedFetch {
        let key = keyed.key.clone();
        let partition = key.partition();
        let slot = FetchSlot {
            key: key.clone(),
            kind: SlotKind::Page(request),
        };

        let mut state = self.shared.lock();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(partition));
        if partition == Partition::Trashed {
            entry.set_intent(request);
        }

        if let Some(existing) = state.in_flight.get(&slot) {
            if existing.tag.generation == keyed.generation {
                StatCounters::bump(&self.shared.stats.coalesced);
                debug!(key = %key, page = request.page, "Joining in-flight fetch");
                return existing.future.clone();
            }
        }

        let tag = state.issue_tag(keyed.generation, &self.shared.clock);
        StatCounters::bump(&self.shared.stats.fetches);
        debug!(
            key = %key,
            page = request.page,
            limit = request.limit,
            generation = %tag.generation,
            started = %tag.started,
            "Fetching page"
        );

        let query = ListQuery::build(partition, &keyed.criteria, request);
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let task_slot = slot.clone();
        let task = tokio::spawn(async move {
            let result = timed(shared.config.fetch_timeout, source.list(&query)).await;
            shared.land_page(&task_slot, tag, request, result)
        });

        let future = share(task);
        state.in_flight.insert(
            slot,
            InFlight {
                tag,
                future: future.clone(),
            },
        );
        future
    }

    /// Stale-while-revalidate read.
    ///
    /// Fresh data is returned as-is. Stale data is returned immediately and
    /// a background revalidation is started (or joined). Anything else is
    /// fetched.
    pub async fn resolve(&self, keyed: &KeyedCriteria, request: PageRequest) -> FetchResult {
        self.resolve_tracked(keyed, request).await.map(|resolved| resolved.read)
    }

    /// [`resolve`](Self::resolve), also handing back the background
    /// revalidation so the caller can follow it without refetching.
    pub async fn resolve_tracked(
        &self,
        keyed: &KeyedCriteria,
        request: PageRequest,
    ) -> Result<Resolved, ListingError> {
        self.check(keyed)?;
        let key = &keyed.key;
        let cached = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.partition()));
            if key.partition() == Partition::Trashed {
                entry.set_intent(request);
            }
            if entry.has_data() && entry.covers(request) {
                state.read(key, &self.shared.config)
            } else {
                None
            }
        };

        match cached {
            Some(read) => {
                StatCounters::bump(&self.shared.stats.hits);
                let revalidation = (!read.is_fresh()).then(|| {
                    debug!(key = %key, "Serving stale entry while revalidating");
                    self.revalidation(keyed)
                });
                Ok(Resolved { read, revalidation })
            }
            None => {
                StatCounters::bump(&self.shared.stats.misses);
                let read = self.page_fetch(keyed, request).await?;
                Ok(Resolved {
                    read,
                    revalidation: None,
                })
            }
        }
    }

    /// Refetch everything an entry shows and swap it in atomically.
    pub async fn revalidate(&self, keyed: &KeyedCriteria) -> FetchResult {
        self.check(keyed)?;
        self.revalidation(keyed).await
    }

    fn revalidation(&self, keyed: &KeyedCriteria) -> SharedFetch {
        let key = keyed.key.clone();
        let partition = key.partition();
        let slot = FetchSlot {
            key: key.clone(),
            kind: SlotKind::Revalidate,
        };

        let mut state = self.shared.lock();
        if let Some(existing) = state.in_flight.get(&slot) {
            if existing.tag.generation == keyed.generation {
                StatCounters::bump(&self.shared.stats.coalesced);
                return existing.future.clone();
            }
        }

        let plan = state
            .entries
            .get(&key)
            .map(|entry| entry.revalidation_plan(keyed.page_size))
            .unwrap_or_else(|| vec![PageRequest::first(keyed.page_size)]);
        let tag = state.issue_tag(keyed.generation, &self.shared.clock);
        StatCounters::add(&self.shared.stats.fetches, plan.len() as u64);
        debug!(key = %key, pages = plan.len(), started = %tag.started, "Revalidating");

        let criteria = keyed.criteria.clone();
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let task_slot = slot.clone();
        let task = tokio::spawn(async move {
            let mut pages = Vec::with_capacity(plan.len());
            let mut failure = None;
            for request in plan {
                let query = ListQuery::build(partition, &criteria, request);
                match timed(shared.config.fetch_timeout, source.list(&query)).await {
                    Ok(response) => {
                        let has_more = response.has_more;
                        pages.push((request, Page::from(response)));
                        if !has_more {
                            break;
                        }
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            let result = match failure {
                Some(err) => Err(err),
                None => Ok(pages),
            };
            shared.land_revalidation(&task_slot, tag, result)
        });

        let future = share(task);
        state.in_flight.insert(
            slot,
            InFlight {
                tag,
                future: future.clone(),
            },
        );
        future
    }

    /// Load the next page of an accumulated entry.
    ///
    /// Waits for a running revalidation first so the appended page lines up
    /// with the refetched ones. Returns the current view unchanged when the
    /// list is exhausted.
    pub async fn load_more(&self, keyed: &KeyedCriteria) -> FetchResult {
        self.check(keyed)?;
        let key = &keyed.key;
        let pending = {
            let state = self.shared.lock();
            state
                .in_flight
                .get(&FetchSlot {
                    key: key.clone(),
                    kind: SlotKind::Revalidate,
                })
                .map(|f| f.future.clone())
        };
        if let Some(pending) = pending {
            // Its outcome is reported to whoever started it.
            let _ = pending.await;
        }

        let next = {
            let state = self.shared.lock();
            state
                .entries
                .get(key)
                .filter(|entry| entry.has_data())
                .map(CacheEntry::next_page)
        };
        match next {
            Some(Some(request)) => self.fetch_page(keyed, request).await,
            Some(None) => match self.read(key) {
                Some(read) => Ok(read),
                None => self.fetch_page(keyed, PageRequest::first(keyed.page_size)).await,
            },
            None => self.fetch_page(keyed, PageRequest::first(keyed.page_size)).await,
        }
    }

    /// Mark one entry stale without cancelling its in-flight fetches.
    ///
    /// Returns false, and does nothing, when the entry is unknown or already
    /// stale with nothing in flight.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let has_in_flight = state.has_in_flight(key);
            let Some(entry) = state.entries.get_mut(key) else {
                return false;
            };
            let already_stale = entry.freshness(None).is_stale();
            if !has_in_flight && (already_stale || !entry.has_data()) {
                return false;
            }
            let at = self.shared.clock.tick();
            entry.invalidate(at);
            debug!(key = %key, at = %at, "Invalidated entry");
        }
        StatCounters::bump(&self.shared.stats.invalidations);
        self.shared.publish(key.clone());
        true
    }

    /// Invalidate every entry of `partition` whose data or pending fetch
    /// predates `since`. Returns the number of entries marked.
    pub fn invalidate_partition(&self, partition: Partition, since: Watermark) -> usize {
        self.shared.invalidate_partition(partition, since)
    }

    /// Record a confirmed or announced move of an item.
    pub fn record_placement(&self, id: ItemId, placement: Placement, at: Watermark) {
        let keys: Vec<CacheKey> = {
            let mut state = self.shared.lock();
            state.ledger.record(id, placement, at);
            state
                .entries
                .iter()
                .filter(|(_, e)| e.has_data())
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in keys {
            self.shared.publish(key);
        }
    }

    fn confirm(
        &self,
        partitions: &[Partition],
        moves: Vec<(ItemId, Placement)>,
        purge: Option<Partition>,
    ) -> Watermark {
        let at = self.shared.clock.tick();
        {
            let mut state = self.shared.lock();
            for (id, placement) in moves {
                state.ledger.record(id, placement, at);
            }
            if let Some(partition) = purge {
                state.ledger.record_purge(partition, at);
            }
        }
        for partition in partitions {
            self.shared.invalidate_partition(*partition, at);
        }
        at
    }

    fn timeout(&self) -> Duration {
        self.shared.config.fetch_timeout
    }

    /// Re-run generation for a failed item.
    pub async fn retry(&self, id: &ItemId) -> Result<(), ListingError> {
        timed(self.timeout(), self.source.retry(id)).await?;
        let at = self.confirm(&[Partition::Active], Vec::new(), None);
        info!(item_id = %id, at = %at, "Retry confirmed");
        Ok(())
    }

    pub async fn archive(&self, id: &ItemId) -> Result<(), ListingError> {
        timed(self.timeout(), self.source.archive(id)).await?;
        let at = self.confirm(
            &Partition::ALL,
            vec![(id.clone(), Placement::In(Partition::Trashed))],
            None,
        );
        info!(item_id = %id, at = %at, "Archive confirmed");
        Ok(())
    }

    pub async fn restore(&self, id: &ItemId) -> Result<(), ListingError> {
        timed(self.timeout(), self.source.restore(id)).await?;
        let at = self.confirm(
            &Partition::ALL,
            vec![(id.clone(), Placement::In(Partition::Active))],
            None,
        );
        info!(item_id = %id, at = %at, "Restore confirmed");
        Ok(())
    }

    /// Permanently delete one trashed item.
    pub async fn delete(&self, id: &ItemId) -> Result<(), ListingError> {
        timed(self.timeout(), self.source.delete(id)).await?;
        let at = self.confirm(
            &[Partition::Trashed],
            vec![(id.clone(), Placement::Gone)],
            None,
        );
        info!(item_id = %id, at = %at, "Delete confirmed");
        Ok(())
    }

    /// Empty the trash. On failure the trashed entries are left untouched.
    pub async fn delete_all(&self) -> Result<(), ListingError> {
        timed(self.timeout(), self.source.delete_all()).await?;
        let at = self.confirm(&[Partition::Trashed], Vec::new(), Some(Partition::Trashed));
        info!(at = %at, "Trash emptied");
        Ok(())
    }

    pub async fn archive_many(&self, ids: &[ItemId]) -> MutationReport {
        let report = self.bulk(ids, |id| self.source.archive(id)).await;
        if !report.succeeded.is_empty() {
            let moves = report
                .succeeded
                .iter()
                .map(|id| (id.clone(), Placement::In(Partition::Trashed)))
                .collect();
            self.confirm(&Partition::ALL, moves, None);
        }
        info!(
            archived = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk archive finished"
        );
        report
    }

    pub async fn restore_many(&self, ids: &[ItemId]) -> MutationReport {
        let report = self.bulk(ids, |id| self.source.restore(id)).await;
        if !report.succeeded.is_empty() {
            let moves = report
                .succeeded
                .iter()
                .map(|id| (id.clone(), Placement::In(Partition::Active)))
                .collect();
            self.confirm(&Partition::ALL, moves, None);
        }
        info!(
            restored = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk restore finished"
        );
        report
    }

    async fn bulk<'a, F>(&'a self, ids: &'a [ItemId], call: F) -> MutationReport
    where
        F: Fn(&'a ItemId) -> BoxFuture<'a, Result<(), ListingError>>,
    {
        let timeout = self.timeout();
        let outcomes = join_all(ids.iter().map(|id| {
            let fut = call(id);
            async move { (id, timed(timeout, fut).await) }
        }))
        .await;

        let mut report = MutationReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded.push(id.clone()),
                Err(err) => {
                    warn!(item_id = %id, error = %err, "Bulk mutation item failed");
                    report.failed.push((id.clone(), err));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Freshness;
    use chrono::{Duration as ChronoDuration, Utc};
    use mosaic_core::{DateRange, FilterCriteria, UserId};
    use mosaic_test_utils::{ItemFixture, MockItemSource};

    fn keyed(clock: &GenerationClock, partition: Partition, page_size: u32) -> KeyedCriteria {
        let criteria = FilterCriteria::defaults(Utc::now() - ChronoDuration::days(365));
        KeyedCriteria {
            key: CacheKey::new(UserId::new("u1"), partition, &criteria),
            criteria,
            generation: clock.current(partition),
            page_size,
        }
    }

    fn cache(source: &Arc<MockItemSource>) -> (QueryCache<MockItemSource>, Arc<GenerationClock>) {
        let clock = Arc::new(GenerationClock::new());
        let cache = QueryCache::new(Arc::clone(source), Arc::clone(&clock), EngineConfig::default());
        (cache, clock)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(30)));
        source.set_latency(std::time::Duration::from_millis(20));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Active, 15);
        let _lease = cache.lease(&k.key);

        let (a, b) = tokio::join!(
            cache.fetch_page(&k, PageRequest::first(15)),
            cache.fetch_page(&k, PageRequest::first(15))
        );
        assert_eq!(a.unwrap().value().items.len(), 15);
        assert_eq!(b.unwrap().value().items.len(), 15);
        assert_eq!(source.list_calls(), 1);
        assert_eq!(cache.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_superseded_generation_is_rejected_up_front() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(3)));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Active, 15);
        clock.advance(Partition::Active);

        let err = cache.fetch_page(&k, PageRequest::first(15)).await.unwrap_err();
        assert!(err.is_superseded());
        assert_eq!(source.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_date_range_fails_validation() {
        let source = Arc::new(MockItemSource::default());
        let (cache, clock) = cache(&source);
        let mut k = keyed(&clock, Partition::Active, 15);
        let start = k.criteria.date_range.start;
        k.criteria.date_range = DateRange::new(start, start - ChronoDuration::days(1));

        let err = cache.fetch_page(&k, PageRequest::first(15)).await.unwrap_err();
        assert!(matches!(err, ListingError::Validation(_)));
        assert_eq!(source.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Active, 15);
        let _lease = cache.lease(&k.key);
        cache.fetch_page(&k, PageRequest::first(15)).await.unwrap();

        assert!(cache.invalidate(&k.key));
        assert!(!cache.invalidate(&k.key));
        assert_eq!(cache.read(&k.key).unwrap().freshness(), Freshness::Stale);
        assert_eq!(source.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_resolve_serves_old_data_then_revalidates() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Active, 15);
        let _lease = cache.lease(&k.key);
        cache.fetch_page(&k, PageRequest::first(15)).await.unwrap();
        cache.invalidate(&k.key);

        let read = cache.resolve(&k, PageRequest::first(15)).await.unwrap();
        assert!(read.was_cache_hit());
        assert_eq!(read.freshness(), Freshness::Stale);

        let fresh = cache.revalidate(&k).await.unwrap();
        assert!(fresh.is_fresh());
        assert_eq!(source.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_tracked_resolve_hands_back_its_revalidation() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(5)));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Active, 15);
        let _lease = cache.lease(&k.key);

        let first = cache.resolve_tracked(&k, PageRequest::first(15)).await.unwrap();
        assert!(first.revalidation.is_none());

        cache.invalidate(&k.key);
        let stale = cache.resolve_tracked(&k, PageRequest::first(15)).await.unwrap();
        assert_eq!(stale.read.freshness(), Freshness::Stale);
        let fresh = stale.revalidation.expect("stale hit revalidates").await.unwrap();
        assert!(fresh.is_fresh());

        assert_eq!(source.list_calls(), 2);
        assert!(!cache.is_fetching(&k.key));
    }

    #[tokio::test]
    async fn test_dropping_last_lease_evicts() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(2)));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Active, 15);
        let first = cache.lease(&k.key);
        let second = cache.lease(&k.key);
        cache.fetch_page(&k, PageRequest::first(15)).await.unwrap();

        drop(first);
        assert!(cache.read(&k.key).is_some());
        drop(second);
        assert!(cache.read(&k.key).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_cache_untouched() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::trashed_batch(3)));
        let (cache, clock) = cache(&source);
        let k = keyed(&clock, Partition::Trashed, 10);
        let _lease = cache.lease(&k.key);
        cache.fetch_page(&k, PageRequest::first(10)).await.unwrap();

        source.fail_mutations(ListingError::server(500, "boom"));
        assert!(cache.delete_all().await.is_err());
        let read = cache.read(&k.key).unwrap();
        assert!(read.is_fresh());
        assert_eq!(read.value().items.len(), 3);
    }

    #[tokio::test]
    async fn test_bulk_archive_reports_per_item() {
        let source = Arc::new(MockItemSource::with_items(ItemFixture::active_batch(3)));
        let (cache, _clock) = cache(&source);
        let ids = vec![ItemId::new("active-0"), ItemId::new("missing")];

        let report = cache.archive_many(&ids).await;
        assert_eq!(report.succeeded, vec![ItemId::new("active-0")]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, ListingError::Conflict { .. }));
        assert!(!report.is_complete());
    }
}
