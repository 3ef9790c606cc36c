//! The per-partition listing engine.
//!
//! Wires the filter store, the query cache and the invalidator together and
//! publishes one [`ListSnapshot`] per partition on a watch channel. All
//! actions go through here; renderers only ever read snapshots.
//!
//! Snapshots are always rebuilt from the view's *current* criteria, so a
//! result that lands for an older filter can never reach a renderer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use mosaic_core::{
    ChannelSignal, ConfigError, EngineConfig, FilterPatch, ItemId, ItemSource, ListingError,
    PageRequest, Partition, PageStrategy, Placement, ValidationError,
};
use mosaic_storage::{
    EntryLease, FilterPersistence, FilterStateStore, GenerationClock, KeyedCriteria,
    MutationReport, PendingFetch, QueryCache, UserContext, Watermark,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::invalidator::{InvalidationTarget, RealtimeInvalidator};
use crate::snapshot::ListSnapshot;

enum Load {
    Resolve(PageRequest),
    More,
    Revalidate,
    /// Follow a revalidation the cache already started.
    Follow(PendingFetch),
}

struct ViewState {
    keyed: KeyedCriteria,
    /// Page the view asked for last; the first page for accumulated views.
    request: PageRequest,
    lease: Option<EntryLease>,
    error: Option<ListingError>,
    /// Loads started by the engine that have not finished.
    busy: usize,
}

struct View {
    state: Mutex<ViewState>,
    snapshot: watch::Sender<ListSnapshot>,
}

impl View {
    fn new(partition: Partition, keyed: KeyedCriteria) -> Self {
        let (snapshot, _) = watch::channel(ListSnapshot::empty(partition, &keyed));
        Self {
            state: Mutex::new(ViewState {
                request: PageRequest::first(keyed.page_size),
                keyed,
                lease: None,
                error: None,
                busy: 0,
            }),
            snapshot,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct EngineInner<P: FilterPersistence, S: ItemSource + ?Sized + 'static> {
    filters: FilterStateStore<P>,
    cache: QueryCache<S>,
    views: [View; 2],
}

impl<P: FilterPersistence, S: ItemSource + ?Sized + 'static> EngineInner<P, S> {
    fn view(&self, partition: Partition) -> &View {
        &self.views[partition.index()]
    }

    /// Rebuild and publish a partition's snapshot if it changed.
    fn publish(&self, partition: Partition) {
        let view = self.view(partition);
        let state = view.lock();
        let key = &state.keyed.key;
        let loading = state.busy > 0 || self.cache.is_fetching(key);
        let mut next = ListSnapshot::build(
            partition,
            &state.keyed,
            self.cache.read(key),
            loading,
            state.error.clone(),
        );
        // Sent under the view lock so concurrent publishes stay ordered.
        view.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.items == next.items {
                next.items = Arc::clone(&current.items);
            }
            *current = next;
            true
        });
    }
}

/// UI-agnostic coordinator for both partitions of one user.
pub struct ListingEngine<P, S = dyn ItemSource>
where
    P: FilterPersistence + 'static,
    S: ItemSource + ?Sized + 'static,
{
    inner: Arc<EngineInner<P, S>>,
}

impl<P, S> Clone for ListingEngine<P, S>
where
    P: FilterPersistence + 'static,
    S: ItemSource + ?Sized + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, S> std::fmt::Debug for ListingEngine<P, S>
where
    P: FilterPersistence + 'static,
    S: ItemSource + ?Sized + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListingEngine")
            .field("filters", &self.inner.filters)
            .finish_non_exhaustive()
    }
}

impl<P, S> ListingEngine<P, S>
where
    P: FilterPersistence + 'static,
    S: ItemSource + ?Sized + 'static,
{
    /// Build the engine and start its cache listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        user: UserContext,
        persistence: P,
        source: Arc<S>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = Arc::new(GenerationClock::new());
        let filters = FilterStateStore::new(user, persistence, Arc::clone(&clock), config.clone());
        let cache = QueryCache::new(source, clock, config);
        let views = Partition::ALL.map(|partition| View::new(partition, filters.get(partition)));

        let inner = Arc::new(EngineInner {
            filters,
            cache,
            views,
        });
        spawn_listener(&inner);
        info!(user_id = %inner.filters.user().user_id, "Listing engine started");
        Ok(Self { inner })
    }

    pub fn cache(&self) -> &QueryCache<S> {
        &self.inner.cache
    }

    pub fn filters(&self) -> &FilterStateStore<P> {
        &self.inner.filters
    }

    pub fn clock(&self) -> &Arc<GenerationClock> {
        self.inner.cache.clock()
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.cache.config()
    }

    pub fn subscribe(&self, partition: Partition) -> watch::Receiver<ListSnapshot> {
        self.inner.view(partition).snapshot.subscribe()
    }

    pub fn snapshot(&self, partition: Partition) -> ListSnapshot {
        self.inner.view(partition).snapshot.borrow().clone()
    }

    /// Criteria the partition is currently showing.
    pub fn criteria(&self, partition: Partition) -> KeyedCriteria {
        self.inner.view(partition).lock().keyed.clone()
    }

    pub fn is_open(&self, partition: Partition) -> bool {
        self.inner.view(partition).lock().lease.is_some()
    }

    /// Feed push-channel signals into a debounced invalidator bound to this
    /// engine.
    pub fn attach(&self, signals: mpsc::Receiver<ChannelSignal>) -> RealtimeInvalidator {
        RealtimeInvalidator::spawn(
            signals,
            self.clone(),
            Arc::clone(self.clock()),
            self.config(),
        )
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Start showing a partition: lease its entry and load the current page.
    pub async fn open(&self, partition: Partition) -> Result<(), ListingError> {
        let (keyed, request) = {
            let mut state = self.inner.view(partition).lock();
            if state.lease.is_none() {
                state.lease = Some(self.inner.cache.lease(&state.keyed.key));
            }
            (state.keyed.clone(), state.request)
        };
        self.run(partition, keyed, Load::Resolve(request)).await
    }

    /// Stop showing a partition. Its cache entry is evicted once no other
    /// lease holds it.
    pub fn close(&self, partition: Partition) {
        let lease = self.inner.view(partition).lock().lease.take();
        drop(lease);
        self.inner.publish(partition);
    }

    /// Load the next page: appended for accumulated views, replacing the
    /// shown page otherwise.
    pub async fn load_more(&self, partition: Partition) -> Result<(), ListingError> {
        match partition.strategy() {
            PageStrategy::Accumulate => {
                let keyed = self.inner.view(partition).lock().keyed.clone();
                self.run(partition, keyed, Load::More).await
            }
            PageStrategy::Replace => {
                let shown = self.snapshot(partition);
                if !shown.has_more {
                    return Ok(());
                }
                self.go_to_page(partition, shown.page + 1).await
            }
        }
    }

    /// Show a specific page of an offset-paginated view.
    pub async fn go_to_page(&self, partition: Partition, page: u32) -> Result<(), ListingError> {
        if partition.strategy() != PageStrategy::Replace {
            return Err(self.fail(
                partition,
                ValidationError::InvalidValue {
                    field: "page".to_string(),
                    reason: format!("{partition} pages accumulate; use load_more"),
                }
                .into(),
            ));
        }
        let (keyed, request) = {
            let mut state = self.inner.view(partition).lock();
            state.request = PageRequest::new(page, state.keyed.page_size);
            (state.keyed.clone(), state.request)
        };
        self.run(partition, keyed, Load::Resolve(request)).await
    }

    /// Manual refresh: mark the shown entry stale and refetch it.
    pub async fn refresh(&self, partition: Partition) -> Result<(), ListingError> {
        let keyed = self.inner.view(partition).lock().keyed.clone();
        self.inner.cache.invalidate(&keyed.key);
        self.run(partition, keyed, Load::Revalidate).await
    }

    pub fn dismiss_error(&self, partition: Partition) {
        self.inner.view(partition).lock().error = None;
        self.inner.publish(partition);
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    pub async fn set_filters(
        &self,
        partition: Partition,
        patch: &FilterPatch,
    ) -> Result<(), ListingError> {
        match self.inner.filters.set(partition, patch) {
            Ok(keyed) => self.switch(partition, keyed).await,
            Err(err) => Err(self.fail(partition, err)),
        }
    }

    pub async fn reset_filters(&self, partition: Partition) -> Result<(), ListingError> {
        match self.inner.filters.reset(partition) {
            Ok(keyed) => self.switch(partition, keyed).await,
            Err(err) => Err(self.fail(partition, err)),
        }
    }

    pub async fn set_page_size(&self, partition: Partition, size: u32) -> Result<(), ListingError> {
        match self.inner.filters.set_page_size(partition, size) {
            Ok(keyed) => self.switch(partition, keyed).await,
            Err(err) => Err(self.fail(partition, err)),
        }
    }

    /// Point the view at new criteria, back at the first page.
    async fn switch(&self, partition: Partition, keyed: KeyedCriteria) -> Result<(), ListingError> {
        let request = PageRequest::first(keyed.page_size);
        let (previous, open) = {
            let mut state = self.inner.view(partition).lock();
            let open = state.lease.is_some();
            let lease = open.then(|| self.inner.cache.lease(&keyed.key));
            let previous = std::mem::replace(&mut state.lease, lease);
            state.keyed = keyed.clone();
            state.request = request;
            state.error = None;
            (previous, open)
        };
        drop(previous);
        debug!(partition = %partition, generation = %keyed.generation, "View criteria switched");
        self.inner.publish(partition);

        if open {
            self.run(partition, keyed, Load::Resolve(request)).await
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn retry(&self, id: &ItemId) -> Result<(), ListingError> {
        let result = self.inner.cache.retry(id).await;
        self.after_mutation(&[Partition::Active], result).await
    }

    pub async fn archive(&self, id: &ItemId) -> Result<(), ListingError> {
        let result = self.inner.cache.archive(id).await;
        self.after_mutation(&Partition::ALL, result).await
    }

    pub async fn restore(&self, id: &ItemId) -> Result<(), ListingError> {
        let result = self.inner.cache.restore(id).await;
        self.after_mutation(&Partition::ALL, result).await
    }

    pub async fn delete(&self, id: &ItemId) -> Result<(), ListingError> {
        let result = self.inner.cache.delete(id).await;
        self.after_mutation(&[Partition::Trashed], result).await
    }

    pub async fn delete_all(&self) -> Result<(), ListingError> {
        let result = self.inner.cache.delete_all().await;
        self.after_mutation(&[Partition::Trashed], result).await
    }

    pub async fn archive_many(&self, ids: &[ItemId]) -> MutationReport {
        let report = self.inner.cache.archive_many(ids).await;
        if !report.succeeded.is_empty() {
            self.refetch_open(&Partition::ALL).await;
        }
        report
    }

    pub async fn restore_many(&self, ids: &[ItemId]) -> MutationReport {
        let report = self.inner.cache.restore_many(ids).await;
        if !report.succeeded.is_empty() {
            self.refetch_open(&Partition::ALL).await;
        }
        report
    }

    async fn after_mutation(
        &self,
        partitions: &[Partition],
        result: Result<(), ListingError>,
    ) -> Result<(), ListingError> {
        match &result {
            Ok(()) => self.refetch_open(partitions).await,
            Err(err) => warn!(error = %err, "Mutation failed, cache left untouched"),
        }
        result
    }

    /// Revalidate every open view among `partitions`. Failures are recorded
    /// in the snapshots.
    async fn refetch_open(&self, partitions: &[Partition]) {
        for partition in partitions {
            let keyed = {
                let state = self.inner.view(*partition).lock();
                state.lease.is_some().then(|| state.keyed.clone())
            };
            if let Some(keyed) = keyed {
                // Already recorded in the snapshot.
                let _ = self.run(*partition, keyed, Load::Revalidate).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    async fn run(
        &self,
        partition: Partition,
        keyed: KeyedCriteria,
        load: Load,
    ) -> Result<(), ListingError> {
        self.inner.view(partition).lock().busy += 1;
        self.inner.publish(partition);

        let cache = &self.inner.cache;
        let (result, revalidation) = match load {
            Load::Resolve(request) => match cache.resolve_tracked(&keyed, request).await {
                Ok(resolved) => (Ok(resolved.read), resolved.revalidation),
                Err(err) => (Err(err), None),
            },
            Load::More => (cache.load_more(&keyed).await, None),
            Load::Revalidate => (cache.revalidate(&keyed).await, None),
            Load::Follow(pending) => (pending.await, None),
        };

        {
            let mut state = self.inner.view(partition).lock();
            state.busy = state.busy.saturating_sub(1);
            let current = state.keyed.key == keyed.key && state.keyed.generation == keyed.generation;
            match &result {
                Err(err) if current && !err.is_superseded() => state.error = Some(err.clone()),
                Ok(read) if current && read.is_fresh() => state.error = None,
                _ => {}
            }
        }
        self.inner.publish(partition);

        if let Some(pending) = revalidation {
            // Track the cache's own revalidation; never start a second one.
            self.spawn_load(partition, keyed, Load::Follow(pending));
        }

        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_superseded() => {
                debug!(partition = %partition, "Load superseded by newer criteria");
                Ok(())
            }
            Err(err) => {
                warn!(partition = %partition, error = %err, "Load failed");
                Err(err)
            }
        }
    }

    fn spawn_load(&self, partition: Partition, keyed: KeyedCriteria, load: Load) {
        let engine = self.clone();
        tokio::spawn(async move {
            // Recorded in the snapshot.
            let _ = engine.run(partition, keyed, load).await;
        });
    }

    /// Record an error that happened before any load started.
    fn fail(&self, partition: Partition, err: ListingError) -> ListingError {
        self.inner.view(partition).lock().error = Some(err.clone());
        self.inner.publish(partition);
        err
    }
}

impl<P, S> InvalidationTarget for ListingEngine<P, S>
where
    P: FilterPersistence + 'static,
    S: ItemSource + ?Sized + 'static,
{
    fn record_placement(&self, id: ItemId, placement: Placement, at: Watermark) {
        self.inner.cache.record_placement(id, placement, at);
    }

    /// Invalidate both partitions, then refetch whichever open views went
    /// stale.
    fn invalidate_since(&self, since: Watermark) -> usize {
        let marked = InvalidationTarget::invalidate_since(&self.inner.cache, since);
        if marked == 0 {
            return 0;
        }
        for partition in Partition::ALL {
            let keyed = {
                let state = self.inner.view(partition).lock();
                state.lease.is_some().then(|| state.keyed.clone())
            };
            let Some(keyed) = keyed else { continue };
            let stale = self
                .inner
                .cache
                .read(&keyed.key)
                .map_or(true, |read| !read.is_fresh());
            if stale {
                self.spawn_load(partition, keyed, Load::Revalidate);
            }
        }
        marked
    }
}

fn spawn_listener<P, S>(inner: &Arc<EngineInner<P, S>>)
where
    P: FilterPersistence + 'static,
    S: ItemSource + ?Sized + 'static,
{
    let weak: Weak<EngineInner<P, S>> = Arc::downgrade(inner);
    let mut updates = inner.cache.updates();
    tokio::spawn(async move {
        loop {
            let changed = match updates.recv().await {
                Ok(key) => Some(key.partition()),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Cache update listener lagged, republishing all");
                    None
                }
                Err(RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else { break };
            for partition in Partition::ALL {
                if changed.map_or(true, |p| p == partition) {
                    inner.publish(partition);
                }
            }
        }
        debug!("Cache update listener stopped");
    });
}
