//! Real-time invalidation.
//!
//! [`InvalidatorMachine`] is the pure state machine: it is fed connection
//! signals and stamped events and decides when a debounced batch is due.
//! [`RealtimeInvalidator`] drives it from a push channel on a tokio task and
//! applies each due batch to an [`InvalidationTarget`].
//!
//! ```text
//! Disconnected -> Connected -> (event) -> Evaluating -> {Invalidate, Ignore} -> Connected
//! ```
//!
//! Events missed while disconnected are not replayed.

use std::sync::Arc;
use std::time::Duration;

use mosaic_core::{ChannelSignal, EngineConfig, ItemId, ItemSource, Partition, Placement};
use mosaic_storage::{GenerationClock, QueryCache, Watermark};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observable phase of the invalidator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidatorState {
    #[default]
    Disconnected,
    Connected,
    /// Events arrived and the debounce window is open.
    Evaluating,
}

/// Outcome of one debounced batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Invalidate,
    /// Nothing cached predated the batch.
    Ignore,
}

/// A batch whose debounce window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flush {
    /// Stamp of the newest event in the batch.
    pub since: Watermark,
    pub events: usize,
}

/// Result of applying a [`Flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub since: Watermark,
    pub events: usize,
    pub entries: usize,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy)]
struct Batch {
    opened: Instant,
    deadline: Instant,
    since: Watermark,
    events: usize,
}

/// Debounce and connection bookkeeping, free of I/O.
#[derive(Debug, Clone)]
pub struct InvalidatorMachine {
    debounce: Duration,
    max_debounce: Duration,
    invalidate_on_reconnect: bool,
    connected: bool,
    has_connected: bool,
    batch: Option<Batch>,
}

impl InvalidatorMachine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            debounce: config.debounce,
            max_debounce: config.max_debounce.max(config.debounce),
            invalidate_on_reconnect: config.invalidate_on_reconnect,
            connected: false,
            has_connected: false,
            batch: None,
        }
    }

    pub fn state(&self) -> InvalidatorState {
        match (self.connected, self.batch.is_some()) {
            (false, _) => InvalidatorState::Disconnected,
            (true, true) => InvalidatorState::Evaluating,
            (true, false) => InvalidatorState::Connected,
        }
    }

    /// Returns true when this is a reconnect that should be followed by
    /// [`InvalidatorMachine::resync`].
    pub fn connected(&mut self) -> bool {
        let reconnect = self.has_connected;
        self.connected = true;
        self.has_connected = true;
        reconnect && self.invalidate_on_reconnect
    }

    /// A batch already open keeps its deadline and is still flushed.
    pub fn disconnected(&mut self) {
        self.connected = false;
    }

    /// Record an event stamped `at`; (re)starts the trailing window.
    pub fn event(&mut self, now: Instant, at: Watermark) {
        self.schedule(now, at, self.debounce);
    }

    /// Schedule an immediate catch-up flush after a reconnect.
    pub fn resync(&mut self, now: Instant, at: Watermark) {
        self.schedule(now, at, Duration::ZERO);
    }

    fn schedule(&mut self, now: Instant, at: Watermark, delay: Duration) {
        match &mut self.batch {
            Some(batch) => {
                batch.events += 1;
                batch.since = batch.since.max(at);
                batch.deadline = (now + delay).min(batch.opened + self.max_debounce);
            }
            None => {
                self.batch = Some(Batch {
                    opened: now,
                    deadline: now + delay.min(self.max_debounce),
                    since: at,
                    events: 1,
                });
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.batch.map(|batch| batch.deadline)
    }

    /// Close the batch if its window has passed.
    pub fn due(&mut self, now: Instant) -> Option<Flush> {
        if self.batch.is_some_and(|batch| batch.deadline <= now) {
            return self.take();
        }
        None
    }

    /// Close the batch regardless of its deadline.
    pub fn take(&mut self) -> Option<Flush> {
        self.batch.take().map(|batch| Flush {
            since: batch.since,
            events: batch.events,
        })
    }
}

/// What a due batch is applied to.
pub trait InvalidationTarget: Send + Sync {
    /// Record an announced move so stale lists stop showing the item.
    fn record_placement(&self, id: ItemId, placement: Placement, at: Watermark);

    /// Mark everything whose data predates `since` stale. Returns the number
    /// of entries marked.
    fn invalidate_since(&self, since: Watermark) -> usize;
}

impl<S: ItemSource + ?Sized + 'static> InvalidationTarget for QueryCache<S> {
    fn record_placement(&self, id: ItemId, placement: Placement, at: Watermark) {
        QueryCache::record_placement(self, id, placement, at);
    }

    fn invalidate_since(&self, since: Watermark) -> usize {
        Partition::ALL
            .iter()
            .map(|partition| self.invalidate_partition(*partition, since))
            .sum()
    }
}

impl<T: InvalidationTarget + ?Sized> InvalidationTarget for Arc<T> {
    fn record_placement(&self, id: ItemId, placement: Placement, at: Watermark) {
        (**self).record_placement(id, placement, at);
    }

    fn invalidate_since(&self, since: Watermark) -> usize {
        (**self).invalidate_since(since)
    }
}

/// Handle to a running invalidator task.
#[derive(Debug)]
pub struct RealtimeInvalidator {
    state: watch::Receiver<InvalidatorState>,
    flushes: watch::Receiver<Option<FlushReport>>,
    task: JoinHandle<()>,
}

impl RealtimeInvalidator {
    /// Consume `signals` until the sender side is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T>(
        signals: mpsc::Receiver<ChannelSignal>,
        target: T,
        clock: Arc<GenerationClock>,
        config: &EngineConfig,
    ) -> Self
    where
        T: InvalidationTarget + 'static,
    {
        let (state_tx, state) = watch::channel(InvalidatorState::Disconnected);
        let (flush_tx, flushes) = watch::channel(None);
        let machine = InvalidatorMachine::new(config);
        let task = tokio::spawn(run(signals, target, clock, machine, state_tx, flush_tx));
        Self {
            state,
            flushes,
            task,
        }
    }

    pub fn state(&self) -> InvalidatorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InvalidatorState> {
        self.state.clone()
    }

    /// The most recent applied batch.
    pub fn flushes(&self) -> watch::Receiver<Option<FlushReport>> {
        self.flushes.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the task to finish after the signal channel closed.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                warn!(error = %err, "Invalidator task failed");
            }
        }
    }
}

async fn run<T: InvalidationTarget>(
    mut signals: mpsc::Receiver<ChannelSignal>,
    target: T,
    clock: Arc<GenerationClock>,
    mut machine: InvalidatorMachine,
    state_tx: watch::Sender<InvalidatorState>,
    flush_tx: watch::Sender<Option<FlushReport>>,
) {
    loop {
        let deadline = machine.deadline();
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(signal) => handle_signal(signal, &target, &clock, &mut machine),
                None => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(flush) = machine.due(Instant::now()) {
                    apply(flush, &target, &flush_tx);
                }
            }
        }
        state_tx.send_if_modified(|current| {
            let next = machine.state();
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    // The channel closed; don't lose a batch that was still debouncing.
    if let Some(flush) = machine.take() {
        apply(flush, &target, &flush_tx);
    }
    state_tx.send_replace(InvalidatorState::Disconnected);
    debug!("Invalidator stopped");
}

fn handle_signal<T: InvalidationTarget>(
    signal: ChannelSignal,
    target: &T,
    clock: &GenerationClock,
    machine: &mut InvalidatorMachine,
) {
    match signal {
        ChannelSignal::Connected => {
            info!("Realtime channel connected");
            if machine.connected() {
                machine.resync(Instant::now(), clock.tick());
            }
        }
        ChannelSignal::Disconnected { reason } => {
            warn!(reason = %reason, "Realtime channel disconnected");
            machine.disconnected();
        }
        ChannelSignal::Error { message } => {
            warn!(error = %message, "Realtime channel error");
        }
        ChannelSignal::Event(event) => {
            let at = clock.tick();
            if let Some(placement) = event.placement() {
                target.record_placement(event.item_id().clone(), placement, at);
            }
            debug!(
                event = event.event_type(),
                item_id = %event.item_id(),
                at = %at,
                "Realtime event received"
            );
            machine.event(Instant::now(), at);
        }
    }
}

fn apply<T: InvalidationTarget>(
    flush: Flush,
    target: &T,
    flush_tx: &watch::Sender<Option<FlushReport>>,
) {
    let entries = target.invalidate_since(flush.since);
    let verdict = if entries > 0 {
        Verdict::Invalidate
    } else {
        Verdict::Ignore
    };
    info!(
        since = %flush.since,
        events = flush.events,
        entries,
        verdict = ?verdict,
        "Realtime batch evaluated"
    );
    flush_tx.send_replace(Some(FlushReport {
        since: flush.since,
        events: flush.events,
        entries,
        verdict,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_core::ItemEvent;
    use std::sync::Mutex;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_debounce(Duration::from_millis(300))
            .with_max_debounce(Duration::from_secs(2))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_trailing_debounce_resets_on_each_event() {
        let mut machine = InvalidatorMachine::new(&config());
        assert!(!machine.connected());
        let t0 = Instant::now();

        machine.event(t0, Watermark::new(1));
        assert_eq!(machine.state(), InvalidatorState::Evaluating);
        machine.event(t0 + ms(200), Watermark::new(2));
        assert_eq!(machine.deadline(), Some(t0 + ms(500)));

        assert_eq!(machine.due(t0 + ms(400)), None);
        let flush = machine.due(t0 + ms(500)).unwrap();
        assert_eq!(flush.events, 2);
        assert_eq!(flush.since, Watermark::new(2));
        assert_eq!(machine.state(), InvalidatorState::Connected);
    }

    #[test]
    fn test_max_debounce_caps_a_storm() {
        let mut machine = InvalidatorMachine::new(&config());
        machine.connected();
        let t0 = Instant::now();
        for i in 0..20u64 {
            machine.event(t0 + ms(i * 150), Watermark::new(i + 1));
        }
        assert_eq!(machine.deadline(), Some(t0 + ms(2000)));
        assert_eq!(machine.due(t0 + ms(2000)).unwrap().events, 20);
    }

    #[test]
    fn test_reconnect_resync_is_opt_in() {
        let mut machine = InvalidatorMachine::new(&config());
        assert!(!machine.connected());
        machine.disconnected();
        assert_eq!(machine.state(), InvalidatorState::Disconnected);
        assert!(!machine.connected());

        let mut opted = InvalidatorMachine::new(&config().with_invalidate_on_reconnect(true));
        assert!(!opted.connected());
        opted.disconnected();
        assert!(opted.connected());
        let now = Instant::now();
        opted.resync(now, Watermark::new(9));
        assert_eq!(opted.due(now).unwrap().since, Watermark::new(9));
    }

    #[derive(Default)]
    struct Recorder {
        placements: Mutex<Vec<(ItemId, Placement)>>,
        invalidations: Mutex<Vec<Watermark>>,
    }

    impl InvalidationTarget for Recorder {
        fn record_placement(&self, id: ItemId, placement: Placement, _at: Watermark) {
            self.placements.lock().unwrap().push((id, placement));
        }

        fn invalidate_since(&self, since: Watermark) -> usize {
            self.invalidations.lock().unwrap().push(since);
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_collapses_events_into_one_batch() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(16);
        let invalidator = RealtimeInvalidator::spawn(
            rx,
            Arc::clone(&recorder),
            Arc::new(GenerationClock::new()),
            &config(),
        );

        tx.send(ChannelSignal::Connected).await.unwrap();
        for _ in 0..2 {
            tx.send(ChannelSignal::Event(ItemEvent::Archived {
                id: ItemId::new("x"),
            }))
            .await
            .unwrap();
            tokio::time::sleep(ms(100)).await;
        }
        tokio::time::sleep(ms(400)).await;

        assert_eq!(recorder.invalidations.lock().unwrap().len(), 1);
        assert_eq!(recorder.placements.lock().unwrap().len(), 2);
        let report = (*invalidator.flushes().borrow()).unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(report.verdict, Verdict::Ignore);
        assert_eq!(invalidator.state(), InvalidatorState::Connected);

        drop(tx);
        invalidator.join().await;
    }
}
