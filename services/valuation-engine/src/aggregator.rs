//! Windowed aggregator
//!
//! Sole owner of all keyed window state. Every mutation of a
//! `(collection_id, window)` happens through `&mut self`, so the pipeline
//! runs exactly one aggregator task.
//!
//! Per window: **Open** → **Closing** (the watermark passed `window_end`)
//! → **Closed** (snapshot produced, state discarded). Closed snapshots stay
//! *pending* until the emitter confirms them; pending snapshots are part
//! of every checkpoint and are re-dispatched until confirmed.
//!
//! Processing one event:
//! 1. Reject malformed events (counted, never fatal)
//! 2. Drop duplicates: ids of recently closed windows, then the target
//!    window's own seen-id set
//! 3. Route late events (window end ≤ watermark) per [`LatePolicy`]
//! 4. Join against the price side-table at aggregation time
//! 5. Fold into the window; advance the watermark

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use persistence::{CheckpointState, SourceOffsets};
use tracing::{debug, error, info, warn};
use types::errors::EventError;
use types::events::{CollectionValueSnapshot, QuantityEvent};
use types::ids::{EventId, SnapshotId};
use types::numeric::Quantity;

use crate::config::{EngineConfig, LatePolicy};
use crate::emission::{emit, snapshot_digest, EmissionLedger, IntegrityViolation, LedgerCheck};
use crate::metrics::EngineMetrics;
use crate::price_table::PriceTable;
use crate::window::{CollectionWindowState, Watermark, WindowKey, WindowSpec};

/// Aggregator settings, taken from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window_size_ms: i64,
    pub out_of_orderness_ms: i64,
    pub late_policy: LatePolicy,
    pub dedup_horizon: usize,
    pub ledger_capacity: usize,
    pub idle_watermark: bool,
}

impl From<&EngineConfig> for AggregatorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            window_size_ms: config.window_size_ms,
            out_of_orderness_ms: config.out_of_orderness_ms,
            late_policy: config.late_policy,
            dedup_horizon: config.dedup_horizon,
            ledger_capacity: config.ledger_capacity,
            idle_watermark: config.idle_watermark,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// What `process` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied { window_start: i64, opened: bool },
    Duplicate,
    LateDropped,
    LateMerged { window_start: i64 },
    Malformed(EventError),
}

/// A closed window's snapshot awaiting publish confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSnapshot {
    pub snapshot: CollectionValueSnapshot,
    pub digest: String,
    /// Handed to the emitter and not yet confirmed or failed.
    pub in_flight: bool,
}

/// Bounded FIFO set of event ids from closed windows.
#[derive(Debug, Clone)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<EventId>,
    set: HashSet<EventId>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    fn contains(&self, id: &EventId) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: EventId) {
        if self.capacity == 0 || !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn export(&self) -> Vec<EventId> {
        self.order.iter().copied().collect()
    }

    fn restore(&mut self, ids: Vec<EventId>) {
        self.order.clear();
        self.set.clear();
        for id in ids {
            self.insert(id);
        }
    }
}

pub struct Aggregator {
    config: AggregatorConfig,
    spec: WindowSpec,
    watermark: Watermark,
    windows: BTreeMap<WindowKey, CollectionWindowState>,
    recent_ids: RecentIds,
    pending: BTreeMap<SnapshotId, PendingSnapshot>,
    ledger: EmissionLedger,
    quarantine: Vec<CollectionValueSnapshot>,
    prices: Arc<PriceTable>,
    metrics: Arc<EngineMetrics>,
    /// Next quantity-topic offset not yet reflected in state.
    quantity_offset: u64,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, prices: Arc<PriceTable>, metrics: Arc<EngineMetrics>) -> Self {
        info!(
            window_size_ms = config.window_size_ms,
            out_of_orderness_ms = config.out_of_orderness_ms,
            late_policy = ?config.late_policy,
            dedup_horizon = config.dedup_horizon,
            "Aggregator initialized"
        );
        Self {
            spec: WindowSpec::new(config.window_size_ms),
            watermark: Watermark::new(config.out_of_orderness_ms),
            windows: BTreeMap::new(),
            recent_ids: RecentIds::new(config.dedup_horizon),
            pending: BTreeMap::new(),
            ledger: EmissionLedger::new(config.ledger_capacity),
            quarantine: Vec::new(),
            prices,
            metrics,
            quantity_offset: 0,
            config,
        }
    }

    /// Fold one quantity event into its window.
    pub fn process(&mut self, event: &QuantityEvent) -> ProcessOutcome {
        let started = Instant::now();

        if let Err(err) = event.validate() {
            self.metrics.record_malformed();
            warn!(event_id = %event.event_id, error = %err, "dropping malformed event");
            return ProcessOutcome::Malformed(err);
        }

        if self.recent_ids.contains(&event.event_id) {
            self.metrics.record_duplicate();
            debug!(event_id = %event.event_id, "duplicate of a closed window");
            return ProcessOutcome::Duplicate;
        }

        // Checked before late routing: an event whose window the watermark
        // has passed may still sit in that window until the next tick.
        if let Some((window_start, applied)) = self.applied_in(event) {
            self.metrics.record_duplicate();
            if applied != event.quantity {
                warn!(
                    event_id = %event.event_id,
                    collection_id = %event.collection_id,
                    window_start,
                    applied = applied.get(),
                    redelivered = event.quantity.get(),
                    "duplicate event with a different quantity, keeping the applied one"
                );
            } else {
                debug!(event_id = %event.event_id, window_start, "duplicate event");
            }
            return ProcessOutcome::Duplicate;
        }

        let (assigned_start, assigned_end) = self.spec.assign(event.event_time);
        let mut late = false;
        let (window_start, window_end) = if self.watermark.is_late(assigned_end) {
            match (self.config.late_policy, self.watermark.current()) {
                (LatePolicy::MergeIntoNext, Some(wm)) => {
                    late = true;
                    self.spec.assign(wm)
                }
                _ => {
                    self.metrics.record_late_dropped();
                    warn!(
                        event_id = %event.event_id,
                        collection_id = %event.collection_id,
                        event_time = event.event_time,
                        window_end = assigned_end,
                        watermark = ?self.watermark.current(),
                        "dropping late event"
                    );
                    return ProcessOutcome::LateDropped;
                }
            }
        } else {
            (assigned_start, assigned_end)
        };

        let key = WindowKey {
            collection_id: event.collection_id,
            window_start,
        };

        let quote = self.prices.lookup(&event.item_identity, event.event_time);
        self.metrics.record_lookup(&quote);

        let opened = !self.windows.contains_key(&key);
        let window = self.windows.entry(key).or_insert_with(|| {
            CollectionWindowState::new(
                event.collection_id,
                event.collection_name.clone(),
                window_start,
                window_end,
            )
        });
        window.apply(event, quote);

        if opened {
            self.metrics.record_window_opened();
            self.metrics.set_open_windows(self.windows.len() as u64);
            debug!(collection_id = %event.collection_id, window_start, window_end, "window opened");
        }

        if !late {
            self.watermark.observe(event.event_time);
        }
        self.metrics
            .record_event_processed(started.elapsed().as_nanos() as u64);

        if late {
            self.metrics.record_late_merged();
            info!(
                event_id = %event.event_id,
                collection_id = %event.collection_id,
                from_window = assigned_start,
                into_window = window_start,
                "late event merged into current window"
            );
            ProcessOutcome::LateMerged { window_start }
        } else {
            ProcessOutcome::Applied { window_start, opened }
        }
    }

    /// Start of the open window of the event's collection that already
    /// applied it, with the quantity it contributed. A merged late event
    /// lives outside its own window, so every open window is searched.
    fn applied_in(&self, event: &QuantityEvent) -> Option<(i64, Quantity)> {
        let first = WindowKey {
            collection_id: event.collection_id,
            window_start: i64::MIN,
        };
        let last = WindowKey {
            collection_id: event.collection_id,
            window_start: i64::MAX,
        };
        self.windows.range(first..=last).find_map(|(key, window)| {
            window
                .applied_quantity(&event.event_id)
                .map(|qty| (key.window_start, qty))
        })
    }

    /// Timer tick: optionally advance the watermark from processing time,
    /// then close every window the watermark has passed.
    ///
    /// Returns the number of windows closed.
    pub fn on_timer(&mut self, now_ms: i64) -> usize {
        if self.config.idle_watermark {
            let candidate = now_ms.saturating_sub(self.config.out_of_orderness_ms);
            if self.watermark.advance_to(candidate) {
                debug!(watermark = candidate, "watermark advanced by processing time");
            }
        }
        let Some(wm) = self.watermark.current() else {
            return 0;
        };
        let ready: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(_, w)| w.window_end <= wm)
            .map(|(k, _)| *k)
            .collect();
        for key in &ready {
            self.close(key);
        }
        ready.len()
    }

    /// Close every open window regardless of the watermark (end of bounded input).
    pub fn flush_all(&mut self) -> usize {
        let keys: Vec<WindowKey> = self.windows.keys().copied().collect();
        for key in &keys {
            self.close(key);
        }
        keys.len()
    }

    fn close(&mut self, key: &WindowKey) {
        let Some(state) = self.windows.remove(key) else {
            return;
        };
        for id in state.seen_event_ids.keys() {
            self.recent_ids.insert(*id);
        }
        self.metrics.record_window_closed();
        self.metrics.set_open_windows(self.windows.len() as u64);

        let snapshot = emit(&state);
        let digest = snapshot_digest(&snapshot);
        info!(
            collection_id = %snapshot.collection_id,
            collection_name = %snapshot.collection_name,
            window_start = snapshot.window_start,
            window_end = snapshot.window_end,
            snapshot_id = %snapshot.snapshot_id,
            total_items = snapshot.total_items,
            unique_items = snapshot.unique_items,
            total_value = %snapshot.total_value,
            default_priced_items = snapshot.default_priced_items,
            "window closed"
        );

        if let Some(existing) = self.pending.get(&snapshot.snapshot_id) {
            if existing.digest != digest {
                let violation = IntegrityViolation::DuplicateWindowKey {
                    snapshot_id: snapshot.snapshot_id,
                    recorded: existing.digest.clone(),
                    new: digest,
                };
                self.quarantine_snapshot(snapshot, violation);
            }
            return;
        }

        match self.ledger.check(&snapshot.snapshot_id, &digest) {
            Ok(LedgerCheck::New) => {
                self.pending.insert(
                    snapshot.snapshot_id,
                    PendingSnapshot {
                        snapshot,
                        digest,
                        in_flight: false,
                    },
                );
                self.metrics.set_pending_snapshots(self.pending.len() as u64);
            }
            Ok(LedgerCheck::Replay) => {
                self.metrics.record_snapshot_replay();
                debug!(snapshot_id = %snapshot.snapshot_id, "snapshot already confirmed, skipping");
            }
            Err(violation) => self.quarantine_snapshot(snapshot, violation),
        }
    }

    fn quarantine_snapshot(&mut self, snapshot: CollectionValueSnapshot, violation: IntegrityViolation) {
        error!(
            snapshot_id = %snapshot.snapshot_id,
            collection_id = %snapshot.collection_id,
            window_start = snapshot.window_start,
            total_value = %snapshot.total_value,
            total_items = snapshot.total_items,
            "snapshot quarantined"
        );
        self.metrics.record_integrity_violation(violation.to_string());
        self.quarantine.push(snapshot);
    }

    /// Pending snapshots not currently with the emitter, marked in flight.
    pub fn take_dispatchable(&mut self) -> Vec<CollectionValueSnapshot> {
        self.pending
            .values_mut()
            .filter(|p| !p.in_flight)
            .map(|p| {
                p.in_flight = true;
                p.snapshot.clone()
            })
            .collect()
    }

    /// The emitter published `snapshot_id`.
    pub fn confirm(&mut self, snapshot_id: &SnapshotId) {
        let Some(pending) = self.pending.remove(snapshot_id) else {
            return;
        };
        self.metrics.set_pending_snapshots(self.pending.len() as u64);
        match self.ledger.record(*snapshot_id, pending.digest.clone()) {
            Ok(LedgerCheck::New) => self.metrics.record_snapshot_emitted(),
            Ok(LedgerCheck::Replay) => self.metrics.record_snapshot_replay(),
            Err(violation) => self.quarantine_snapshot(pending.snapshot, violation),
        }
    }

    /// The emitter gave up on `snapshot_id`; it is re-dispatched on the next tick.
    pub fn publish_failed(&mut self, snapshot_id: &SnapshotId) {
        if let Some(pending) = self.pending.get_mut(snapshot_id) {
            pending.in_flight = false;
            warn!(%snapshot_id, "snapshot publish not confirmed, will retry");
        }
    }

    pub fn set_quantity_offset(&mut self, next_offset: u64) {
        self.quantity_offset = next_offset;
    }

    pub fn quantity_offset(&self) -> u64 {
        self.quantity_offset
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark.current()
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self, key: &WindowKey) -> Option<&CollectionWindowState> {
        self.windows.get(key)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSnapshot> {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn quarantined(&self) -> &[CollectionValueSnapshot] {
        &self.quarantine
    }

    /// Capture the full state. `price_offset` must be read before this
    /// call so the exported table reflects at least that prefix of the
    /// price topic.
    pub fn checkpoint_state(&self, price_offset: u64) -> CheckpointState {
        CheckpointState {
            windows: self.windows.values().map(CollectionWindowState::to_record).collect(),
            pending: self.pending.values().map(|p| p.snapshot.clone()).collect(),
            quarantined: self.quarantine.clone(),
            recent_event_ids: self.recent_ids.export(),
            emitted: self.ledger.export(),
            watermark: self.watermark.to_record(),
            prices: self.prices.export(),
            offsets: SourceOffsets {
                quantity: self.quantity_offset,
                price: price_offset,
            },
        }
    }

    /// Replace all state with a checkpoint's; returns the offsets to resume from.
    pub fn restore(&mut self, state: CheckpointState) -> SourceOffsets {
        self.windows = state
            .windows
            .into_iter()
            .map(|record| {
                let window = CollectionWindowState::from_record(record);
                (window.key(), window)
            })
            .collect();
        self.pending = state
            .pending
            .into_iter()
            .map(|snapshot| {
                let digest = snapshot_digest(&snapshot);
                (
                    snapshot.snapshot_id,
                    PendingSnapshot {
                        snapshot,
                        digest,
                        in_flight: false,
                    },
                )
            })
            .collect();
        self.quarantine = state.quarantined;
        self.recent_ids.restore(state.recent_event_ids);
        self.ledger.restore(state.emitted);
        self.watermark.restore(state.watermark);
        self.prices.restore(state.prices);
        self.quantity_offset = state.offsets.quantity;

        self.metrics.set_open_windows(self.windows.len() as u64);
        self.metrics.set_pending_snapshots(self.pending.len() as u64);
        info!(
            windows = self.windows.len(),
            pending = self.pending.len(),
            quarantined = self.quarantine.len(),
            watermark = ?self.watermark.current(),
            quantity_offset = state.offsets.quantity,
            price_offset = state.offsets.price,
            "aggregator restored"
        );
        state.offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use types::events::PriceUpdateEvent;
    use types::ids::CollectionId;
    use types::numeric::{Price, Quantity};

    fn setup(policy: LatePolicy) -> Aggregator {
        let prices = Arc::new(PriceTable::new(Price::from_u64(5), None));
        let config = AggregatorConfig {
            late_policy: policy,
            idle_watermark: true,
            ..AggregatorConfig::default()
        };
        Aggregator::new(config, prices, Arc::new(EngineMetrics::new()))
    }

    fn alpha() -> CollectionId {
        CollectionId::from_source("decks/alpha.deck")
    }

    fn event(name: &str, qty: u32, t: i64) -> QuantityEvent {
        QuantityEvent::new(alpha(), "Alpha", name, Quantity::new(qty).unwrap(), t)
    }

    fn set_price(agg: &Aggregator, item: &str, price: &str, at: i64) {
        agg.prices
            .update(&PriceUpdateEvent::new(item, Price::parse(price).unwrap(), at, "test"))
            .unwrap();
    }

    fn close_all_until(agg: &mut Aggregator, now: i64) -> Vec<CollectionValueSnapshot> {
        agg.on_timer(now);
        let out = agg.take_dispatchable();
        for s in &out {
            agg.confirm(&s.snapshot_id);
        }
        out
    }

    #[test]
    fn test_alpha_scenario() {
        let mut agg = setup(LatePolicy::Drop);
        set_price(&agg, "Lightning Bolt", "2.00", 0);

        agg.process(&event("Lightning Bolt", 4, 1_000));
        agg.process(&event("Black Lotus", 1, 1_000));

        let out = close_all_until(&mut agg, 15_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].total_items, 5);
        assert_eq!(out[0].unique_items, 2);
        assert_eq!(out[0].total_value, Decimal::from_str("13.00").unwrap());
        assert_eq!(out[0].default_priced_items, 1);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut agg = setup(LatePolicy::Drop);
        set_price(&agg, "Lightning Bolt", "2.00", 0);

        let bolt = event("Lightning Bolt", 4, 1_000);
        agg.process(&bolt);
        assert_eq!(agg.process(&bolt), ProcessOutcome::Duplicate);
        agg.process(&event("Black Lotus", 1, 1_000));

        let out = close_all_until(&mut agg, 15_000);
        assert_eq!(out[0].total_items, 5);
        assert_eq!(out[0].total_value, Decimal::from(13));

        // redelivery after close is a duplicate, not late data
        assert_eq!(agg.process(&bolt), ProcessOutcome::Duplicate);
    }

    #[test]
    fn test_late_price_does_not_change_emitted_snapshot() {
        let mut agg = setup(LatePolicy::Drop);
        set_price(&agg, "Lightning Bolt", "2.00", 0);
        agg.process(&event("Lightning Bolt", 4, 1_000));
        agg.process(&event("Black Lotus", 1, 1_000));
        let first = close_all_until(&mut agg, 15_000);

        set_price(&agg, "Black Lotus", "50.00", 16_000);
        agg.process(&event("Lightning Bolt", 4, 21_000));
        agg.process(&event("Black Lotus", 1, 21_000));
        let second = close_all_until(&mut agg, 35_000);

        assert_eq!(first[0].total_value, Decimal::from(13));
        assert_eq!(second[0].total_value, Decimal::from(58));
        assert_eq!(second[0].default_priced_items, 0);
        assert_ne!(first[0].snapshot_id, second[0].snapshot_id);
    }

    #[test]
    fn test_late_event_dropped_under_drop_policy() {
        let mut agg = setup(LatePolicy::Drop);
        agg.process(&event("Island", 1, 20_000));
        assert_eq!(agg.watermark(), Some(15_000));
        assert_eq!(agg.process(&event("Forest", 1, 4_000)), ProcessOutcome::LateDropped);
        assert_eq!(agg.metrics.export()["events_late_dropped"], 1);
    }

    #[test]
    fn test_late_event_merged_under_merge_policy() {
        let mut agg = setup(LatePolicy::MergeIntoNext);
        agg.process(&event("Island", 1, 20_000));
        let outcome = agg.process(&event("Forest", 2, 4_000));
        assert_eq!(outcome, ProcessOutcome::LateMerged { window_start: 10_000 });

        let key = WindowKey {
            collection_id: alpha(),
            window_start: 10_000,
        };
        assert_eq!(agg.window(&key).unwrap().total_quantity, 2);
        assert_eq!(agg.watermark(), Some(15_000));
    }

    #[test]
    fn test_redelivery_to_passed_open_window_under_drop_policy() {
        let mut agg = setup(LatePolicy::Drop);
        let bolt = event("Lightning Bolt", 4, 1_000);
        agg.process(&bolt);
        agg.process(&event("Island", 1, 20_000));
        // The watermark passed [0, 10_000) but no tick has closed it yet.
        assert_eq!(agg.open_windows(), 2);

        assert_eq!(agg.process(&bolt), ProcessOutcome::Duplicate);
        let counters = agg.metrics.export();
        assert_eq!(counters["events_duplicate"], 1);
        assert_eq!(counters["events_late_dropped"], 0);

        let total: u64 = close_all_until(&mut agg, 40_000).iter().map(|s| s.total_items).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_redelivery_to_passed_open_window_under_merge_policy() {
        let mut agg = setup(LatePolicy::MergeIntoNext);
        let bolt = event("Lightning Bolt", 4, 1_000);
        agg.process(&bolt);
        agg.process(&event("Island", 1, 20_000));

        assert_eq!(agg.process(&bolt), ProcessOutcome::Duplicate);
        let next = WindowKey {
            collection_id: alpha(),
            window_start: 10_000,
        };
        assert!(agg.window(&next).is_none());
        assert_eq!(agg.metrics.export()["events_late_merged"], 0);

        let mut out = close_all_until(&mut agg, 40_000);
        out.sort_by_key(|s| s.window_start);
        let totals: Vec<_> = out.iter().map(|s| (s.window_start, s.total_items)).collect();
        assert_eq!(totals, vec![(0, 4), (20_000, 1)]);
    }

    #[test]
    fn test_merged_event_redelivered_after_watermark_moves_on() {
        let mut agg = setup(LatePolicy::MergeIntoNext);
        agg.process(&event("Island", 1, 20_000));
        let forest = event("Forest", 2, 4_000);
        assert_eq!(agg.process(&forest), ProcessOutcome::LateMerged { window_start: 10_000 });

        // Watermark now 26_000: a fresh merge would target [20_000, 30_000).
        agg.process(&event("Swamp", 1, 31_000));
        assert_eq!(agg.process(&forest), ProcessOutcome::Duplicate);

        let current = WindowKey {
            collection_id: alpha(),
            window_start: 20_000,
        };
        assert_eq!(agg.window(&current).unwrap().total_quantity, 1);
    }

    #[test]
    fn test_redelivery_with_different_quantity_keeps_applied_quantity() {
        let mut agg = setup(LatePolicy::Drop);
        agg.process(&event("Lightning Bolt", 4, 1_000));

        let corrected = event("Lightning Bolt", 3, 1_000);
        assert_eq!(agg.process(&corrected), ProcessOutcome::Duplicate);

        let key = WindowKey {
            collection_id: alpha(),
            window_start: 0,
        };
        let window = agg.window(&key).unwrap();
        assert_eq!(window.total_quantity, 4);
        assert_eq!(window.applied_quantity(&corrected.event_id), Quantity::new(4));
    }

    #[test]
    fn test_window_boundary_event_goes_to_next_window() {
        let mut agg = setup(LatePolicy::Drop);
        let outcome = agg.process(&event("Island", 1, 10_000));
        assert_eq!(
            outcome,
            ProcessOutcome::Applied {
                window_start: 10_000,
                opened: true
            }
        );
    }

    #[test]
    fn test_window_not_closed_before_watermark_passes_end() {
        let mut agg = setup(LatePolicy::Drop);
        agg.process(&event("Island", 1, 1_000));
        assert_eq!(agg.on_timer(14_999), 0);
        assert_eq!(agg.open_windows(), 1);
        assert_eq!(agg.on_timer(15_000), 1);
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn test_malformed_event_is_counted_not_fatal() {
        let mut agg = setup(LatePolicy::Drop);
        let mut bad = event("Island", 1, 1_000);
        bad.item_identity = types::ids::ItemIdentity::new("");
        assert!(matches!(agg.process(&bad), ProcessOutcome::Malformed(_)));
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn test_failed_publish_is_redispatched() {
        let mut agg = setup(LatePolicy::Drop);
        agg.process(&event("Island", 1, 1_000));
        agg.on_timer(15_000);

        let first = agg.take_dispatchable();
        assert_eq!(first.len(), 1);
        assert!(agg.take_dispatchable().is_empty(), "in flight snapshots are not re-sent");

        agg.publish_failed(&first[0].snapshot_id);
        let again = agg.take_dispatchable();
        assert_eq!(again, first);

        agg.confirm(&first[0].snapshot_id);
        assert_eq!(agg.pending_count(), 0);
    }

    /// Close [0, 10_000), then reopen it with different content and close
    /// it again.
    fn reemit_conflicting_window(agg: &mut Aggregator) {
        agg.process(&event("Island", 1, 1_000));
        close_all_until(agg, 15_000);

        let mut state = agg.checkpoint_state(0);
        let mut reopened = CollectionWindowState::new(alpha(), "Alpha".into(), 0, 10_000);
        reopened.apply(
            &event("Forest", 3, 2_000),
            agg.prices.lookup(&types::ids::ItemIdentity::new("forest"), 2_000),
        );
        state.windows.push(reopened.to_record());
        state.watermark.watermark = Some(0);
        agg.restore(state);
        agg.on_timer(15_000);
    }

    #[test]
    fn test_conflicting_reemission_is_quarantined() {
        let mut agg = setup(LatePolicy::Drop);
        reemit_conflicting_window(&mut agg);
        assert_eq!(agg.pending_count(), 0);
        assert_eq!(agg.quarantined().len(), 1);
        assert_eq!(agg.metrics.export()["integrity_violations"], 1);
    }

    #[test]
    fn test_checkpoint_restore_roundtrip() {
        let mut agg = setup(LatePolicy::Drop);
        set_price(&agg, "Lightning Bolt", "2.00", 0);
        agg.process(&event("Lightning Bolt", 4, 1_000));
        agg.set_quantity_offset(1);
        let state = agg.checkpoint_state(7);

        let mut restored = setup(LatePolicy::Drop);
        let offsets = restored.restore(state.clone());
        assert_eq!(offsets, SourceOffsets { quantity: 1, price: 7 });
        assert_eq!(restored.checkpoint_state(7), state);
    }

    #[test]
    fn test_quarantine_survives_checkpoint_restore() {
        let mut agg = setup(LatePolicy::Drop);
        reemit_conflicting_window(&mut agg);
        let state = agg.checkpoint_state(0);
        assert_eq!(state.quarantined.len(), 1);

        let mut restored = setup(LatePolicy::Drop);
        restored.restore(state.clone());
        assert_eq!(restored.quarantined(), agg.quarantined());
        assert_eq!(restored.quarantined()[0].total_items, 3);
        assert_eq!(restored.checkpoint_state(0), state);
    }
}
