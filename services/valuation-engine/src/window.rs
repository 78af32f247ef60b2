//! Tumbling event-time windows and the watermark
//!
//! Windows are aligned to the epoch: `start = floor(t / size) * size`
//! (floor toward negative infinity), covering `[start, start + size)`. An
//! event exactly at a window's end belongs to the next window.

use std::collections::{BTreeMap, BTreeSet};

use persistence::{WatermarkRecord, WindowStateRecord};
use rust_decimal::Decimal;
use types::events::{CollectionValueSnapshot, QuantityEvent};
use types::ids::{CollectionId, EventId, ItemIdentity, SnapshotId};
use types::numeric::Quantity;

use crate::price_table::PriceQuote;

/// Fixed-size tumbling window assigner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    size_ms: i64,
}

impl WindowSpec {
    /// `size_ms` must be positive; validated with the engine config.
    pub fn new(size_ms: i64) -> Self {
        Self { size_ms: size_ms.max(1) }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Start of the window containing `event_time`.
    pub fn align(&self, event_time: i64) -> i64 {
        event_time.div_euclid(self.size_ms) * self.size_ms
    }

    /// `(start, end)` of the window containing `event_time`.
    pub fn assign(&self, event_time: i64) -> (i64, i64) {
        let start = self.align(event_time);
        (start, start.saturating_add(self.size_ms))
    }
}

/// Key of one open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub collection_id: CollectionId,
    pub window_start: i64,
}

/// Running totals of one collection over one open window.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionWindowState {
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub window_start: i64,
    pub window_end: i64,
    pub total_quantity: u64,
    pub accumulated_value: Decimal,
    pub default_priced_items: u64,
    pub stale_priced_items: u64,
    pub seen_items: BTreeSet<ItemIdentity>,
    /// Applied events and the quantity each contributed.
    pub seen_event_ids: BTreeMap<EventId, Quantity>,
}

impl CollectionWindowState {
    pub fn new(collection_id: CollectionId, collection_name: String, window_start: i64, window_end: i64) -> Self {
        Self {
            collection_id,
            collection_name,
            window_start,
            window_end,
            total_quantity: 0,
            accumulated_value: Decimal::ZERO,
            default_priced_items: 0,
            stale_priced_items: 0,
            seen_items: BTreeSet::new(),
            seen_event_ids: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            collection_id: self.collection_id,
            window_start: self.window_start,
        }
    }

    pub fn unique_item_count(&self) -> u64 {
        self.seen_items.len() as u64
    }

    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.seen_event_ids.contains_key(event_id)
    }

    /// Quantity the event contributed when it was applied.
    pub fn applied_quantity(&self, event_id: &EventId) -> Option<Quantity> {
        self.seen_event_ids.get(event_id).copied()
    }

    /// Fold one event, valued with `quote`, into the totals.
    ///
    /// The caller deduplicates; applying the same event twice counts it twice.
    pub fn apply(&mut self, event: &QuantityEvent, quote: PriceQuote) {
        self.total_quantity += u64::from(event.quantity.get());
        self.accumulated_value += quote.price.extend(event.quantity);
        if quote.is_default {
            self.default_priced_items += 1;
        }
        if quote.is_stale {
            self.stale_priced_items += 1;
        }
        self.seen_items.insert(event.item_identity.clone());
        self.seen_event_ids.insert(event.event_id, event.quantity);
        if self.collection_name.is_empty() {
            self.collection_name = event.collection_name.clone();
        }
    }

    /// Convert the closed window into its snapshot.
    ///
    /// `computed_at` is the window end, so closing the same window twice
    /// produces identical snapshots.
    pub fn to_snapshot(&self) -> CollectionValueSnapshot {
        CollectionValueSnapshot {
            snapshot_id: SnapshotId::derive(&self.collection_id, self.window_start, self.window_end),
            collection_id: self.collection_id,
            collection_name: self.collection_name.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
            total_items: self.total_quantity,
            unique_items: self.unique_item_count(),
            total_value: self.accumulated_value.normalize(),
            default_priced_items: self.default_priced_items,
            stale_priced_items: self.stale_priced_items,
            computed_at: self.window_end,
        }
    }

    pub fn to_record(&self) -> WindowStateRecord {
        WindowStateRecord {
            collection_id: self.collection_id,
            collection_name: self.collection_name.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
            total_quantity: self.total_quantity,
            accumulated_value: self.accumulated_value,
            default_priced_items: self.default_priced_items,
            stale_priced_items: self.stale_priced_items,
            seen_items: self.seen_items.iter().cloned().collect(),
            seen_event_ids: self.seen_event_ids.iter().map(|(id, qty)| (*id, *qty)).collect(),
        }
    }

    pub fn from_record(record: WindowStateRecord) -> Self {
        Self {
            collection_id: record.collection_id,
            collection_name: record.collection_name,
            window_start: record.window_start,
            window_end: record.window_end,
            total_quantity: record.total_quantity,
            accumulated_value: record.accumulated_value,
            default_priced_items: record.default_priced_items,
            stale_priced_items: record.stale_priced_items,
            seen_items: record.seen_items.into_iter().collect(),
            seen_event_ids: record.seen_event_ids.into_iter().collect(),
        }
    }
}

/// Monotonic event-time watermark with bounded out-of-orderness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    tolerance_ms: i64,
    max_event_time: Option<i64>,
    current: Option<i64>,
}

impl Watermark {
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            tolerance_ms: tolerance_ms.max(0),
            max_event_time: None,
            current: None,
        }
    }

    pub fn current(&self) -> Option<i64> {
        self.current
    }

    pub fn max_event_time(&self) -> Option<i64> {
        self.max_event_time
    }

    /// Track an event time. Returns true if the watermark moved.
    pub fn observe(&mut self, event_time: i64) -> bool {
        if self.max_event_time.map_or(true, |max| event_time > max) {
            self.max_event_time = Some(event_time);
        }
        match self.max_event_time {
            Some(max) => self.advance_to(max.saturating_sub(self.tolerance_ms)),
            None => false,
        }
    }

    /// Move the watermark to `candidate` if that is forward.
    pub fn advance_to(&mut self, candidate: i64) -> bool {
        if self.current.map_or(true, |w| candidate > w) {
            self.current = Some(candidate);
            true
        } else {
            false
        }
    }

    /// Whether a window ending at `window_end` has already been passed.
    pub fn is_late(&self, window_end: i64) -> bool {
        self.current.map_or(false, |w| window_end <= w)
    }

    pub fn to_record(&self) -> WatermarkRecord {
        WatermarkRecord {
            max_event_time: self.max_event_time,
            watermark: self.current,
        }
    }

    pub fn restore(&mut self, record: WatermarkRecord) {
        self.max_event_time = record.max_event_time;
        self.current = record.watermark;
    }
}
