//! Price side-table
//!
//! Last-known price per item identity, written by the price feed and read
//! by the aggregator at aggregation time.
//!
//! - One entry per identity: the observation with the latest `observed_at`.
//!   Equal timestamps resolve to the update applied last.
//! - `lookup` never fails. Unknown items get the configured default price
//!   with `is_default` set.
//! - Entries never expire. An entry older than the staleness horizon
//!   relative to `as_of` is still returned, flagged `is_stale`.
//!
//! Entries are `Arc` cells in a sharded map: a writer swaps the cell under
//! its shard lock, so updates to one key are serialized and a reader clones
//! the `Arc` and never observes a partial entry.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use persistence::PriceRecord;
use tracing::{debug, trace};
use types::errors::EventError;
use types::events::PriceUpdateEvent;
use types::ids::ItemIdentity;
use types::numeric::Price;

/// A stored observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceEntry {
    pub price: Price,
    pub observed_at: i64,
    pub source: String,
}

/// Answer to a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceQuote {
    pub price: Price,
    /// No observation exists; `price` is the configured default.
    pub is_default: bool,
    /// The observation is older than the staleness horizon.
    pub is_stale: bool,
    pub observed_at: Option<i64>,
}

/// What an update did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Replaced,
    /// The table already holds a newer observation.
    IgnoredOlder,
}

#[derive(Debug)]
pub struct PriceTable {
    entries: DashMap<ItemIdentity, Arc<PriceEntry>>,
    default_price: Price,
    staleness_horizon_ms: Option<i64>,
}

impl PriceTable {
    pub fn new(default_price: Price, staleness_horizon_ms: Option<i64>) -> Self {
        Self {
            entries: DashMap::new(),
            default_price,
            staleness_horizon_ms,
        }
    }

    pub fn default_price(&self) -> Price {
        self.default_price
    }

    /// Apply one observation with last-write-wins on `observed_at`.
    pub fn update(&self, event: &PriceUpdateEvent) -> Result<UpdateOutcome, EventError> {
        event.validate()?;

        let cell = Arc::new(PriceEntry {
            price: event.price,
            observed_at: event.observed_at,
            source: event.source.clone(),
        });

        let outcome = match self.entries.entry(event.item_identity.clone()) {
            Entry::Occupied(mut occupied) => {
                if event.observed_at >= occupied.get().observed_at {
                    occupied.insert(cell);
                    UpdateOutcome::Replaced
                } else {
                    UpdateOutcome::IgnoredOlder
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(cell);
                UpdateOutcome::Inserted
            }
        };

        trace!(
            item = %event.item_identity,
            price = %event.price,
            observed_at = event.observed_at,
            ?outcome,
            "price update"
        );
        Ok(outcome)
    }

    /// Price of `item` as seen at event time `as_of`.
    pub fn lookup(&self, item: &ItemIdentity, as_of: i64) -> PriceQuote {
        let entry = self.entries.get(item).map(|r| Arc::clone(r.value()));
        match entry {
            Some(entry) => PriceQuote {
                price: entry.price,
                is_default: false,
                is_stale: self
                    .staleness_horizon_ms
                    .map(|horizon| as_of.saturating_sub(entry.observed_at) > horizon)
                    .unwrap_or(false),
                observed_at: Some(entry.observed_at),
            },
            None => PriceQuote {
                price: self.default_price,
                is_default: true,
                is_stale: false,
                observed_at: None,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Contents sorted by identity, for checkpoints.
    pub fn export(&self) -> Vec<PriceRecord> {
        let mut records: Vec<PriceRecord> = self
            .entries
            .iter()
            .map(|r| PriceRecord {
                item_identity: r.key().clone(),
                price: r.value().price,
                observed_at: r.value().observed_at,
                source: r.value().source.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.item_identity.cmp(&b.item_identity));
        records
    }

    /// Replace the contents with checkpointed records.
    pub fn restore(&self, records: Vec<PriceRecord>) {
        self.entries.clear();
        let count = records.len();
        for record in records {
            self.entries.insert(
                record.item_identity,
                Arc::new(PriceEntry {
                    price: record.price,
                    observed_at: record.observed_at,
                    source: record.source,
                }),
            );
        }
        debug!(entries = count, "price table restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn table() -> PriceTable {
        PriceTable::new(Price::from_u64(5), Some(1_000))
    }

    fn update(item: &str, price: &str, observed_at: i64) -> PriceUpdateEvent {
        PriceUpdateEvent::new(item, Price::parse(price).unwrap(), observed_at, "test")
    }

    #[test]
    fn test_unknown_item_gets_default() {
        let quote = table().lookup(&ItemIdentity::from_name("Black Lotus"), 0);
        assert_eq!(quote.price, Price::from_u64(5));
        assert!(quote.is_default);
        assert!(!quote.is_stale);
        assert_eq!(quote.observed_at, None);
    }

    #[test]
    fn test_last_write_wins_by_observed_at() {
        let t = table();
        assert_eq!(t.update(&update("Bolt", "2.00", 100)).unwrap(), UpdateOutcome::Inserted);
        assert_eq!(t.update(&update("Bolt", "1.00", 50)).unwrap(), UpdateOutcome::IgnoredOlder);
        assert_eq!(t.update(&update("bolt", "3.00", 200)).unwrap(), UpdateOutcome::Replaced);

        let quote = t.lookup(&ItemIdentity::from_name("Bolt"), 200);
        assert_eq!(quote.price, Price::from_u64(3));
        assert!(!quote.is_default);
    }

    #[test]
    fn test_equal_timestamps_last_applied_wins() {
        let t = table();
        t.update(&update("Bolt", "2.00", 100)).unwrap();
        assert_eq!(t.update(&update("Bolt", "2.50", 100)).unwrap(), UpdateOutcome::Replaced);
        assert_eq!(
            t.lookup(&ItemIdentity::from_name("Bolt"), 100).price,
            Price::parse("2.50").unwrap()
        );
    }

    #[test]
    fn test_stale_entry_still_returned() {
        let t = table();
        t.update(&update("Bolt", "2.00", 0)).unwrap();
        let fresh = t.lookup(&ItemIdentity::from_name("Bolt"), 1_000);
        let stale = t.lookup(&ItemIdentity::from_name("Bolt"), 1_001);
        assert!(!fresh.is_stale);
        assert!(stale.is_stale);
        assert_eq!(stale.price, Price::from_u64(2));
    }

    #[test]
    fn test_update_rejects_empty_identity() {
        let t = table();
        assert_eq!(
            t.update(&update("   ", "1.00", 0)),
            Err(EventError::MissingItemIdentity)
        );
        assert!(t.is_empty());
    }

    #[test]
    fn test_export_restore_roundtrip_is_sorted() {
        let t = table();
        t.update(&update("Mox Pearl", "900", 1)).unwrap();
        t.update(&update("Ancestral Recall", "1200", 2)).unwrap();

        let exported = t.export();
        assert_eq!(exported[0].item_identity.as_str(), "ancestral recall");

        let restored = table();
        restored.restore(exported.clone());
        assert_eq!(restored.export(), exported);
    }

    #[test]
    fn test_concurrent_updates_converge_to_latest() {
        let t = Arc::new(table());
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    for i in 0..100 {
                        let ts = w * 100 + i;
                        t.update(&update("Bolt", &ts.to_string(), ts)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let quote = t.lookup(&ItemIdentity::from_name("Bolt"), 0);
        assert_eq!(quote.observed_at, Some(799));
        assert_eq!(quote.price, Price::from_u64(799));
    }
}
