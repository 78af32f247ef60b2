//! Event shapes exchanged over the three topics
//!
//! - `collection.items`: [`QuantityEvent`], keyed by collection id
//! - `price.updates`: [`PriceUpdateEvent`], keyed by item identity
//! - `collection.values`: [`CollectionValueSnapshot`], keyed by collection id
//!
//! All timestamps are Unix milliseconds. Every payload travels inside an
//! [`Envelope`]; readers ignore unknown fields, so producers may add fields
//! without breaking older consumers.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::EventError;
use crate::ids::{CollectionId, EventId, ItemIdentity, SnapshotId};
use crate::numeric::{Price, Quantity};

/// Current envelope schema version.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// One normalized item line of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityEvent {
    pub event_id: EventId,
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub item_identity: ItemIdentity,
    /// Display spelling from the source line; informational only.
    #[serde(default)]
    pub item_name: String,
    pub quantity: Quantity,
    /// Unix milliseconds, assigned at normalization.
    pub event_time: i64,
}

impl QuantityEvent {
    /// Build an event with its id derived from the keyed fields.
    pub fn new(
        collection_id: CollectionId,
        collection_name: impl Into<String>,
        item_name: impl Into<String>,
        quantity: Quantity,
        event_time: i64,
    ) -> Self {
        let item_name = item_name.into();
        let item_identity = ItemIdentity::from_name(&item_name);
        Self {
            event_id: EventId::derive(&collection_id, &item_identity, event_time),
            collection_id,
            collection_name: collection_name.into(),
            item_identity,
            item_name,
            quantity,
            event_time,
        }
    }

    /// Check the fields the aggregator keys on.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.collection_id.is_nil() {
            return Err(EventError::MissingCollectionId);
        }
        if self.item_identity.is_empty() {
            return Err(EventError::MissingItemIdentity);
        }
        if self.quantity.get() == 0 {
            return Err(EventError::InvalidQuantity);
        }
        Ok(())
    }
}

/// Most recent known price of an item from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdateEvent {
    pub item_identity: ItemIdentity,
    pub price: Price,
    /// Unix milliseconds at which the source observed this price.
    pub observed_at: i64,
    pub source: String,
}

impl PriceUpdateEvent {
    pub fn new(item: impl AsRef<str>, price: Price, observed_at: i64, source: impl Into<String>) -> Self {
        Self {
            item_identity: ItemIdentity::new(item),
            price,
            observed_at,
            source: source.into(),
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.item_identity.is_empty() {
            return Err(EventError::MissingItemIdentity);
        }
        Ok(())
    }
}

/// Valuation of one collection over one closed window.
///
/// Immutable once emitted. `snapshot_id` is a pure function of
/// `(collection_id, window_start, window_end)` and `computed_at` is the
/// window end, so re-emitting after recovery yields an identical record and
/// consumers can deduplicate on `snapshot_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionValueSnapshot {
    pub snapshot_id: SnapshotId,
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub window_start: i64,
    pub window_end: i64,
    pub total_items: u64,
    pub unique_items: u64,
    pub total_value: Decimal,
    /// Item lines valued at the configured default because no price was known.
    pub default_priced_items: u64,
    /// Item lines valued with a price older than the staleness horizon.
    pub stale_priced_items: u64,
    pub computed_at: i64,
}

/// Envelope event types per topic.
pub mod event_types {
    pub const COLLECTION_ITEM: &str = "collection.item";
    pub const PRICE_UPDATED: &str = "price.updated";
    pub const VALUE_CALCULATED: &str = "collection.value.calculated";
}

/// Wire wrapper carried on every topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub event_type: String,
    /// Stable id of the payload (event id, snapshot id, or a price key).
    pub event_id: String,
    /// Unix milliseconds at which the envelope was produced.
    pub timestamp: i64,
    pub source: String,
    pub schema_version: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(event_type: &str, event_id: impl Into<String>, source: &str, data: T) -> Self {
        Self {
            event_type: event_type.to_string(),
            event_id: event_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            source: source.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            data,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::Encode(e.to_string()))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decode an envelope, checking the event type matches.
    pub fn from_json(raw: &str, expected_type: &str) -> Result<Self, EventError> {
        let envelope: Envelope<T> =
            serde_json::from_str(raw).map_err(|e| EventError::Decode(e.to_string()))?;
        if envelope.event_type != expected_type {
            return Err(EventError::UnexpectedType {
                expected: expected_type.to_string(),
                actual: envelope.event_type,
            });
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bolt_event() -> QuantityEvent {
        QuantityEvent::new(
            CollectionId::from_source("decks/alpha.deck"),
            "Alpha",
            "Lightning Bolt",
            Quantity::new(4).unwrap(),
            1_000,
        )
    }

    #[test]
    fn test_quantity_event_derives_identity_and_id() {
        let e = bolt_event();
        assert_eq!(e.item_identity.as_str(), "lightning bolt");
        assert_eq!(e.event_id, bolt_event().event_id);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_quantity_event_missing_collection_is_invalid() {
        let mut e = bolt_event();
        e.collection_id = CollectionId::from_uuid(uuid::Uuid::nil());
        assert_eq!(e.validate(), Err(EventError::MissingCollectionId));
    }

    #[test]
    fn test_envelope_ignores_unknown_fields() {
        let raw = r#"{
            "event_type": "price.updated",
            "event_id": "p-1",
            "timestamp": 5,
            "source": "mtgjson",
            "schema_version": "1.1.0",
            "partition_hint": 3,
            "data": {
                "item_identity": "Lightning Bolt",
                "price": "2.00",
                "observed_at": 100,
                "source": "tcgplayer",
                "currency": "USD"
            }
        }"#;
        let env: Envelope<PriceUpdateEvent> =
            Envelope::from_json(raw, event_types::PRICE_UPDATED).unwrap();
        assert_eq!(env.data.item_identity.as_str(), "lightning bolt");
        assert_eq!(env.data.price, Price::from_u64(2));
    }

    #[test]
    fn test_envelope_rejects_wrong_type() {
        let env = Envelope::new(event_types::COLLECTION_ITEM, "x", "test", bolt_event());
        let raw = env.to_json().unwrap();
        let err = Envelope::<QuantityEvent>::from_json(&raw, event_types::PRICE_UPDATED).unwrap_err();
        assert!(matches!(err, EventError::UnexpectedType { .. }));
    }

    #[test]
    fn test_quantity_event_envelope_roundtrip() {
        let event = bolt_event();
        let env = Envelope::new(event_types::COLLECTION_ITEM, event.event_id.to_string(), "test", event.clone());
        let decoded: Envelope<QuantityEvent> =
            Envelope::from_json(&env.to_json().unwrap(), event_types::COLLECTION_ITEM).unwrap();
        assert_eq!(decoded.data, event);
    }
}
