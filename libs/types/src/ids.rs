//! Identifier types for collections, items, events and snapshots
//!
//! Every identifier in the engine is derived, never random: re-ingesting the
//! same collection, re-delivering the same event, or re-closing the same
//! window after a restart must yield the same id. UUID v5 (SHA-1 name-based)
//! gives that with a fixed namespace per identifier kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for collection ids (derived from the source's stable identity).
const COLLECTION_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_43a2_8c0e_4b5d_9a47_1e2f_3c4d_5e6f);
/// Namespace for quantity event ids.
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x0b8e_91c4_27d3_4f6a_b512_6c7d_8e9f_a0b1);
/// Namespace for snapshot ids.
const SNAPSHOT_NAMESPACE: Uuid = Uuid::from_u128(0x94a2_5f07_c3e1_4d28_8b6f_d0e1_f2a3_b4c5);

/// Identifier of a collection (deck).
///
/// Derived from the source's stable identity (path or name) so that the
/// same collection always lands on the same aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(Uuid);

impl CollectionId {
    /// Derive the id for a source identity such as `decks/alpha.deck`.
    pub fn from_source(source: &str) -> Self {
        Self(Uuid::new_v5(&COLLECTION_NAMESPACE, source.trim().as_bytes()))
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The nil id; never produced by `from_source`, used to flag missing keys.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical key of a priced item.
///
/// The mapping from a display name is the pure function [`ItemIdentity::from_name`]:
/// trim, collapse every run of Unicode whitespace to a single ASCII space,
/// then Unicode-lowercase. Spellings that differ only in case or spacing map
/// to one identity; anything else (punctuation, diacritics, word order)
/// stays distinct.
///
/// Deserialization re-canonicalizes, so a key read off the wire in a
/// non-canonical spelling still joins against the right entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ItemIdentity(String);

impl ItemIdentity {
    /// Derive the identity of a display name.
    pub fn from_name(name: &str) -> Self {
        let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
        Self(collapsed.to_lowercase())
    }

    /// Wrap a key read from elsewhere (e.g. the price feed); re-canonicalized.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self::from_name(key.as_ref())
    }

    /// Get the key string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ItemIdentity {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<ItemIdentity> for String {
    fn from(id: ItemIdentity) -> Self {
        id.0
    }
}

/// Identifier of a single quantity event.
///
/// Derived from `(collection_id, item_identity, event_time)`, so the
/// transport re-delivering an event, or a replay after restart, presents
/// the same id to the aggregator's dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn derive(collection_id: &CollectionId, item: &ItemIdentity, event_time: i64) -> Self {
        let mut name = Vec::with_capacity(16 + item.as_str().len() + 9);
        name.extend_from_slice(collection_id.as_uuid().as_bytes());
        name.extend_from_slice(item.as_str().as_bytes());
        name.push(0);
        name.extend_from_slice(&event_time.to_be_bytes());
        Self(Uuid::new_v5(&EVENT_NAMESPACE, &name))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an emitted collection snapshot.
///
/// Derived from `(collection_id, window_start, window_end)`: the same
/// logical window always produces the same id, which is what lets
/// downstream consumers deduplicate re-emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    pub fn derive(collection_id: &CollectionId, window_start: i64, window_end: i64) -> Self {
        let mut name = [0u8; 32];
        name[..16].copy_from_slice(collection_id.as_uuid().as_bytes());
        name[16..24].copy_from_slice(&window_start.to_be_bytes());
        name[24..].copy_from_slice(&window_end.to_be_bytes());
        Self(Uuid::new_v5(&SNAPSHOT_NAMESPACE, &name))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
