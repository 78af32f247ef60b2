//! Emission & idempotency
//!
//! Delivery guarantee: **at-least-once** at the transport. A snapshot may
//! be published more than once: a publish can succeed after its timeout
//! fired, and after a restart every snapshot that was pending in the
//! restored checkpoint is published again. End-to-end exactly-once is
//! *effective* only, and rests on two properties:
//!
//! 1. `snapshot_id` is derived from `(collection_id, window_start,
//!    window_end)` and `computed_at` is the window end, so every emission
//!    of one logical window carries the same id and the same content.
//! 2. Downstream consumers deduplicate on `snapshot_id`
//!    ([`DedupConsumer`] is the reference behaviour).
//!
//! The [`EmissionLedger`] remembers a content digest per confirmed id. The
//! same id with the same digest is a benign replay; the same id with a
//! different digest means two different valuations claim one window, which
//! is reported as [`IntegrityViolation::DuplicateWindowKey`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use persistence::EmittedRecord;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use types::errors::EventError;
use types::events::{event_types, CollectionValueSnapshot, Envelope};
use types::ids::SnapshotId;

use crate::metrics::EngineMetrics;
use crate::retry::{RetryFailure, RetryPolicy};
use crate::transport::{Transport, TransportError};
use crate::window::CollectionWindowState;

/// Envelope `source` for snapshots this engine publishes.
pub const EMITTER_SOURCE: &str = "valuation-engine";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("publish failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: TransportError },

    #[error("publish timed out after {attempts} attempts")]
    TimedOut { attempts: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    #[error("snapshot {snapshot_id} re-emitted with different content (recorded {recorded}, new {new})")]
    DuplicateWindowKey {
        snapshot_id: SnapshotId,
        recorded: String,
        new: String,
    },
}

/// Close a window into its snapshot.
pub fn emit(state: &CollectionWindowState) -> CollectionValueSnapshot {
    state.to_snapshot()
}

/// SHA-256 over the snapshot's canonical field encoding.
pub fn snapshot_digest(snapshot: &CollectionValueSnapshot) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        snapshot.snapshot_id,
        snapshot.collection_id,
        snapshot.collection_name,
        snapshot.window_start,
        snapshot.window_end,
        snapshot.total_items,
        snapshot.unique_items,
        snapshot.total_value.normalize(),
        snapshot.default_priced_items,
        snapshot.stale_priced_items,
        snapshot.computed_at,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of checking a snapshot against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerCheck {
    /// Not seen before.
    New,
    /// Seen with identical content.
    Replay,
}

/// Bounded memory of confirmed snapshot ids and their digests.
#[derive(Debug, Clone)]
pub struct EmissionLedger {
    capacity: usize,
    order: VecDeque<SnapshotId>,
    digests: HashMap<SnapshotId, String>,
}

impl EmissionLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            digests: HashMap::new(),
        }
    }

    pub fn check(&self, snapshot_id: &SnapshotId, digest: &str) -> Result<LedgerCheck, IntegrityViolation> {
        match self.digests.get(snapshot_id) {
            None => Ok(LedgerCheck::New),
            Some(recorded) if recorded == digest => Ok(LedgerCheck::Replay),
            Some(recorded) => Err(IntegrityViolation::DuplicateWindowKey {
                snapshot_id: *snapshot_id,
                recorded: recorded.clone(),
                new: digest.to_string(),
            }),
        }
    }

    /// Record a confirmed emission. A conflicting digest is not recorded.
    pub fn record(&mut self, snapshot_id: SnapshotId, digest: String) -> Result<LedgerCheck, IntegrityViolation> {
        let check = self.check(&snapshot_id, &digest)?;
        if check == LedgerCheck::New {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.digests.remove(&oldest);
                }
            }
            self.order.push_back(snapshot_id);
            self.digests.insert(snapshot_id, digest);
        }
        Ok(check)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Oldest first.
    pub fn export(&self) -> Vec<EmittedRecord> {
        self.order
            .iter()
            .filter_map(|id| {
                self.digests.get(id).map(|digest| EmittedRecord {
                    snapshot_id: *id,
                    digest: digest.clone(),
                })
            })
            .collect()
    }

    pub fn restore(&mut self, records: Vec<EmittedRecord>) {
        self.order.clear();
        self.digests.clear();
        for record in records {
            // Ids are unique in an exported ledger; a conflict cannot occur.
            let _ = self.record(record.snapshot_id, record.digest);
        }
    }
}

/// Publishes snapshots with bounded retry and an overall timeout.
pub struct Emitter {
    transport: Arc<dyn Transport>,
    topic: String,
    retry: RetryPolicy,
    timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl Emitter {
    pub fn new(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        retry: RetryPolicy,
        timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            retry,
            timeout,
            metrics,
        }
    }

    /// Publish one snapshot keyed by its collection id; returns the offset.
    pub async fn publish(&self, snapshot: &CollectionValueSnapshot) -> Result<u64, EmitError> {
        let key = snapshot.collection_id.to_string();
        let envelope = Envelope::new(
            event_types::VALUE_CALCULATED,
            snapshot.snapshot_id.to_string(),
            EMITTER_SOURCE,
            snapshot,
        );
        let payload = envelope.to_json().map_err(|e| EmitError::Encode(e.to_string()))?;
        let snapshot_id = snapshot.snapshot_id;

        let result = self
            .retry
            .retry_with_timeout(
                self.timeout,
                |_| self.transport.publish(&self.topic, &key, payload.clone()),
                |attempt, err| {
                    self.metrics.record_publish_retry();
                    warn!(%snapshot_id, attempt, error = %err, "publish failed, retrying");
                },
            )
            .await;

        match result {
            Ok(offset) => {
                debug!(%snapshot_id, offset, topic = %self.topic, "snapshot published");
                Ok(offset)
            }
            Err(RetryFailure::Exhausted { attempts, last }) => {
                self.metrics.record_publish_failure();
                Err(EmitError::Exhausted { attempts, last })
            }
            Err(RetryFailure::TimedOut { attempts }) => {
                self.metrics.record_publish_failure();
                Err(EmitError::TimedOut { attempts })
            }
        }
    }
}

/// Downstream reference consumer: forwards each `snapshot_id` once.
#[derive(Debug, Default)]
pub struct DedupConsumer {
    seen: HashSet<SnapshotId>,
    duplicates: u64,
}

impl DedupConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some` the first time an id is offered, `None` afterwards.
    pub fn offer(&mut self, snapshot: CollectionValueSnapshot) -> Option<CollectionValueSnapshot> {
        if self.seen.insert(snapshot.snapshot_id) {
            Some(snapshot)
        } else {
            self.duplicates += 1;
            None
        }
    }

    /// Decode an envelope payload from the output topic and offer it.
    pub fn offer_payload(&mut self, payload: &str) -> Result<Option<CollectionValueSnapshot>, EventError> {
        let envelope: Envelope<CollectionValueSnapshot> =
            Envelope::from_json(payload, event_types::VALUE_CALCULATED)?;
        Ok(self.offer(envelope.data))
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
