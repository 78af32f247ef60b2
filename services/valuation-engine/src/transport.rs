//! Topic transport
//!
//! The engine needs three things from its transport: publish a keyed
//! record, read a topic from an offset, and learn a topic's end offset.
//! Delivery is at-least-once and ordered per topic; a consumer restarted
//! from an older offset sees the same records again.
//!
//! [`MemoryTransport`] is an in-process, replayable, offset-addressed log
//! used by the binary and the tests. [`FlakyPublisher`] wraps any transport
//! and fails a configurable number of publishes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use types::events::Envelope;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("encode error: {0}")]
    Encode(String),
}

/// One record of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub key: String,
    pub payload: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Append a record, returning its offset.
    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<u64, TransportError>;

    /// Up to `max` records starting at `offset`, in offset order.
    async fn read_from(&self, topic: &str, offset: u64, max: usize) -> Result<Vec<Record>, TransportError>;

    /// Offset the next published record will get.
    async fn end_offset(&self, topic: &str) -> Result<u64, TransportError>;
}

/// Serialize an envelope and publish it.
pub async fn publish_envelope<T: Serialize + Sync>(
    transport: &dyn Transport,
    topic: &str,
    key: &str,
    envelope: &Envelope<T>,
) -> Result<u64, TransportError> {
    let payload = envelope
        .to_json()
        .map_err(|e| TransportError::Encode(e.to_string()))?;
    transport.publish(topic, key, payload).await
}

/// In-memory topic log.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    topics: DashMap<String, Vec<Record>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of a topic, for inspection.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.topics
            .get(topic)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<u64, TransportError> {
        let mut log = self.topics.entry(topic.to_string()).or_default();
        let offset = log.len() as u64;
        log.push(Record {
            offset,
            key: key.to_string(),
            payload,
        });
        Ok(offset)
    }

    async fn read_from(&self, topic: &str, offset: u64, max: usize) -> Result<Vec<Record>, TransportError> {
        Ok(self
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .skip(offset as usize)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn end_offset(&self, topic: &str) -> Result<u64, TransportError> {
        Ok(self.topics.get(topic).map(|log| log.len() as u64).unwrap_or(0))
    }
}

/// Wraps a transport and fails the next `n` publishes with
/// [`TransportError::Unavailable`]. Reads pass through.
pub struct FlakyPublisher<T: Transport> {
    inner: Arc<T>,
    failures_left: AtomicU32,
    failed: AtomicU64,
}

impl<T: Transport> FlakyPublisher<T> {
    pub fn new(inner: Arc<T>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            failed: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Publishes rejected so far.
    pub fn failed_publishes(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for FlakyPublisher<T> {
    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<u64, TransportError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Unavailable(format!("injected failure on {}", topic)));
        }
        self.inner.publish(topic, key, payload).await
    }

    async fn read_from(&self, topic: &str, offset: u64, max: usize) -> Result<Vec<Record>, TransportError> {
        self.inner.read_from(topic, offset, max).await
    }

    async fn end_offset(&self, topic: &str) -> Result<u64, TransportError> {
        self.inner.end_offset(topic).await
    }
}
