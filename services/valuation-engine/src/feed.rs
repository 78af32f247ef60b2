//! Input feeds for the binary
//!
//! Turns collection documents on disk into `collection.items` records and a
//! JSON-lines price file into `price.updates` records. Each price line is
//! either a full envelope or a bare price update.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use types::errors::EventError;
use types::events::{event_types, Envelope, PriceUpdateEvent};

use crate::normalizer::{normalize_collection, NormalizedCollection};
use crate::transport::{publish_envelope, Transport, TransportError};

/// Source tag on envelopes produced by the feeds.
pub const FEED_SOURCE: &str = "valuation-feed";

/// Extensions picked up when a directory is given.
const COLLECTION_EXTENSIONS: &[&str] = &["deck", "txt"];

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn read(path: &Path) -> Result<String, FeedError> {
    fs::read_to_string(path).map_err(|source| FeedError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Expand the inputs into collection files, sorted. Directories are not
/// descended into recursively.
pub fn collection_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, FeedError> {
    let mut paths = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            paths.push(input.clone());
            continue;
        }
        let entries = fs::read_dir(input).map_err(|source| FeedError::Io {
            path: input.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| FeedError::Io {
                    path: input.clone(),
                    source,
                })?
                .path();
            let wanted = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| COLLECTION_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if path.is_file() && wanted {
                paths.push(path);
            }
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Normalize one collection file; its path is the collection's source identity.
pub fn load_collection(path: &Path, event_time: i64) -> Result<NormalizedCollection, FeedError> {
    let text = read(path)?;
    let source = path.to_string_lossy();
    Ok(normalize_collection(&source, &text, event_time))
}

/// Publish every event of a normalized collection, keyed by collection id.
pub async fn publish_collection(
    transport: &dyn Transport,
    topic: &str,
    collection: &NormalizedCollection,
) -> Result<usize, FeedError> {
    let key = collection.collection_id.to_string();
    for event in &collection.events {
        let envelope = Envelope::new(
            event_types::COLLECTION_ITEM,
            event.event_id.to_string(),
            FEED_SOURCE,
            event,
        );
        publish_envelope(transport, topic, &key, &envelope).await?;
    }
    info!(
        collection = %collection.collection_name,
        events = collection.events.len(),
        rejected = collection.rejected.len(),
        "collection published"
    );
    Ok(collection.events.len())
}

/// A price line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPrice {
    pub line_no: usize,
    pub error: EventError,
}

/// Parse JSON-lines price updates. Blank lines and `#` comments are skipped.
pub fn parse_price_lines(text: &str) -> (Vec<PriceUpdateEvent>, Vec<RejectedPrice>) {
    let mut updates = Vec::new();
    let mut rejected = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = Envelope::<PriceUpdateEvent>::from_json(line, event_types::PRICE_UPDATED)
            .map(|envelope| envelope.data)
            .or_else(|_| {
                serde_json::from_str::<PriceUpdateEvent>(line).map_err(|e| EventError::Decode(e.to_string()))
            })
            .and_then(|update| update.validate().map(|()| update));
        match parsed {
            Ok(update) => updates.push(update),
            Err(error) => {
                warn!(line_no = i + 1, error = %error, "skipping malformed price line");
                rejected.push(RejectedPrice { line_no: i + 1, error });
            }
        }
    }
    (updates, rejected)
}

/// Load a price file and publish it, keyed by item identity.
pub async fn publish_price_file(
    transport: &dyn Transport,
    topic: &str,
    path: &Path,
) -> Result<(usize, Vec<RejectedPrice>), FeedError> {
    let (updates, rejected) = parse_price_lines(&read(path)?);
    for update in &updates {
        let key = update.item_identity.to_string();
        let envelope = Envelope::new(
            event_types::PRICE_UPDATED,
            format!("{}@{}", key, update.observed_at),
            FEED_SOURCE,
            update,
        );
        publish_envelope(transport, topic, &key, &envelope).await?;
    }
    info!(path = %path.display(), prices = updates.len(), rejected = rejected.len(), "prices published");
    Ok((updates.len(), rejected))
}
