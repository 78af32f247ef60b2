//! Checkpoint files: engine state with integrity and compression
//!
//! Features:
//! - Full engine state serialization (open windows, unconfirmed and
//!   quarantined snapshots, dedup horizon, watermark, price table,
//!   consumer offsets)
//! - Sorted vectors so identical state serializes to identical bytes
//! - SHA-256 integrity hash over the bincode-serialized state
//! - Optional zstd compression
//! - Format versioning for forward compatibility
//! - Atomic write (tmp file, fsync, rename)
//! - Retention policy (keep last N checkpoints)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::events::CollectionValueSnapshot;
use types::ids::{CollectionId, EventId, ItemIdentity, SnapshotId};
use types::numeric::{Price, Quantity};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CheckpointFileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("No checkpoints found")]
    NoCheckpoints,
}

// ── Engine State ────────────────────────────────────────────────────

/// Everything needed to resume processing without loss or double counting.
///
/// All collections are kept sorted by their natural key so that
/// `compute_hash` is a function of the logical state alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Open windows, sorted by (collection_id, window_start).
    pub windows: Vec<WindowStateRecord>,
    /// Closed windows whose snapshot has not been confirmed published.
    pub pending: Vec<CollectionValueSnapshot>,
    /// Snapshots held back after an integrity violation, in quarantine order.
    pub quarantined: Vec<CollectionValueSnapshot>,
    /// Event ids of recently closed windows (dedup horizon), oldest first.
    pub recent_event_ids: Vec<EventId>,
    /// Content digests of confirmed snapshots, oldest first.
    pub emitted: Vec<EmittedRecord>,
    pub watermark: WatermarkRecord,
    /// Price side-table, sorted by item identity.
    pub prices: Vec<PriceRecord>,
    pub offsets: SourceOffsets,
}

impl CheckpointState {
    /// Create a new empty state.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compute a deterministic SHA-256 hash of the state.
    pub fn compute_hash(&self) -> Result<String, CheckpointFileError> {
        let bytes = bincode::serialize(self)
            .map_err(|e| CheckpointFileError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Persisted form of one open collection window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStateRecord {
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub window_start: i64,
    pub window_end: i64,
    pub total_quantity: u64,
    pub accumulated_value: Decimal,
    pub default_priced_items: u64,
    pub stale_priced_items: u64,
    /// Sorted.
    pub seen_items: Vec<ItemIdentity>,
    /// Applied event ids with the quantity each contributed, sorted by id.
    pub seen_event_ids: Vec<(EventId, Quantity)>,
}

/// Persisted side-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub item_identity: ItemIdentity,
    pub price: Price,
    pub observed_at: i64,
    pub source: String,
}

/// A snapshot id that was confirmed published, with its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedRecord {
    pub snapshot_id: SnapshotId,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub max_event_time: Option<i64>,
    pub watermark: Option<i64>,
}

/// Next offset to consume on each inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceOffsets {
    pub quantity: u64,
    pub price: u64,
}

// ── Checkpoint ──────────────────────────────────────────────────────

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 2;

/// A complete checkpoint of the engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version for forward compatibility.
    pub version: u32,
    /// Monotonic checkpoint counter.
    pub epoch: u64,
    /// Unix millisecond timestamp when the checkpoint was taken.
    pub timestamp: i64,
    pub state: CheckpointState,
    /// SHA-256 hash of the serialized state.
    pub checksum: String,
    /// Whether the data on disk is zstd-compressed.
    pub compressed: bool,
}

impl Checkpoint {
    /// Create a new checkpoint with computed integrity hash.
    pub fn new(
        epoch: u64,
        timestamp: i64,
        state: CheckpointState,
        compressed: bool,
    ) -> Result<Self, CheckpointFileError> {
        let checksum = state.compute_hash()?;
        Ok(Self {
            version: CHECKPOINT_VERSION,
            epoch,
            timestamp,
            state,
            checksum,
            compressed,
        })
    }

    /// Verify the checkpoint's integrity hash.
    pub fn verify_integrity(&self) -> bool {
        matches!(self.state.compute_hash(), Ok(computed) if computed == self.checksum)
    }
}

// ── Checkpoint Writer ───────────────────────────────────────────────

/// Writes checkpoints to disk with optional zstd compression.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
    compress: bool,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a checkpoint atomically: serialize → compress → write tmp → fsync → rename.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointFileError> {
        fs::create_dir_all(&self.dir)?;

        let data = bincode::serialize(checkpoint)
            .map_err(|e| CheckpointFileError::Serialization(e.to_string()))?;

        let (final_data, ext) = if self.compress {
            let compressed = zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| CheckpointFileError::Compression(e.to_string()))?;
            (compressed, "ckpt.zst")
        } else {
            (data, "ckpt")
        };

        let filename = format!("checkpoint-{:012}.{}", checkpoint.epoch, ext);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{}.tmp", filename));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&final_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        Ok(path)
    }
}

// ── Checkpoint Loader ───────────────────────────────────────────────

/// Loads checkpoints from disk, verifying integrity.
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
    dir: PathBuf,
}

impl CheckpointLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a specific checkpoint file.
    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointFileError> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let is_compressed = path.extension().map(|e| e == "zst").unwrap_or(false);

        let decompressed = if is_compressed {
            zstd::decode_all(data.as_slice())
                .map_err(|e| CheckpointFileError::Compression(e.to_string()))?
        } else {
            data
        };

        let checkpoint: Checkpoint = bincode::deserialize(&decompressed)
            .map_err(|e| CheckpointFileError::Serialization(e.to_string()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointFileError::UnsupportedVersion(checkpoint.version));
        }

        let actual = checkpoint.state.compute_hash()?;
        if actual != checkpoint.checksum {
            return Err(CheckpointFileError::IntegrityFailure {
                expected: checkpoint.checksum.clone(),
                actual,
            });
        }

        Ok(checkpoint)
    }

    /// Load the latest checkpoint (highest epoch).
    pub fn load_latest(&self) -> Result<Checkpoint, CheckpointFileError> {
        let path = self.find_latest()?;
        self.load(&path)
    }

    /// Find the path to the latest checkpoint.
    pub fn find_latest(&self) -> Result<PathBuf, CheckpointFileError> {
        self.list_checkpoints()?
            .pop()
            .map(|(_, path)| path)
            .ok_or(CheckpointFileError::NoCheckpoints)
    }

    /// List all checkpoints as (epoch, path) pairs, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<(u64, PathBuf)>, CheckpointFileError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("checkpoint-")
                && (name.ends_with(".ckpt") || name.ends_with(".ckpt.zst"))
            {
                if let Some(epoch) = Self::parse_epoch(&name) {
                    results.push((epoch, entry.path()));
                }
            }
        }
        results.sort_by_key(|(epoch, _)| *epoch);
        Ok(results)
    }

    fn parse_epoch(filename: &str) -> Option<u64> {
        let stripped = filename
            .trim_start_matches("checkpoint-")
            .trim_end_matches(".ckpt.zst")
            .trim_end_matches(".ckpt");
        stripped.parse::<u64>().ok()
    }
}

// ── Retention Policy ────────────────────────────────────────────────

/// Policy for cleaning up old checkpoints.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Maximum number of checkpoints to retain.
    pub max_checkpoints: usize,
}

impl RetentionPolicy {
    pub fn new(max_checkpoints: usize) -> Self {
        Self {
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    /// Remove old checkpoints, keeping only the most recent `max_checkpoints`.
    pub fn cleanup(&self, dir: &Path) -> Result<Vec<PathBuf>, CheckpointFileError> {
        let loader = CheckpointLoader::new(dir);
        let checkpoints = loader.list_checkpoints()?;

        let mut removed = Vec::new();
        if checkpoints.len() > self.max_checkpoints {
            let to_remove = checkpoints.len() - self.max_checkpoints;
            for (_, path) in checkpoints.iter().take(to_remove) {
                fs::remove_file(path)?;
                removed.push(path.clone());
            }
        }
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
