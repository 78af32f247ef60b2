//! Recovery Flow: boot from the newest valid checkpoint
//!
//! Recovery process:
//! 1. List checkpoint files, newest first
//! 2. Load each candidate until one decodes and passes its integrity check
//! 3. Hand its state back to the caller, which resumes consumption from
//!    the checkpointed offsets
//!
//! A corrupt or truncated newest file (e.g. a crash mid-write on a
//! filesystem without atomic rename) falls back to the previous checkpoint;
//! replay from the older offsets is absorbed by event-id dedup and the
//! last-write-wins price table. An empty directory is a cold start.

use crate::checkpoint::{Checkpoint, CheckpointFileError, CheckpointLoader};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointFileError),

    #[error("All {attempted} checkpoints failed verification")]
    NoValidCheckpoint { attempted: usize },
}

// ── Recovery Metrics ────────────────────────────────────────────────

/// Metrics collected during the recovery process.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    /// Number of checkpoint files found on disk.
    pub candidates: usize,
    /// Number of files that failed to load before one succeeded.
    pub rejected: usize,
    /// Epoch of the restored checkpoint (None on cold start).
    pub restored_epoch: Option<u64>,
    /// Total recovery time.
    pub total_recovery_time_ms: u64,
    /// Whether recovery completed successfully.
    pub success: bool,
}

// ── Recovery Log Entry ──────────────────────────────────────────────

/// Structured recovery log entry for diagnostics.
#[derive(Debug, Clone)]
pub struct RecoveryLogEntry {
    pub stage: RecoveryStage,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    Start,
    CheckpointSearch,
    CheckpointLoad,
    CheckpointRejected,
    ColdStart,
    Complete,
    Error,
}

// ── Recovery Engine ─────────────────────────────────────────────────

/// Finds and loads the checkpoint to resume from.
pub struct RecoveryEngine {
    checkpoint_dir: PathBuf,
    log: Vec<RecoveryLogEntry>,
}

impl RecoveryEngine {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            log: Vec::new(),
        }
    }

    /// Restore the newest checkpoint that loads and verifies.
    ///
    /// Returns `Ok((None, _))` when the directory holds no checkpoints.
    /// Fails with [`RecoveryError::NoValidCheckpoint`] when checkpoints
    /// exist but none of them is usable: silently starting empty would
    /// discard every open window they held.
    pub fn restore_latest(
        &mut self,
    ) -> Result<(Option<Checkpoint>, RecoveryMetrics), RecoveryError> {
        let start = Instant::now();
        let mut metrics = RecoveryMetrics::default();

        self.log_stage(RecoveryStage::Start, "Recovery started", &start);
        self.log_stage(
            RecoveryStage::CheckpointSearch,
            &format!("Searching {}", self.checkpoint_dir.display()),
            &start,
        );

        let loader = CheckpointLoader::new(&self.checkpoint_dir);
        let candidates = loader.list_checkpoints()?;
        metrics.candidates = candidates.len();

        if candidates.is_empty() {
            self.log_stage(
                RecoveryStage::ColdStart,
                "No checkpoints found, starting from empty state",
                &start,
            );
            info!(dir = %self.checkpoint_dir.display(), "no checkpoint found, cold start");
            metrics.success = true;
            metrics.total_recovery_time_ms = start.elapsed().as_millis() as u64;
            return Ok((None, metrics));
        }

        for (epoch, path) in candidates.iter().rev() {
            match loader.load(path) {
                Ok(checkpoint) => {
                    self.log_stage(
                        RecoveryStage::CheckpointLoad,
                        &format!(
                            "Checkpoint loaded: epoch={}, hash={}",
                            epoch,
                            &checkpoint.checksum[..16.min(checkpoint.checksum.len())]
                        ),
                        &start,
                    );
                    metrics.restored_epoch = Some(checkpoint.epoch);
                    metrics.success = true;
                    metrics.total_recovery_time_ms = start.elapsed().as_millis() as u64;
                    self.log_stage(
                        RecoveryStage::Complete,
                        &format!(
                            "Recovery complete: epoch={} after {} rejected",
                            epoch, metrics.rejected
                        ),
                        &start,
                    );
                    info!(
                        epoch = checkpoint.epoch,
                        windows = checkpoint.state.windows.len(),
                        pending = checkpoint.state.pending.len(),
                        prices = checkpoint.state.prices.len(),
                        quantity_offset = checkpoint.state.offsets.quantity,
                        price_offset = checkpoint.state.offsets.price,
                        rejected = metrics.rejected,
                        "restored checkpoint"
                    );
                    return Ok((Some(checkpoint), metrics));
                }
                Err(e) => {
                    metrics.rejected += 1;
                    warn!(epoch, path = %path.display(), error = %e, "checkpoint rejected, trying older");
                    self.log_stage(
                        RecoveryStage::CheckpointRejected,
                        &format!("Checkpoint {} rejected: {}", epoch, e),
                        &start,
                    );
                }
            }
        }

        metrics.total_recovery_time_ms = start.elapsed().as_millis() as u64;
        self.log_stage(
            RecoveryStage::Error,
            &format!("No valid checkpoint among {}", metrics.candidates),
            &start,
        );
        Err(RecoveryError::NoValidCheckpoint {
            attempted: metrics.candidates,
        })
    }

    /// Get recovery log entries.
    pub fn log(&self) -> &[RecoveryLogEntry] {
        &self.log
    }

    fn log_stage(&mut self, stage: RecoveryStage, message: &str, start: &Instant) {
        self.log.push(RecoveryLogEntry {
            stage,
            message: message.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        });
    }
}

// ── Tests ───────────────────────────────────────────────────────────
