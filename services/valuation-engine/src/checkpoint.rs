//! Checkpoint coordinator
//!
//! Persists the aggregator's state (open windows, pending snapshots, dedup
//! horizon, emission ledger, watermark, price table, consumer offsets) on a
//! fixed interval and restores it on startup.
//!
//! A failed write is retried within the operation timeout. A run of
//! `max_consecutive_failures` failed checkpoints is fatal: the pipeline
//! stops rather than keep processing with no durable recovery point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use persistence::{
    Checkpoint, CheckpointState, CheckpointWriter, RecoveryEngine, RecoveryError, RetentionPolicy,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::retry::{RetryFailure, RetryPolicy};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint write failed after {attempts} attempts: {reason}")]
    Write { attempts: usize, reason: String },

    #[error("checkpoint write timed out after {attempts} attempts")]
    TimedOut { attempts: usize },

    #[error("{failures} consecutive checkpoint failures, giving up")]
    Exhausted { failures: u32 },

    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),
}

pub struct CheckpointCoordinator {
    dir: PathBuf,
    writer: CheckpointWriter,
    retention: RetentionPolicy,
    epoch: u64,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    retry: RetryPolicy,
    timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl CheckpointCoordinator {
    pub fn new(config: &EngineConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            dir: config.checkpoint_dir.clone(),
            writer: CheckpointWriter::new(&config.checkpoint_dir, config.checkpoint_compress),
            retention: RetentionPolicy::new(config.checkpoint_retention),
            epoch: 0,
            consecutive_failures: 0,
            max_consecutive_failures: config.max_consecutive_checkpoint_failures.max(1),
            retry: config.retry.clone(),
            timeout: config.operation_timeout,
            metrics,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Load the newest valid checkpoint, if any, and continue its epoch sequence.
    pub fn restore(&mut self) -> Result<Option<CheckpointState>, CheckpointError> {
        let mut recovery = RecoveryEngine::new(&self.dir);
        let (restored, metrics) = recovery.restore_latest()?;
        info!(
            candidates = metrics.candidates,
            rejected = metrics.rejected,
            epoch = ?metrics.restored_epoch,
            elapsed_ms = metrics.total_recovery_time_ms,
            "checkpoint recovery finished"
        );
        Ok(restored.map(|checkpoint| {
            self.epoch = checkpoint.epoch;
            checkpoint.state
        }))
    }

    /// Write one checkpoint. Returns the file written.
    pub async fn checkpoint(&mut self, state: CheckpointState) -> Result<PathBuf, CheckpointError> {
        let epoch = self.epoch + 1;
        let result = self.write(epoch, state).await;

        match result {
            Ok(path) => {
                self.epoch = epoch;
                self.consecutive_failures = 0;
                self.metrics.record_checkpoint_written();
                info!(epoch, path = %path.display(), "checkpoint written");
                if let Err(e) = self.retention.cleanup(&self.dir) {
                    warn!(error = %e, "checkpoint retention cleanup failed");
                }
                Ok(path)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.metrics.record_checkpoint_failure();
                error!(
                    epoch,
                    consecutive_failures = self.consecutive_failures,
                    max = self.max_consecutive_failures,
                    error = %err,
                    "checkpoint failed"
                );
                if self.consecutive_failures >= self.max_consecutive_failures {
                    Err(CheckpointError::Exhausted {
                        failures: self.consecutive_failures,
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn write(&self, epoch: u64, state: CheckpointState) -> Result<PathBuf, CheckpointError> {
        let checkpoint = Checkpoint::new(epoch, Utc::now().timestamp_millis(), state, self.writer.compress())
            .map_err(|e| CheckpointError::Write {
                attempts: 0,
                reason: e.to_string(),
            })?;
        let checkpoint = Arc::new(checkpoint);

        let result = self
            .retry
            .retry_with_timeout(
                self.timeout,
                |_| {
                    let writer = self.writer.clone();
                    let checkpoint = Arc::clone(&checkpoint);
                    async move {
                        tokio::task::spawn_blocking(move || writer.write(&checkpoint))
                            .await
                            .map_err(|e| e.to_string())?
                            .map_err(|e| e.to_string())
                    }
                },
                |attempt, reason| warn!(epoch, attempt, error = %reason, "checkpoint write failed, retrying"),
            )
            .await;

        result.map_err(|failure| match failure {
            RetryFailure::Exhausted { attempts, last } => CheckpointError::Write {
                attempts,
                reason: last,
            },
            RetryFailure::TimedOut { attempts } => CheckpointError::TimedOut { attempts },
        })
    }
}
