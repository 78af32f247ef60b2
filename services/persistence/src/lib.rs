//! Checkpoint persistence for the valuation engine
//!
//! Provides durable, integrity-checked checkpoint files of the engine's
//! state and the recovery flow that picks the newest usable one on boot.

pub mod checkpoint;
pub mod recovery;

pub use checkpoint::{
    Checkpoint, CheckpointFileError, CheckpointLoader, CheckpointState, CheckpointWriter,
    EmittedRecord, PriceRecord, RetentionPolicy, SourceOffsets, WatermarkRecord,
    WindowStateRecord, CHECKPOINT_VERSION,
};
pub use recovery::{RecoveryEngine, RecoveryError, RecoveryMetrics, RecoveryStage};
