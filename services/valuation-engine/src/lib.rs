//! Valuation Engine
//!
//! Consumes collection quantity events and item price updates, and produces
//! one valuation snapshot per collection per closed event-time window:
//! - Normalization of raw collection lines into quantity events
//! - A concurrent price side-table (latest observation wins)
//! - Tumbling event-time windows with a bounded-out-of-orderness watermark
//! - Idempotent emission keyed by a derived snapshot id
//! - Periodic checkpoints and recovery from the newest valid one
//!
//! # Architecture
//!
//! ```text
//!  deck files ──► Normalizer ──► collection.items ─┐
//!                                                  │
//!  price file ─────────────────► price.updates ──┐ │
//!                                                │ │
//!                                     ┌──────────▼─▼──────────┐
//!                                     │ Pipeline               │
//!                                     │  PriceTable  Aggregator│──► Checkpoints
//!                                     └──────────┬────────────┘
//!                                                │ Emitter
//!                                                ▼
//!                                       collection.values
//! ```
//!
//! The value of a window is `Σ quantity × price`, with each price looked up
//! at the moment its quantity event is applied. A price that arrives later
//! never revalues an event already applied.

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod emission;
pub mod feed;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod price_table;
pub mod retry;
pub mod transport;
pub mod window;

pub use aggregator::{Aggregator, AggregatorConfig, ProcessOutcome};
pub use config::{EngineArgs, EngineConfig, LatePolicy};
pub use emission::{DedupConsumer, Emitter, EmissionLedger};
pub use metrics::EngineMetrics;
pub use pipeline::{PipelineError, PipelineHandle, PipelineReport};
pub use price_table::PriceTable;
pub use transport::{MemoryTransport, Transport};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
