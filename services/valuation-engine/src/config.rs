//! Engine configuration
//!
//! Read once at start. [`EngineConfig`] is a plain struct with defaults and
//! a `validate()` pass; [`EngineArgs`] is the clap surface the binary
//! flattens into its subcommands, with every flag also readable from a
//! `VALUATION_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use thiserror::Error;
use types::numeric::Price;

use crate::retry::RetryPolicy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("window size must be positive, got {0}ms")]
    InvalidWindowSize(i64),

    #[error("out-of-orderness tolerance must not be negative, got {0}ms")]
    NegativeTolerance(i64),

    #[error("invalid default price: {0:?}")]
    InvalidDefaultPrice(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// What happens to an event whose window already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LatePolicy {
    /// Count and discard.
    #[default]
    Drop,
    /// Fold into the window that contains the current watermark.
    MergeIntoNext,
}

/// Topic names for the three streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub quantity: String,
    pub price: String,
    pub output: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            quantity: "collection.items".to_string(),
            price: "price.updates".to_string(),
            output: "collection.values".to_string(),
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tumbling window size in milliseconds.
    pub window_size_ms: i64,
    /// Bounded out-of-orderness; the watermark trails the max event time by this much.
    pub out_of_orderness_ms: i64,
    /// Price used for items the side-table has never seen.
    pub default_price: Price,
    /// Prices observed longer than this before `as_of` are flagged stale.
    pub staleness_horizon_ms: Option<i64>,
    pub late_policy: LatePolicy,
    /// Event ids of closed windows remembered for dedup.
    pub dedup_horizon: usize,
    /// Confirmed snapshot digests remembered for integrity checks.
    pub ledger_capacity: usize,
    /// Capacity of every inter-stage queue.
    pub queue_capacity: usize,
    /// Records fetched per transport read.
    pub read_batch: usize,
    pub tick_interval: Duration,
    pub poll_interval: Duration,
    pub checkpoint_interval: Duration,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_compress: bool,
    pub checkpoint_retention: usize,
    pub max_consecutive_checkpoint_failures: u32,
    /// Backoff for publish and checkpoint writes.
    pub retry: RetryPolicy,
    /// Upper bound on one publish or checkpoint write including retries.
    pub operation_timeout: Duration,
    pub topics: TopicNames,
    /// Advance the watermark from processing time when the stream is quiet.
    pub idle_watermark: bool,
    /// Readers stop at the end of the topic instead of polling for more.
    pub bounded_input: bool,
    /// On drain, close every open window instead of checkpointing it open.
    pub flush_on_drain: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 10_000,
            out_of_orderness_ms: 5_000,
            default_price: Price::from_u64(5),
            staleness_horizon_ms: Some(24 * 60 * 60 * 1_000),
            late_policy: LatePolicy::Drop,
            dedup_horizon: 100_000,
            ledger_capacity: 10_000,
            queue_capacity: 1_024,
            read_batch: 256,
            tick_interval: Duration::from_millis(1_000),
            poll_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_secs(10),
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_compress: true,
            checkpoint_retention: 3,
            max_consecutive_checkpoint_failures: 3,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(5),
            topics: TopicNames::default(),
            idle_watermark: false,
            bounded_input: false,
            flush_on_drain: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_ms <= 0 {
            return Err(ConfigError::InvalidWindowSize(self.window_size_ms));
        }
        if self.out_of_orderness_ms < 0 {
            return Err(ConfigError::NegativeTolerance(self.out_of_orderness_ms));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        if self.read_batch == 0 {
            return Err(ConfigError::Zero("read batch"));
        }
        if self.checkpoint_retention == 0 {
            return Err(ConfigError::Zero("checkpoint retention"));
        }
        if self.max_consecutive_checkpoint_failures == 0 {
            return Err(ConfigError::Zero("max consecutive checkpoint failures"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero("tick interval"));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::Zero("checkpoint interval"));
        }
        Ok(())
    }
}

/// Command-line and environment surface for [`EngineConfig`].
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Tumbling window size in milliseconds
    #[arg(long, env = "VALUATION_WINDOW_SIZE_MS", default_value_t = 10_000)]
    pub window_size_ms: i64,

    /// Out-of-orderness tolerance in milliseconds
    #[arg(long, env = "VALUATION_OUT_OF_ORDERNESS_MS", default_value_t = 5_000)]
    pub out_of_orderness_ms: i64,

    /// Price applied to items with no known price
    #[arg(long, env = "VALUATION_DEFAULT_PRICE", default_value = "5.00")]
    pub default_price: String,

    /// Staleness horizon in milliseconds (0 disables the flag)
    #[arg(long, env = "VALUATION_STALENESS_HORIZON_MS", default_value_t = 86_400_000)]
    pub staleness_horizon_ms: i64,

    /// Late-data policy
    #[arg(long, env = "VALUATION_LATE_POLICY", value_enum, default_value_t = LatePolicy::Drop)]
    pub late_policy: LatePolicy,

    #[arg(long, env = "VALUATION_DEDUP_HORIZON", default_value_t = 100_000)]
    pub dedup_horizon: usize,

    #[arg(long, env = "VALUATION_QUEUE_CAPACITY", default_value_t = 1_024)]
    pub queue_capacity: usize,

    #[arg(long, env = "VALUATION_TICK_MS", default_value_t = 1_000)]
    pub tick_ms: u64,

    #[arg(long, env = "VALUATION_CHECKPOINT_INTERVAL_MS", default_value_t = 10_000)]
    pub checkpoint_interval_ms: u64,

    #[arg(long, env = "VALUATION_CHECKPOINT_DIR", default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Write checkpoints uncompressed
    #[arg(long, env = "VALUATION_CHECKPOINT_NO_COMPRESS")]
    pub checkpoint_no_compress: bool,

    #[arg(long, env = "VALUATION_CHECKPOINT_RETENTION", default_value_t = 3)]
    pub checkpoint_retention: usize,

    #[arg(long, env = "VALUATION_MAX_CHECKPOINT_FAILURES", default_value_t = 3)]
    pub max_checkpoint_failures: u32,

    #[arg(long, env = "VALUATION_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: usize,

    #[arg(long, env = "VALUATION_RETRY_BASE_MS", default_value_t = 100)]
    pub retry_base_ms: u64,

    #[arg(long, env = "VALUATION_RETRY_MAX_MS", default_value_t = 2_000)]
    pub retry_max_ms: u64,

    #[arg(long, env = "VALUATION_OPERATION_TIMEOUT_MS", default_value_t = 5_000)]
    pub operation_timeout_ms: u64,

    #[arg(long, env = "VALUATION_TOPIC_QUANTITY", default_value = "collection.items")]
    pub topic_quantity: String,

    #[arg(long, env = "VALUATION_TOPIC_PRICE", default_value = "price.updates")]
    pub topic_price: String,

    #[arg(long, env = "VALUATION_TOPIC_OUTPUT", default_value = "collection.values")]
    pub topic_output: String,

    /// Advance the watermark from processing time when input is idle
    #[arg(long, env = "VALUATION_IDLE_WATERMARK")]
    pub idle_watermark: bool,
}

impl EngineArgs {
    pub fn into_config(self) -> Result<EngineConfig, ConfigError> {
        let default_price = Price::parse(&self.default_price)
            .ok_or_else(|| ConfigError::InvalidDefaultPrice(self.default_price.clone()))?;

        let config = EngineConfig {
            window_size_ms: self.window_size_ms,
            out_of_orderness_ms: self.out_of_orderness_ms,
            default_price,
            staleness_horizon_ms: (self.staleness_horizon_ms > 0).then_some(self.staleness_horizon_ms),
            late_policy: self.late_policy,
            dedup_horizon: self.dedup_horizon,
            queue_capacity: self.queue_capacity,
            tick_interval: Duration::from_millis(self.tick_ms),
            checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms),
            checkpoint_dir: self.checkpoint_dir,
            checkpoint_compress: !self.checkpoint_no_compress,
            checkpoint_retention: self.checkpoint_retention,
            max_consecutive_checkpoint_failures: self.max_checkpoint_failures,
            retry: RetryPolicy::new(self.retry_attempts, self.retry_base_ms, self.retry_max_ms, 0.2),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            topics: TopicNames {
                quantity: self.topic_quantity,
                price: self.topic_price,
                output: self.topic_output,
            },
            idle_watermark: self.idle_watermark,
            ..EngineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        engine: EngineArgs,
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_size_ms, 10_000);
        assert_eq!(config.out_of_orderness_ms, 5_000);
        assert_eq!(config.default_price, Price::from_u64(5));
        assert_eq!(config.topics.output, "collection.values");
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let config = EngineConfig {
            window_size_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidWindowSize(0)));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = EngineConfig {
            queue_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn test_args_into_config() {
        let cli = TestCli::try_parse_from([
            "test",
            "--window-size-ms",
            "60000",
            "--default-price",
            "0.25",
            "--late-policy",
            "merge-into-next",
            "--staleness-horizon-ms",
            "0",
            "--checkpoint-no-compress",
        ])
        .unwrap();
        let config = cli.engine.into_config().unwrap();

        assert_eq!(config.window_size_ms, 60_000);
        assert_eq!(config.default_price, Price::parse("0.25").unwrap());
        assert_eq!(config.late_policy, LatePolicy::MergeIntoNext);
        assert_eq!(config.staleness_horizon_ms, None);
        assert!(!config.checkpoint_compress);
    }

    #[test]
    fn test_args_reject_bad_price() {
        let cli = TestCli::try_parse_from(["test", "--default-price=-1"]).unwrap();
        assert!(matches!(
            cli.engine.into_config(),
            Err(ConfigError::InvalidDefaultPrice(_))
        ));
    }
}
