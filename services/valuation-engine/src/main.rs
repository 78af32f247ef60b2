use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use persistence::CheckpointLoader;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use valuation_engine::config::EngineArgs;
use valuation_engine::emission::DedupConsumer;
use valuation_engine::feed;
use valuation_engine::pipeline;
use valuation_engine::transport::{MemoryTransport, Transport};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Windowed collection valuation engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Value collections against a price feed",
        after_help = "EXAMPLES:\n    valuation-engine run decks/ --prices prices.jsonl\n\n    # Continue from the checkpoints of an earlier run\n    valuation-engine run decks/ --prices prices.jsonl --resume"
    )]
    Run(RunArgs),

    #[command(about = "Normalize collection files and print the result without valuing them")]
    Normalize(NormalizeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Collection files or directories of them
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// JSON-lines price updates
    #[arg(long)]
    prices: Option<PathBuf>,

    /// Event time (Unix ms) stamped on every collection line; defaults to now
    #[arg(long)]
    event_time: Option<i64>,

    /// Restore from existing checkpoints in the checkpoint directory
    #[arg(long)]
    resume: bool,

    /// Print engine counters to stderr when done
    #[arg(long)]
    metrics: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct NormalizeArgs {
    /// Collection files or directories of them
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Event time (Unix ms) stamped on every line; defaults to now
    #[arg(long)]
    event_time: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::Normalize(args) => normalize(args),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = args.engine.into_config()?;
    config.bounded_input = true;
    config.flush_on_drain = true;

    let existing = CheckpointLoader::new(&config.checkpoint_dir).list_checkpoints()?;
    if !existing.is_empty() && !args.resume {
        bail!(
            "{} already holds {} checkpoint(s); pass --resume or choose another --checkpoint-dir",
            config.checkpoint_dir.display(),
            existing.len()
        );
    }

    let event_time = args.event_time.unwrap_or_else(|| Utc::now().timestamp_millis());
    let transport = Arc::new(MemoryTransport::new());

    if let Some(prices) = &args.prices {
        feed::publish_price_file(transport.as_ref(), &config.topics.price, prices)
            .await
            .with_context(|| format!("loading prices from {}", prices.display()))?;
    }
    for path in feed::collection_paths(&args.inputs)? {
        let collection = feed::load_collection(&path, event_time)?;
        feed::publish_collection(transport.as_ref(), &config.topics.quantity, &collection).await?;
    }

    let output_topic = config.topics.output.clone();
    let handle = pipeline::start(config, Arc::clone(&transport) as Arc<dyn Transport>).await?;
    let metrics = handle.metrics();

    let join = handle.join();
    tokio::pin!(join);
    let report = tokio::select! {
        result = &mut join => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, draining");
            // Bounded readers stop on their own; wait for the drain.
            join.await?
        }
    };

    let mut consumer = DedupConsumer::new();
    for record in transport.records(&output_topic) {
        if let Some(snapshot) = consumer.offer_payload(&record.payload)? {
            println!("{}", serde_json::to_string(&snapshot)?);
        }
    }

    if !report.quarantined.is_empty() {
        warn!(count = report.quarantined.len(), "snapshots quarantined");
    }
    if args.metrics {
        eprintln!("{}", serde_json::to_string_pretty(&metrics.export())?);
    }
    info!(
        pending = report.pending_snapshots,
        epoch = report.checkpoint_epoch,
        duplicates = consumer.duplicates(),
        "run complete"
    );
    Ok(())
}

fn normalize(args: NormalizeArgs) -> anyhow::Result<()> {
    let event_time = args.event_time.unwrap_or_else(|| Utc::now().timestamp_millis());
    for path in feed::collection_paths(&args.inputs)? {
        let collection = feed::load_collection(&path, event_time)?;
        let rejected: Vec<_> = collection
            .rejected
            .iter()
            .map(|r| json!({ "line": r.line_no, "error": r.error.to_string() }))
            .collect();
        let out = json!({
            "collection_id": collection.collection_id,
            "collection_name": collection.collection_name,
            "source": collection.source,
            "total_items": collection.summary.total_items,
            "unique_items": collection.summary.unique_items,
            "events": collection.events,
            "rejected": rejected,
        });
        println!("{}", serde_json::to_string(&out)?);
    }
    Ok(())
}
