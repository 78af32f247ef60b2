//! Staged tokio pipeline
//!
//! ```text
//!  collection.items        price.updates
//!        │                       │
//!  ┌─────▼──────┐         ┌──────▼───────┐
//!  │ quantity   │         │ price-table  │──► PriceTable (Arc, DashMap)
//!  │ reader     │         │ updater      │         ▲
//!  └─────┬──────┘         └──────────────┘         │ lookup
//!        │ mpsc (bounded)                          │
//!  ┌─────▼──────────────────────────────────────────┴──┐
//!  │ aggregator (sole owner of window state) + timer    │
//!  └─────┬───────────────────────▲──────────────┬──────┘
//!        │ mpsc snapshots        │ confirmations │ mpsc checkpoint state
//!  ┌─────▼──────┐                │        ┌──────▼───────┐
//!  │ emitter    │────────────────┘        │ checkpointer │
//!  └─────┬──────┘                         └──────────────┘
//!        ▼
//!  collection.values
//! ```
//!
//! Startup restores the newest checkpoint, then catches the price table up
//! to the end of the price topic before quantity consumption begins.
//!
//! Shutdown (watch channel) drains: readers stop, the aggregator finishes
//! every queued event, closes what the watermark allows (or everything,
//! with `flush_on_drain`), waits for the emitter to confirm or fail each
//! dispatched snapshot, then writes a final checkpoint. Open windows are
//! never discarded; they are in that checkpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use persistence::CheckpointState;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use types::events::{event_types, CollectionValueSnapshot, Envelope, PriceUpdateEvent, QuantityEvent};
use types::ids::SnapshotId;

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::checkpoint::{CheckpointCoordinator, CheckpointError};
use crate::config::{ConfigError, EngineConfig};
use crate::emission::Emitter;
use crate::metrics::{AlertThresholds, EngineMetrics};
use crate::price_table::PriceTable;
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("stage task failed: {0}")]
    Join(String),
}

/// Final state of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub quantity_offset: u64,
    pub price_offset: u64,
    pub open_windows: usize,
    /// Snapshots still unconfirmed at exit; they are in the final checkpoint.
    pub pending_snapshots: usize,
    pub quarantined: Vec<CollectionValueSnapshot>,
    pub checkpoint_epoch: u64,
}

/// Emitter → aggregator feedback.
#[derive(Debug, Clone, Copy)]
enum EmitReport {
    Confirmed(SnapshotId),
    Failed(SnapshotId),
}

/// A quantity record: next offset to consume, and the event if it decoded.
type QuantityMsg = (u64, Option<QuantityEvent>);

/// Running pipeline.
pub struct PipelineHandle {
    shutdown: Arc<watch::Sender<bool>>,
    supervisor: JoinHandle<Result<PipelineReport, PipelineError>>,
    metrics: Arc<EngineMetrics>,
    prices: Arc<PriceTable>,
}

impl PipelineHandle {
    /// Signal shutdown; the pipeline drains and writes a final checkpoint.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the pipeline to finish.
    pub async fn join(self) -> Result<PipelineReport, PipelineError> {
        self.supervisor
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?
    }

    pub async fn shutdown_and_join(self) -> Result<PipelineReport, PipelineError> {
        self.shutdown();
        self.join().await
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn prices(&self) -> Arc<PriceTable> {
        Arc::clone(&self.prices)
    }
}

/// Restore state and start every stage.
pub async fn start(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<PipelineHandle, PipelineError> {
    config.validate()?;

    let metrics = Arc::new(EngineMetrics::new());
    let prices = Arc::new(PriceTable::new(config.default_price, config.staleness_horizon_ms));
    let mut aggregator = Aggregator::new(
        AggregatorConfig::from(&config),
        Arc::clone(&prices),
        Arc::clone(&metrics),
    );
    let mut coordinator = CheckpointCoordinator::new(&config, Arc::clone(&metrics));

    let offsets = match coordinator.restore()? {
        Some(state) => aggregator.restore(state),
        None => Default::default(),
    };

    let price_offset = Arc::new(AtomicU64::new(offsets.price));
    let caught_up = catch_up_prices(&config, transport.as_ref(), &prices, &metrics, &price_offset).await?;
    info!(
        quantity_offset = offsets.quantity,
        price_offset = caught_up,
        prices = prices.len(),
        "pipeline starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let (quantity_tx, quantity_rx) = mpsc::channel::<QuantityMsg>(config.queue_capacity);
    let (snapshot_tx, snapshot_rx) = mpsc::channel::<CollectionValueSnapshot>(config.queue_capacity);
    let (report_tx, report_rx) = mpsc::unbounded_channel::<EmitReport>();
    let (checkpoint_tx, checkpoint_rx) = mpsc::channel::<CheckpointState>(1);

    let quantity_reader = tokio::spawn(run_quantity_reader(
        config.clone(),
        Arc::clone(&transport),
        offsets.quantity,
        quantity_tx,
        shutdown_rx.clone(),
        Arc::clone(&metrics),
    ));
    let price_updater = tokio::spawn(run_price_updater(
        config.clone(),
        Arc::clone(&transport),
        Arc::clone(&price_offset),
        Arc::clone(&prices),
        shutdown_rx,
        Arc::clone(&metrics),
    ));
    let emitter = Emitter::new(
        Arc::clone(&transport),
        config.topics.output.clone(),
        config.retry.clone(),
        config.operation_timeout,
        Arc::clone(&metrics),
    );
    let emitter_task = tokio::spawn(run_emitter(emitter, snapshot_rx, report_tx));
    let checkpointer = tokio::spawn(run_checkpointer(coordinator, checkpoint_rx, Arc::clone(&shutdown_tx)));
    let aggregator_task = tokio::spawn(run_aggregator(
        config,
        aggregator,
        quantity_rx,
        snapshot_tx,
        report_rx,
        checkpoint_tx,
        Arc::clone(&price_offset),
    ));

    let supervisor_metrics = Arc::clone(&metrics);
    let supervisor = tokio::spawn(async move {
        let join = |e: tokio::task::JoinError| PipelineError::Join(e.to_string());
        quantity_reader.await.map_err(join)?;
        price_updater.await.map_err(join)?;
        let mut report = aggregator_task.await.map_err(join)?;
        emitter_task.await.map_err(join)?;
        report.checkpoint_epoch = checkpointer.await.map_err(join)??;
        report.price_offset = price_offset.load(Ordering::SeqCst);
        for alert in supervisor_metrics.check_thresholds(&AlertThresholds::default()) {
            warn!(level = ?alert.level, metric = %alert.metric, "{}", alert.message);
        }
        info!(
            quantity_offset = report.quantity_offset,
            price_offset = report.price_offset,
            open_windows = report.open_windows,
            pending = report.pending_snapshots,
            epoch = report.checkpoint_epoch,
            "pipeline stopped"
        );
        Ok::<_, PipelineError>(report)
    });

    Ok(PipelineHandle {
        shutdown: shutdown_tx,
        supervisor,
        metrics,
        prices,
    })
}

/// Apply the price topic up to its current end. Returns the new offset.
async fn catch_up_prices(
    config: &EngineConfig,
    transport: &dyn Transport,
    prices: &PriceTable,
    metrics: &EngineMetrics,
    offset: &AtomicU64,
) -> Result<u64, PipelineError> {
    let end = transport.end_offset(&config.topics.price).await?;
    while offset.load(Ordering::SeqCst) < end {
        let records = transport
            .read_from(&config.topics.price, offset.load(Ordering::SeqCst), config.read_batch)
            .await?;
        if records.is_empty() {
            break;
        }
        for record in records {
            apply_price_record(&record.payload, prices, metrics);
            offset.store(record.offset + 1, Ordering::SeqCst);
        }
    }
    Ok(offset.load(Ordering::SeqCst))
}

fn apply_price_record(payload: &str, prices: &PriceTable, metrics: &EngineMetrics) {
    let update = Envelope::<PriceUpdateEvent>::from_json(payload, event_types::PRICE_UPDATED)
        .and_then(|envelope| prices.update(&envelope.data));
    match update {
        Ok(outcome) => metrics.record_price_update(outcome),
        Err(e) => {
            metrics.record_price_malformed();
            warn!(error = %e, "skipping malformed price update");
        }
    }
}

/// Sleep for `poll` unless shutdown arrives first. Returns true on shutdown.
async fn idle_or_shutdown(poll: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(poll) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn run_quantity_reader(
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    mut offset: u64,
    tx: mpsc::Sender<QuantityMsg>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
) {
    let topic = config.topics.quantity.as_str();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let records = match transport.read_from(topic, offset, config.read_batch).await {
            Ok(records) => records,
            Err(e) => {
                warn!(topic, offset, error = %e, "quantity read failed");
                if idle_or_shutdown(config.poll_interval, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if records.is_empty() {
            if config.bounded_input || idle_or_shutdown(config.poll_interval, &mut shutdown).await {
                break;
            }
            continue;
        }
        for record in records {
            let event = match Envelope::<QuantityEvent>::from_json(&record.payload, event_types::COLLECTION_ITEM) {
                Ok(envelope) => Some(envelope.data),
                Err(e) => {
                    metrics.record_malformed();
                    warn!(topic, offset = record.offset, error = %e, "skipping undecodable quantity record");
                    None
                }
            };
            offset = record.offset + 1;
            if tx.send((offset, event)).await.is_err() {
                return;
            }
        }
    }
    debug!(topic, offset, "quantity reader stopped");
}

async fn run_price_updater(
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    offset: Arc<AtomicU64>,
    prices: Arc<PriceTable>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
) {
    let topic = config.topics.price.as_str();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let from = offset.load(Ordering::SeqCst);
        let records = match transport.read_from(topic, from, config.read_batch).await {
            Ok(records) => records,
            Err(e) => {
                warn!(topic, offset = from, error = %e, "price read failed");
                if idle_or_shutdown(config.poll_interval, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if records.is_empty() {
            if config.bounded_input || idle_or_shutdown(config.poll_interval, &mut shutdown).await {
                break;
            }
            continue;
        }
        for record in records {
            apply_price_record(&record.payload, &prices, &metrics);
            // Table first, offset second: a checkpoint never claims an update it lacks.
            offset.store(record.offset + 1, Ordering::SeqCst);
        }
    }
    debug!(topic, offset = offset.load(Ordering::SeqCst), "price updater stopped");
}

async fn run_emitter(
    emitter: Emitter,
    mut rx: mpsc::Receiver<CollectionValueSnapshot>,
    reports: mpsc::UnboundedSender<EmitReport>,
) {
    while let Some(snapshot) = rx.recv().await {
        let report = match emitter.publish(&snapshot).await {
            Ok(_) => EmitReport::Confirmed(snapshot.snapshot_id),
            Err(e) => {
                warn!(snapshot_id = %snapshot.snapshot_id, error = %e, "snapshot stays pending");
                EmitReport::Failed(snapshot.snapshot_id)
            }
        };
        if reports.send(report).is_err() {
            break;
        }
    }
}

async fn run_checkpointer(
    mut coordinator: CheckpointCoordinator,
    mut rx: mpsc::Receiver<CheckpointState>,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<u64, CheckpointError> {
    while let Some(state) = rx.recv().await {
        match coordinator.checkpoint(state).await {
            Ok(_) => {}
            Err(e @ CheckpointError::Exhausted { .. }) => {
                error!(error = %e, "checkpointing exhausted, stopping pipeline");
                let _ = shutdown.send(true);
                return Err(e);
            }
            Err(_) => {}
        }
    }
    Ok(coordinator.epoch())
}

fn handle_report(aggregator: &mut Aggregator, report: EmitReport) {
    match report {
        EmitReport::Confirmed(id) => aggregator.confirm(&id),
        EmitReport::Failed(id) => aggregator.publish_failed(&id),
    }
}

async fn dispatch(aggregator: &mut Aggregator, tx: &mpsc::Sender<CollectionValueSnapshot>) {
    for snapshot in aggregator.take_dispatchable() {
        let id = snapshot.snapshot_id;
        if tx.send(snapshot).await.is_err() {
            aggregator.publish_failed(&id);
        }
    }
}

async fn run_aggregator(
    config: EngineConfig,
    mut aggregator: Aggregator,
    mut quantity_rx: mpsc::Receiver<QuantityMsg>,
    snapshot_tx: mpsc::Sender<CollectionValueSnapshot>,
    mut report_rx: mpsc::UnboundedReceiver<EmitReport>,
    checkpoint_tx: mpsc::Sender<CheckpointState>,
    price_offset: Arc<AtomicU64>,
) -> PipelineReport {
    let mut tick = interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut checkpoint_tick = interval_at(Instant::now() + config.checkpoint_interval, config.checkpoint_interval);
    checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Timers ahead of input, or a backlog starves them.
            biased;
            Some(report) = report_rx.recv() => handle_report(&mut aggregator, report),
            _ = tick.tick() => {
                aggregator.on_timer(Utc::now().timestamp_millis());
                dispatch(&mut aggregator, &snapshot_tx).await;
            }
            _ = checkpoint_tick.tick() => {
                let state = aggregator.checkpoint_state(price_offset.load(Ordering::SeqCst));
                match checkpoint_tx.try_send(state) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("previous checkpoint still in progress, skipping");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        error!("checkpointer stopped");
                    }
                }
            }
            msg = quantity_rx.recv() => match msg {
                Some((next_offset, event)) => {
                    if let Some(event) = event {
                        aggregator.process(&event);
                    }
                    aggregator.set_quantity_offset(next_offset);
                }
                None => break,
            },
        }
    }

    // Drain.
    let closed = if config.flush_on_drain {
        aggregator.flush_all()
    } else {
        aggregator.on_timer(Utc::now().timestamp_millis())
    };
    info!(closed, open = aggregator.open_windows(), "draining");
    dispatch(&mut aggregator, &snapshot_tx).await;
    drop(snapshot_tx);
    while let Some(report) = report_rx.recv().await {
        handle_report(&mut aggregator, report);
    }

    let state = aggregator.checkpoint_state(price_offset.load(Ordering::SeqCst));
    if checkpoint_tx.send(state).await.is_err() {
        error!("final checkpoint not written: checkpointer stopped");
    }

    PipelineReport {
        quantity_offset: aggregator.quantity_offset(),
        price_offset: price_offset.load(Ordering::SeqCst),
        open_windows: aggregator.open_windows(),
        pending_snapshots: aggregator.pending_count(),
        quarantined: aggregator.quarantined().to_vec(),
        checkpoint_epoch: 0,
    }
}
