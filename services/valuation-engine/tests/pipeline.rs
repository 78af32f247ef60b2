//! End-to-end pipeline tests over the in-memory transport.
//!
//! Covers:
//! - The Alpha valuation scenario (known + default prices)
//! - Duplicate delivery of a quantity event
//! - A price that arrives after a window closed only affects later windows
//! - Malformed records are skipped, not fatal
//! - Unconfirmed snapshots survive a restart and are published afterwards
//! - Shutdown of an unbounded pipeline keeps open windows in the checkpoint

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tempfile::TempDir;
use types::events::{event_types, CollectionValueSnapshot, Envelope, PriceUpdateEvent, QuantityEvent};
use types::ids::CollectionId;
use types::numeric::{Price, Quantity};
use valuation_engine::config::EngineConfig;
use valuation_engine::emission::DedupConsumer;
use valuation_engine::pipeline;
use valuation_engine::retry::RetryPolicy;
use valuation_engine::transport::{publish_envelope, FlakyPublisher, MemoryTransport, Transport};

fn config(checkpoints: &Path) -> EngineConfig {
    EngineConfig {
        checkpoint_dir: checkpoints.to_path_buf(),
        checkpoint_compress: false,
        tick_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(5),
        checkpoint_interval: Duration::from_millis(50),
        retry: RetryPolicy::new(2, 1, 2, 0.0),
        operation_timeout: Duration::from_secs(1),
        staleness_horizon_ms: None,
        bounded_input: true,
        flush_on_drain: true,
        ..EngineConfig::default()
    }
}

fn alpha() -> CollectionId {
    CollectionId::from_source("decks/alpha.deck")
}

fn item(name: &str, qty: u32, t: i64) -> QuantityEvent {
    QuantityEvent::new(alpha(), "Alpha", name, Quantity::new(qty).unwrap(), t)
}

async fn publish_item(transport: &dyn Transport, event: &QuantityEvent) {
    let envelope = Envelope::new(event_types::COLLECTION_ITEM, event.event_id.to_string(), "test", event);
    publish_envelope(transport, "collection.items", &event.collection_id.to_string(), &envelope)
        .await
        .unwrap();
}

async fn publish_price(transport: &dyn Transport, name: &str, price: &str, at: i64) {
    let update = PriceUpdateEvent::new(name.to_lowercase(), Price::parse(price).unwrap(), at, "test");
    let envelope = Envelope::new(event_types::PRICE_UPDATED, format!("{name}@{at}"), "test", &update);
    publish_envelope(transport, "price.updates", update.item_identity.as_str(), &envelope)
        .await
        .unwrap();
}

fn emitted(transport: &MemoryTransport) -> Vec<CollectionValueSnapshot> {
    let mut consumer = DedupConsumer::new();
    transport
        .records("collection.values")
        .iter()
        .filter_map(|r| consumer.offer_payload(&r.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn test_alpha_valuation() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    publish_price(transport.as_ref(), "Lightning Bolt", "2.00", 0).await;
    publish_item(transport.as_ref(), &item("Lightning Bolt", 4, 1_000)).await;
    publish_item(transport.as_ref(), &item("Black Lotus", 1, 1_000)).await;

    let report = pipeline::start(config(tmp.path()), transport.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    let out = emitted(&transport);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].collection_name, "Alpha");
    assert_eq!((out[0].window_start, out[0].window_end), (0, 10_000));
    assert_eq!(out[0].total_items, 5);
    assert_eq!(out[0].unique_items, 2);
    assert_eq!(out[0].total_value, Decimal::from_str("13.00").unwrap());
    assert_eq!(out[0].default_priced_items, 1);
    assert_eq!(out[0].computed_at, 10_000);

    assert_eq!(report.quantity_offset, 2);
    assert_eq!(report.price_offset, 1);
    assert_eq!(report.open_windows, 0);
    assert_eq!(report.pending_snapshots, 0);
    assert!(report.checkpoint_epoch >= 1);
}

#[tokio::test]
async fn test_duplicate_delivery_counts_once() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    publish_price(transport.as_ref(), "Lightning Bolt", "2.00", 0).await;
    let bolt = item("Lightning Bolt", 4, 1_000);
    publish_item(transport.as_ref(), &bolt).await;
    publish_item(transport.as_ref(), &item("Black Lotus", 1, 1_000)).await;
    publish_item(transport.as_ref(), &bolt).await;

    let handle = pipeline::start(config(tmp.path()), transport.clone()).await.unwrap();
    let metrics = handle.metrics();
    handle.join().await.unwrap();

    let out = emitted(&transport);
    assert_eq!(out[0].total_items, 5);
    assert_eq!(out[0].total_value, Decimal::from(13));
    assert_eq!(metrics.export()["events_duplicate"], 1);
}

#[tokio::test]
async fn test_late_price_only_affects_later_windows() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    publish_price(transport.as_ref(), "Lightning Bolt", "2.00", 0).await;
    publish_item(transport.as_ref(), &item("Lightning Bolt", 4, 1_000)).await;
    publish_item(transport.as_ref(), &item("Black Lotus", 1, 1_000)).await;

    pipeline::start(config(tmp.path()), transport.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    let first = emitted(&transport);
    assert_eq!(first.len(), 1);

    publish_price(transport.as_ref(), "Black Lotus", "50.00", 16_000).await;
    publish_item(transport.as_ref(), &item("Lightning Bolt", 4, 21_000)).await;
    publish_item(transport.as_ref(), &item("Black Lotus", 1, 21_000)).await;

    pipeline::start(config(tmp.path()), transport.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    let all = emitted(&transport);

    assert_eq!(all.len(), 2);
    assert_eq!(all[0], first[0], "emitted snapshot is never altered");
    assert_eq!(all[1].window_start, 20_000);
    assert_eq!(all[1].total_value, Decimal::from(58));
    assert_eq!(all[1].default_priced_items, 0);
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport
        .publish("collection.items", "x", "{not json".to_string())
        .await
        .unwrap();
    transport
        .publish("price.updates", "x", r#"{"event_type":"price.updated"}"#.to_string())
        .await
        .unwrap();
    publish_item(transport.as_ref(), &item("Island", 3, 2_000)).await;

    let handle = pipeline::start(config(tmp.path()), transport.clone()).await.unwrap();
    let metrics = handle.metrics();
    let report = handle.join().await.unwrap();

    let out = emitted(&transport);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].total_value, Decimal::from(15));
    assert_eq!(report.quantity_offset, 2);
    let counters = metrics.export();
    assert_eq!(counters["events_malformed"], 1);
    assert_eq!(counters["price_updates_malformed"], 1);
}

#[tokio::test]
async fn test_unconfirmed_snapshot_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let memory = Arc::new(MemoryTransport::new());
    publish_item(memory.as_ref(), &item("Island", 2, 1_000)).await;

    // Both attempts of the only publish fail.
    let flaky = Arc::new(FlakyPublisher::new(memory.clone(), 2));
    let report = pipeline::start(config(tmp.path()), flaky.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(report.pending_snapshots, 1);
    assert_eq!(flaky.failed_publishes(), 2);
    assert!(emitted(&memory).is_empty());

    let report = pipeline::start(config(tmp.path()), memory.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(report.pending_snapshots, 0);
    let out = emitted(&memory);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].total_value, Decimal::from(10));
}

#[tokio::test]
async fn test_shutdown_checkpoints_open_windows() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    publish_item(transport.as_ref(), &item("Island", 1, 1_000)).await;
    publish_item(transport.as_ref(), &item("Forest", 1, 2_000)).await;

    let unbounded = EngineConfig {
        bounded_input: false,
        flush_on_drain: false,
        ..config(tmp.path())
    };
    let handle = pipeline::start(unbounded, transport.clone()).await.unwrap();
    let metrics = handle.metrics();
    for _ in 0..200 {
        if metrics.export()["events_processed"] == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let report = handle.shutdown_and_join().await.unwrap();

    assert_eq!(report.open_windows, 1, "watermark has not passed the window end");
    assert_eq!(report.quantity_offset, 2);
    assert!(emitted(&transport).is_empty());

    // A bounded restart flushes the restored window.
    let report = pipeline::start(config(tmp.path()), transport.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(report.open_windows, 0);
    let out = emitted(&transport);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].total_items, 2);
}
