//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Entity builders for source projects
//! - A seeded in-memory source/destination pair
//! - A one-shot run helper

#![allow(dead_code)]

use catalog_replicator::{
    Datapoint, Entity, MemoryRemote, ReplicatorConfig, Replicator, ResourceType, RunSummary, TimeExpr,
};
use serde_json::json;
use std::sync::Arc;

pub const SOURCE: &str = "source";
pub const DESTINATION: &str = "destination";

pub fn asset(id: i64, external_id: &str) -> Entity {
    Entity::new(id, external_id, json!({"name": external_id, "description": "asset"}))
}

pub fn event(id: i64, external_id: &str) -> Entity {
    Entity::new(id, external_id, json!({"type": "alarm", "subtype": external_id}))
}

pub fn timeseries(id: i64, external_id: &str) -> Entity {
    Entity::new(id, external_id, json!({"name": external_id, "unit": "bar", "is_string": false}))
}

pub fn string_timeseries(id: i64, external_id: &str) -> Entity {
    Entity::new(id, external_id, json!({"name": external_id, "is_string": true}))
}

/// Entity without an external id.
pub fn anonymous(id: i64) -> Entity {
    let mut entity = Entity::new(id, "", json!({"name": "anonymous"}));
    entity.external_id = None;
    entity
}

/// `count` points one second apart starting at `start_ms`, value = index.
pub fn points(start_ms: i64, count: usize) -> Vec<Datapoint> {
    (0..count)
        .map(|i| Datapoint::new(start_ms + i as i64 * 1_000, i as f64))
        .collect()
}

/// Test config with a fixed datapoints window covering `[0, 10^12]` ms.
pub fn config() -> ReplicatorConfig {
    let mut config = ReplicatorConfig::for_testing(SOURCE, DESTINATION);
    config.datapoints.start = TimeExpr::Absolute(0);
    config.datapoints.end = TimeExpr::Absolute(1_000_000_000);
    config
}

/// Source project with a small asset tree, events, timeseries and datapoints.
///
/// ```text
/// plant
/// ├── pump-1   events: alarm-1     timeseries: pressure-1 (5 points)
/// └── pump-2   events: alarm-2     timeseries: pressure-2 (5 points)
/// ```
pub async fn seeded_remote() -> Arc<MemoryRemote> {
    let remote = Arc::new(MemoryRemote::new());
    remote
        .seed(
            SOURCE,
            ResourceType::Asset,
            vec![
                asset(1, "plant"),
                asset(2, "pump-1").with_parent("plant"),
                asset(3, "pump-2").with_parent("plant"),
            ],
        )
        .await;
    remote
        .seed(
            SOURCE,
            ResourceType::Event,
            vec![
                event(10, "alarm-1").with_parent("pump-1"),
                event(11, "alarm-2").with_parent("pump-2"),
            ],
        )
        .await;
    remote
        .seed(
            SOURCE,
            ResourceType::TimeSeries,
            vec![
                timeseries(20, "pressure-1").with_parent("pump-1"),
                timeseries(21, "pressure-2").with_parent("pump-2"),
            ],
        )
        .await;
    remote.seed_datapoints(SOURCE, "pressure-1", points(1_000, 5)).await;
    remote.seed_datapoints(SOURCE, "pressure-2", points(1_000, 5)).await;
    remote
}

/// Run a fresh replicator once and return its summary.
pub async fn run_once(remote: &Arc<MemoryRemote>, config: ReplicatorConfig) -> RunSummary {
    Replicator::new(config, Arc::clone(remote))
        .run()
        .await
        .expect("run should produce a summary")
}
