// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject remote failures and verify graceful degradation.
//!
//! These tests verify that throttling and transport failures are retried,
//! that exhausted retries surface as per-item failures instead of aborting,
//! and that a later run repairs what an earlier one could not finish.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use catalog_replicator::config::RateLimitSettings;
use catalog_replicator::remote::RemoteOp;
use catalog_replicator::{Operation, RemoteError, Replicator, ResourceType, RunState};
use common::*;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Throttling
// =============================================================================

/// Test: Throttled creates are retried and eventually succeed
#[tokio::test]
async fn throttled_create_is_retried() {
    let remote = seeded_remote().await;
    remote
        .fail_next(RemoteOp::Create, RemoteError::Throttled { retry_after: None }, 2)
        .await;

    let summary = run_once(&remote, config()).await;

    assert!(summary.is_success(), "summary: {summary:?}");
    assert_eq!(summary.resource(ResourceType::Asset).unwrap().created, 3);
    // Two throttled attempts plus the successful one for the first asset level.
    let creates = remote.calls_to(RemoteOp::Create, DESTINATION).await;
    assert!(creates.len() >= 3 + 2);
}

/// Test: Server retry-after hint is honored as a minimum delay
#[tokio::test(start_paused = true)]
async fn throttle_honors_retry_after() {
    let remote = seeded_remote().await;
    remote
        .fail_next(
            RemoteOp::List,
            RemoteError::Throttled {
                retry_after: Some(Duration::from_secs(30)),
            },
            1,
        )
        .await;

    let started = tokio::time::Instant::now();
    let summary = run_once(&remote, config()).await;

    assert!(summary.is_success());
    assert!(started.elapsed() >= Duration::from_secs(30));
}

/// Test: Exhausted throttling fails the batch but not the run
#[tokio::test]
async fn throttling_exhausted_fails_batch_not_run() {
    let remote = seeded_remote().await;
    // Testing settings allow 3 attempts; the first asset level never gets through.
    remote
        .fail_next(RemoteOp::Create, RemoteError::Throttled { retry_after: None }, 3)
        .await;

    let mut replicator = Replicator::new(config(), Arc::clone(&remote));
    let summary = replicator.run().await.unwrap();

    assert_eq!(replicator.state(), RunState::Completed);
    assert!(!summary.is_success());

    let assets = summary.resource(ResourceType::Asset).unwrap();
    let plant = assets
        .failures
        .iter()
        .find(|f| f.external_id == "plant")
        .expect("plant should fail");
    assert_eq!(plant.operation, Operation::Create);
    assert!(plant.error.contains("Throttled"));

    // Children of the failed root cannot be placed.
    assert!(assets
        .failures
        .iter()
        .any(|f| f.external_id == "pump-1" && f.operation == Operation::ResolveParent));
    assert!(remote.find(DESTINATION, ResourceType::Asset, "plant").await.is_none());
}

/// Test: A run after a throttled one completes the replication
#[tokio::test]
async fn rerun_repairs_throttled_run() {
    let remote = seeded_remote().await;
    remote
        .fail_next(RemoteOp::Create, RemoteError::Throttled { retry_after: None }, 3)
        .await;
    let first = run_once(&remote, config()).await;
    assert!(!first.is_success());

    let second = run_once(&remote, config()).await;
    assert!(second.is_success(), "summary: {second:?}");
    assert_eq!(remote.entities(DESTINATION, ResourceType::Asset).await.len(), 3);
    assert_eq!(remote.entities(DESTINATION, ResourceType::Event).await.len(), 2);
    assert_eq!(remote.datapoints(DESTINATION, "pressure-2").await.len(), 5);
}

// =============================================================================
// Transport Failures
// =============================================================================

/// Test: Transient transport errors on listing are retried
#[tokio::test]
async fn transport_error_on_listing_is_retried() {
    let remote = seeded_remote().await;
    remote
        .fail_next(RemoteOp::List, RemoteError::Transport("connection reset".into()), 2)
        .await;

    let summary = run_once(&remote, config()).await;

    assert!(summary.is_success(), "summary: {summary:?}");
    assert_eq!(summary.total_changes(), 7);
}

/// Test: Rejected updates are reported per item
#[tokio::test]
async fn rejected_update_is_reported() {
    let remote = seeded_remote().await;
    run_once(&remote, config()).await;

    remote
        .modify(SOURCE, ResourceType::Asset, "pump-1", |e| {
            e.payload["description"] = "replaced".into();
        })
        .await;
    remote
        .fail_next(RemoteOp::Update, RemoteError::Rejected("validation failed".into()), 1)
        .await;

    let summary = run_once(&remote, config()).await;
    let assets = summary.resource(ResourceType::Asset).unwrap();
    assert_eq!(assets.updated, 0);
    assert_eq!(assets.failed, 1);
    assert_eq!(assets.failures[0].operation, Operation::Update);

    // Nothing was applied, so the next run retries the update.
    let retried = run_once(&remote, config()).await;
    assert_eq!(retried.resource(ResourceType::Asset).unwrap().updated, 1);
}

// =============================================================================
// Datapoints
// =============================================================================

/// Test: A failed datapoint write stops only its own timeseries
#[tokio::test]
async fn failed_datapoint_write_is_isolated() {
    let remote = seeded_remote().await;
    remote
        .fail_next_for(
            RemoteOp::WriteDatapoints,
            "pressure-1",
            RemoteError::Rejected("quota exceeded".into()),
            1,
        )
        .await;

    let summary = run_once(&remote, config()).await;
    let datapoints = summary.resource(ResourceType::Datapoints).unwrap();
    assert_eq!(datapoints.created, 5);
    assert_eq!(datapoints.failed, 5);
    assert_eq!(datapoints.failures[0].operation, Operation::WriteDatapoints);
    assert!(remote.datapoints(DESTINATION, "pressure-1").await.is_empty());
    assert_eq!(remote.datapoints(DESTINATION, "pressure-2").await.len(), 5);

    // Resume fills the gap.
    let second = run_once(&remote, config()).await;
    assert_eq!(second.resource(ResourceType::Datapoints).unwrap().created, 5);
    assert_eq!(remote.datapoints(DESTINATION, "pressure-1").await.len(), 5);
}

/// Test: A rejected datapoint read shows up in the failure counts
#[tokio::test]
async fn rejected_datapoint_read_is_counted() {
    let remote = seeded_remote().await;
    remote
        .fail_next_for(
            RemoteOp::ListDatapoints,
            "pressure-1",
            RemoteError::Rejected("bad range".into()),
            1,
        )
        .await;

    let summary = run_once(&remote, config()).await;
    let datapoints = summary.resource(ResourceType::Datapoints).unwrap();
    assert_eq!(datapoints.failed, datapoints.failures.len());
    assert_eq!(datapoints.failures[0].operation, Operation::ReadDatapoints);
    assert!(summary.total_failed() > 0);
    assert!(!summary.is_success());
    assert!(remote.datapoints(DESTINATION, "pressure-1").await.is_empty());
    assert_eq!(remote.datapoints(DESTINATION, "pressure-2").await.len(), 5);
}

/// Test: Transient failure reading datapoints is retried
#[tokio::test]
async fn transient_datapoint_read_is_retried() {
    let remote = seeded_remote().await;
    remote
        .fail_next_for(
            RemoteOp::ListDatapoints,
            "pressure-2",
            RemoteError::Transport("broken pipe".into()),
            2,
        )
        .await;

    let summary = run_once(&remote, config()).await;
    assert!(summary.is_success(), "summary: {summary:?}");
    assert_eq!(remote.datapoints(DESTINATION, "pressure-2").await.len(), 5);
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Test: A rate-limited run completes
#[tokio::test]
async fn rate_limited_run_completes() {
    let remote = seeded_remote().await;
    let mut cfg = config();
    cfg.settings.rate_limit = Some(RateLimitSettings {
        per_second: 1_000,
        burst: 5,
    });

    let summary = run_once(&remote, cfg).await;
    assert!(summary.is_success());
    assert_eq!(summary.total_changes(), 7);
}
