// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch executor for create, update and delete against the destination.
//!
//! Splits work into batches of at most `batch_size` items and runs them
//! concurrently on the run's shared worker pool.
//!
//! # Design
//!
//! ```text
//! items ──▶ partition(batch_size) ──┬──▶ JoinSet task ──▶ Bulkhead permit
//!                                   │                        │
//!                                   │                        ▼
//!                                   │                 call_with_retry(remote)
//!                                   │                        │
//!                                   │          ok ───────────┼──────── failed
//!                                   │          ▼                        ▼
//!                                   │   IdRegistry record /     FailedItem per item
//!                                   │   advance / remove        (not in registry)
//!                                   ▼
//!                              BatchReport (merged)
//! ```
//!
//! A failed batch never stops the other batches. Fatal errors
//! (authentication, mapping conflict) abort every outstanding batch and are
//! returned to the caller.

use crate::deletion::{DeletionCandidate, DeletionReason};
use crate::diff::{Resolved, UpdateTarget};
use crate::entity::{DestinationId, Entity, EntityUpdate, ResourceType, SourceId};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::registry::IdRegistry;
use crate::remote::{ItemOutcome, RemoteClient};
use crate::resilience::{call_with_retry, Bulkhead, RateLimiter, RetryConfig};
use crate::summary::{FailedItem, Operation};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Split `items` into consecutive batches of at most `batch_size`.
pub fn partition<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

/// Aggregated outcome of one executor call.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Number of batches submitted.
    pub batches: usize,
    /// Items the remote confirmed.
    pub succeeded: usize,
    pub failures: Vec<FailedItem>,
}

impl BatchReport {
    fn failed<I>(external_ids: I, operation: Operation, error: &ReplicationError) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            batches: 1,
            succeeded: 0,
            failures: external_ids
                .into_iter()
                .map(|id| FailedItem::new(id, operation, error))
                .collect(),
        }
    }

    fn merge(&mut self, other: BatchReport) {
        self.batches += other.batches;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
    }
}

/// Runs batches for one destination project.
pub struct BatchExecutor<C: RemoteClient> {
    client: Arc<C>,
    registry: Arc<IdRegistry>,
    workers: Arc<Bulkhead>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryConfig,
    source_project: String,
    destination_project: String,
    batch_size: usize,
    replicated_time: i64,
}

impl<C: RemoteClient> Clone for BatchExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            workers: Arc::clone(&self.workers),
            limiter: self.limiter.clone(),
            retry: self.retry.clone(),
            source_project: self.source_project.clone(),
            destination_project: self.destination_project.clone(),
            batch_size: self.batch_size,
            replicated_time: self.replicated_time,
        }
    }
}

impl<C: RemoteClient> BatchExecutor<C> {
    pub fn new(
        client: Arc<C>,
        registry: Arc<IdRegistry>,
        workers: Arc<Bulkhead>,
        source_project: impl Into<String>,
        destination_project: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            workers,
            limiter: None,
            retry: RetryConfig::default(),
            source_project: source_project.into(),
            destination_project: destination_project.into(),
            batch_size: 10_000,
            replicated_time: 0,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Stamp written entities' provenance with this run time.
    pub fn with_replicated_time(mut self, replicated_time: i64) -> Self {
        self.replicated_time = replicated_time;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Create entities and record their destination identities.
    #[instrument(skip_all, fields(resource = %resource, items = items.len()))]
    pub async fn create(&self, resource: ResourceType, items: Vec<Resolved<Entity>>) -> Result<BatchReport> {
        let this = self.clone();
        self.execute(Operation::Create, items, move |batch| {
            let this = this.clone();
            async move { this.create_batch(resource, batch).await }
        })
        .await
        .inspect(|report| log_report(resource, Operation::Create, report))
    }

    /// Update mapped entities and advance their watermarks.
    #[instrument(skip_all, fields(resource = %resource, items = items.len()))]
    pub async fn update(
        &self,
        resource: ResourceType,
        items: Vec<Resolved<UpdateTarget>>,
    ) -> Result<BatchReport> {
        let this = self.clone();
        self.execute(Operation::Update, items, move |batch| {
            let this = this.clone();
            async move { this.update_batch(resource, batch).await }
        })
        .await
        .inspect(|report| log_report(resource, Operation::Update, report))
    }

    /// Delete destination entities and drop their mappings.
    #[instrument(skip_all, fields(resource = %resource, items = candidates.len()))]
    pub async fn delete(
        &self,
        resource: ResourceType,
        candidates: Vec<DeletionCandidate>,
    ) -> Result<BatchReport> {
        let this = self.clone();
        self.execute(Operation::Delete, candidates, move |batch| {
            let this = this.clone();
            async move { this.delete_batch(resource, batch).await }
        })
        .await
        .inspect(|report| log_report(resource, Operation::Delete, report))
    }

    /// Fan batches out over the worker pool and merge their reports.
    async fn execute<T, F, Fut>(&self, operation: Operation, items: Vec<T>, work: F) -> Result<BatchReport>
    where
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<BatchReport>> + Send + 'static,
    {
        let mut report = BatchReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let mut join_set = JoinSet::new();
        for batch in partition(items, self.batch_size) {
            let workers = Arc::clone(&self.workers);
            let task = work(batch);
            join_set.spawn(async move {
                let _permit = workers.acquire().await?;
                let outcome = task.await;
                if matches!(&outcome, Err(e) if e.is_fatal()) {
                    // Stops every other step sharing the pool from starting new calls.
                    workers.close();
                }
                outcome
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(batch_report)) => report.merge(batch_report),
                Ok(Err(e)) => {
                    warn!(operation = %operation, error = %e, "Aborting outstanding batches");
                    join_set.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    join_set.abort_all();
                    return Err(ReplicationError::Internal(format!(
                        "{operation} batch task failed: {join_err}"
                    )));
                }
            }
        }

        Ok(report)
    }

    async fn create_batch(&self, resource: ResourceType, batch: Vec<Resolved<Entity>>) -> Result<BatchReport> {
        let started = Instant::now();
        let operation = format!("{resource}.create");
        let writes: Vec<_> = batch
            .iter()
            .filter_map(|r| {
                r.item
                    .to_write(r.parent_id, &self.source_project, self.replicated_time)
            })
            .collect();

        let created = call_with_retry(&operation, &self.retry, self.limiter.as_deref(), || {
            self.client
                .create(&self.destination_project, resource, writes.clone())
        })
        .await;

        let created = match created {
            Ok(created) => created,
            Err(e) => return self.batch_failed(resource, Operation::Create, labels(&batch), e, started),
        };

        let assigned: HashMap<String, DestinationId> = created.into_iter().collect();
        let mut report = BatchReport {
            batches: 1,
            ..Default::default()
        };

        for Resolved { item: entity, .. } in batch {
            let external_id = entity.external_id.clone().unwrap_or_default();
            match assigned.get(&external_id) {
                Some(destination_id) => {
                    self.registry.record(
                        resource,
                        &external_id,
                        SourceId(entity.id),
                        *destination_id,
                        Some(entity.last_updated_time),
                        Some(entity.content_hash()),
                    )?;
                    report.succeeded += 1;
                }
                None => {
                    let err = ReplicationError::Rejected {
                        operation: operation.clone(),
                        message: "create not acknowledged".to_string(),
                    };
                    report
                        .failures
                        .push(FailedItem::new(external_id, Operation::Create, &err));
                }
            }
        }

        metrics::record_batch(resource, Operation::Create, report.succeeded, true, started.elapsed());
        Ok(report)
    }

    async fn update_batch(
        &self,
        resource: ResourceType,
        batch: Vec<Resolved<UpdateTarget>>,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let operation = format!("{resource}.update");
        let updates: Vec<_> = batch
            .iter()
            .filter_map(|r| {
                r.item
                    .entity
                    .to_write(r.parent_id, &self.source_project, self.replicated_time)
                    .map(|write| EntityUpdate {
                        destination_id: r.item.destination_id,
                        write,
                    })
            })
            .collect();

        let outcomes = call_with_retry(&operation, &self.retry, self.limiter.as_deref(), || {
            self.client
                .update(&self.destination_project, resource, updates.clone())
        })
        .await;

        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let ids = batch.iter().map(|r| r.item.entity.external_id.clone().unwrap_or_default());
                return self.batch_failed(resource, Operation::Update, ids.collect(), e, started);
            }
        };

        let mut report = BatchReport {
            batches: 1,
            ..Default::default()
        };
        let mut outcomes = outcomes.into_iter();

        for Resolved { item, .. } in batch {
            let entity = item.entity;
            let external_id = entity.external_id.clone().unwrap_or_default();
            let message = match outcomes.next() {
                Some(outcome) if outcome.is_applied() => {
                    self.registry.advance_watermark(
                        resource,
                        &external_id,
                        entity.last_updated_time,
                        entity.content_hash(),
                    );
                    report.succeeded += 1;
                    continue;
                }
                Some(ItemOutcome::Failed(message)) => message,
                _ => "update not acknowledged".to_string(),
            };
            let err = ReplicationError::Rejected {
                operation: operation.clone(),
                message,
            };
            report
                .failures
                .push(FailedItem::new(external_id, Operation::Update, &err));
        }

        metrics::record_batch(resource, Operation::Update, report.succeeded, true, started.elapsed());
        Ok(report)
    }

    async fn delete_batch(&self, resource: ResourceType, batch: Vec<DeletionCandidate>) -> Result<BatchReport> {
        let started = Instant::now();
        let operation = format!("{resource}.delete");
        let ids: Vec<_> = batch.iter().map(|c| c.destination_id).collect();

        let outcomes = call_with_retry(&operation, &self.retry, self.limiter.as_deref(), || {
            self.client
                .delete(&self.destination_project, resource, ids.clone())
        })
        .await;

        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let labels = batch.iter().map(DeletionCandidate::label).collect();
                return self.batch_failed(resource, Operation::Delete, labels, e, started);
            }
        };

        let mut report = BatchReport {
            batches: 1,
            ..Default::default()
        };
        let mut outcomes = outcomes.into_iter();

        for candidate in batch {
            let message = match outcomes.next() {
                Some(outcome) if outcome.is_applied() => {
                    if let (DeletionReason::RemovedInSource, Some(external_id)) =
                        (candidate.reason, &candidate.external_id)
                    {
                        self.registry.remove(resource, external_id);
                    }
                    debug!(
                        resource = %resource,
                        target = %candidate.label(),
                        reason = %candidate.reason,
                        "Deleted"
                    );
                    report.succeeded += 1;
                    continue;
                }
                Some(ItemOutcome::Failed(message)) => message,
                _ => "delete not acknowledged".to_string(),
            };
            let err = ReplicationError::Rejected {
                operation: operation.clone(),
                message,
            };
            report
                .failures
                .push(FailedItem::new(candidate.label(), Operation::Delete, &err));
        }

        metrics::record_batch(resource, Operation::Delete, report.succeeded, true, started.elapsed());
        Ok(report)
    }

    /// Turn a batch-level error into per-item failures, unless it is fatal.
    fn batch_failed(
        &self,
        resource: ResourceType,
        operation: Operation,
        external_ids: Vec<String>,
        error: ReplicationError,
        started: Instant,
    ) -> Result<BatchReport> {
        if error.is_fatal() {
            return Err(error);
        }
        warn!(
            resource = %resource,
            operation = %operation,
            items = external_ids.len(),
            error = %error,
            "Batch failed"
        );
        metrics::record_batch(resource, operation, external_ids.len(), false, started.elapsed());
        Ok(BatchReport::failed(external_ids, operation, &error))
    }
}

fn labels(batch: &[Resolved<Entity>]) -> Vec<String> {
    batch
        .iter()
        .map(|r| r.item.external_id.clone().unwrap_or_default())
        .collect()
}

fn log_report(resource: ResourceType, operation: Operation, report: &BatchReport) {
    info!(
        resource = %resource,
        operation = %operation,
        batches = report.batches,
        succeeded = report.succeeded,
        failed = report.failures.len(),
        "Batches complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::{MemoryRemote, RemoteOp};
    use serde_json::json;

    fn executor(remote: &Arc<MemoryRemote>, registry: &Arc<IdRegistry>) -> BatchExecutor<MemoryRemote> {
        BatchExecutor::new(
            Arc::clone(remote),
            Arc::clone(registry),
            Arc::new(Bulkhead::new(4)),
            "src",
            "dst",
        )
        .with_retry(RetryConfig::testing())
        .with_batch_size(2)
    }

    fn resolved(external_id: &str, source_id: i64) -> Resolved<Entity> {
        Resolved {
            item: Entity::new(source_id, external_id, json!({"name": external_id})).with_updated_time(7),
            parent_id: None,
        }
    }

    #[test]
    fn test_partition_sizes() {
        let batches = partition((0..25_000).collect::<Vec<_>>(), 10_000);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10_000, 10_000, 5_000]);
        assert_eq!(batches[2][0], 20_000);
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(partition(Vec::<u8>::new(), 10).is_empty());
        assert_eq!(partition(vec![1, 2, 3], 3).len(), 1);
        assert_eq!(partition(vec![1, 2, 3], 0).len(), 3);
    }

    #[tokio::test]
    async fn test_create_records_mappings() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        let report = executor(&remote, &registry)
            .create(
                ResourceType::Asset,
                vec![resolved("a", 1), resolved("b", 2), resolved("c", 3)],
            )
            .await
            .unwrap();

        assert_eq!(report.batches, 2);
        assert_eq!(report.succeeded, 3);
        assert!(report.failures.is_empty());
        assert_eq!(remote.calls_to(RemoteOp::Create, "dst").await.len(), 2);

        let stored = remote.find("dst", ResourceType::Asset, "b").await.unwrap();
        let entry = registry.entry(ResourceType::Asset, "b").unwrap();
        assert_eq!(entry.destination_id, DestinationId(stored.id));
        assert_eq!(entry.source_id, Some(SourceId(2)));
        assert_eq!(entry.watermark, Some(7));
    }

    #[tokio::test]
    async fn test_failed_batch_excluded_from_registry() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        remote
            .fail_next(RemoteOp::Create, RemoteError::Rejected("invalid".into()), 1)
            .await;

        let report = executor(&remote, &registry)
            .with_batch_size(10)
            .create(ResourceType::Event, vec![resolved("e1", 1), resolved("e2", 2)])
            .await
            .unwrap();

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].operation, Operation::Create);
        assert!(report.failures[0].error.contains("invalid"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_batch_retried() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        remote
            .fail_next(RemoteOp::Create, RemoteError::Throttled { retry_after: None }, 2)
            .await;

        let report = executor(&remote, &registry)
            .create(ResourceType::Asset, vec![resolved("a", 1)])
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(remote.calls_to(RemoteOp::Create, "dst").await.len(), 3);
    }

    #[tokio::test]
    async fn test_authentication_is_fatal() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        remote
            .fail_next(RemoteOp::Create, RemoteError::Authentication("expired".into()), 10)
            .await;

        let err = executor(&remote, &registry)
            .create(ResourceType::Asset, vec![resolved("a", 1), resolved("b", 2), resolved("c", 3)])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_update_advances_watermark() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        let exec = executor(&remote, &registry);
        exec.create(ResourceType::Asset, vec![resolved("a", 1)]).await.unwrap();
        let destination_id = registry.lookup(ResourceType::Asset, "a").unwrap();

        let changed = Entity::new(1, "a", json!({"name": "renamed"})).with_updated_time(50);
        let report = exec
            .update(
                ResourceType::Asset,
                vec![
                    Resolved {
                        item: UpdateTarget { entity: changed, destination_id },
                        parent_id: None,
                    },
                    Resolved {
                        item: UpdateTarget {
                            entity: Entity::new(9, "ghost", json!({})),
                            destination_id: DestinationId(1),
                        },
                        parent_id: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].external_id, "ghost");
        assert_eq!(registry.entry(ResourceType::Asset, "a").unwrap().watermark, Some(50));
        assert_eq!(
            remote.find("dst", ResourceType::Asset, "a").await.unwrap().name(),
            Some("renamed")
        );
    }

    #[tokio::test]
    async fn test_delete_removes_mapping() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        let exec = executor(&remote, &registry);
        exec.create(ResourceType::Event, vec![resolved("e", 1)]).await.unwrap();
        let destination_id = registry.lookup(ResourceType::Event, "e").unwrap();

        let report = exec
            .delete(
                ResourceType::Event,
                vec![DeletionCandidate {
                    external_id: Some("e".to_string()),
                    destination_id,
                    reason: DeletionReason::RemovedInSource,
                }],
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(registry.lookup(ResourceType::Event, "e").is_none());
        assert!(remote.entities("dst", ResourceType::Event).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let remote = Arc::new(MemoryRemote::new());
        let registry = Arc::new(IdRegistry::new());
        let report = executor(&remote, &registry)
            .delete(ResourceType::Event, Vec::new())
            .await
            .unwrap();
        assert_eq!(report.batches, 0);
        assert!(remote.calls().await.is_empty());
    }
}
