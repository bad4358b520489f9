// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One metadata resource type: list, filter, diff, write.
//!
//! ```text
//! list(source) ─▶ filter ─▶ plan ─┬─▶ creates, level by level (assets)
//!                                 │      └─▶ deferred: one retry pass
//!                                 ├─▶ updates (parents resolved after creates)
//!                                 └─▶ deletes
//! ```
//!
//! Items whose parent is still unmapped after the retry pass are reported as
//! unresolved references. They never fail the step.

use crate::batch::{BatchExecutor, BatchReport};
use crate::deletion::DeletionPolicyEngine;
use crate::diff::{hierarchy_levels, resolve_parents, DiffEngine};
use crate::entity::{Entity, ResourceType};
use crate::error::{ReplicationError, Result};
use crate::filter::ResourceFilter;
use crate::metrics;
use crate::registry::IdRegistry;
use crate::remote::RemoteClient;
use crate::resilience::{call_with_retry, RateLimiter, RetryConfig};
use crate::summary::{FailedItem, Operation, ResourceSummary};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Everything a resource type step shares with the rest of the run.
pub(super) struct StepContext<C: RemoteClient> {
    pub client: Arc<C>,
    pub registry: Arc<IdRegistry>,
    pub executor: BatchExecutor<C>,
    pub deletion: DeletionPolicyEngine,
    pub retry: RetryConfig,
    pub limiter: Option<Arc<RateLimiter>>,
    pub source_project: String,
    pub destination_project: String,
}

impl<C: RemoteClient> StepContext<C> {
    pub async fn list_source(&self, resource: ResourceType) -> Result<Vec<Entity>> {
        self.list(&self.source_project, resource).await
    }

    pub async fn list_destination(&self, resource: ResourceType) -> Result<Vec<Entity>> {
        self.list(&self.destination_project, resource).await
    }

    async fn list(&self, project: &str, resource: ResourceType) -> Result<Vec<Entity>> {
        let operation = format!("{resource}.list");
        call_with_retry(&operation, &self.retry, self.limiter.as_deref(), || {
            self.client.list(project, resource)
        })
        .await
    }
}

/// Replicate one metadata resource type against its destination snapshot.
#[instrument(skip_all, fields(resource = %resource))]
pub(super) async fn replicate_resource<C: RemoteClient>(
    ctx: &StepContext<C>,
    resource: ResourceType,
    filter: &ResourceFilter,
    destination: &[Entity],
) -> Result<ResourceSummary> {
    let mut summary = ResourceSummary::default();

    let source = ctx.list_source(resource).await?;
    let listed = source.len();
    let filtered = filter.apply(source);
    summary.skipped = filtered.skipped;
    summary.excluded = filtered.excluded;
    metrics::record_filter(resource, filtered.retained.len(), filtered.skipped, filtered.excluded);
    debug!(
        listed,
        retained = filtered.retained.len(),
        skipped = filtered.skipped,
        excluded = filtered.excluded,
        "Filtered source snapshot"
    );

    let plan = DiffEngine::plan(
        resource,
        &filtered.retained,
        destination,
        &ctx.registry,
        &ctx.deletion,
    );
    summary.unchanged = plan.unchanged;
    metrics::record_unchanged(resource, plan.unchanged);

    // Creates
    let levels = if resource == ResourceType::Asset {
        hierarchy_levels(plan.to_create)
    } else {
        vec![plan.to_create]
    };

    let mut deferred = Vec::new();
    for level in levels.into_iter().filter(|l| !l.is_empty()) {
        let resolution = resolve_parents(resource, level, &ctx.registry);
        deferred.extend(resolution.deferred);
        let report = ctx.executor.create(resource, resolution.ready).await?;
        let succeeded = absorb(&mut summary, report);
        summary.created += succeeded;
    }

    if !deferred.is_empty() {
        debug!(deferred = deferred.len(), "Retrying deferred creates");
        let resolution = resolve_parents(resource, deferred, &ctx.registry);
        report_unresolved(&mut summary, resource, &resolution.deferred);
        let report = ctx.executor.create(resource, resolution.ready).await?;
        let succeeded = absorb(&mut summary, report);
        summary.created += succeeded;
    }

    // Updates
    let resolution = resolve_parents(resource, plan.to_update, &ctx.registry);
    report_unresolved(&mut summary, resource, &resolution.deferred);
    let report = ctx.executor.update(resource, resolution.ready).await?;
    let succeeded = absorb(&mut summary, report);
    summary.updated += succeeded;

    // Deletes
    let report = ctx.executor.delete(resource, plan.to_delete).await?;
    let succeeded = absorb(&mut summary, report);
    summary.deleted += succeeded;

    metrics::set_registry_size(resource, ctx.registry.len(resource));
    info!(
        created = summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        unchanged = summary.unchanged,
        failed = summary.failed,
        "Resource type replicated"
    );
    Ok(summary)
}

/// Move batch failures into the summary and return the success count.
fn absorb(summary: &mut ResourceSummary, report: BatchReport) -> usize {
    for failure in report.failures {
        summary.record_failure(failure);
    }
    report.succeeded
}

fn report_unresolved<T: AsRef<Entity>>(summary: &mut ResourceSummary, resource: ResourceType, items: &[T]) {
    if items.is_empty() {
        return;
    }
    warn!(resource = %resource, count = items.len(), "Unresolved parent references");
    metrics::record_unresolved_references(resource, items.len());

    for item in items {
        let entity = item.as_ref();
        let external_id = entity.external_id.clone().unwrap_or_default();
        let error = ReplicationError::UnresolvedReference {
            external_id: external_id.clone(),
            parent_external_id: entity.parent_external_id.clone().unwrap_or_default(),
        };
        summary.record_failure(FailedItem::new(external_id, Operation::ResolveParent, &error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::deletion::DeletionPolicy;
    use crate::entity::DestinationId;
    use crate::remote::MemoryRemote;
    use crate::resilience::Bulkhead;
    use serde_json::json;

    fn context(remote: &Arc<MemoryRemote>, policy: DeletionPolicy) -> StepContext<MemoryRemote> {
        let registry = Arc::new(IdRegistry::new());
        let executor = BatchExecutor::new(
            Arc::clone(remote),
            Arc::clone(&registry),
            Arc::new(Bulkhead::new(4)),
            "src",
            "dst",
        )
        .with_batch_size(2)
        .with_retry(RetryConfig::testing());

        StepContext {
            client: Arc::clone(remote),
            registry,
            executor,
            deletion: DeletionPolicyEngine::new(policy),
            retry: RetryConfig::testing(),
            limiter: None,
            source_project: "src".to_string(),
            destination_project: "dst".to_string(),
        }
    }

    fn asset(id: i64, external_id: &str) -> Entity {
        Entity::new(id, external_id, json!({"name": external_id}))
    }

    #[tokio::test]
    async fn test_asset_hierarchy_created_in_order() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .seed(
                "src",
                ResourceType::Asset,
                vec![
                    asset(1, "leaf").with_parent("mid"),
                    asset(2, "mid").with_parent("root"),
                    asset(3, "root"),
                ],
            )
            .await;
        let ctx = context(&remote, DeletionPolicy::default());

        let summary = replicate_resource(
            &ctx,
            ResourceType::Asset,
            &ResourceFilter::pass_through(ResourceType::Asset),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(summary.created, 3);
        assert_eq!(summary.failed, 0);

        let root = ctx.registry.lookup(ResourceType::Asset, "root").unwrap();
        let mid = remote.find("dst", ResourceType::Asset, "mid").await.unwrap();
        assert_eq!(mid.parent_id, Some(root.0));
    }

    #[tokio::test]
    async fn test_missing_parent_is_unresolved() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .seed(
                "src",
                ResourceType::Event,
                vec![
                    Entity::new(1, "ok", json!({})),
                    Entity::new(2, "orphan", json!({})).with_parent("nowhere"),
                ],
            )
            .await;
        let ctx = context(&remote, DeletionPolicy::default());

        let summary = replicate_resource(
            &ctx,
            ResourceType::Event,
            &ResourceFilter::pass_through(ResourceType::Event),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].external_id, "orphan");
        assert_eq!(summary.failures[0].operation, Operation::ResolveParent);
        assert!(remote.find("dst", ResourceType::Event, "orphan").await.is_none());
    }

    #[tokio::test]
    async fn test_filter_counts_and_removed_in_source() {
        let remote = Arc::new(MemoryRemote::new());
        let mut anonymous = Entity::new(3, "x", json!({}));
        anonymous.external_id = None;
        remote
            .seed(
                "src",
                ResourceType::Event,
                vec![
                    Entity::new(1, "keep", json!({})),
                    Entity::new(2, "tmp_1", json!({})),
                    anonymous,
                ],
            )
            .await;

        let ctx = context(
            &remote,
            DeletionPolicy {
                delete_if_removed_in_source: true,
                delete_if_not_replicated: false,
            },
        );
        // A mapping left over from an earlier run.
        remote
            .seed("dst", ResourceType::Event, vec![Entity::new(50, "gone", json!({}))])
            .await;
        ctx.registry
            .record(
                ResourceType::Event,
                "gone",
                crate::entity::SourceId(9),
                DestinationId(50),
                Some(0),
                None,
            )
            .unwrap();

        let filter = ResourceFilter::new(
            ResourceType::Event,
            &FilterConfig {
                exclude_pattern: Some("^tmp_".to_string()),
                external_ids: None,
            },
        )
        .unwrap();

        let summary = replicate_resource(&ctx, ResourceType::Event, &filter, &[])
            .await
            .unwrap();

        assert_eq!(summary.created, 1);
        assert_eq!(summary.excluded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.deleted, 1);
        assert!(remote.find("dst", ResourceType::Event, "gone").await.is_none());
        assert!(ctx.registry.lookup(ResourceType::Event, "gone").is_none());
    }
}
