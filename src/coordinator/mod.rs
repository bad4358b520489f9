// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication orchestrator.
//!
//! Runs the resource type steps in dependency order:
//!
//! ```text
//! validate ─▶ bootstrap registry ─▶ assets ─┬─▶ events     ─┐
//!                                           └─▶ timeseries ─┴─▶ datapoints
//! ```
//!
//! The registry and the worker pool live for exactly one run. A failing step
//! is recorded in the summary and the next step still runs; only
//! configuration and authentication errors abort, and they stop concurrent
//! steps before those issue further writes. Datapoints are skipped when
//! timeseries replication failed and left no mapped timeseries at all.

mod metadata;
mod types;

pub use types::RunState;

use crate::batch::BatchExecutor;
use crate::config::ReplicatorConfig;
use crate::datapoints::DatapointsReplicator;
use crate::deletion::DeletionPolicyEngine;
use crate::entity::{Entity, ResourceType};
use crate::error::{ReplicationError, Result};
use crate::filter::ResourceFilter;
use crate::metrics;
use crate::registry::IdRegistry;
use crate::remote::RemoteClient;
use crate::resilience::{Bulkhead, RateLimiter};
use crate::summary::{ResourceSummary, RunSummary};
use crate::time_window::{TimeWindow, WindowResolver};
use crate::transform::ValueTransform;
use metadata::{replicate_resource, StepContext};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Closes the worker pool when the run ends, however it ends.
struct PoolGuard(Arc<Bulkhead>);

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Everything resolved from the config before the first remote call.
struct RunPlan {
    filters: BTreeMap<ResourceType, ResourceFilter>,
    window: Option<TimeWindow>,
}

/// Replicates one source project into one destination project.
///
/// A replicator performs a single run; create a new one for the next run.
/// The registry is rebuilt from the destination each time, so consecutive
/// runs converge without any local state.
pub struct Replicator<C: RemoteClient> {
    config: ReplicatorConfig,
    client: Arc<C>,
    registry: Arc<IdRegistry>,
    transform: Option<ValueTransform>,
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
}

impl<C: RemoteClient> Replicator<C> {
    /// Create a replicator in `Created` state. Nothing is validated or
    /// listed until [`run()`](Self::run).
    pub fn new(config: ReplicatorConfig, client: Arc<C>) -> Self {
        let (state_tx, state_rx) = watch::channel(RunState::Created);
        Self {
            config,
            client,
            registry: Arc::new(IdRegistry::new()),
            transform: None,
            state_tx,
            state_rx,
        }
    }

    /// Apply `transform` to every replicated datapoint value.
    pub fn with_value_transform(mut self, transform: ValueTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// The identity registry of this run.
    pub fn registry(&self) -> &Arc<IdRegistry> {
        &self.registry
    }

    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: RunState) {
        let _ = self.state_tx.send(state);
        metrics::set_run_state(&state.to_string());
    }

    /// Run the replication.
    ///
    /// Returns a summary whenever the run got past validation and no
    /// authentication error occurred, even if individual items failed.
    pub async fn run(&mut self) -> Result<RunSummary> {
        if self.state() != RunState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let started = Instant::now();
        info!(
            source = %self.config.source_project,
            destination = %self.config.destination_project,
            resources = ?self.config.resources,
            "Starting replication run"
        );

        match self.execute(started).await {
            Ok(summary) => {
                self.set_state(RunState::Completed);
                metrics::record_run(summary.duration, summary.is_success());
                info!(
                    changes = summary.total_changes(),
                    failed = summary.total_failed(),
                    skipped_resources = summary.skipped_resources.len(),
                    duration_ms = summary.duration.as_millis() as u64,
                    "Replication run complete"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "Replication run aborted");
                self.set_state(RunState::Failed);
                metrics::record_run(started.elapsed(), false);
                Err(e)
            }
        }
    }

    async fn execute(&self, started: Instant) -> Result<RunSummary> {
        let plan = self.prepare()?;
        let settings = &self.config.settings;
        let retry = settings.retry_config()?;

        let limiter = settings.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled"
            );
            Arc::new(RateLimiter::new(cfg))
        });
        let workers = Arc::new(Bulkhead::new(settings.number_of_threads));
        let _pool = PoolGuard(Arc::clone(&workers));

        let executor = BatchExecutor::new(
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            Arc::clone(&workers),
            self.config.source_project.clone(),
            self.config.destination_project.clone(),
        )
        .with_batch_size(settings.batch_size)
        .with_retry(retry.clone())
        .with_rate_limiter(limiter.clone())
        .with_replicated_time(WindowResolver::new().now_ms());

        let ctx = StepContext {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            executor,
            deletion: DeletionPolicyEngine::new(self.config.deletion),
            retry,
            limiter,
            source_project: self.config.source_project.clone(),
            destination_project: self.config.destination_project.clone(),
        };

        let mut summary = RunSummary::default();

        self.set_state(RunState::Bootstrapping);
        let snapshots = self.bootstrap(&ctx, &mut summary).await?;

        self.set_state(RunState::Replicating);

        let assets = self
            .metadata_step(&ctx, &plan, &snapshots, ResourceType::Asset)
            .await;
        absorb_step(&mut summary, ResourceType::Asset, assets)?;

        // A fatal error in either step drops the other one mid-flight.
        let (events, timeseries) = tokio::try_join!(
            fatal_only(self.metadata_step(&ctx, &plan, &snapshots, ResourceType::Event)),
            fatal_only(self.metadata_step(&ctx, &plan, &snapshots, ResourceType::TimeSeries)),
        )?;
        absorb_step(&mut summary, ResourceType::Event, events)?;
        absorb_step(&mut summary, ResourceType::TimeSeries, timeseries)?;

        if let Some(window) = plan.window {
            if self.timeseries_failed_entirely(&summary) {
                warn!("Timeseries replication failed, skipping datapoints");
                summary.skipped_resources.insert(
                    ResourceType::Datapoints,
                    "timeseries replication failed".to_string(),
                );
            } else {
                let datapoints = self.datapoints_step(&ctx, &plan, &workers, window).await;
                absorb_step(&mut summary, ResourceType::Datapoints, datapoints)?;
            }
        }

        summary.duration = started.elapsed();
        Ok(summary)
    }

    /// Validate the config and compile filters and the datapoints window.
    fn prepare(&self) -> Result<RunPlan> {
        self.config.validate()?;

        let mut filters = BTreeMap::new();
        for resource in ResourceType::METADATA {
            let filter = ResourceFilter::new(resource, self.config.filters.for_resource(resource))?;
            filters.insert(resource, filter);
        }

        let window = if self.config.replicates(ResourceType::Datapoints) {
            let window = WindowResolver::new()
                .resolve_window(&self.config.datapoints.start, &self.config.datapoints.end)?;
            debug!(start = window.start(), end = window.end(), "Resolved datapoints window");
            Some(window)
        } else {
            None
        };

        Ok(RunPlan { filters, window })
    }

    /// Destination resource types the run needs a snapshot of: the
    /// configured ones plus the parents and timeseries they depend on.
    fn bootstrap_types(&self) -> Vec<ResourceType> {
        let config = &self.config;
        ResourceType::METADATA
            .into_iter()
            .filter(|resource| {
                config.replicates(*resource)
                    || (*resource == ResourceType::Asset
                        && (config.replicates(ResourceType::Event)
                            || config.replicates(ResourceType::TimeSeries)))
                    || (*resource == ResourceType::TimeSeries
                        && config.replicates(ResourceType::Datapoints))
            })
            .collect()
    }

    /// List destination snapshots and index them into the registry.
    async fn bootstrap(
        &self,
        ctx: &StepContext<C>,
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<ResourceType, Vec<Entity>>> {
        let mut snapshots = BTreeMap::new();

        for resource in self.bootstrap_types() {
            match ctx.list_destination(resource).await {
                Ok(destination) => {
                    let indexed = self.registry.index_destination(resource, &destination);
                    metrics::set_registry_size(resource, indexed);
                    info!(resource = %resource, entities = destination.len(), indexed, "Indexed destination");
                    snapshots.insert(resource, destination);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Listing destination failed");
                    if self.config.replicates(resource) {
                        summary
                            .skipped_resources
                            .insert(resource, format!("destination listing failed: {e}"));
                    }
                }
            }
        }

        Ok(snapshots)
    }

    /// `Ok(None)` if the resource type is not configured or has no snapshot.
    async fn metadata_step(
        &self,
        ctx: &StepContext<C>,
        plan: &RunPlan,
        snapshots: &BTreeMap<ResourceType, Vec<Entity>>,
        resource: ResourceType,
    ) -> Result<Option<ResourceSummary>> {
        if !self.config.replicates(resource) {
            return Ok(None);
        }
        let (Some(filter), Some(destination)) = (plan.filters.get(&resource), snapshots.get(&resource))
        else {
            return Ok(None);
        };
        replicate_resource(ctx, resource, filter, destination)
            .await
            .map(Some)
    }

    fn timeseries_failed_entirely(&self, summary: &RunSummary) -> bool {
        if !self.config.replicates(ResourceType::TimeSeries) {
            return false;
        }
        let failed = summary.skipped_resources.contains_key(&ResourceType::TimeSeries)
            || summary
                .resource(ResourceType::TimeSeries)
                .map_or(true, |s| s.has_failures());
        failed && self.registry.len(ResourceType::TimeSeries) == 0
    }

    /// Copy datapoints for every numeric, mapped source timeseries.
    async fn datapoints_step(
        &self,
        ctx: &StepContext<C>,
        plan: &RunPlan,
        workers: &Arc<Bulkhead>,
        window: TimeWindow,
    ) -> Result<Option<ResourceSummary>> {
        let mut summary = ResourceSummary::default();

        let source = ctx.list_source(ResourceType::TimeSeries).await?;
        let filtered = match plan.filters.get(&ResourceType::TimeSeries) {
            Some(filter) => filter.apply(source),
            None => ResourceFilter::pass_through(ResourceType::TimeSeries).apply(source),
        };
        summary.skipped = filtered.skipped;
        summary.excluded = filtered.excluded;

        let mut targets = Vec::with_capacity(filtered.retained.len());
        for timeseries in filtered.retained {
            let Some(external_id) = timeseries.external_id.as_deref() else {
                continue;
            };
            if timeseries.is_string_series() {
                summary.skipped += 1;
                continue;
            }
            if self.registry.lookup(ResourceType::TimeSeries, external_id).is_none() {
                debug!(external_id, "Timeseries not replicated, skipping datapoints");
                summary.skipped += 1;
                continue;
            }
            targets.push(external_id.to_string());
        }

        let settings = &self.config.settings;
        let replicator = DatapointsReplicator::new(
            Arc::clone(&self.client),
            Arc::clone(workers),
            self.config.source_project.clone(),
            self.config.destination_project.clone(),
            window,
        )
        .with_retry(ctx.retry.clone())
        .with_rate_limiter(ctx.limiter.clone())
        .with_read_limit(settings.batch_size_datapoints)
        .with_write_batch_size(settings.datapoints_write_batch_size)
        .with_incremental(self.config.datapoints.incremental)
        .with_transform(self.transform.clone());

        summary.merge(replicator.replicate(targets).await?);
        Ok(Some(summary))
    }
}

/// Lift fatal errors out of a step's outcome, leaving the rest for
/// [`absorb_step`].
async fn fatal_only<F>(step: F) -> Result<Result<Option<ResourceSummary>>>
where
    F: Future<Output = Result<Option<ResourceSummary>>>,
{
    match step.await {
        Err(e) if e.is_fatal() => Err(e),
        outcome => Ok(outcome),
    }
}

/// Fold one step's outcome into the run summary. Only fatal errors escape.
fn absorb_step(
    summary: &mut RunSummary,
    resource: ResourceType,
    outcome: Result<Option<ResourceSummary>>,
) -> Result<()> {
    match outcome {
        Ok(Some(step)) => {
            summary.resources.insert(resource, step);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(resource = %resource, error = %e, "Resource type step failed");
            summary.skipped_resources.insert(resource, e.to_string());
            Ok(())
        }
    }
}
