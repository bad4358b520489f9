// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Datapoint streaming for replicated timeseries.
//!
//! Each timeseries is one task on the shared worker pool. Within a task the
//! work is strictly sequential, so writes for one timeseries always go out in
//! increasing timestamp order:
//!
//! ```text
//! latest_datapoint(dst) ─▶ narrow window (incremental)
//!        │
//!        ▼
//! list_datapoints(src, page) ─▶ drop out-of-window / out-of-order points
//!        │                           │
//!        │                           ▼
//!        │                     transform(value) ── error ─▶ failed point
//!        │                           │
//!        │                           ▼
//!        └───── next page ◀── buffer ─▶ write_datapoints(dst, chunk)
//! ```
//!
//! A write chunk that still fails after retries stops its timeseries for this
//! run, so the destination never has a gap below its newest point; the next
//! incremental run resumes from there.

use crate::entity::Datapoint;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteClient;
use crate::resilience::{call_with_retry, Bulkhead, RateLimiter, RetryConfig};
use crate::summary::{FailedItem, Operation, ResourceSummary};
use crate::time_window::TimeWindow;
use crate::transform::ValueTransform;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Per-timeseries cap on detailed failure entries; counts stay exact.
const MAX_FAILURE_DETAILS: usize = 100;

/// Outcome for one timeseries.
#[derive(Debug, Default)]
pub struct SeriesReport {
    pub external_id: String,
    pub written: usize,
    pub failed: usize,
    /// Stopped early on a failed read or write.
    pub aborted: bool,
    pub failures: Vec<FailedItem>,
}

impl SeriesReport {
    fn new(external_id: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            ..Default::default()
        }
    }

    fn fail(&mut self, points: usize, operation: Operation, error: &ReplicationError) {
        self.failed += points;
        if self.failures.len() < MAX_FAILURE_DETAILS {
            self.failures
                .push(FailedItem::new(self.external_id.clone(), operation, error));
        }
    }
}

/// Copies numeric datapoints from source to destination timeseries.
pub struct DatapointsReplicator<C: RemoteClient> {
    client: Arc<C>,
    workers: Arc<Bulkhead>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryConfig,
    source_project: String,
    destination_project: String,
    window: TimeWindow,
    read_limit: Option<usize>,
    write_batch_size: usize,
    incremental: bool,
    transform: Option<ValueTransform>,
}

impl<C: RemoteClient> Clone for DatapointsReplicator<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            workers: Arc::clone(&self.workers),
            limiter: self.limiter.clone(),
            retry: self.retry.clone(),
            source_project: self.source_project.clone(),
            destination_project: self.destination_project.clone(),
            window: self.window,
            read_limit: self.read_limit,
            write_batch_size: self.write_batch_size,
            incremental: self.incremental,
            transform: self.transform.clone(),
        }
    }
}

impl<C: RemoteClient> DatapointsReplicator<C> {
    pub fn new(
        client: Arc<C>,
        workers: Arc<Bulkhead>,
        source_project: impl Into<String>,
        destination_project: impl Into<String>,
        window: TimeWindow,
    ) -> Self {
        Self {
            client,
            workers,
            limiter: None,
            retry: RetryConfig::default(),
            source_project: source_project.into(),
            destination_project: destination_project.into(),
            window,
            read_limit: None,
            write_batch_size: 10_000,
            incremental: true,
            transform: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Page size for reads; `None` uses the remote's own limit.
    pub fn with_read_limit(mut self, read_limit: Option<usize>) -> Self {
        self.read_limit = read_limit;
        self
    }

    pub fn with_write_batch_size(mut self, write_batch_size: usize) -> Self {
        self.write_batch_size = write_batch_size.max(1);
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_transform(mut self, transform: Option<ValueTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Replicate every listed timeseries. Fatal errors abort all of them.
    #[instrument(skip_all, fields(timeseries = external_ids.len()))]
    pub async fn replicate(&self, external_ids: Vec<String>) -> Result<ResourceSummary> {
        let mut summary = ResourceSummary::default();
        let mut join_set = JoinSet::new();

        for external_id in external_ids {
            let this = self.clone();
            join_set.spawn(async move {
                let _permit = this.workers.acquire().await?;
                let outcome = this.replicate_series(&external_id).await;
                if matches!(&outcome, Err(e) if e.is_fatal()) {
                    this.workers.close();
                }
                outcome
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let report = match joined {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    warn!(error = %e, "Aborting datapoint replication");
                    join_set.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    join_set.abort_all();
                    return Err(ReplicationError::Internal(format!(
                        "datapoint task failed: {join_err}"
                    )));
                }
            };

            summary.created += report.written;
            summary.failed += report.failed;
            summary.failures.extend(report.failures);
        }

        info!(
            written = summary.created,
            failed = summary.failed,
            "Datapoint replication complete"
        );
        Ok(summary)
    }

    /// Copy one timeseries. Only fatal errors are returned as `Err`.
    pub async fn replicate_series(&self, external_id: &str) -> Result<SeriesReport> {
        let mut report = SeriesReport::new(external_id);

        let Some(window) = self.effective_window(external_id).await? else {
            debug!(external_id, "Timeseries up to date");
            return Ok(report);
        };

        let operation = "datapoints.list";
        let mut cursor: Option<String> = None;
        let mut buffer: Vec<Datapoint> = Vec::with_capacity(self.write_batch_size.min(10_000));
        let mut last_accepted: Option<i64> = None;

        loop {
            let page = call_with_retry(operation, &self.retry, self.limiter.as_deref(), || {
                self.client.list_datapoints(
                    &self.source_project,
                    external_id,
                    window,
                    self.read_limit,
                    cursor.clone(),
                )
            })
            .await;

            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(external_id, error = %e, "Reading datapoints failed");
                    // The unread remainder of the series counts as one failed item.
                    metrics::record_datapoints_failed(1, "read");
                    report.fail(1, Operation::ReadDatapoints, &e);
                    report.aborted = true;
                    break;
                }
            };

            for point in page.points {
                if !window.contains(point.timestamp)
                    || last_accepted.is_some_and(|last| point.timestamp <= last)
                {
                    continue;
                }
                last_accepted = Some(point.timestamp);

                match self.transformed(external_id, point, &mut report) {
                    Some(point) => buffer.push(point),
                    None => continue,
                }

                if buffer.len() >= self.write_batch_size {
                    let chunk = std::mem::take(&mut buffer);
                    if !self.write_chunk(external_id, chunk, &mut report).await? {
                        return Ok(self.finish(report));
                    }
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        if !buffer.is_empty() && !report.aborted {
            self.write_chunk(external_id, buffer, &mut report).await?;
        }

        Ok(self.finish(report))
    }

    /// The configured window, narrowed past the destination's newest point.
    async fn effective_window(&self, external_id: &str) -> Result<Option<TimeWindow>> {
        if !self.incremental {
            return Ok(Some(self.window));
        }

        let latest = call_with_retry("datapoints.latest", &self.retry, self.limiter.as_deref(), || {
            self.client
                .latest_datapoint(&self.destination_project, external_id)
        })
        .await;

        match latest {
            Ok(Some(latest)) => Ok(latest
                .checked_add(1)
                .and_then(|start| self.window.starting_at(start))),
            Ok(None) => Ok(Some(self.window)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                // Unknown resume point: fall back to the full window.
                warn!(external_id, error = %e, "Could not read latest datapoint");
                Ok(Some(self.window))
            }
        }
    }

    fn transformed(&self, external_id: &str, point: Datapoint, report: &mut SeriesReport) -> Option<Datapoint> {
        let Some(transform) = &self.transform else {
            return Some(point);
        };
        match transform.apply(point.value) {
            Ok(value) => Some(Datapoint::new(point.timestamp, value)),
            Err(e) => {
                let err = ReplicationError::Transformation {
                    external_id: external_id.to_string(),
                    timestamp: point.timestamp,
                    message: e.to_string(),
                };
                debug!(external_id, timestamp = point.timestamp, error = %e, "Skipping datapoint");
                metrics::record_datapoints_failed(1, "transform");
                report.fail(1, Operation::Transform, &err);
                None
            }
        }
    }

    /// Write one chunk. Returns `false` if the timeseries must stop.
    async fn write_chunk(&self, external_id: &str, chunk: Vec<Datapoint>, report: &mut SeriesReport) -> Result<bool> {
        let count = chunk.len();
        let written = call_with_retry("datapoints.write", &self.retry, self.limiter.as_deref(), || {
            self.client
                .write_datapoints(&self.destination_project, external_id, chunk.clone())
        })
        .await;

        match written {
            Ok(()) => {
                report.written += count;
                metrics::record_datapoints_written(count);
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(external_id, points = count, error = %e, "Writing datapoints failed, stopping timeseries");
                metrics::record_datapoints_failed(count, "write");
                report.fail(count, Operation::WriteDatapoints, &e);
                report.aborted = true;
                Ok(false)
            }
        }
    }

    fn finish(&self, report: SeriesReport) -> SeriesReport {
        debug!(
            external_id = %report.external_id,
            written = report.written,
            failed = report.failed,
            aborted = report.aborted,
            "Timeseries done"
        );
        report
    }
}
