// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`RemoteClient`] holding any number of projects in memory.
//!
//! Behaves like the real service where the replicator relies on it:
//!
//! - Identities are assigned on create, unique across all projects
//! - Creating an external id that already exists rejects the whole batch
//! - A `parent_id` must point at an existing asset in the same project
//! - Datapoint writes must be strictly increasing in timestamp
//! - Datapoint listings are paginated
//!
//! Every call is logged, and failures can be injected per operation, which
//! makes it the backbone of the crate's tests and usable for dry runs.

use super::{BoxFuture, DatapointPage, ItemOutcome, RemoteClient, RemoteResult};
use crate::entity::{Datapoint, DestinationId, Entity, EntityUpdate, EntityWrite, ResourceType};
use crate::error::RemoteError;
use crate::time_window::TimeWindow;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

const DEFAULT_PAGE_LIMIT: usize = 1_000;
const FIRST_ASSIGNED_ID: i64 = 1_000_000;

/// Kind of remote operation, for the call log and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    List,
    Create,
    Update,
    Delete,
    ListDatapoints,
    WriteDatapoints,
    LatestDatapoint,
}

/// One logged call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub project: String,
    pub resource: ResourceType,
    /// Timeseries external id for datapoint operations.
    pub external_id: Option<String>,
    /// Number of items in the request.
    pub items: usize,
}

#[derive(Debug)]
struct Fault {
    op: RemoteOp,
    external_id: Option<String>,
    error: RemoteError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Project {
    entities: BTreeMap<ResourceType, BTreeMap<i64, Entity>>,
    datapoints: HashMap<String, BTreeMap<i64, f64>>,
    /// Datapoints in the order they were written, per timeseries.
    write_log: HashMap<String, Vec<Datapoint>>,
}

impl Project {
    fn resource(&mut self, resource: ResourceType) -> &mut BTreeMap<i64, Entity> {
        self.entities.entry(resource).or_default()
    }

    fn find_id(&self, resource: ResourceType, external_id: &str) -> Option<i64> {
        self.entities.get(&resource).and_then(|entities| {
            entities
                .values()
                .find(|e| e.external_id.as_deref() == Some(external_id))
                .map(|e| e.id)
        })
    }

    fn has_asset(&self, id: i64) -> bool {
        self.entities
            .get(&ResourceType::Asset)
            .is_some_and(|assets| assets.contains_key(&id))
    }
}

#[derive(Debug)]
struct State {
    projects: HashMap<String, Project>,
    next_id: i64,
    clock: i64,
    calls: Vec<RemoteCall>,
    faults: Vec<Fault>,
}

impl State {
    fn project(&mut self, name: &str) -> &mut Project {
        self.projects.entry(name.to_string()).or_default()
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    /// Log the call and return an injected failure, if one matches.
    fn enter(&mut self, call: RemoteCall) -> RemoteResult<()> {
        let fault = self.faults.iter_mut().find(|f| {
            f.op == call.op
                && f.remaining > 0
                && (f.external_id.is_none() || f.external_id == call.external_id)
        });
        let injected = fault.map(|f| {
            f.remaining -= 1;
            f.error.clone()
        });
        self.faults.retain(|f| f.remaining > 0);
        self.calls.push(call);

        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory data platform.
#[derive(Debug)]
pub struct MemoryRemote {
    state: RwLock<State>,
    page_limit: usize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                projects: HashMap::new(),
                next_id: FIRST_ASSIGNED_ID,
                clock: 0,
                calls: Vec::new(),
                faults: Vec::new(),
            }),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Cap datapoint pages at `limit` points.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    // =========================================================================
    // Seeding and inspection
    // =========================================================================

    /// Insert or replace entities as-is (ids included).
    pub async fn seed(&self, project: &str, resource: ResourceType, entities: Vec<Entity>) {
        let mut state = self.state.write().await;
        let target = state.project(project).resource(resource);
        for entity in entities {
            target.insert(entity.id, entity);
        }
    }

    pub async fn seed_datapoints(&self, project: &str, external_id: &str, points: Vec<Datapoint>) {
        let mut state = self.state.write().await;
        let series = state
            .project(project)
            .datapoints
            .entry(external_id.to_string())
            .or_default();
        for point in points {
            series.insert(point.timestamp, point.value);
        }
    }

    /// Remove an entity by external id. Returns whether it existed.
    pub async fn remove(&self, project: &str, resource: ResourceType, external_id: &str) -> bool {
        let mut state = self.state.write().await;
        let project = state.project(project);
        match project.find_id(resource, external_id) {
            Some(id) => project.resource(resource).remove(&id).is_some(),
            None => false,
        }
    }

    /// Apply a local edit to an entity, as a user of that project would.
    pub async fn modify<F>(&self, project: &str, resource: ResourceType, external_id: &str, edit: F) -> bool
    where
        F: FnOnce(&mut Entity),
    {
        let mut state = self.state.write().await;
        let now = state.tick();
        let project = state.project(project);
        let Some(id) = project.find_id(resource, external_id) else {
            return false;
        };
        match project.resource(resource).get_mut(&id) {
            Some(entity) => {
                edit(entity);
                entity.last_updated_time = entity.last_updated_time.max(now);
                true
            }
            None => false,
        }
    }

    pub async fn entities(&self, project: &str, resource: ResourceType) -> Vec<Entity> {
        let state = self.state.read().await;
        state
            .projects
            .get(project)
            .and_then(|p| p.entities.get(&resource))
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn find(&self, project: &str, resource: ResourceType, external_id: &str) -> Option<Entity> {
        self.entities(project, resource)
            .await
            .into_iter()
            .find(|e| e.external_id.as_deref() == Some(external_id))
    }

    /// Stored datapoints of a timeseries, ascending.
    pub async fn datapoints(&self, project: &str, external_id: &str) -> Vec<Datapoint> {
        let state = self.state.read().await;
        state
            .projects
            .get(project)
            .and_then(|p| p.datapoints.get(external_id))
            .map(|series| series.iter().map(|(t, v)| Datapoint::new(*t, *v)).collect())
            .unwrap_or_default()
    }

    /// Datapoints in the order they were written to a timeseries.
    pub async fn write_log(&self, project: &str, external_id: &str) -> Vec<Datapoint> {
        let state = self.state.read().await;
        state
            .projects
            .get(project)
            .and_then(|p| p.write_log.get(external_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.read().await.calls.clone()
    }

    /// Calls of one kind against one project.
    pub async fn calls_to(&self, op: RemoteOp, project: &str) -> Vec<RemoteCall> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op && c.project == project)
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.write().await.calls.clear();
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub async fn fail_next(&self, op: RemoteOp, error: RemoteError, times: usize) {
        self.state.write().await.faults.push(Fault {
            op,
            external_id: None,
            error,
            remaining: times,
        });
    }

    /// Fail the next `times` datapoint calls of `op` for one timeseries.
    pub async fn fail_next_for(&self, op: RemoteOp, external_id: &str, error: RemoteError, times: usize) {
        self.state.write().await.faults.push(Fault {
            op,
            external_id: Some(external_id.to_string()),
            error,
            remaining: times,
        });
    }

    // =========================================================================
    // Operation bodies
    // =========================================================================

    async fn do_list(&self, project: String, resource: ResourceType) -> RemoteResult<Vec<Entity>> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::List,
            project: project.clone(),
            resource,
            external_id: None,
            items: 0,
        })?;
        Ok(state
            .project(&project)
            .resource(resource)
            .values()
            .cloned()
            .collect())
    }

    async fn do_create(
        &self,
        project: String,
        resource: ResourceType,
        batch: Vec<EntityWrite>,
    ) -> RemoteResult<Vec<(String, DestinationId)>> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::Create,
            project: project.clone(),
            resource,
            external_id: None,
            items: batch.len(),
        })?;

        {
            let target = state.project(&project);
            let existing: HashSet<&str> = target
                .entities
                .get(&resource)
                .map(|entities| entities.values().filter_map(|e| e.external_id.as_deref()).collect())
                .unwrap_or_default();
            let mut seen = HashSet::new();
            for write in &batch {
                if !seen.insert(write.external_id.as_str())
                    || existing.contains(write.external_id.as_str())
                {
                    return Err(RemoteError::Rejected(format!(
                        "duplicate external id: {}",
                        write.external_id
                    )));
                }
                if let Some(parent) = write.parent_id {
                    if !target.has_asset(parent.0) {
                        return Err(RemoteError::Rejected(format!(
                            "{}: parent asset {} not found",
                            write.external_id, parent
                        )));
                    }
                }
            }
        }

        let mut created = Vec::with_capacity(batch.len());
        for write in batch {
            let id = state.next_id;
            state.next_id += 1;
            let now = state.tick();
            let entity = Entity {
                id,
                external_id: Some(write.external_id.clone()),
                parent_external_id: write.parent_external_id,
                parent_id: write.parent_id.map(|p| p.0),
                payload: write.payload,
                last_updated_time: now,
                provenance: Some(write.provenance),
            };
            state.project(&project).resource(resource).insert(id, entity);
            created.push((write.external_id, DestinationId(id)));
        }
        Ok(created)
    }

    async fn do_update(
        &self,
        project: String,
        resource: ResourceType,
        batch: Vec<EntityUpdate>,
    ) -> RemoteResult<Vec<ItemOutcome>> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::Update,
            project: project.clone(),
            resource,
            external_id: None,
            items: batch.len(),
        })?;

        let mut outcomes = Vec::with_capacity(batch.len());
        for update in batch {
            let now = state.tick();
            let target = state.project(&project);
            if let Some(parent) = update.write.parent_id {
                if !target.has_asset(parent.0) {
                    outcomes.push(ItemOutcome::Failed(format!("parent asset {parent} not found")));
                    continue;
                }
            }
            match target.resource(resource).get_mut(&update.destination_id.0) {
                Some(entity) => {
                    entity.parent_external_id = update.write.parent_external_id;
                    entity.parent_id = update.write.parent_id.map(|p| p.0);
                    entity.payload = update.write.payload;
                    entity.provenance = Some(update.write.provenance);
                    entity.last_updated_time = now;
                    outcomes.push(ItemOutcome::Applied);
                }
                None => outcomes.push(ItemOutcome::Failed(format!(
                    "{} not found",
                    update.destination_id
                ))),
            }
        }
        Ok(outcomes)
    }

    async fn do_delete(
        &self,
        project: String,
        resource: ResourceType,
        ids: Vec<DestinationId>,
    ) -> RemoteResult<Vec<ItemOutcome>> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::Delete,
            project: project.clone(),
            resource,
            external_id: None,
            items: ids.len(),
        })?;

        let target = state.project(&project);
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            match target.resource(resource).remove(&id.0) {
                Some(entity) => {
                    if resource == ResourceType::TimeSeries {
                        if let Some(external_id) = &entity.external_id {
                            target.datapoints.remove(external_id);
                        }
                    }
                    outcomes.push(ItemOutcome::Applied);
                }
                None => outcomes.push(ItemOutcome::Failed(format!("{id} not found"))),
            }
        }
        Ok(outcomes)
    }

    async fn do_list_datapoints(
        &self,
        project: String,
        external_id: String,
        window: TimeWindow,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> RemoteResult<DatapointPage> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::ListDatapoints,
            project: project.clone(),
            resource: ResourceType::Datapoints,
            external_id: Some(external_id.clone()),
            items: 0,
        })?;

        let after = match cursor {
            Some(token) => Some(
                token
                    .parse::<i64>()
                    .map_err(|_| RemoteError::Rejected(format!("invalid cursor: {token}")))?,
            ),
            None => None,
        };
        let limit = limit.unwrap_or(self.page_limit).clamp(1, self.page_limit);

        let Some(series) = state.project(&project).datapoints.get(&external_id) else {
            return Ok(DatapointPage::default());
        };

        let mut in_range = series
            .range(window.start()..=window.end())
            .filter(|(t, _)| after.map_or(true, |a| **t > a))
            .map(|(t, v)| Datapoint::new(*t, *v));

        let points: Vec<Datapoint> = in_range.by_ref().take(limit).collect();
        let next_cursor = match (in_range.next(), points.last()) {
            (Some(_), Some(last)) => Some(last.timestamp.to_string()),
            _ => None,
        };

        Ok(DatapointPage { points, next_cursor })
    }

    async fn do_write_datapoints(
        &self,
        project: String,
        external_id: String,
        points: Vec<Datapoint>,
    ) -> RemoteResult<()> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::WriteDatapoints,
            project: project.clone(),
            resource: ResourceType::Datapoints,
            external_id: Some(external_id.clone()),
            items: points.len(),
        })?;

        let target = state.project(&project);
        if target.find_id(ResourceType::TimeSeries, &external_id).is_none() {
            return Err(RemoteError::Rejected(format!(
                "timeseries {external_id} not found"
            )));
        }
        if points.windows(2).any(|w| w[1].timestamp <= w[0].timestamp) {
            return Err(RemoteError::Rejected(format!(
                "datapoints for {external_id} are not strictly increasing"
            )));
        }

        let series = target.datapoints.entry(external_id.clone()).or_default();
        for point in &points {
            series.insert(point.timestamp, point.value);
        }
        target.write_log.entry(external_id).or_default().extend(points);
        Ok(())
    }

    async fn do_latest_datapoint(&self, project: String, external_id: String) -> RemoteResult<Option<i64>> {
        let mut state = self.state.write().await;
        state.enter(RemoteCall {
            op: RemoteOp::LatestDatapoint,
            project: project.clone(),
            resource: ResourceType::Datapoints,
            external_id: Some(external_id.clone()),
            items: 0,
        })?;
        Ok(state
            .project(&project)
            .datapoints
            .get(&external_id)
            .and_then(|series| series.keys().next_back().copied()))
    }
}

impl RemoteClient for MemoryRemote {
    fn list(&self, project: &str, resource: ResourceType) -> BoxFuture<'_, Vec<Entity>> {
        let project = project.to_string();
        Box::pin(self.do_list(project, resource))
    }

    fn create(
        &self,
        project: &str,
        resource: ResourceType,
        batch: Vec<EntityWrite>,
    ) -> BoxFuture<'_, Vec<(String, DestinationId)>> {
        let project = project.to_string();
        Box::pin(self.do_create(project, resource, batch))
    }

    fn update(
        &self,
        project: &str,
        resource: ResourceType,
        batch: Vec<EntityUpdate>,
    ) -> BoxFuture<'_, Vec<ItemOutcome>> {
        let project = project.to_string();
        Box::pin(self.do_update(project, resource, batch))
    }

    fn delete(
        &self,
        project: &str,
        resource: ResourceType,
        ids: Vec<DestinationId>,
    ) -> BoxFuture<'_, Vec<ItemOutcome>> {
        let project = project.to_string();
        Box::pin(self.do_delete(project, resource, ids))
    }

    fn list_datapoints(
        &self,
        project: &str,
        external_id: &str,
        window: TimeWindow,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> BoxFuture<'_, DatapointPage> {
        let project = project.to_string();
        let external_id = external_id.to_string();
        Box::pin(self.do_list_datapoints(project, external_id, window, limit, cursor))
    }

    fn write_datapoints(
        &self,
        project: &str,
        external_id: &str,
        points: Vec<Datapoint>,
    ) -> BoxFuture<'_, ()> {
        let project = project.to_string();
        let external_id = external_id.to_string();
        Box::pin(self.do_write_datapoints(project, external_id, points))
    }

    fn latest_datapoint(&self, project: &str, external_id: &str) -> BoxFuture<'_, Option<i64>> {
        let project = project.to_string();
        let external_id = external_id.to_string();
        Box::pin(self.do_latest_datapoint(project, external_id))
    }
}
