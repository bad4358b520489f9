// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote data-platform client interface.
//!
//! The replicator never talks HTTP itself. It drives a [`RemoteClient`]
//! supplied by the embedding application, which owns transport, credentials
//! and pagination of metadata listings. Both projects are reached through the
//! same client; every call names the project it targets.
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_replicator::remote::{BoxFuture, DatapointPage, ItemOutcome, RemoteClient};
//! use catalog_replicator::entity::*;
//! use catalog_replicator::time_window::TimeWindow;
//!
//! struct Offline;
//!
//! impl RemoteClient for Offline {
//!     fn list(&self, _project: &str, _resource: ResourceType) -> BoxFuture<'_, Vec<Entity>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//!     fn create(&self, _p: &str, _r: ResourceType, _b: Vec<EntityWrite>) -> BoxFuture<'_, Vec<(String, DestinationId)>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//!     fn update(&self, _p: &str, _r: ResourceType, b: Vec<EntityUpdate>) -> BoxFuture<'_, Vec<ItemOutcome>> {
//!         Box::pin(async move { Ok(vec![ItemOutcome::Applied; b.len()]) })
//!     }
//!     fn delete(&self, _p: &str, _r: ResourceType, ids: Vec<DestinationId>) -> BoxFuture<'_, Vec<ItemOutcome>> {
//!         Box::pin(async move { Ok(vec![ItemOutcome::Applied; ids.len()]) })
//!     }
//!     fn list_datapoints(&self, _p: &str, _x: &str, _w: TimeWindow, _l: Option<usize>, _c: Option<String>) -> BoxFuture<'_, DatapointPage> {
//!         Box::pin(async { Ok(DatapointPage::default()) })
//!     }
//!     fn write_datapoints(&self, _p: &str, _x: &str, _pts: Vec<Datapoint>) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

mod memory;

pub use memory::{MemoryRemote, RemoteCall, RemoteOp};

use crate::entity::{Datapoint, DestinationId, Entity, EntityUpdate, EntityWrite, ResourceType};
use crate::error::RemoteError;
use crate::time_window::TimeWindow;
use std::future::Future;
use std::pin::Pin;

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RemoteResult<T>> + Send + 'a>>;

/// Outcome of one item in an update or delete call.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Applied,
    Failed(String),
}

impl ItemOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// One page of datapoints, ascending by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatapointPage {
    pub points: Vec<Datapoint>,
    /// Opaque token for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Operations the replicator needs from the data platform.
///
/// `update` and `delete` return one outcome per input item, in input order.
/// `create` is all-or-nothing per batch and returns the destination identity
/// assigned to each created external id.
pub trait RemoteClient: Send + Sync + 'static {
    /// List every entity of a resource type in a project.
    fn list(&self, project: &str, resource: ResourceType) -> BoxFuture<'_, Vec<Entity>>;

    fn create(
        &self,
        project: &str,
        resource: ResourceType,
        batch: Vec<EntityWrite>,
    ) -> BoxFuture<'_, Vec<(String, DestinationId)>>;

    fn update(
        &self,
        project: &str,
        resource: ResourceType,
        batch: Vec<EntityUpdate>,
    ) -> BoxFuture<'_, Vec<ItemOutcome>>;

    fn delete(
        &self,
        project: &str,
        resource: ResourceType,
        ids: Vec<DestinationId>,
    ) -> BoxFuture<'_, Vec<ItemOutcome>>;

    /// Read one page of datapoints within `window` (inclusive).
    ///
    /// `limit` caps the page size; `None` uses the service's own limit.
    fn list_datapoints(
        &self,
        project: &str,
        external_id: &str,
        window: TimeWindow,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> BoxFuture<'_, DatapointPage>;

    /// Write points to a timeseries. Timestamps must be strictly increasing.
    fn write_datapoints(
        &self,
        project: &str,
        external_id: &str,
        points: Vec<Datapoint>,
    ) -> BoxFuture<'_, ()>;

    /// Timestamp of the newest datapoint of a timeseries, if known.
    ///
    /// Default implementation reports nothing, which disables incremental resume.
    fn latest_datapoint(&self, _project: &str, _external_id: &str) -> BoxFuture<'_, Option<i64>> {
        Box::pin(async { Ok(None) })
    }
}
