//! # Catalog Replicator
//!
//! One-way replication of assets, events, timeseries and datapoints from a
//! source project of a data platform into a destination project.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            catalog-replicator                             │
//! │                                                                           │
//! │  ┌────────────┐    ┌──────────────┐    ┌────────────┐    ┌─────────────┐  │
//! │  │ Replicator │───►│ResourceFilter│───►│ DiffEngine │───►│BatchExecutor│  │
//! │  │(dependency │    │ (regex/allow)│    │ (watermark)│    │ (pool+retry)│  │
//! │  │  order)    │    └──────────────┘    └────────────┘    └─────────────┘  │
//! │  └────────────┘                              │  ▲               │         │
//! │         │                                    ▼  │               ▼         │
//! │         │                          ┌──────────────────┐  ┌─────────────┐  │
//! │         │                          │ DeletionPolicy   │  │ IdRegistry  │  │
//! │         │                          └──────────────────┘  │ (ext → ids) │  │
//! │         ▼                                                └─────────────┘  │
//! │  ┌──────────────────────┐                                       ▲         │
//! │  │ DatapointsReplicator │───────────────────────────────────────┘         │
//! │  │ (window, transform)  │                                                 │
//! │  └──────────────────────┘                                                 │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//!
//! Entities are matched across projects by external id. Every entity the
//! replicator writes carries [`Provenance`](entity::Provenance): the source
//! identity, the source last-updated time and a content hash. The
//! [`IdRegistry`](registry::IdRegistry) is rebuilt from it at the start of
//! each run, so repeated runs converge without local state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use catalog_replicator::{MemoryRemote, Replicator, ReplicatorConfig, ValueTransform};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicatorConfig::for_testing("source", "destination");
//!     let remote = Arc::new(MemoryRemote::new());
//!
//!     let mut replicator = Replicator::new(config, remote)
//!         .with_value_transform(ValueTransform::scale(0.2));
//!     let summary = replicator.run().await.expect("Replication failed");
//!
//!     println!("{} changes, {} failures", summary.total_changes(), summary.total_failed());
//! }
//! ```

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod datapoints;
pub mod deletion;
pub mod diff;
pub mod entity;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod resilience;
pub mod summary;
pub mod time_window;
pub mod transform;

pub use config::{ReplicationSettings, ReplicatorConfig};
pub use coordinator::{Replicator, RunState};
pub use deletion::DeletionPolicy;
pub use entity::{Datapoint, DestinationId, Entity, ResourceType, SourceId};
pub use error::{RemoteError, ReplicationError, Result};
pub use remote::{MemoryRemote, RemoteClient};
pub use summary::{FailedItem, Operation, ResourceSummary, RunSummary};
pub use time_window::{TimeExpr, TimeWindow};
pub use transform::{TransformError, ValueTransform};
