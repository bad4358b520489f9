// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Run summary: what happened, per resource type.
//!
//! A run always produces a [`RunSummary`], including on partial failure.
//! Only configuration, authentication and mapping-conflict errors skip it
//! by aborting the run.

use crate::entity::ResourceType;
use crate::error::ReplicationError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Operation that failed for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    ResolveParent,
    ReadDatapoints,
    WriteDatapoints,
    Transform,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ResolveParent => "resolve_parent",
            Self::ReadDatapoints => "read_datapoints",
            Self::WriteDatapoints => "write_datapoints",
            Self::Transform => "transform",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed item with its error detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub external_id: String,
    pub operation: Operation,
    pub error: String,
}

impl FailedItem {
    pub fn new(external_id: impl Into<String>, operation: Operation, error: &ReplicationError) -> Self {
        Self {
            external_id: external_id.into(),
            operation,
            error: error.to_string(),
        }
    }
}

/// Counters for one resource type.
///
/// For datapoints the counters are in points: `created` is points written,
/// `failed` is points skipped by a failed transformation or a failed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Source entities without an external id, or string timeseries for datapoints.
    pub skipped: usize,
    /// Source entities dropped by filters.
    pub excluded: usize,
    /// Mapped entities already up to date.
    pub unchanged: usize,
    pub failed: usize,
    pub failures: Vec<FailedItem>,
}

impl ResourceSummary {
    pub fn record_failure(&mut self, failure: FailedItem) {
        self.failed += 1;
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: ResourceSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.excluded += other.excluded;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || !self.failures.is_empty()
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub resources: BTreeMap<ResourceType, ResourceSummary>,
    /// Resource types not attempted, with the reason.
    pub skipped_resources: BTreeMap<ResourceType, String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn resource(&self, resource: ResourceType) -> Option<&ResourceSummary> {
        self.resources.get(&resource)
    }

    /// True if nothing failed and no resource type was skipped.
    pub fn is_success(&self) -> bool {
        self.skipped_resources.is_empty() && self.resources.values().all(|r| !r.has_failures())
    }

    pub fn total_failed(&self) -> usize {
        self.resources.values().map(|r| r.failed).sum()
    }

    /// Total creates, updates and deletes across all metadata resource types.
    pub fn total_changes(&self) -> usize {
        self.resources
            .iter()
            .filter(|(resource, _)| **resource != ResourceType::Datapoints)
            .map(|(_, r)| r.created + r.updated + r.deleted)
            .sum()
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl RunSummary {
        fn resource_mut(&mut self, resource: ResourceType) -> &mut ResourceSummary {
            self.resources.entry(resource).or_default()
        }
    }

    #[test]
    fn test_empty_summary_is_success() {
        let summary = RunSummary::default();
        assert!(summary.is_success());
        assert_eq!(summary.total_failed(), 0);
    }

    #[test]
    fn test_failure_marks_run() {
        let mut summary = RunSummary::default();
        summary.resource_mut(ResourceType::Event).created = 3;
        assert!(summary.is_success());

        let err = ReplicationError::UnresolvedReference {
            external_id: "e1".to_string(),
            parent_external_id: "A".to_string(),
        };
        summary
            .resource_mut(ResourceType::Event)
            .record_failure(FailedItem::new("e1", Operation::ResolveParent, &err));

        assert!(!summary.is_success());
        assert_eq!(summary.total_failed(), 1);
        let failure = &summary.resource(ResourceType::Event).unwrap().failures[0];
        assert_eq!(failure.external_id, "e1");
        assert!(failure.error.contains("Unresolved"));
    }

    #[test]
    fn test_skipped_resource_marks_run() {
        let mut summary = RunSummary::default();
        summary
            .skipped_resources
            .insert(ResourceType::Datapoints, "timeseries failed".to_string());
        assert!(!summary.is_success());
    }

    #[test]
    fn test_total_changes_excludes_datapoints() {
        let mut summary = RunSummary::default();
        summary.resource_mut(ResourceType::Asset).created = 2;
        summary.resource_mut(ResourceType::Event).deleted = 1;
        summary.resource_mut(ResourceType::Datapoints).created = 500;
        assert_eq!(summary.total_changes(), 3);
    }

    #[test]
    fn test_merge() {
        let mut a = ResourceSummary {
            created: 1,
            unchanged: 2,
            ..Default::default()
        };
        a.merge(ResourceSummary {
            created: 2,
            failed: 1,
            ..Default::default()
        });
        assert_eq!(a.created, 3);
        assert_eq!(a.unchanged, 2);
        assert_eq!(a.failed, 1);
    }

    #[test]
    fn test_serializes_to_json() {
        let mut summary = RunSummary::default();
        summary.resource_mut(ResourceType::TimeSeries).updated = 4;
        summary.duration = Duration::from_millis(1500);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["resources"]["timeseries"]["updated"], 4);
        assert_eq!(json["duration"], 1500);
    }
}
