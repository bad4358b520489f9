// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated resource model.
//!
//! An [`Entity`] is whatever a project lists for a resource type: an asset,
//! an event or a timeseries metadata record. Its `id` is local to the project
//! it was listed from; identities are never carried across projects; the
//! [`IdRegistry`](crate::registry::IdRegistry) translates between them via
//! [`SourceId`] and [`DestinationId`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// The replicated categories, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "assets")]
    Asset,
    #[serde(rename = "events")]
    Event,
    #[serde(rename = "timeseries")]
    TimeSeries,
    #[serde(rename = "datapoints")]
    Datapoints,
}

impl ResourceType {
    /// Resource types whose metadata goes through the diff engine.
    pub const METADATA: [ResourceType; 3] = [Self::Asset, Self::Event, Self::TimeSeries];

    /// Resource type that `parent_external_id` refers to.
    pub fn parent_type(&self) -> Option<ResourceType> {
        match self {
            Self::Asset | Self::Event | Self::TimeSeries => Some(Self::Asset),
            Self::Datapoints => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "assets",
            Self::Event => "events",
            Self::TimeSeries => "timeseries",
            Self::Datapoints => "datapoints",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an entity in the source project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub i64);

/// Identity of an entity in the destination project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a destination entity came from.
///
/// Stamped on every entity the replicator writes. Destination entities
/// without it were never replicated by this tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_project: String,
    pub source_id: SourceId,
    /// Source `last_updated_time` at the moment of replication (the watermark).
    pub source_updated_time: i64,
    /// Content hash of the replicated source payload.
    pub payload_hash: String,
    /// Epoch millis of the run that wrote this version.
    pub replicated_time: i64,
}

/// A listed asset, event or timeseries record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Project-local identity.
    pub id: i64,
    /// Cross-project identity. Entities without one are not replicable.
    pub external_id: Option<String>,
    /// External id of the referenced asset (hierarchy parent or linked asset).
    pub parent_external_id: Option<String>,
    /// Project-local id of the referenced asset, as stored by the project.
    #[serde(default)]
    pub parent_id: Option<i64>,
    /// Resource-type-specific attributes.
    pub payload: Value,
    /// Monotonic update watermark (epoch millis).
    pub last_updated_time: i64,
    /// Present on destination entities written by the replicator.
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

impl Entity {
    pub fn new(id: i64, external_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            external_id: Some(external_id.into()),
            parent_external_id: None,
            parent_id: None,
            payload,
            last_updated_time: 0,
            provenance: None,
        }
    }

    pub fn with_parent(mut self, parent_external_id: impl Into<String>) -> Self {
        self.parent_external_id = Some(parent_external_id.into());
        self
    }

    pub fn with_updated_time(mut self, last_updated_time: i64) -> Self {
        self.last_updated_time = last_updated_time;
        self
    }

    /// `name` attribute of the payload, if any.
    pub fn name(&self) -> Option<&str> {
        self.payload.get("name").and_then(Value::as_str)
    }

    /// True for timeseries holding string values rather than numbers.
    pub fn is_string_series(&self) -> bool {
        self.payload
            .get("is_string")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// SHA-256 over the payload and the parent reference.
    ///
    /// `serde_json` object keys are ordered, so equal payloads hash equally.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.payload.to_string().as_bytes());
        hasher.update([0u8]);
        if let Some(parent) = &self.parent_external_id {
            hasher.update(parent.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Build the destination write for this source entity.
    ///
    /// Returns `None` for entities without an external id.
    pub fn to_write(
        &self,
        parent_id: Option<DestinationId>,
        source_project: &str,
        replicated_time: i64,
    ) -> Option<EntityWrite> {
        let external_id = self.external_id.clone()?;
        Some(EntityWrite {
            external_id,
            parent_external_id: self.parent_external_id.clone(),
            parent_id,
            payload: self.payload.clone(),
            provenance: Provenance {
                source_project: source_project.to_string(),
                source_id: SourceId(self.id),
                source_updated_time: self.last_updated_time,
                payload_hash: self.content_hash(),
                replicated_time,
            },
        })
    }
}

/// Body of a create or update against the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub external_id: String,
    pub parent_external_id: Option<String>,
    /// Parent re-mapped into the destination id space.
    pub parent_id: Option<DestinationId>,
    pub payload: Value,
    pub provenance: Provenance,
}

/// An update addressed to an existing destination entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub destination_id: DestinationId,
    pub write: EntityWrite,
}

/// A single numeric datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: i64,
    pub value: f64,
}

impl Datapoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_type_serde_names() {
        let parsed: Vec<ResourceType> =
            serde_json::from_str(r#"["assets","events","timeseries","datapoints"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                ResourceType::Asset,
                ResourceType::Event,
                ResourceType::TimeSeries,
                ResourceType::Datapoints
            ]
        );
        assert_eq!(ResourceType::TimeSeries.to_string(), "timeseries");
    }

    #[test]
    fn test_parent_type_is_asset() {
        assert_eq!(ResourceType::Event.parent_type(), Some(ResourceType::Asset));
        assert_eq!(ResourceType::Asset.parent_type(), Some(ResourceType::Asset));
        assert_eq!(ResourceType::Datapoints.parent_type(), None);
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = Entity::new(1, "x", json!({"name": "pump", "unit": "bar"}));
        let b = Entity::new(2, "x", json!({"unit": "bar", "name": "pump"}));
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_covers_parent() {
        let a = Entity::new(1, "x", json!({"name": "pump"}));
        let b = a.clone().with_parent("site");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_to_write_stamps_provenance() {
        let entity = Entity::new(42, "pump-1", json!({"name": "pump"}))
            .with_parent("site")
            .with_updated_time(1_000);
        let write = entity
            .to_write(Some(DestinationId(7)), "src-project", 5_000)
            .unwrap();

        assert_eq!(write.external_id, "pump-1");
        assert_eq!(write.parent_id, Some(DestinationId(7)));
        assert_eq!(write.provenance.source_id, SourceId(42));
        assert_eq!(write.provenance.source_updated_time, 1_000);
        assert_eq!(write.provenance.replicated_time, 5_000);
        assert_eq!(write.provenance.payload_hash, entity.content_hash());
    }

    #[test]
    fn test_to_write_requires_external_id() {
        let mut entity = Entity::new(1, "x", json!({}));
        entity.external_id = None;
        assert!(entity.to_write(None, "src", 0).is_none());
    }

    #[test]
    fn test_string_series_flag() {
        assert!(Entity::new(1, "s", json!({"is_string": true})).is_string_series());
        assert!(!Entity::new(1, "n", json!({"is_string": false})).is_string_series());
        assert!(!Entity::new(1, "n", json!({})).is_string_series());
    }
}
