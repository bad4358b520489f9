// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identity mapping between the source and destination projects.
//!
//! The registry is the only structure mutated concurrently by workers. It is
//! a [`DashMap`] keyed by `(resource type, external id)`: reads never block
//! each other, and writes to one key are serialized by the shard lock held
//! through the entry API, while writes to distinct keys proceed in parallel.
//!
//! # Lifecycle
//!
//! ```text
//! run start:  index destination entities carrying provenance
//! create ok:  record(external_id, source_id, destination_id)
//! update ok:  advance_watermark(external_id, ...)
//! delete ok:  remove(external_id)
//! ```
//!
//! A mapping's destination identity is immutable. Re-recording an external id
//! with a different destination id is a [`ReplicationError::MappingConflict`].

use crate::entity::{DestinationId, Entity, ResourceType, SourceId};
use crate::error::{ReplicationError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Persistent association for one replicated external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub destination_id: DestinationId,
    pub source_id: Option<SourceId>,
    /// Source `last_updated_time` of the last replicated version.
    pub watermark: Option<i64>,
    /// Content hash of the last replicated version.
    pub payload_hash: Option<String>,
}

type MappingKey = (ResourceType, String);

/// Thread-safe bidirectional identity map for one run.
#[derive(Debug, Default)]
pub struct IdRegistry {
    entries: DashMap<MappingKey, MappingEntry>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a destination snapshot.
    ///
    /// Only entities with an external id and provenance are mapped; anything
    /// else was not written by the replicator. Returns the number indexed.
    pub fn index_destination(&self, resource: ResourceType, destination: &[Entity]) -> usize {
        let mut indexed = 0;
        for entity in destination {
            let (Some(external_id), Some(provenance)) = (&entity.external_id, &entity.provenance)
            else {
                continue;
            };

            let entry = MappingEntry {
                destination_id: DestinationId(entity.id),
                source_id: Some(provenance.source_id),
                watermark: Some(provenance.source_updated_time),
                payload_hash: Some(provenance.payload_hash.clone()),
            };

            if let Some(previous) = self.entries.insert((resource, external_id.clone()), entry) {
                warn!(
                    resource = %resource,
                    external_id = %external_id,
                    previous = %previous.destination_id,
                    current = entity.id,
                    "Duplicate external id in destination snapshot, keeping the last one"
                );
            }
            indexed += 1;
        }

        debug!(resource = %resource, indexed, "Indexed destination snapshot");
        indexed
    }

    pub fn lookup(&self, resource: ResourceType, external_id: &str) -> Option<DestinationId> {
        self.entries
            .get(&(resource, external_id.to_string()))
            .map(|e| e.destination_id)
    }

    pub fn entry(&self, resource: ResourceType, external_id: &str) -> Option<MappingEntry> {
        self.entries
            .get(&(resource, external_id.to_string()))
            .map(|e| e.value().clone())
    }

    /// Record a mapping after a successful create.
    ///
    /// Idempotent for the same destination id.
    pub fn record(
        &self,
        resource: ResourceType,
        external_id: &str,
        source_id: SourceId,
        destination_id: DestinationId,
        watermark: Option<i64>,
        payload_hash: Option<String>,
    ) -> Result<()> {
        match self.entries.entry((resource, external_id.to_string())) {
            Entry::Occupied(existing) => {
                let existing = existing.get().destination_id;
                if existing != destination_id {
                    return Err(ReplicationError::MappingConflict {
                        resource: resource.to_string(),
                        external_id: external_id.to_string(),
                        existing: existing.0,
                        attempted: destination_id.0,
                    });
                }
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(MappingEntry {
                    destination_id,
                    source_id: Some(source_id),
                    watermark,
                    payload_hash,
                });
                Ok(())
            }
        }
    }

    /// Move the watermark forward after a successful update.
    ///
    /// Returns `false` if the external id is not mapped.
    pub fn advance_watermark(
        &self,
        resource: ResourceType,
        external_id: &str,
        watermark: i64,
        payload_hash: String,
    ) -> bool {
        match self.entries.get_mut(&(resource, external_id.to_string())) {
            Some(mut entry) => {
                if entry.watermark.map_or(true, |w| watermark >= w) {
                    entry.watermark = Some(watermark);
                }
                entry.payload_hash = Some(payload_hash);
                true
            }
            None => false,
        }
    }

    /// Drop a mapping after its destination entity was deleted.
    pub fn remove(&self, resource: ResourceType, external_id: &str) -> Option<MappingEntry> {
        self.entries
            .remove(&(resource, external_id.to_string()))
            .map(|(_, entry)| entry)
    }

    /// All `(external id, destination id)` pairs for one resource type.
    pub fn mappings(&self, resource: ResourceType) -> Vec<(String, DestinationId)> {
        let mut mappings: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == resource)
            .map(|e| (e.key().1.clone(), e.destination_id))
            .collect();
        mappings.sort();
        mappings
    }

    pub fn len(&self, resource: ResourceType) -> usize {
        self.entries.iter().filter(|e| e.key().0 == resource).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Provenance;
    use serde_json::json;
    use std::sync::Arc;

    fn replicated(id: i64, external_id: &str, source_id: i64, updated: i64) -> Entity {
        let mut entity = Entity::new(id, external_id, json!({}));
        entity.provenance = Some(Provenance {
            source_project: "src".to_string(),
            source_id: SourceId(source_id),
            source_updated_time: updated,
            payload_hash: "h".to_string(),
            replicated_time: 0,
        });
        entity
    }

    #[test]
    fn test_index_only_replicated_entities() {
        let registry = IdRegistry::new();
        let mut no_external_id = replicated(3, "x", 30, 0);
        no_external_id.external_id = None;

        let indexed = registry.index_destination(
            ResourceType::Asset,
            &[
                replicated(1, "a", 10, 100),
                Entity::new(2, "manual", json!({})),
                no_external_id,
            ],
        );

        assert_eq!(indexed, 1);
        assert_eq!(registry.lookup(ResourceType::Asset, "a"), Some(DestinationId(1)));
        assert_eq!(registry.lookup(ResourceType::Asset, "manual"), None);

        let entry = registry.entry(ResourceType::Asset, "a").unwrap();
        assert_eq!(entry.source_id, Some(SourceId(10)));
        assert_eq!(entry.watermark, Some(100));
    }

    #[test]
    fn test_resource_types_are_separate_namespaces() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Asset, "x", SourceId(1), DestinationId(100), None, None)
            .unwrap();
        registry
            .record(ResourceType::Event, "x", SourceId(2), DestinationId(200), None, None)
            .unwrap();

        assert_eq!(registry.lookup(ResourceType::Asset, "x"), Some(DestinationId(100)));
        assert_eq!(registry.lookup(ResourceType::Event, "x"), Some(DestinationId(200)));
        assert_eq!(registry.len(ResourceType::Asset), 1);
    }

    #[test]
    fn test_record_is_idempotent() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Asset, "a", SourceId(1), DestinationId(10), Some(5), None)
            .unwrap();
        registry
            .record(ResourceType::Asset, "a", SourceId(1), DestinationId(10), Some(9), None)
            .unwrap();

        let entry = registry.entry(ResourceType::Asset, "a").unwrap();
        assert_eq!(entry.watermark, Some(5));
    }

    #[test]
    fn test_record_conflict_is_error() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Asset, "a", SourceId(1), DestinationId(10), None, None)
            .unwrap();
        let err = registry
            .record(ResourceType::Asset, "a", SourceId(1), DestinationId(11), None, None)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(registry.lookup(ResourceType::Asset, "a"), Some(DestinationId(10)));
    }

    #[test]
    fn test_advance_watermark() {
        let registry = IdRegistry::new();
        assert!(!registry.advance_watermark(ResourceType::Asset, "a", 10, "h".into()));

        registry
            .record(ResourceType::Asset, "a", SourceId(1), DestinationId(10), Some(5), None)
            .unwrap();
        assert!(registry.advance_watermark(ResourceType::Asset, "a", 10, "h2".into()));
        // Never moves backwards.
        assert!(registry.advance_watermark(ResourceType::Asset, "a", 7, "h3".into()));

        let entry = registry.entry(ResourceType::Asset, "a").unwrap();
        assert_eq!(entry.watermark, Some(10));
        assert_eq!(entry.payload_hash.as_deref(), Some("h3"));
    }

    #[test]
    fn test_remove() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Event, "e", SourceId(1), DestinationId(10), None, None)
            .unwrap();
        assert!(registry.remove(ResourceType::Event, "e").is_some());
        assert!(registry.remove(ResourceType::Event, "e").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mappings_sorted() {
        let registry = IdRegistry::new();
        for (i, ext) in ["c", "a", "b"].iter().enumerate() {
            registry
                .record(ResourceType::TimeSeries, ext, SourceId(i as i64), DestinationId(i as i64), None, None)
                .unwrap();
        }
        let ids: Vec<_> = registry
            .mappings(ResourceType::TimeSeries)
            .into_iter()
            .map(|(ext, _)| ext)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_records_same_key_single_winner() {
        let registry = Arc::new(IdRegistry::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.record(
                    ResourceType::Asset,
                    "contended",
                    SourceId(1),
                    DestinationId(i),
                    None,
                    None,
                )
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(ReplicationError::MappingConflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn test_concurrent_records_distinct_keys() {
        let registry = Arc::new(IdRegistry::new());
        let mut handles = Vec::new();

        for i in 0..64 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.record(
                    ResourceType::Asset,
                    &format!("asset-{i}"),
                    SourceId(i),
                    DestinationId(1000 + i),
                    None,
                    None,
                )
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(registry.len(ResourceType::Asset), 64);
    }
}
