// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Diff engine: what to create, update and delete for one resource type.
//!
//! # Decision per filtered source entity
//!
//! ```text
//! no mapping                          → create
//! mapping with watermark w:
//!     last_updated_time > w           → update
//!     otherwise                       → unchanged
//! mapping without watermark:
//!     content hash differs/unknown    → update
//!     otherwise                       → unchanged
//! ```
//!
//! Deletions come from the [`DeletionPolicyEngine`], never from raw diffing.
//!
//! Parent references are re-mapped into the destination id space with
//! [`resolve_parents`] right before a create or update is issued, so that
//! parents created earlier in the same run are found.

use crate::deletion::{DeletionCandidate, DeletionPolicyEngine, Protected};
use crate::entity::{DestinationId, Entity, ResourceType};
use crate::registry::{IdRegistry, MappingEntry};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// A mapped source entity that needs an update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateTarget {
    pub entity: Entity,
    pub destination_id: DestinationId,
}

impl AsRef<Entity> for UpdateTarget {
    fn as_ref(&self) -> &Entity {
        &self.entity
    }
}

impl AsRef<Entity> for Entity {
    fn as_ref(&self) -> &Entity {
        self
    }
}

/// Work for one resource type in one run. The three sets are disjoint.
#[derive(Debug, Clone, Default)]
pub struct ReplicationPlan {
    pub to_create: Vec<Entity>,
    pub to_update: Vec<UpdateTarget>,
    pub to_delete: Vec<DeletionCandidate>,
    /// Mapped entities already up to date.
    pub unchanged: usize,
}

impl ReplicationPlan {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

pub struct DiffEngine;

impl DiffEngine {
    /// Build the plan for one resource type.
    ///
    /// `source` must already be filtered. `destination` is the snapshot the
    /// registry was indexed from.
    pub fn plan(
        resource: ResourceType,
        source: &[Entity],
        destination: &[Entity],
        registry: &IdRegistry,
        deletion: &DeletionPolicyEngine,
    ) -> ReplicationPlan {
        let mut plan = ReplicationPlan::default();
        let mut seen: HashSet<&str> = HashSet::with_capacity(source.len());

        for entity in source {
            let Some(external_id) = entity.external_id.as_deref() else {
                continue;
            };
            if !seen.insert(external_id) {
                warn!(resource = %resource, external_id, "Duplicate external id in source, ignoring");
                continue;
            }

            match registry.entry(resource, external_id) {
                None => plan.to_create.push(entity.clone()),
                Some(entry) if needs_update(entity, &entry) => plan.to_update.push(UpdateTarget {
                    entity: entity.clone(),
                    destination_id: entry.destination_id,
                }),
                Some(_) => plan.unchanged += 1,
            }
        }

        let protected = Protected {
            external_ids: plan
                .to_create
                .iter()
                .chain(plan.to_update.iter().map(|u| &u.entity))
                .filter_map(|e| e.external_id.as_deref())
                .collect(),
            destination_ids: plan.to_update.iter().map(|u| u.destination_id).collect(),
        };
        plan.to_delete = deletion.candidates(resource, registry, &seen, destination, &protected);

        debug!(
            resource = %resource,
            create = plan.to_create.len(),
            update = plan.to_update.len(),
            delete = plan.to_delete.len(),
            unchanged = plan.unchanged,
            "Planned replication"
        );
        plan
    }
}

/// Watermark comparison, falling back to the content hash.
pub fn needs_update(entity: &Entity, entry: &MappingEntry) -> bool {
    match entry.watermark {
        Some(watermark) => entity.last_updated_time > watermark,
        None => entry.payload_hash.as_deref() != Some(entity.content_hash().as_str()),
    }
}

/// Split entities into hierarchy levels: roots first, then their children.
///
/// An entity is a root if it has no parent or its parent is not in the set.
/// Entities caught in a reference cycle end up together in the last level
/// and are left for parent resolution to reject.
pub fn hierarchy_levels(entities: Vec<Entity>) -> Vec<Vec<Entity>> {
    let mut levels = Vec::new();
    let mut remaining = entities;

    while !remaining.is_empty() {
        let pending: HashSet<String> = remaining
            .iter()
            .filter_map(|e| e.external_id.clone())
            .collect();

        let (level, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|e| {
            e.parent_external_id
                .as_ref()
                .map_or(true, |parent| !pending.contains(parent))
        });

        if level.is_empty() {
            warn!(entities = rest.len(), "Reference cycle in hierarchy");
            levels.push(rest);
            break;
        }

        levels.push(level);
        remaining = rest;
    }

    levels
}

/// An item whose parent reference has been mapped into the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub item: T,
    pub parent_id: Option<DestinationId>,
}

/// Outcome of re-mapping parent references.
#[derive(Debug)]
pub struct ParentResolution<T> {
    pub ready: Vec<Resolved<T>>,
    /// Parent not mapped yet.
    pub deferred: Vec<T>,
}

/// Look up every item's parent in the registry.
pub fn resolve_parents<T: AsRef<Entity>>(
    resource: ResourceType,
    items: Vec<T>,
    registry: &IdRegistry,
) -> ParentResolution<T> {
    let parent_type = resource.parent_type();
    let mut cache: HashMap<String, Option<DestinationId>> = HashMap::new();
    let mut resolution = ParentResolution {
        ready: Vec::with_capacity(items.len()),
        deferred: Vec::new(),
    };

    for item in items {
        let parent = match (&item.as_ref().parent_external_id, parent_type) {
            (Some(parent), Some(parent_type)) => Some(
                *cache
                    .entry(parent.clone())
                    .or_insert_with(|| registry.lookup(parent_type, parent)),
            ),
            _ => None,
        };

        match parent {
            None => resolution.ready.push(Resolved { item, parent_id: None }),
            Some(Some(parent_id)) => resolution.ready.push(Resolved {
                item,
                parent_id: Some(parent_id),
            }),
            Some(None) => resolution.deferred.push(item),
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::DeletionPolicy;
    use crate::entity::SourceId;
    use serde_json::json;

    fn entity(external_id: &str, updated: i64) -> Entity {
        Entity::new(1, external_id, json!({"name": external_id})).with_updated_time(updated)
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().filter_map(|e| e.external_id.as_deref()).collect()
    }

    #[test]
    fn test_plan_create_update_unchanged() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Event, "old", SourceId(1), DestinationId(10), Some(100), None)
            .unwrap();
        registry
            .record(ResourceType::Event, "same", SourceId(2), DestinationId(11), Some(100), None)
            .unwrap();

        let source = vec![entity("new", 5), entity("old", 101), entity("same", 100)];
        let plan = DiffEngine::plan(
            ResourceType::Event,
            &source,
            &[],
            &registry,
            &DeletionPolicyEngine::default(),
        );

        assert_eq!(ids(&plan.to_create), vec!["new"]);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].destination_id, DestinationId(10));
        assert_eq!(plan.unchanged, 1);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn test_hash_fallback_without_watermark() {
        let changed = entity("x", 0);
        let mut entry = MappingEntry {
            destination_id: DestinationId(1),
            source_id: None,
            watermark: None,
            payload_hash: Some("stale".to_string()),
        };
        assert!(needs_update(&changed, &entry));

        entry.payload_hash = Some(changed.content_hash());
        assert!(!needs_update(&changed, &entry));

        entry.payload_hash = None;
        assert!(needs_update(&changed, &entry));
    }

    #[test]
    fn test_plan_sets_are_disjoint_with_deletion() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Asset, "gone", SourceId(1), DestinationId(10), Some(1), None)
            .unwrap();
        registry
            .record(ResourceType::Asset, "kept", SourceId(2), DestinationId(11), Some(1), None)
            .unwrap();
        // Unmarked destination entity sharing an external id with a new source entity.
        let destination = vec![Entity::new(12, "fresh", json!({}))];

        let deletion = DeletionPolicyEngine::new(DeletionPolicy {
            delete_if_removed_in_source: true,
            delete_if_not_replicated: true,
        });
        let source = vec![entity("kept", 5), entity("fresh", 1)];
        let plan = DiffEngine::plan(ResourceType::Asset, &source, &destination, &registry, &deletion);

        assert_eq!(ids(&plan.to_create), vec!["fresh"]);
        assert_eq!(plan.to_update.len(), 1);
        let deleted: Vec<_> = plan.to_delete.iter().map(|c| c.label()).collect();
        assert_eq!(deleted, vec!["gone"]);
    }

    #[test]
    fn test_duplicate_source_external_id_ignored() {
        let plan = DiffEngine::plan(
            ResourceType::Event,
            &[entity("a", 1), entity("a", 2)],
            &[],
            &IdRegistry::new(),
            &DeletionPolicyEngine::default(),
        );
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.to_create[0].last_updated_time, 1);
    }

    #[test]
    fn test_hierarchy_levels() {
        let entities = vec![
            entity("leaf", 0).with_parent("mid"),
            entity("mid", 0).with_parent("root"),
            entity("root", 0),
            entity("orphan", 0).with_parent("elsewhere"),
        ];
        let levels = hierarchy_levels(entities);
        assert_eq!(levels.len(), 3);
        assert_eq!(ids(&levels[0]), vec!["root", "orphan"]);
        assert_eq!(ids(&levels[1]), vec!["mid"]);
        assert_eq!(ids(&levels[2]), vec!["leaf"]);
    }

    #[test]
    fn test_hierarchy_cycle_terminates() {
        let entities = vec![
            entity("a", 0).with_parent("b"),
            entity("b", 0).with_parent("a"),
            entity("c", 0),
        ];
        let levels = hierarchy_levels(entities);
        assert_eq!(levels.len(), 2);
        assert_eq!(ids(&levels[0]), vec!["c"]);
        assert_eq!(levels[1].len(), 2);
    }

    #[test]
    fn test_resolve_parents() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Asset, "A", SourceId(1), DestinationId(100), None, None)
            .unwrap();

        let items = vec![
            entity("e1", 0).with_parent("A"),
            entity("e2", 0).with_parent("missing"),
            entity("e3", 0),
        ];
        let resolution = resolve_parents(ResourceType::Event, items, &registry);

        assert_eq!(resolution.ready.len(), 2);
        assert_eq!(resolution.ready[0].parent_id, Some(DestinationId(100)));
        assert_eq!(resolution.ready[1].parent_id, None);
        assert_eq!(ids(&resolution.deferred), vec!["e2"]);
    }

    #[test]
    fn test_resolve_parents_for_updates() {
        let registry = IdRegistry::new();
        registry
            .record(ResourceType::Asset, "A", SourceId(1), DestinationId(100), None, None)
            .unwrap();
        let targets = vec![UpdateTarget {
            entity: entity("ts", 0).with_parent("A"),
            destination_id: DestinationId(5),
        }];
        let resolution = resolve_parents(ResourceType::TimeSeries, targets, &registry);
        assert_eq!(resolution.ready[0].item.destination_id, DestinationId(5));
        assert_eq!(resolution.ready[0].parent_id, Some(DestinationId(100)));
    }
}
