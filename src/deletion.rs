// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deletion policy.
//!
//! All deletion eligibility is decided here. Two independent flags, both off
//! by default:
//!
//! | Flag | Deletes |
//! |------|---------|
//! | `delete_if_removed_in_source` | mapped destination entities whose external id left the filtered source |
//! | `delete_if_not_replicated` | destination entities the registry does not know (never replicated) |
//!
//! Candidates of both policies are unioned. Anything planned for create or
//! update in the same run is never deleted.

use crate::entity::{DestinationId, Entity, ResourceType};
use crate::registry::IdRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Deletion flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionPolicy {
    #[serde(default)]
    pub delete_if_removed_in_source: bool,
    #[serde(default)]
    pub delete_if_not_replicated: bool,
}

impl DeletionPolicy {
    /// True if either flag is set.
    pub fn is_destructive(&self) -> bool {
        self.delete_if_removed_in_source || self.delete_if_not_replicated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeletionReason {
    RemovedInSource,
    NotReplicated,
}

impl fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemovedInSource => f.write_str("removed in source"),
            Self::NotReplicated => f.write_str("not replicated"),
        }
    }
}

/// A destination entity eligible for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionCandidate {
    /// `None` for destination entities without an external id.
    pub external_id: Option<String>,
    pub destination_id: DestinationId,
    pub reason: DeletionReason,
}

impl DeletionCandidate {
    /// External id, or `#<destination id>` when there is none.
    pub fn label(&self) -> String {
        match &self.external_id {
            Some(external_id) => external_id.clone(),
            None => format!("#{}", self.destination_id),
        }
    }
}

/// What the current run is about to create or update; never deleted.
#[derive(Debug, Default)]
pub struct Protected<'a> {
    pub external_ids: HashSet<&'a str>,
    pub destination_ids: HashSet<DestinationId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeletionPolicyEngine {
    policy: DeletionPolicy,
}

impl DeletionPolicyEngine {
    pub fn new(policy: DeletionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DeletionPolicy {
        self.policy
    }

    /// Deletion candidates for one resource type, ordered by destination id.
    ///
    /// `source_external_ids` is the filtered source snapshot; `destination`
    /// is the destination snapshot listed at run start.
    pub fn candidates(
        &self,
        resource: ResourceType,
        registry: &IdRegistry,
        source_external_ids: &HashSet<&str>,
        destination: &[Entity],
        protected: &Protected<'_>,
    ) -> Vec<DeletionCandidate> {
        if !self.policy.is_destructive() {
            return Vec::new();
        }

        let mappings = registry.mappings(resource);
        let mut candidates: BTreeMap<DestinationId, DeletionCandidate> = BTreeMap::new();

        if self.policy.delete_if_removed_in_source {
            for (external_id, destination_id) in &mappings {
                if source_external_ids.contains(external_id.as_str()) {
                    continue;
                }
                candidates.insert(
                    *destination_id,
                    DeletionCandidate {
                        external_id: Some(external_id.clone()),
                        destination_id: *destination_id,
                        reason: DeletionReason::RemovedInSource,
                    },
                );
            }
        }

        if self.policy.delete_if_not_replicated {
            let mapped: HashSet<DestinationId> = mappings.iter().map(|(_, id)| *id).collect();
            for entity in destination {
                let destination_id = DestinationId(entity.id);
                if mapped.contains(&destination_id) {
                    continue;
                }
                // A registry-unknown entity can never also be removed-in-source.
                if let Some(existing) = candidates.get(&destination_id) {
                    debug_assert!(false, "entity {destination_id} is both mapped and unmapped");
                    warn!(
                        resource = %resource,
                        destination_id = %destination_id,
                        kept = %existing.reason,
                        "Deletion candidate matched both policies"
                    );
                    continue;
                }
                candidates.insert(
                    destination_id,
                    DeletionCandidate {
                        external_id: entity.external_id.clone(),
                        destination_id,
                        reason: DeletionReason::NotReplicated,
                    },
                );
            }
        }

        let before = candidates.len();
        let result: Vec<_> = candidates
            .into_values()
            .filter(|c| {
                !protected.destination_ids.contains(&c.destination_id)
                    && !c
                        .external_id
                        .as_deref()
                        .is_some_and(|id| protected.external_ids.contains(id))
            })
            .collect();

        debug!(
            resource = %resource,
            candidates = result.len(),
            protected = before - result.len(),
            "Computed deletion candidates"
        );
        result
    }
}
