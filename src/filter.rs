// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source snapshot filtering.
//!
//! Rules, in order:
//!
//! 1. Entities without an external id are dropped and counted as skipped.
//! 2. A non-empty allow-list keeps only the listed external ids; the exclude
//!    pattern is not consulted.
//! 3. Otherwise entities whose external id matches the exclude pattern are
//!    dropped and counted as excluded.
//!
//! Timeseries named like service-account metrics are always excluded.

use crate::config::FilterConfig;
use crate::entity::{Entity, ResourceType};
use crate::error::Result;
use regex::Regex;
use std::collections::HashSet;

const SERVICE_ACCOUNT_METRICS: &str = "service_account_metrics";

/// Result of filtering one source snapshot.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub retained: Vec<Entity>,
    /// Dropped for lacking an external id.
    pub skipped: usize,
    /// Dropped by the allow-list, the exclude pattern or a built-in rule.
    pub excluded: usize,
}

/// Compiled filter for one resource type.
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    resource: ResourceType,
    exclude: Option<Regex>,
    allow: Option<HashSet<String>>,
}

impl ResourceFilter {
    /// Compile a filter. An invalid exclude pattern is a configuration error.
    pub fn new(resource: ResourceType, config: &FilterConfig) -> Result<Self> {
        let exclude = config
            .exclude_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()?;

        let allow = config
            .external_ids
            .as_ref()
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.iter().cloned().collect());

        Ok(Self {
            resource,
            exclude,
            allow,
        })
    }

    /// A filter that keeps every entity with an external id.
    pub fn pass_through(resource: ResourceType) -> Self {
        Self {
            resource,
            exclude: None,
            allow: None,
        }
    }

    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    /// Check a single external id against the allow-list / exclude pattern.
    pub fn admits(&self, external_id: &str) -> bool {
        match (&self.allow, &self.exclude) {
            (Some(allow), _) => allow.contains(external_id),
            (None, Some(exclude)) => !exclude.is_match(external_id),
            (None, None) => true,
        }
    }

    pub fn apply(&self, snapshot: Vec<Entity>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();

        for entity in snapshot {
            let Some(external_id) = entity.external_id.as_deref() else {
                outcome.skipped += 1;
                continue;
            };

            if !self.admits(external_id) || self.is_builtin_excluded(&entity) {
                outcome.excluded += 1;
                continue;
            }

            outcome.retained.push(entity);
        }

        outcome
    }

    fn is_builtin_excluded(&self, entity: &Entity) -> bool {
        self.resource == ResourceType::TimeSeries
            && entity
                .name()
                .is_some_and(|name| name.contains(SERVICE_ACCOUNT_METRICS))
    }
}
