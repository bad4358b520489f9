// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replicator.
//!
//! Configuration is passed to [`Replicator::new()`](crate::Replicator::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use catalog_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig {
//!     source_project: "plant-prod".into(),
//!     destination_project: "plant-staging".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── source_project / destination_project
//! ├── resources: [assets, events, timeseries, datapoints]
//! ├── delete_if_removed_in_source / delete_if_not_replicated (flattened)
//! ├── settings: ReplicationSettings
//! │   ├── batch_size, batch_size_datapoints, datapoints_write_batch_size
//! │   ├── number_of_threads, client_timeout
//! │   ├── retry: RetrySettings
//! │   └── rate_limit: Option<RateLimitSettings>
//! ├── filters: { assets, events, timeseries }: FilterConfig
//! └── datapoints: DatapointsConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source_project: "plant-prod"
//! destination_project: "plant-staging"
//! resources: [assets, events, timeseries, datapoints]
//! delete_if_removed_in_source: true
//!
//! settings:
//!   batch_size: 10000
//!   number_of_threads: 10
//!   client_timeout: 120
//!   retry:
//!     max_attempts: 5
//!     initial_delay: "1s"
//!
//! filters:
//!   timeseries:
//!     exclude_pattern: "^tmp_"
//!
//! datapoints:
//!   start: "52w-ago"
//!   end: "now"
//! ```

use crate::deletion::DeletionPolicy;
use crate::entity::ResourceType;
use crate::error::{ReplicationError, Result};
use crate::filter::ResourceFilter;
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::time_window::{TimeExpr, WindowResolver};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Replicator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Project to read from.
    pub source_project: String,

    /// Project to mirror into.
    pub destination_project: String,

    /// Resource types to replicate. Always executed in dependency order.
    #[serde(default = "default_resources")]
    pub resources: Vec<ResourceType>,

    /// Deletion policy flags, both off by default.
    #[serde(flatten)]
    pub deletion: DeletionPolicy,

    #[serde(default)]
    pub settings: ReplicationSettings,

    #[serde(default)]
    pub filters: ResourceFilters,

    #[serde(default)]
    pub datapoints: DatapointsConfig,
}

fn default_resources() -> Vec<ResourceType> {
    vec![
        ResourceType::Asset,
        ResourceType::Event,
        ResourceType::TimeSeries,
        ResourceType::Datapoints,
    ]
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            source_project: "source".to_string(),
            destination_project: "destination".to_string(),
            resources: default_resources(),
            deletion: DeletionPolicy::default(),
            settings: ReplicationSettings::default(),
            filters: ResourceFilters::default(),
            datapoints: DatapointsConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a minimal config for testing: small batches, fast retries.
    pub fn for_testing(source_project: &str, destination_project: &str) -> Self {
        Self {
            source_project: source_project.to_string(),
            destination_project: destination_project.to_string(),
            settings: ReplicationSettings::testing(),
            ..Default::default()
        }
    }

    pub fn replicates(&self, resource: ResourceType) -> bool {
        self.resources.contains(&resource)
    }

    /// Check everything that can be checked without talking to a project.
    pub fn validate(&self) -> Result<()> {
        if self.source_project.trim().is_empty() || self.destination_project.trim().is_empty() {
            return Err(ReplicationError::Config(
                "source_project and destination_project must be set".to_string(),
            ));
        }
        if self.source_project == self.destination_project {
            return Err(ReplicationError::Config(format!(
                "source and destination are the same project ({})",
                self.source_project
            )));
        }
        if self.resources.is_empty() {
            return Err(ReplicationError::Config(
                "no resource types configured".to_string(),
            ));
        }

        self.settings.validate()?;

        for resource in ResourceType::METADATA {
            ResourceFilter::new(resource, self.filters.for_resource(resource))?;
        }

        if self.replicates(ResourceType::Datapoints) {
            WindowResolver::new().resolve_window(&self.datapoints.start, &self.datapoints.end)?;
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: batch sizes, pool size, timeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables shared by every resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Maximum entities per create/update/delete call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Page size when reading datapoints. `None` uses the remote's own limit.
    #[serde(default)]
    pub batch_size_datapoints: Option<usize>,

    /// Maximum datapoints per write call.
    #[serde(default = "default_batch_size")]
    pub datapoints_write_batch_size: usize,

    /// Size of the worker pool shared by all batch work in a run.
    #[serde(default = "default_number_of_threads")]
    pub number_of_threads: usize,

    /// Per-call timeout in seconds.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Optional global request rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_number_of_threads() -> usize {
    10
}

fn default_client_timeout() -> u64 {
    120
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            batch_size_datapoints: None,
            datapoints_write_batch_size: 10_000,
            number_of_threads: 10,
            client_timeout: 120,
            retry: RetrySettings::default(),
            rate_limit: None,
        }
    }
}

impl ReplicationSettings {
    /// Small batches and millisecond retries.
    pub fn testing() -> Self {
        Self {
            batch_size: 100,
            batch_size_datapoints: None,
            datapoints_write_batch_size: 100,
            number_of_threads: 4,
            client_timeout: 5,
            retry: RetrySettings {
                max_attempts: 3,
                initial_delay: "5ms".to_string(),
                max_delay: "50ms".to_string(),
                backoff_factor: 2.0,
            },
            rate_limit: None,
        }
    }

    pub fn client_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    /// Build the retry policy used for every remote call.
    pub fn retry_config(&self) -> Result<RetryConfig> {
        Ok(RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_delay: parse_duration("retry.initial_delay", &self.retry.initial_delay)?,
            max_delay: parse_duration("retry.max_delay", &self.retry.max_delay)?,
            backoff_factor: self.retry.backoff_factor,
            call_timeout: self.client_timeout_duration(),
        })
    }

    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit.as_ref().map(|r| RateLimitConfig {
            burst_size: r.burst,
            refill_rate: r.per_second,
        })
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("datapoints_write_batch_size", self.datapoints_write_batch_size),
            ("number_of_threads", self.number_of_threads),
            ("client_timeout", self.client_timeout as usize),
            ("retry.max_attempts", self.retry.max_attempts),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ReplicationError::Config(format!("{name} must be positive")));
            }
        }
        if self.batch_size_datapoints == Some(0) {
            return Err(ReplicationError::Config(
                "batch_size_datapoints must be positive".to_string(),
            ));
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return Err(ReplicationError::Config(
                "retry.backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if let Some(rate) = &self.rate_limit {
            if rate.per_second == 0 || rate.burst == 0 {
                return Err(ReplicationError::Config(
                    "rate_limit.per_second and rate_limit.burst must be positive".to_string(),
                ));
            }
        }
        self.retry_config().map(|_| ())
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{field}: invalid duration {value:?}: {e}")))
}

/// Retry policy for remote calls, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Human-readable duration, e.g. `"500ms"`.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "60s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: "1s".to_string(),
            max_delay: "60s".to_string(),
            backoff_factor: 2.0,
        }
    }
}

/// Token bucket for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub per_second: u32,
    pub burst: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Exclude pattern and allow-list for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Regex matched against external ids. Matching entities are not replicated.
    #[serde(default)]
    pub exclude_pattern: Option<String>,

    /// If non-empty, only these external ids are replicated.
    #[serde(default)]
    pub external_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceFilters {
    #[serde(default)]
    pub assets: FilterConfig,
    #[serde(default)]
    pub events: FilterConfig,
    #[serde(default)]
    pub timeseries: FilterConfig,
}

impl ResourceFilters {
    /// Datapoints follow the timeseries filter.
    pub fn for_resource(&self, resource: ResourceType) -> &FilterConfig {
        match resource {
            ResourceType::Asset => &self.assets,
            ResourceType::Event => &self.events,
            ResourceType::TimeSeries | ResourceType::Datapoints => &self.timeseries,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DatapointsConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatapointsConfig {
    #[serde(default = "default_datapoints_start")]
    pub start: TimeExpr,

    #[serde(default = "default_datapoints_end")]
    pub end: TimeExpr,

    /// Resume each timeseries after its latest destination datapoint.
    #[serde(default = "default_true")]
    pub incremental: bool,
}

fn default_datapoints_start() -> TimeExpr {
    TimeExpr::ago("52w-ago")
}

fn default_datapoints_end() -> TimeExpr {
    TimeExpr::now()
}

fn default_true() -> bool {
    true
}

impl Default for DatapointsConfig {
    fn default() -> Self {
        Self {
            start: default_datapoints_start(),
            end: default_datapoints_end(),
            incremental: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
