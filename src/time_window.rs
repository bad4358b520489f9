// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time window resolution for datapoint replication.
//!
//! Accepted forms:
//!
//! ```text
//! 1700000000      absolute epoch seconds
//! "now"           the run's captured instant
//! "2w-ago"        <integer>(s|m|h|d|w)-ago, relative to the captured instant
//! ```
//!
//! A [`WindowResolver`] captures "now" once, so the start and end of a
//! window are computed against the same instant however long resolution takes.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;
const WEEK_MS: i64 = 604_800_000;

/// A configured time bound, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeExpr {
    /// Absolute epoch seconds.
    Absolute(i64),
    /// `now` or `<n><unit>-ago`.
    Expression(String),
}

impl TimeExpr {
    pub fn now() -> Self {
        Self::Expression("now".to_string())
    }

    pub fn ago(expr: impl Into<String>) -> Self {
        Self::Expression(expr.into())
    }
}

impl fmt::Display for TimeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(secs) => write!(f, "{secs}"),
            Self::Expression(expr) => f.write_str(expr),
        }
    }
}

/// Resolved `[start, end]` in epoch millis. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: i64,
    end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(ReplicationError::Config(format!(
                "time window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Narrow the start, e.g. to resume after the latest written point.
    ///
    /// Returns `None` if nothing of the window remains.
    pub fn starting_at(&self, start: i64) -> Option<Self> {
        let start = start.max(self.start);
        (start <= self.end).then_some(Self {
            start,
            end: self.end,
        })
    }
}

/// Resolves [`TimeExpr`]s against a single captured instant.
#[derive(Debug, Clone, Copy)]
pub struct WindowResolver {
    now_ms: i64,
}

impl WindowResolver {
    /// Capture the current wall-clock time.
    pub fn new() -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self { now_ms }
    }

    /// Resolve against a fixed instant.
    pub fn at(now_ms: i64) -> Self {
        Self { now_ms }
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Resolve one bound to epoch millis.
    pub fn resolve(&self, expr: &TimeExpr) -> Result<i64> {
        match expr {
            TimeExpr::Absolute(secs) => {
                if *secs < 0 {
                    return Err(ReplicationError::Config(format!(
                        "negative absolute timestamp: {secs}"
                    )));
                }
                secs.checked_mul(SECOND_MS).ok_or_else(|| {
                    ReplicationError::Config(format!("absolute timestamp out of range: {secs}"))
                })
            }
            TimeExpr::Expression(raw) => self.resolve_expression(raw.trim()),
        }
    }

    /// Resolve both bounds and check `start <= end`.
    pub fn resolve_window(&self, start: &TimeExpr, end: &TimeExpr) -> Result<TimeWindow> {
        let start_ms = self.resolve(start)?;
        let end_ms = self.resolve(end)?;
        TimeWindow::new(start_ms, end_ms)
    }

    fn resolve_expression(&self, raw: &str) -> Result<i64> {
        if raw == "now" {
            return Ok(self.now_ms);
        }

        let malformed = || {
            ReplicationError::Config(format!(
                "malformed time expression {raw:?}: expected \"now\", epoch seconds or <n>(s|m|h|d|w)-ago"
            ))
        };

        let relative = raw.strip_suffix("-ago").ok_or_else(malformed)?;
        let unit = relative.chars().last().ok_or_else(malformed)?;
        let magnitude = &relative[..relative.len() - unit.len_utf8()];

        let unit_ms = match unit {
            's' => SECOND_MS,
            'm' => MINUTE_MS,
            'h' => HOUR_MS,
            'd' => DAY_MS,
            'w' => WEEK_MS,
            _ => return Err(malformed()),
        };

        if magnitude.starts_with('-') {
            return Err(ReplicationError::Config(format!(
                "negative magnitude in time expression {raw:?}"
            )));
        }
        // Plain decimal only: no sign, no padding.
        if magnitude.is_empty()
            || !magnitude.bytes().all(|b| b.is_ascii_digit())
            || (magnitude.len() > 1 && magnitude.starts_with('0'))
        {
            return Err(malformed());
        }
        let magnitude: i64 = magnitude.parse().map_err(|_| malformed())?;

        magnitude
            .checked_mul(unit_ms)
            .and_then(|offset| self.now_ms.checked_sub(offset))
            .ok_or_else(|| ReplicationError::Config(format!("time expression out of range: {raw:?}")))
    }
}

impl Default for WindowResolver {
    fn default() -> Self {
        Self::new()
    }
}
