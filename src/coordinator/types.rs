//! Replicator run state.
//!
//! # State Transitions
//!
//! ```text
//!               run()
//! Created ─────────────→ Bootstrapping
//!    │                        │
//!    │ (invalid config)       │ (destination indexed)
//!    ↓                        ↓
//! Failed ←──────────────  Replicating
//!          (fatal error)      │
//!                             │ (all steps attempted)
//!                             ↓
//!                         Completed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `Replicator::new()`. Nothing listed yet.
//! - **Bootstrapping**: Listing destination snapshots and indexing the registry.
//! - **Replicating**: Running the resource type steps in dependency order.
//! - **Completed**: Run finished and produced a summary, possibly with failures.
//! - **Failed**: Configuration or authentication error. No summary.

/// State of a replicator.
///
/// A replicator runs once; see module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created but not run.
    ///
    /// Call [`run()`](super::Replicator::run) to replicate.
    Created,

    /// Building the identity registry from the destination.
    Bootstrapping,

    /// Replicating resource types.
    Replicating,

    /// Run finished. Check the summary for per-item failures.
    Completed,

    /// Run aborted by a fatal error.
    Failed,
}

impl RunState {
    /// True once the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "Created"),
            RunState::Bootstrapping => write!(f, "Bootstrapping"),
            RunState::Replicating => write!(f, "Replicating"),
            RunState::Completed => write!(f, "Completed"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}
