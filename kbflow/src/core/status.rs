//! Execution and phase status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet started.
    #[default]
    Pending,
    /// Phases are being executed.
    Running,
    /// Paused at an item boundary; the cursor is persisted.
    Paused,
    /// Every phase completed without item failures.
    Completed,
    /// A phase failed and nothing was committed during this run.
    Failed,
    /// Finished or halted with some items committed and some failed.
    Partial,
    /// Stopped by an abort request.
    Aborted,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Partial => write!(f, "partial"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if the execution can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Partial | Self::Aborted
        )
    }

    /// Returns true if a paused or persisted run may continue.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Pending | Self::Running)
    }
}

/// Status of a single phase within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not reached yet.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished, all items succeeded or were already up to date.
    Completed,
    /// Finished, but some items failed.
    Partial,
    /// Skipped by configuration.
    Skipped,
    /// Failed at the phase level.
    Failed,
    /// Interrupted by pause or abort.
    Interrupted,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl PhaseStatus {
    /// Returns true if the next phase may start.
    #[must_use]
    pub fn allows_progression(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Skipped)
    }
}
