//! The persisted record of one orchestrator run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PipelineConfig;
use crate::core::{ExecutionStatus, Phase, PhaseStatus, ProcessingStep};
use crate::utils::{now_utc, Timestamp};

/// Status and timing of one phase within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Which phase.
    pub phase: Phase,
    /// Current status.
    pub status: PhaseStatus,
    /// When the phase last started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the phase last finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Wall time of the last attempt.
    #[serde(default)]
    pub duration_ms: f64,
    /// Units of work finished.
    #[serde(default)]
    pub processed: usize,
    /// Units of work found.
    #[serde(default)]
    pub total: usize,
    /// Items that failed.
    #[serde(default)]
    pub failed: usize,
    /// Phase-level error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseRecord {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: 0.0,
            processed: 0,
            total: 0,
            failed: 0,
            error: None,
        }
    }
}

/// Where a paused or interrupted run picks up again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Index into [`Phase::ALL`] of the first phase not yet finished.
    pub phase_index: usize,
    /// Content processing sub-phase to resume at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_phase: Option<ProcessingStep>,
}

impl Cursor {
    /// The phase the cursor points at, or `None` past the last phase.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        Phase::from_index(self.phase_index)
    }
}

/// One orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Run id.
    pub id: Uuid,
    /// Overall status.
    pub status: ExecutionStatus,
    /// Phase being worked on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    /// One record per phase, in execution order.
    pub phases: Vec<PhaseRecord>,
    /// Resume point.
    #[serde(default)]
    pub cursor: Cursor,
    /// Configuration the run was started with.
    pub config: PipelineConfig,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last change.
    pub updated_at: Timestamp,
    /// Set once the status is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Error that ended the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-item step commits made by this run.
    #[serde(default)]
    pub items_committed: usize,
}

impl PipelineExecution {
    /// Creates a pending execution.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let now = now_utc();
        Self {
            id: Uuid::now_v7(),
            status: ExecutionStatus::Pending,
            current_phase: None,
            phases: Phase::ALL.iter().copied().map(PhaseRecord::new).collect(),
            cursor: Cursor::default(),
            config,
            created_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
            items_committed: 0,
        }
    }

    /// Record for `phase`.
    #[must_use]
    pub fn phase(&self, phase: Phase) -> &PhaseRecord {
        &self.phases[phase.index()]
    }

    /// Mutable record for `phase`.
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        &mut self.phases[phase.index()]
    }

    /// Marks `phase` as running.
    pub fn begin_phase(&mut self, phase: Phase) {
        self.current_phase = Some(phase);
        self.cursor.phase_index = phase.index();
        let record = self.phase_mut(phase);
        record.status = PhaseStatus::Running;
        record.started_at = Some(now_utc());
        record.finished_at = None;
        record.error = None;
        self.touch();
    }

    /// Records the end of `phase` and moves the cursor past it when the
    /// phase allows progression.
    pub fn finish_phase(&mut self, phase: Phase, status: PhaseStatus, duration_ms: f64) {
        let record = self.phase_mut(phase);
        record.status = status;
        record.finished_at = Some(now_utc());
        record.duration_ms = duration_ms;
        if status.allows_progression() {
            self.cursor = Cursor {
                phase_index: phase.index() + 1,
                sub_phase: None,
            };
        }
        self.touch();
    }

    /// Sets a terminal or paused status.
    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(now_utc());
            self.current_phase = None;
        }
        self.touch();
    }

    /// Returns true if any phase ended with item failures.
    #[must_use]
    pub fn has_partial_phase(&self) -> bool {
        self.phases.iter().any(|p| p.status == PhaseStatus::Partial)
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}
