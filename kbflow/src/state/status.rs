//! Per-item completion record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::ProcessingStep;
use crate::errors::{ErrorKind, PipelineError};
use crate::utils::{now_utc, Timestamp};

/// How many recent errors an item keeps.
pub const ERROR_HISTORY_LIMIT: usize = 5;

/// One recorded processing failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Step that failed.
    pub step: ProcessingStep,
    /// Error classification.
    pub kind: ErrorKind,
    /// Rendered error.
    pub message: String,
    /// When it happened.
    pub at: Timestamp,
}

/// Completion flags and staleness data for one content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPhaseStatus {
    /// The item this record belongs to.
    pub item_id: String,
    /// Raw data captured.
    pub cached: bool,
    /// Media described.
    pub media_analyzed: bool,
    /// Summary written.
    pub content_understood: bool,
    /// Categories assigned.
    pub categorized: bool,
    /// Input fingerprint of each step at the time its flag was set.
    #[serde(default)]
    pub step_fingerprints: BTreeMap<ProcessingStep, String>,
    /// Content fingerprint last seen by the tracker.
    #[serde(default)]
    pub content_fingerprint: String,
    /// Most recent failures, oldest first.
    #[serde(default)]
    pub errors: Vec<StepError>,
    /// Set after a validation failure.
    #[serde(default)]
    pub needs_review: bool,
    /// Last change.
    pub updated_at: Timestamp,
}

impl SubPhaseStatus {
    /// Creates a record with every flag cleared.
    #[must_use]
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            cached: false,
            media_analyzed: false,
            content_understood: false,
            categorized: false,
            step_fingerprints: BTreeMap::new(),
            content_fingerprint: String::new(),
            errors: Vec::new(),
            needs_review: false,
            updated_at: now_utc(),
        }
    }

    /// Value of a step's flag.
    #[must_use]
    pub fn flag(&self, step: ProcessingStep) -> bool {
        match step {
            ProcessingStep::Cache => self.cached,
            ProcessingStep::MediaAnalysis => self.media_analyzed,
            ProcessingStep::ContentUnderstanding => self.content_understood,
            ProcessingStep::Categorization => self.categorized,
        }
    }

    pub(crate) fn set_flag(&mut self, step: ProcessingStep, value: bool) {
        let slot = match step {
            ProcessingStep::Cache => &mut self.cached,
            ProcessingStep::MediaAnalysis => &mut self.media_analyzed,
            ProcessingStep::ContentUnderstanding => &mut self.content_understood,
            ProcessingStep::Categorization => &mut self.categorized,
        };
        *slot = value;
        if !value {
            self.step_fingerprints.remove(&step);
        }
        self.updated_at = now_utc();
    }

    /// First prerequisite of `step` whose flag is false.
    #[must_use]
    pub fn missing_prerequisite(&self, step: ProcessingStep) -> Option<ProcessingStep> {
        step.prerequisites().iter().copied().find(|p| !self.flag(*p))
    }

    /// Share of the four flags that are set, in percent.
    #[must_use]
    pub fn completion_percentage(&self) -> f64 {
        let set = ProcessingStep::ALL
            .iter()
            .filter(|s| self.flag(**s))
            .count();
        #[allow(clippy::cast_precision_loss)]
        let pct = set as f64 / ProcessingStep::ALL.len() as f64 * 100.0;
        pct
    }

    /// Returns true if every flag is set.
    #[must_use]
    pub fn is_fully_processed(&self) -> bool {
        ProcessingStep::ALL.iter().all(|s| self.flag(*s))
    }

    /// Appends a failure, dropping the oldest beyond the history limit.
    pub fn push_error(&mut self, step: ProcessingStep, error: &PipelineError) {
        self.errors.push(StepError {
            step,
            kind: error.kind(),
            message: error.to_string(),
            at: now_utc(),
        });
        if self.errors.len() > ERROR_HISTORY_LIMIT {
            let excess = self.errors.len() - ERROR_HISTORY_LIMIT;
            self.errors.drain(..excess);
        }
        if error.kind() == ErrorKind::Validation {
            self.needs_review = true;
        }
        self.updated_at = now_utc();
    }
}
