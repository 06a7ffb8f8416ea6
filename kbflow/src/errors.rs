//! Error types for the kbflow pipeline.
//!
//! Every phase executor returns `Result<T, PipelineError>`. The orchestrator
//! decides what to do with a failure by looking at its [`ErrorKind`]:
//! transient failures are retried, validation failures park the item for
//! review, ordering violations stop the run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::{ModelPhase, ProcessingStep};

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A network call to the content source or an AI backend failed in a
    /// way that may succeed on a later attempt.
    #[error("Transient network error: {message}")]
    TransientNetwork {
        /// What went wrong.
        message: String,
        /// Backoff requested by the remote side (`Retry-After`).
        retry_after: Option<Duration>,
    },

    /// No model could be resolved for a phase.
    #[error("No model available for phase '{phase}': {reason}")]
    ModelUnavailable {
        /// The model phase that could not be served.
        phase: ModelPhase,
        /// Why every candidate was rejected.
        reason: String,
    },

    /// An item failed its required-field checks after a step.
    #[error("Validation failed for item '{item_id}': {message}")]
    Validation {
        /// The offending item.
        item_id: String,
        /// Which check failed.
        message: String,
    },

    /// A flag was marked complete while one of its prerequisites was false.
    #[error("Ordering violation on item '{item_id}': cannot mark '{step}' before '{missing}'")]
    OrderingViolation {
        /// The item being updated.
        item_id: String,
        /// The step that was marked.
        step: ProcessingStep,
        /// The first prerequisite that is not satisfied.
        missing: ProcessingStep,
    },

    /// The persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The pipeline configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was aborted.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`PipelineError`] used by the retry policy and
/// recorded on failed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried with backoff.
    TransientNetwork,
    /// Retried once after a capability refresh.
    ModelUnavailable,
    /// Not retried; the item is flagged for manual review.
    Validation,
    /// Fatal; aborts the run.
    OrderingViolation,
    /// Propagated immediately; the phase fails.
    Storage,
    /// Invalid configuration.
    Config,
    /// Cancelled by abort.
    Cancelled,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientNetwork => "transient_network",
            Self::ModelUnavailable => "model_unavailable",
            Self::Validation => "validation",
            Self::OrderingViolation => "ordering_violation",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl PipelineError {
    /// Creates a transient network error without a backoff hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a rate-limit error carrying the remote backoff hint.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::TransientNetwork {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            item_id: item_id.into(),
            message: message.into(),
        }
    }

    /// Creates a model-unavailable error.
    #[must_use]
    pub fn model_unavailable(phase: ModelPhase, reason: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            phase,
            reason: reason.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::OrderingViolation { .. } => ErrorKind::OrderingViolation,
            Self::Storage(_) | Self::Io(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the retry policy may attempt the call again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::ModelUnavailable
        )
    }

    /// Returns true if the error must stop the whole run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::OrderingViolation | ErrorKind::Cancelled)
    }

    /// Returns true if the error fails the current phase rather than a
    /// single item.
    #[must_use]
    pub fn is_phase_level(&self) -> bool {
        self.is_fatal() || matches!(self.kind(), ErrorKind::Storage | ErrorKind::Config)
    }

    /// Returns the backoff requested by the remote side, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientNetwork { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Converts to a dictionary representation for progress events.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(delay) = self.retry_after() {
            map.insert(
                "retry_after_ms".to_string(),
                serde_json::json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            );
        }
        map
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
