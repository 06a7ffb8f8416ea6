//! Progress events sent to the notification collaborator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::Phase;

/// A progress notification emitted by the orchestrator.
///
/// Delivery is best-effort; sinks must never block the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The event type (e.g., "phase.started", "item.completed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The execution that emitted the event.
    pub execution_id: Uuid,

    /// Phase the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Items processed so far in the phase.
    #[serde(default)]
    pub processed: usize,

    /// Items the phase has to look at.
    #[serde(default)]
    pub total: usize,

    /// Milliseconds since the phase (or run) started.
    #[serde(default)]
    pub elapsed_ms: f64,

    /// Additional payload.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl ProgressEvent {
    /// Creates a new event for an execution.
    #[must_use]
    pub fn new(event_type: impl Into<String>, execution_id: Uuid) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            execution_id,
            phase: None,
            processed: 0,
            total: 0,
            elapsed_ms: 0.0,
            data: HashMap::new(),
        }
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Sets processed and total counts.
    #[must_use]
    pub fn with_progress(mut self, processed: usize, total: usize) -> Self {
        self.processed = processed;
        self.total = total;
        self
    }

    /// Sets the elapsed time.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed_ms: f64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Converts the event to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.event_type));
        map.insert("timestamp".to_string(), serde_json::json!(self.timestamp));
        map.insert(
            "execution_id".to_string(),
            serde_json::json!(self.execution_id.to_string()),
        );
        if let Some(phase) = self.phase {
            map.insert("phase".to_string(), serde_json::json!(phase.as_str()));
        }
        map.insert("processed".to_string(), serde_json::json!(self.processed));
        map.insert("total".to_string(), serde_json::json!(self.total));
        map.insert("elapsed_ms".to_string(), serde_json::json!(self.elapsed_ms));

        if !self.data.is_empty() {
            let data_map: serde_json::Map<String, serde_json::Value> =
                self.data.clone().into_iter().collect();
            map.insert("data".to_string(), serde_json::Value::Object(data_map));
        }

        map
    }

    /// Creates a "phase.started" event.
    #[must_use]
    pub fn phase_started(execution_id: Uuid, phase: Phase) -> Self {
        Self::new("phase.started", execution_id).with_phase(phase)
    }

    /// Creates a "phase.completed" event.
    #[must_use]
    pub fn phase_completed(
        execution_id: Uuid,
        phase: Phase,
        processed: usize,
        total: usize,
        elapsed_ms: f64,
    ) -> Self {
        Self::new("phase.completed", execution_id)
            .with_phase(phase)
            .with_progress(processed, total)
            .with_elapsed(elapsed_ms)
    }

    /// Creates a "phase.failed" event.
    #[must_use]
    pub fn phase_failed(execution_id: Uuid, phase: Phase, error: &str) -> Self {
        Self::new("phase.failed", execution_id)
            .with_phase(phase)
            .add_data("error", serde_json::json!(error))
    }

    /// Creates an "item.completed" event.
    #[must_use]
    pub fn item_completed(execution_id: Uuid, phase: Phase, item_id: &str) -> Self {
        Self::new("item.completed", execution_id)
            .with_phase(phase)
            .add_data("item_id", serde_json::json!(item_id))
    }

    /// Creates an "item.failed" event.
    #[must_use]
    pub fn item_failed(execution_id: Uuid, phase: Phase, item_id: &str, error: &str) -> Self {
        Self::new("item.failed", execution_id)
            .with_phase(phase)
            .add_data("item_id", serde_json::json!(item_id))
            .add_data("error", serde_json::json!(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let id = Uuid::new_v4();
        let event = ProgressEvent::new("pipeline.started", id);
        assert_eq!(event.event_type, "pipeline.started");
        assert_eq!(event.execution_id, id);
        assert!(event.phase.is_none());
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_phase_completed_carries_counts() {
        let event = ProgressEvent::phase_completed(Uuid::nil(), Phase::Fetch, 3, 5, 12.5);
        assert_eq!(event.event_type, "phase.completed");
        assert_eq!(event.phase, Some(Phase::Fetch));
        assert_eq!((event.processed, event.total), (3, 5));

        let dict = event.to_dict();
        assert_eq!(dict.get("phase"), Some(&serde_json::json!("fetch")));
        assert_eq!(dict.get("elapsed_ms"), Some(&serde_json::json!(12.5)));
    }

    #[test]
    fn test_item_failed() {
        let event = ProgressEvent::item_failed(Uuid::nil(), Phase::ContentProcessing, "42", "boom");
        assert_eq!(event.data.get("item_id"), Some(&serde_json::json!("42")));
        assert_eq!(event.data.get("error"), Some(&serde_json::json!("boom")));
    }

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent::phase_started(Uuid::nil(), Phase::SynthesisGeneration);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"phase.started""#));
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase, Some(Phase::SynthesisGeneration));
    }
}
