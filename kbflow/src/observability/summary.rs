//! Wide end-of-run payloads.

use crate::pipeline::PipelineExecution;

/// One JSON object describing a whole execution: status, timing, the
/// cursor and a line per phase.
#[must_use]
pub fn execution_summary(execution: &PipelineExecution) -> serde_json::Value {
    let phases: Vec<serde_json::Value> = execution
        .phases
        .iter()
        .map(|p| {
            let mut entry = serde_json::json!({
                "phase": p.phase,
                "status": p.status,
                "duration_ms": p.duration_ms,
                "processed": p.processed,
                "total": p.total,
                "failed": p.failed,
            });
            if let Some(error) = &p.error {
                entry["error"] = serde_json::json!(error);
            }
            entry
        })
        .collect();

    let mut payload = serde_json::json!({
        "execution_id": execution.id.to_string(),
        "status": execution.status,
        "created_at": execution.created_at.to_rfc3339(),
        "finished_at": execution.finished_at.map(|t| t.to_rfc3339()),
        "items_committed": execution.items_committed,
        "cursor": {
            "phase": execution.cursor.phase(),
            "sub_phase": execution.cursor.sub_phase,
        },
        "phases": phases,
    });
    if let Some(error) = &execution.error {
        payload["error"] = serde_json::json!(error);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, Phase, PhaseStatus};
    use crate::pipeline::PipelineConfig;

    #[test]
    fn test_summary_lists_every_phase() {
        let mut execution = PipelineExecution::new(PipelineConfig::default());
        execution.begin_phase(Phase::Initialization);
        execution.finish_phase(Phase::Initialization, PhaseStatus::Completed, 1.5);
        execution.phase_mut(Phase::Fetch).error = Some("source down".into());
        execution.error = Some("fetch: source down".into());
        execution.set_status(ExecutionStatus::Failed);

        let summary = execution_summary(&execution);
        assert_eq!(summary["status"], "failed");
        assert_eq!(summary["phases"].as_array().unwrap().len(), 7);
        assert_eq!(summary["phases"][0]["status"], "completed");
        assert_eq!(summary["phases"][1]["error"], "source down");
        assert_eq!(summary["cursor"]["phase"], "fetch");
        assert!(summary["finished_at"].is_string());
    }
}
