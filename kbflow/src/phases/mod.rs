//! Phase executors.
//!
//! One executor per top-level phase. Executors never retry on their own:
//! network-bound work goes through [`PhaseContext::pool`] or
//! [`PhaseContext::guarded`], which apply the run's retry policy, per-call
//! timeout and abort signal. Item-level failures are counted and recorded;
//! phase-level failures are returned as `Err`.

mod content;
mod embedding;
mod fetch;
mod index;
mod initialization;
mod synthesis;
mod sync;

use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::core::{ContentItem, ItemUpdate, ModelPhase, ModelSelector, Phase, ProcessingStep, ProgressEvent};
use crate::errors::{PipelineError, Result};
use crate::events::EventSink;
use crate::models::ModelRouter;
use crate::pipeline::{with_retry, PipelineConfig, PoolReport, RunControl, RunSignal, WorkerPool};
use crate::ports::{ContentSource, Exporter, Generation, ItemQuery, Prompt, Store};
use crate::state::{needs_processing, SubPhaseStatus, SubPhaseTracker};

pub use content::ContentProcessingPhase;
pub use embedding::EmbeddingPhase;
pub use fetch::FetchPhase;
pub use index::{article_ref, IndexPhase};
pub use initialization::InitializationPhase;
pub use synthesis::{synthesis_hash, SynthesisPhase};
pub use sync::ExternalSyncPhase;

/// What a phase executor reports back to the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    /// Units of work that finished.
    pub processed: usize,
    /// Units of work found.
    pub total: usize,
    /// Units of work that failed at item level.
    pub failed: usize,
    /// Set if the phase stopped early for a pause or abort.
    pub interrupted: Option<RunSignal>,
    /// Sub-phase to resume at after an interruption.
    pub resume_at: Option<ProcessingStep>,
}

impl PhaseOutcome {
    /// Folds a step report into the outcome.
    pub fn absorb(&mut self, report: &StepReport) {
        self.processed += report.processed;
        self.total += report.total;
        self.failed += report.failed;
        if self.interrupted.is_none() {
            self.interrupted = report.interrupted;
        }
    }
}

/// Counts for one batch of pooled work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Items handed to the pool.
    pub total: usize,
    /// Items that committed.
    pub processed: usize,
    /// Items that failed.
    pub failed: usize,
    /// Set if the pool stopped for a pause or abort.
    pub interrupted: Option<RunSignal>,
}

/// A pipeline phase.
#[async_trait]
pub trait PhaseExecutor: Send + Sync + Debug {
    /// The phase this executor implements.
    fn phase(&self) -> Phase;

    /// Runs the phase.
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome>;
}

/// The executors for all seven phases, in execution order.
#[must_use]
pub fn default_executors() -> Vec<Arc<dyn PhaseExecutor>> {
    vec![
        Arc::new(InitializationPhase),
        Arc::new(FetchPhase),
        Arc::new(ContentProcessingPhase),
        Arc::new(SynthesisPhase),
        Arc::new(EmbeddingPhase),
        Arc::new(IndexPhase),
        Arc::new(ExternalSyncPhase),
    ]
}

/// Everything a phase executor may touch.
#[derive(Clone)]
pub struct PhaseContext {
    /// Execution being run.
    pub execution_id: Uuid,
    /// Run configuration.
    pub config: Arc<PipelineConfig>,
    /// Persistence.
    pub store: Arc<dyn Store>,
    /// Where posts come from.
    pub source: Arc<dyn ContentSource>,
    /// Model routing.
    pub router: Arc<ModelRouter>,
    /// Flag bookkeeping.
    pub tracker: SubPhaseTracker,
    /// Export target.
    pub exporter: Arc<dyn Exporter>,
    /// Progress notifications.
    pub sink: Arc<dyn EventSink>,
    /// Pause and abort signal.
    pub control: RunControl,
    /// Sub-phase cursor of an interrupted run.
    pub resume_at: Option<ProcessingStep>,
    committed: Arc<AtomicUsize>,
}

impl Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("execution_id", &self.execution_id)
            .field("resume_at", &self.resume_at)
            .field("committed", &self.committed())
            .finish_non_exhaustive()
    }
}

impl PhaseContext {
    /// Creates a context.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        config: Arc<PipelineConfig>,
        store: Arc<dyn Store>,
        source: Arc<dyn ContentSource>,
        router: Arc<ModelRouter>,
        tracker: SubPhaseTracker,
        exporter: Arc<dyn Exporter>,
        sink: Arc<dyn EventSink>,
        control: RunControl,
    ) -> Self {
        Self {
            execution_id,
            config,
            store,
            source,
            router,
            tracker,
            exporter,
            sink,
            control,
            resume_at: None,
            committed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the sub-phase cursor.
    #[must_use]
    pub fn with_resume_at(mut self, step: Option<ProcessingStep>) -> Self {
        self.resume_at = step;
        self
    }

    /// Per-item commits made through this context.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    /// A worker pool configured for this run.
    #[must_use]
    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.config.workers,
            self.config.item_timeout(),
            self.config.retry.clone(),
            self.control.clone(),
        )
        .with_router(self.router.clone())
    }

    /// Sends a progress event without waiting.
    pub fn emit(&self, event: ProgressEvent) {
        self.sink.try_emit(event);
    }

    /// Runs one network-bound call under the retry policy, the per-call
    /// timeout and the abort signal.
    pub async fn guarded<T, F, Fut>(&self, key: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.item_timeout();
        let attempt = with_retry(&self.config.retry, key, Some(&self.router), || {
            let fut = operation();
            async move {
                tokio::time::timeout(timeout, fut).await.unwrap_or_else(|_| {
                    Err(PipelineError::transient(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    )))
                })
            }
        });
        tokio::select! {
            biased;
            () = self.control.aborted() => Err(PipelineError::Cancelled("aborted".into())),
            result = attempt => result,
        }
    }

    /// Resolves a model for `phase` and runs one generation on it.
    ///
    /// Resolution happens on every call so a capability refresh between
    /// retries can move the call to another model.
    pub async fn generate(&self, phase: ModelPhase, prompt: &Prompt) -> Result<(Generation, ModelSelector)> {
        let resolution = self
            .router
            .resolve(phase, self.config.override_for(phase))
            .await?;
        let backend = self.router.backend_for(&resolution.selector)?;
        let output = backend.generate(prompt, &resolution.selector).await?;
        Ok((output, resolution.selector))
    }

    /// Runs `work` then `commit` for every id through the worker pool,
    /// emitting item events as outcomes arrive.
    ///
    /// Returns `Err` with the first phase-level failure; work committed
    /// before it stays committed.
    pub async fn run_pooled<T, U, W, WFut, C, CFut>(
        &self,
        phase: Phase,
        step: Option<ProcessingStep>,
        ids: Vec<String>,
        work: W,
        commit: C,
    ) -> Result<PoolReport<U>>
    where
        W: Fn(String) -> WFut,
        WFut: Future<Output = Result<T>>,
        C: Fn(String, T) -> CFut,
        CFut: Future<Output = Result<U>>,
    {
        let execution_id = self.execution_id;
        let total = ids.len();
        let started = Instant::now();
        let mut settled = 0;
        let mut report = self
            .pool()
            .run(ids, work, commit, |id, outcome| {
                settled += 1;
                let event = match outcome {
                    Ok(_) => ProgressEvent::item_completed(execution_id, phase, id),
                    Err(error) => {
                        ProgressEvent::item_failed(execution_id, phase, id, &error.to_string())
                            .add_data("kind", serde_json::json!(error.kind()))
                    }
                };
                let event = event
                    .with_progress(settled, total)
                    .with_elapsed(started.elapsed().as_secs_f64() * 1000.0);
                let event = match step {
                    Some(step) => event.add_data("step", serde_json::json!(step)),
                    None => event,
                };
                self.emit(event);
            })
            .await;

        self.committed
            .fetch_add(report.completed.len(), Ordering::Relaxed);
        if let Some((id, error)) = report.take_halt_error() {
            tracing::error!(
                execution_id = %execution_id,
                phase = %phase,
                item_id = %id,
                error = %error,
                "Phase-level failure"
            );
            return Err(error);
        }
        Ok(report)
    }

    /// Runs a processing step for `ids`: `work` produces the step's
    /// update, which is committed through the tracker. Item failures are
    /// recorded on the item's status.
    pub async fn run_step<W, WFut>(
        &self,
        phase: Phase,
        step: ProcessingStep,
        ids: Vec<String>,
        work: W,
    ) -> Result<StepReport>
    where
        W: Fn(String) -> WFut,
        WFut: Future<Output = Result<ItemUpdate>>,
    {
        let total = ids.len();
        let tracker = &self.tracker;
        let report = self
            .run_pooled(phase, Some(step), ids, work, |id, update| async move {
                tracker.commit(&id, update).await.map(|_| ())
            })
            .await?;

        for (id, error) in &report.failed {
            tracing::warn!(item_id = %id, step = %step, error = %error, "Step failed");
            self.tracker.record_failure(id, step, error).await?;
        }
        Ok(summarize(&report, total))
    }

    /// Loads every item with its status.
    pub async fn items_with_status(&self) -> Result<Vec<(ContentItem, SubPhaseStatus)>> {
        let items = self.store.query_items(&ItemQuery::All).await?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let status = self.tracker.status(&item.source_id).await?;
            out.push((item, status));
        }
        Ok(out)
    }
}

/// Counts from a pool report.
#[must_use]
pub fn summarize<U>(report: &PoolReport<U>, total: usize) -> StepReport {
    StepReport {
        total,
        processed: report.completed.len(),
        failed: report.failed.len(),
        interrupted: report.interrupted,
    }
}

/// Returns true if `step` should run for an item in this pass: its inputs
/// are complete and current, the item is not parked for review, and the
/// step itself is missing or stale.
#[must_use]
pub fn is_due(item: &ContentItem, status: &SubPhaseStatus, step: ProcessingStep) -> bool {
    if status.needs_review {
        return false;
    }
    let inputs_ready = step
        .prerequisites()
        .iter()
        .all(|p| !needs_processing(item, status, *p, false));
    inputs_ready && needs_processing(item, status, step, false)
}

/// Trims a model answer and rejects an empty one.
pub(crate) fn required_text(item_id: &str, field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation(item_id, format!("empty {field}")));
    }
    Ok(trimmed.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;

    #[test]
    fn test_is_due_requires_fresh_prerequisites() {
        let item = ContentItem::from_raw(raw("1", "alice", 0, None));
        let mut status = SubPhaseStatus::new("1");
        assert!(is_due(&item, &status, ProcessingStep::Cache));
        assert!(!is_due(&item, &status, ProcessingStep::MediaAnalysis));

        status.set_flag(ProcessingStep::Cache, true);
        status
            .step_fingerprints
            .insert(ProcessingStep::Cache, item.step_fingerprint(ProcessingStep::Cache));
        assert!(!is_due(&item, &status, ProcessingStep::Cache));
        assert!(is_due(&item, &status, ProcessingStep::MediaAnalysis));

        status.needs_review = true;
        assert!(!is_due(&item, &status, ProcessingStep::MediaAnalysis));
    }

    #[test]
    fn test_stale_prerequisite_blocks_step() {
        let mut item = ContentItem::from_raw(raw("1", "alice", 0, None));
        let mut status = SubPhaseStatus::new("1");
        status.set_flag(ProcessingStep::Cache, true);
        status
            .step_fingerprints
            .insert(ProcessingStep::Cache, item.step_fingerprint(ProcessingStep::Cache));

        item.text = "edited".into();
        assert!(!is_due(&item, &status, ProcessingStep::MediaAnalysis));
        assert!(is_due(&item, &status, ProcessingStep::Cache));
    }

    #[test]
    fn test_required_text() {
        assert_eq!(required_text("1", "summary", "  ok ").unwrap(), "ok");
        assert!(matches!(
            required_text("1", "summary", "   "),
            Err(PipelineError::Validation { .. })
        ));
    }
}
