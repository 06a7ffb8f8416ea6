//! Content processing: media analysis, understanding, thread collective
//! understanding and categorization.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use super::{is_due, required_text, PhaseContext, PhaseExecutor, PhaseOutcome, StepReport};
use crate::core::{ContentItem, ItemUpdate, ModelPhase, ModelSelector, Phase, ProcessingStep, ProgressEvent};
use crate::errors::{PipelineError, Result};
use crate::ports::Prompt;
use crate::state::{needs_processing, SubPhaseStatus};
use crate::threads::Thread;

const MEDIA_INSTRUCTION: &str = "Describe this attachment in two or three factual sentences.";
const UNDERSTANDING_INSTRUCTION: &str =
    "Summarize what this post is about and why someone would bookmark it.";
const THREAD_INSTRUCTION: &str =
    "These posts form one thread by the same author. Summarize the thread as a whole.";
const CATEGORIZATION_INSTRUCTION: &str = "Classify the post. Answer with JSON: \
    {\"main_category\": string, \"sub_category\": string, \"item_name\": string}.";

/// The content processing phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentProcessingPhase;

async fn load(ctx: &PhaseContext, id: &str) -> Result<ContentItem> {
    ctx.store
        .get_item(id)
        .await?
        .ok_or_else(|| PipelineError::storage(format!("item '{id}' not found")))
}

async fn analyze_media(ctx: &PhaseContext, id: String) -> Result<ItemUpdate> {
    let item = load(ctx, &id).await?;
    if item.media.is_empty() {
        return Ok(ItemUpdate::MediaAnalyzed {
            descriptions: Vec::new(),
            model: None,
        });
    }

    let mut descriptions = Vec::with_capacity(item.media.len());
    let mut model = None;
    for media in &item.media {
        let context = media.alt_text.clone().unwrap_or_else(|| item.text.clone());
        let prompt = Prompt::new(ModelPhase::Vision, MEDIA_INSTRUCTION, context).with_image(&media.url);
        let (output, selector) = ctx.generate(ModelPhase::Vision, &prompt).await?;
        let description = required_text(&id, "media description", &output.into_text())?;
        descriptions.push((media.url.clone(), description));
        model = Some(selector);
    }
    Ok(ItemUpdate::MediaAnalyzed { descriptions, model })
}

async fn understand(ctx: &PhaseContext, id: String) -> Result<ItemUpdate> {
    let item = load(ctx, &id).await?;
    let mut input = item.text.clone();
    let media = item.media_descriptions();
    if !media.is_empty() {
        input.push_str("\n\nAttachments:\n");
        input.push_str(&media);
    }
    let prompt = Prompt::new(ModelPhase::Understanding, UNDERSTANDING_INSTRUCTION, input);
    let (output, model) = ctx.generate(ModelPhase::Understanding, &prompt).await?;
    Ok(ItemUpdate::Understood {
        summary: required_text(&id, "summary", &output.into_text())?,
        model,
    })
}

async fn categorize(ctx: &PhaseContext, id: String) -> Result<ItemUpdate> {
    let item = load(ctx, &id).await?;
    let input = format!(
        "{}\n\nSummary: {}",
        item.text,
        item.summary.as_deref().unwrap_or_default()
    );
    let prompt = Prompt::new(ModelPhase::Categorization, CATEGORIZATION_INSTRUCTION, input);
    let (output, model) = ctx.generate(ModelPhase::Categorization, &prompt).await?;
    let answer = output
        .into_json()
        .map_err(|e| PipelineError::validation(&id, format!("unparseable categorization: {e}")))?;
    let field = |name: &str| -> Result<String> {
        let value = answer.get(name).and_then(|v| v.as_str()).unwrap_or_default();
        required_text(&id, name, value)
    };
    Ok(ItemUpdate::Categorized {
        main_category: field("main_category")?,
        sub_category: field("sub_category")?,
        item_name: field("item_name")?,
        model,
    })
}

impl ContentProcessingPhase {
    async fn run_sub_phase(
        ctx: &PhaseContext,
        step: ProcessingStep,
        candidates: &[(ContentItem, SubPhaseStatus)],
    ) -> Result<StepReport> {
        let due: Vec<String> = candidates
            .iter()
            .filter(|(item, status)| is_due(item, status, step))
            .map(|(item, _)| item.source_id.clone())
            .collect();
        debug!(step = %step, due = due.len(), "Sub-phase candidates");

        let phase = Phase::ContentProcessing;
        match step {
            ProcessingStep::MediaAnalysis => {
                ctx.run_step(phase, step, due, |id| analyze_media(ctx, id)).await
            }
            ProcessingStep::ContentUnderstanding => {
                ctx.run_step(phase, step, due, |id| understand(ctx, id)).await
            }
            ProcessingStep::Categorization => {
                ctx.run_step(phase, step, due, |id| categorize(ctx, id)).await
            }
            ProcessingStep::Cache => Ok(StepReport::default()),
        }
    }

    /// Builds collective understanding for multi-item threads whose
    /// members are all understood and whose member content changed.
    async fn understand_threads(ctx: &PhaseContext) -> Result<StepReport> {
        let rows = ctx.items_with_status().await?;
        let understood: HashMap<&str, bool> = rows
            .iter()
            .map(|(item, status)| {
                (
                    item.source_id.as_str(),
                    !needs_processing(item, status, ProcessingStep::ContentUnderstanding, false),
                )
            })
            .collect();
        let items: HashMap<String, ContentItem> = rows
            .iter()
            .map(|(item, _)| (item.source_id.clone(), item.clone()))
            .collect();

        let mut due = HashMap::new();
        for thread in ctx.store.list_threads().await? {
            let current = thread.member_ids.iter().all(|id| {
                items
                    .get(id)
                    .is_some_and(|i| i.thread_id.as_deref() == Some(thread.id.as_str()))
            });
            let ready = thread
                .member_ids
                .iter()
                .all(|id| understood.get(id.as_str()).copied().unwrap_or(false));
            if current && ready && thread.needs_understanding(&items) {
                due.insert(thread.id.clone(), thread);
            }
        }
        let total = due.len();
        let ids: Vec<String> = due.keys().cloned().collect();
        let due = &due;
        let items = &items;

        let report = ctx
            .run_pooled(
                Phase::ContentProcessing,
                None,
                ids,
                |id| async move {
                    let thread = due
                        .get(&id)
                        .ok_or_else(|| PipelineError::Internal(format!("unknown thread '{id}'")))?;
                    let input = thread
                        .member_ids
                        .iter()
                        .filter_map(|m| items.get(m))
                        .map(|i| format!("- {}", i.summary.as_deref().unwrap_or(&i.text)))
                        .collect::<Vec<_>>()
                        .join("\n");
                    let prompt = Prompt::new(ModelPhase::Understanding, THREAD_INSTRUCTION, input);
                    let (output, model) = ctx.generate(ModelPhase::Understanding, &prompt).await?;
                    let summary = required_text(&thread.root_id, "thread summary", &output.into_text())?;
                    Ok((summary, thread.member_fingerprint(items), model))
                },
                |id: String, (summary, fingerprint, model): (String, String, ModelSelector)| async move {
                    let _guard = ctx.tracker.locks().acquire(&id).await;
                    let Some(mut thread): Option<Thread> = ctx.store.get_thread(&id).await? else {
                        return Ok(());
                    };
                    thread.collective_understanding = Some(summary);
                    thread.understanding_fingerprint = Some(fingerprint);
                    thread.understanding_model = Some(model);
                    ctx.store.put_thread(&thread).await
                },
            )
            .await?;
        Ok(super::summarize(&report, total))
    }
}

#[async_trait]
impl PhaseExecutor for ContentProcessingPhase {
    fn phase(&self) -> Phase {
        Phase::ContentProcessing
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let start_at = ctx.resume_at.unwrap_or(ProcessingStep::MediaAnalysis);
        let mut outcome = PhaseOutcome::default();

        for step in ProcessingStep::SUB_PHASES {
            if step < start_at {
                continue;
            }
            if ctx.control.should_stop() {
                outcome.interrupted = Some(ctx.control.signal());
                outcome.resume_at = Some(step);
                return Ok(outcome);
            }

            let started = Instant::now();
            ctx.emit(
                ProgressEvent::new("subphase.started", ctx.execution_id)
                    .with_phase(Phase::ContentProcessing)
                    .add_data("sub_phase", serde_json::json!(step)),
            );

            let candidates = ctx.items_with_status().await?;
            let report = Self::run_sub_phase(ctx, step, &candidates).await?;
            outcome.absorb(&report);
            if report.interrupted.is_some() {
                outcome.resume_at = Some(step);
                return Ok(outcome);
            }

            if step == ProcessingStep::ContentUnderstanding && ctx.config.content().thread_understanding {
                let threads = Self::understand_threads(ctx).await?;
                outcome.absorb(&threads);
                if threads.interrupted.is_some() {
                    outcome.resume_at = Some(step);
                    return Ok(outcome);
                }
            }

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            ctx.emit(
                ProgressEvent::new("subphase.completed", ctx.execution_id)
                    .with_phase(Phase::ContentProcessing)
                    .with_progress(report.processed, report.total)
                    .with_elapsed(elapsed_ms)
                    .add_data("sub_phase", serde_json::json!(step))
                    .add_data("failed", serde_json::json!(report.failed)),
            );
            info!(
                execution_id = %ctx.execution_id,
                sub_phase = %step,
                processed = report.processed,
                failed = report.failed,
                "Sub-phase completed"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;
    use crate::core::MediaRef;
    use crate::models::RoutingConfig;
    use crate::phases::test_support::{harness, harness_with, Harness};
    use crate::phases::FetchPhase;
    use crate::pipeline::PipelineConfig;
    use crate::ports::Store;
    use pretty_assertions::assert_eq;

    async fn fetched(h: &Harness) {
        FetchPhase.execute(&h.ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_items_reach_categorized() {
        let mut with_media = raw("2", "bob", 0, None);
        with_media.media = vec![MediaRef::image("https://img/2.png")];
        let h = harness(vec![raw("1", "alice", 0, None), with_media]);
        fetched(&h).await;

        let outcome = ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.failed, 0);
        for id in ["1", "2"] {
            let status = h.ctx.tracker.status(id).await.unwrap();
            assert!(status.is_fully_processed(), "{id} not fully processed");
        }

        let item = h.store.get_item("2").await.unwrap().unwrap();
        assert!(item.media[0].description.is_some());
        assert!(item.summary.is_some());
        assert!(item.category_key().is_some());
        assert!(item.provenance.contains_key(&ModelPhase::Vision));
        // Items without media analyse trivially.
        assert_eq!(h.backend.calls(ModelPhase::Vision), 1);

        let types = h.sink.event_types();
        assert_eq!(types.iter().filter(|t| *t == "subphase.started").count(), 3);
        assert_eq!(types.iter().filter(|t| *t == "subphase.completed").count(), 3);
    }

    #[tokio::test]
    async fn test_item_events_report_progress() {
        let h = harness(vec![
            raw("1", "alice", 0, None),
            raw("2", "bob", 0, None),
            raw("3", "carol", 0, None),
        ]);
        fetched(&h).await;
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();

        let categorized: Vec<_> = h
            .sink
            .events_of_type("item.completed")
            .into_iter()
            .filter(|e| e.data.get("step") == Some(&serde_json::json!("categorization")))
            .collect();
        assert_eq!(categorized.len(), 3);
        let mut counts: Vec<usize> = categorized.iter().map(|e| e.processed).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2, 3]);
        assert!(categorized.iter().all(|e| e.total == 3));
        assert!(categorized.iter().all(|e| e.elapsed_ms >= 0.0));
        assert!(categorized.iter().all(|e| e.phase == Some(Phase::ContentProcessing)));
    }

    #[tokio::test]
    async fn test_second_run_makes_no_ai_calls() {
        let h = harness(vec![raw("1", "alice", 0, None), raw("2", "bob", 0, None)]);
        fetched(&h).await;
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        let first = h.store.get_item("1").await.unwrap().unwrap();
        let calls = h.backend.generate_calls();

        let outcome = ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.total, 0);
        assert_eq!(h.backend.generate_calls(), calls);
        assert_eq!(h.store.get_item("1").await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_empty_category_parks_item_for_review() {
        let h = harness(vec![raw("1", "alice", 0, None), raw("2", "bob", 0, None)]);
        h.backend.set_category_for("post 2", "", "Nothing");
        fetched(&h).await;

        let outcome = ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.failed, 1);
        let status = h.ctx.tracker.status("2").await.unwrap();
        assert!(status.content_understood);
        assert!(!status.categorized);
        assert!(status.needs_review);
        assert_eq!(status.errors.len(), 1);
        assert!(h.ctx.tracker.status("1").await.unwrap().categorized);

        // Parked items are not retried on the next pass.
        let calls = h.backend.generate_calls();
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(h.backend.generate_calls(), calls);
    }

    #[tokio::test]
    async fn test_thread_collective_understanding() {
        let h = harness(vec![
            raw("a", "alice", 0, None),
            raw("b", "alice", 30, Some("a")),
            raw("c", "carol", 60, None),
        ]);
        fetched(&h).await;
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();

        let thread = h.store.get_thread("thread:a").await.unwrap().unwrap();
        assert!(thread.collective_understanding.is_some());
        assert!(thread.understanding_model.is_some());
        let single = h.store.get_thread("thread:c").await.unwrap().unwrap();
        assert!(single.collective_understanding.is_none());

        // Unchanged members do not regenerate the thread summary.
        let calls = h.backend.generate_calls();
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(h.backend.generate_calls(), calls);
    }

    #[tokio::test]
    async fn test_vision_fallback_is_recorded_as_provenance() {
        let mut with_media = raw("1", "alice", 0, None);
        with_media.media = vec![MediaRef::image("https://img/1.png")];
        let routing = crate::testing::default_routing("local")
            .with_default(ModelPhase::Vision, ModelSelector::new("local", "retired-vision"))
            .with_fallback(ModelPhase::Vision, ModelSelector::new("local", "vision-model"));
        let h = harness_with(vec![with_media], PipelineConfig::default(), routing);
        fetched(&h).await;
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();

        let item = h.store.get_item("1").await.unwrap().unwrap();
        assert_eq!(
            item.provenance.get(&ModelPhase::Vision),
            Some(&ModelSelector::new("local", "vision-model"))
        );
    }

    #[tokio::test]
    async fn test_missing_model_fails_items_not_phase() {
        let routing = RoutingConfig::default();
        let h = harness_with(vec![raw("1", "alice", 0, None)], PipelineConfig::default(), routing);
        fetched(&h).await;

        let outcome = ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.failed, 1);
        let status = h.ctx.tracker.status("1").await.unwrap();
        assert!(status.media_analyzed);
        assert!(!status.content_understood);
        assert!(!status.needs_review);
    }

    #[tokio::test]
    async fn test_resume_starts_at_cursor() {
        let h = harness(vec![raw("1", "alice", 0, None)]);
        fetched(&h).await;
        let ctx = h.ctx.clone().with_resume_at(Some(ProcessingStep::Categorization));
        let outcome = ContentProcessingPhase.execute(&ctx).await.unwrap();
        // Categorization is not due before understanding has run.
        assert_eq!(outcome.total, 0);
        assert!(!h.ctx.tracker.status("1").await.unwrap().media_analyzed);
    }
}
