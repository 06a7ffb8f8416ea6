//! Embedding generation for items and synthesis documents.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::core::{CategoryKey, ContentItem, EmbeddingRecord, ModelPhase, ModelSelector, Phase, ProcessingStep};
use crate::errors::{PipelineError, Result};
use crate::state::needs_processing;

/// The embedding generation phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingPhase;

/// Something that needs a vector.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    Item { id: String, fingerprint: String },
    Synthesis { key: CategoryKey, fingerprint: String },
}

impl Target {
    fn lock_key(&self) -> String {
        match self {
            Self::Item { id, .. } => id.clone(),
            Self::Synthesis { key, .. } => format!("synthesis:{key}"),
        }
    }
}

/// Text an item's embedding is computed from.
fn item_text(item: &ContentItem) -> String {
    let mut parts = vec![item.display_title()];
    if let (Some(main), Some(sub)) = (&item.main_category, &item.sub_category) {
        parts.push(format!("{main} / {sub}"));
    }
    if let Some(summary) = &item.summary {
        parts.push(summary.clone());
    }
    parts.push(item.text.clone());
    parts.join("\n")
}

fn is_current(record: Option<&EmbeddingRecord>, fingerprint: &str) -> bool {
    record.is_some_and(|r| r.fingerprint == fingerprint)
}

impl EmbeddingPhase {
    async fn collect(ctx: &PhaseContext) -> Result<Vec<(Target, String)>> {
        let mut targets = Vec::new();
        for (item, status) in ctx.items_with_status().await? {
            if status.needs_review
                || needs_processing(&item, &status, ProcessingStep::Categorization, false)
            {
                continue;
            }
            let fingerprint = item.knowledge_fingerprint();
            if !is_current(item.embedding.as_ref(), &fingerprint) {
                let text = item_text(&item);
                targets.push((
                    Target::Item {
                        id: item.source_id,
                        fingerprint,
                    },
                    text,
                ));
            }
        }
        for doc in ctx.store.list_synthesis().await? {
            if doc.is_stale {
                continue;
            }
            let fingerprint = doc.embedding_fingerprint();
            if !is_current(doc.embedding.as_ref(), &fingerprint) {
                targets.push((
                    Target::Synthesis {
                        key: doc.key(),
                        fingerprint,
                    },
                    format!("{} / {}\n{}", doc.main_category, doc.sub_category, doc.content),
                ));
            }
        }
        Ok(targets)
    }

    /// Stores one vector if its source has not changed since the batch
    /// was built. Returns false when the write was skipped.
    async fn store_vector(
        ctx: &PhaseContext,
        target: &Target,
        vector: Vec<f32>,
        model: &ModelSelector,
    ) -> Result<bool> {
        let _guard = ctx.tracker.locks().acquire(&target.lock_key()).await;
        match target {
            Target::Item { id, fingerprint } => {
                let Some(mut item) = ctx.store.get_item(id).await? else {
                    return Ok(false);
                };
                if item.knowledge_fingerprint() != *fingerprint {
                    return Ok(false);
                }
                item.embedding = Some(EmbeddingRecord {
                    vector,
                    fingerprint: fingerprint.clone(),
                    model: model.clone(),
                });
                item.record_provenance(ModelPhase::Embedding, model.clone());
                ctx.store.put_item(&item).await?;
            }
            Target::Synthesis { key, fingerprint } => {
                let Some(mut doc) = ctx.store.get_synthesis(key).await? else {
                    return Ok(false);
                };
                if doc.embedding_fingerprint() != *fingerprint {
                    return Ok(false);
                }
                doc.embedding = Some(EmbeddingRecord {
                    vector,
                    fingerprint: fingerprint.clone(),
                    model: model.clone(),
                });
                doc.provenance.insert(ModelPhase::Embedding, model.clone());
                ctx.store.put_synthesis(&doc).await?;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl PhaseExecutor for EmbeddingPhase {
    fn phase(&self) -> Phase {
        Phase::EmbeddingGeneration
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let batch_size = ctx.config.embedding().batch_size;
        let targets = Self::collect(ctx).await?;
        let total = targets.len();
        if total == 0 {
            debug!("All embeddings current");
            return Ok(PhaseOutcome::default());
        }

        let batches: BTreeMap<String, Vec<(Target, String)>> = targets
            .chunks(batch_size)
            .enumerate()
            .map(|(n, chunk)| (format!("batch-{n:04}"), chunk.to_vec()))
            .collect();
        let ids: Vec<String> = batches.keys().cloned().collect();
        let batches = &batches;

        let report = ctx
            .run_pooled(
                Phase::EmbeddingGeneration,
                None,
                ids,
                |id| async move {
                    let batch = batches
                        .get(&id)
                        .ok_or_else(|| PipelineError::Internal(format!("unknown batch '{id}'")))?;
                    let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
                    let resolution = ctx
                        .router
                        .resolve(ModelPhase::Embedding, ctx.config.override_for(ModelPhase::Embedding))
                        .await?;
                    let backend = ctx.router.backend_for(&resolution.selector)?;
                    let vectors = backend.embed(&texts, &resolution.selector).await?;
                    if vectors.len() != texts.len() {
                        return Err(PipelineError::Internal(format!(
                            "embedding backend returned {} vectors for {} inputs",
                            vectors.len(),
                            texts.len()
                        )));
                    }
                    Ok((vectors, resolution.selector))
                },
                |id, (vectors, model): (Vec<Vec<f32>>, ModelSelector)| async move {
                    let batch = batches
                        .get(&id)
                        .ok_or_else(|| PipelineError::Internal(format!("unknown batch '{id}'")))?;
                    let mut written = 0usize;
                    for ((target, _), vector) in batch.iter().zip(vectors) {
                        if Self::store_vector(ctx, target, vector, &model).await? {
                            written += 1;
                        }
                    }
                    Ok(written)
                },
            )
            .await?;

        let processed: usize = report.completed.iter().map(|(_, n)| n).sum();
        let failed: usize = report
            .failed
            .iter()
            .filter_map(|(id, _)| batches.get(id))
            .map(Vec::len)
            .sum();
        info!(
            execution_id = %ctx.execution_id,
            targets = total,
            batches = batches.len(),
            written = processed,
            "Embeddings generated"
        );
        Ok(PhaseOutcome {
            processed,
            total,
            failed,
            interrupted: report.interrupted,
            resume_at: None,
        })
    }
}
