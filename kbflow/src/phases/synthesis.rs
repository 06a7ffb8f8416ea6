//! Synthesis generation: one document per populated category pair.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::{required_text, summarize, PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::core::{CategoryKey, ContentItem, ModelPhase, Phase, ProcessingStep, SynthesisDocument};
use crate::errors::{PipelineError, Result};
use crate::ports::Prompt;
use crate::state::needs_processing;
use crate::utils::{hash_sorted_pairs, now_utc};

const SYNTHESIS_INSTRUCTION: &str = "Write a synthesis of these bookmarked posts: the themes \
    they share, where they disagree, and what a reader should take away.";

/// Hash over the sorted source ids and their knowledge fingerprints.
#[must_use]
pub fn synthesis_hash(items: &[ContentItem]) -> String {
    let pairs: Vec<(String, String)> = items
        .iter()
        .map(|i| (i.source_id.clone(), i.knowledge_fingerprint()))
        .collect();
    hash_sorted_pairs(&pairs)
}

/// The synthesis generation phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthesisPhase;

struct Job {
    key: CategoryKey,
    items: Vec<ContentItem>,
    hash: String,
    existing: Option<SynthesisDocument>,
}

fn prompt_input(key: &CategoryKey, items: &[ContentItem], cap: usize) -> String {
    let mut out = format!("Category: {} / {}\n\n", key.main, key.sub);
    for item in items.iter().take(cap) {
        out.push_str(&format!(
            "- {}: {}\n",
            item.display_title(),
            item.summary.as_deref().unwrap_or(&item.text)
        ));
    }
    out
}

#[async_trait]
impl PhaseExecutor for SynthesisPhase {
    fn phase(&self) -> Phase {
        Phase::SynthesisGeneration
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let options = ctx.config.synthesis();

        let mut groups: BTreeMap<CategoryKey, Vec<ContentItem>> = BTreeMap::new();
        for (item, status) in ctx.items_with_status().await? {
            if needs_processing(&item, &status, ProcessingStep::Categorization, false) {
                continue;
            }
            if let Some(key) = item.category_key() {
                groups.entry(key).or_default().push(item);
            }
        }
        let mut existing: HashMap<CategoryKey, SynthesisDocument> = ctx
            .store
            .list_synthesis()
            .await?
            .into_iter()
            .map(|d| (d.key(), d))
            .collect();

        let mut jobs = BTreeMap::new();
        let mut unchanged = 0;
        let mut staled = 0;
        for (key, mut items) in groups {
            let current = existing.remove(&key);
            if items.len() < options.min_items {
                if let Some(mut doc) = current {
                    if !doc.is_stale {
                        doc.is_stale = true;
                        doc.updated_at = now_utc();
                        ctx.store.put_synthesis(&doc).await?;
                        staled += 1;
                    }
                }
                continue;
            }
            items.sort_by(|a, b| a.source_id.cmp(&b.source_id));
            let hash = synthesis_hash(&items);
            match current {
                Some(mut doc) if doc.source_hash == hash => {
                    if doc.is_stale {
                        doc.is_stale = false;
                        doc.updated_at = now_utc();
                        ctx.store.put_synthesis(&doc).await?;
                    }
                    unchanged += 1;
                }
                current => {
                    jobs.insert(
                        key.to_string(),
                        Job {
                            key,
                            items,
                            hash,
                            existing: current,
                        },
                    );
                }
            }
        }
        // Categories with no items left at all.
        for (_, mut doc) in existing {
            if !doc.is_stale {
                doc.is_stale = true;
                doc.updated_at = now_utc();
                ctx.store.put_synthesis(&doc).await?;
                staled += 1;
            }
        }
        debug!(due = jobs.len(), unchanged, staled, "Synthesis candidates");

        let total = jobs.len();
        let ids: Vec<String> = jobs.keys().cloned().collect();
        let jobs = &jobs;
        let cap = options.max_items_per_synthesis;
        let report = ctx
            .run_pooled(
                Phase::SynthesisGeneration,
                None,
                ids,
                |id| async move {
                    let job = jobs
                        .get(&id)
                        .ok_or_else(|| PipelineError::Internal(format!("unknown category '{id}'")))?;
                    let prompt = Prompt::new(
                        ModelPhase::Synthesis,
                        SYNTHESIS_INSTRUCTION,
                        prompt_input(&job.key, &job.items, cap),
                    );
                    let (output, model) = ctx.generate(ModelPhase::Synthesis, &prompt).await?;
                    let content = required_text(&id, "synthesis", &output.into_text())?;
                    let ids = job.items.iter().map(|i| i.source_id.clone()).collect();
                    let mut doc = SynthesisDocument::new(&job.key, content, ids, job.hash.clone(), model);
                    if let Some(previous) = &job.existing {
                        doc.created_at = previous.created_at;
                    }
                    Ok(doc)
                },
                |_, doc| async move { ctx.store.put_synthesis(&doc).await },
            )
            .await?;

        info!(
            execution_id = %ctx.execution_id,
            generated = report.completed.len(),
            unchanged,
            staled,
            "Synthesis pass finished"
        );
        let mut outcome = PhaseOutcome::default();
        outcome.absorb(&summarize(&report, total));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;
    use crate::phases::test_support::{harness, Harness};
    use crate::phases::{ContentProcessingPhase, FetchPhase};
    use crate::ports::Store;

    async fn process(h: &Harness) {
        FetchPhase.execute(&h.ctx).await.unwrap();
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();
    }

    fn key() -> CategoryKey {
        CategoryKey::new("Programming", "Rust")
    }

    #[tokio::test]
    async fn test_threshold_generate_and_stale() {
        let h = harness(vec![raw("1", "a", 0, None), raw("2", "b", 0, None)]);
        process(&h).await;

        // Two items: withheld.
        SynthesisPhase.execute(&h.ctx).await.unwrap();
        assert!(h.store.get_synthesis(&key()).await.unwrap().is_none());

        // A third item triggers generation.
        h.source.push(raw("3", "c", 0, None));
        process(&h).await;
        let outcome = SynthesisPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.processed, 1);
        let doc = h.store.get_synthesis(&key()).await.unwrap().unwrap();
        assert_eq!(doc.source_item_ids, vec!["1", "2", "3"]);
        assert!(!doc.is_stale);

        // Back to two: stale, not deleted.
        h.store.delete_item("3").await.unwrap();
        SynthesisPhase.execute(&h.ctx).await.unwrap();
        let doc = h.store.get_synthesis(&key()).await.unwrap().unwrap();
        assert!(doc.is_stale);
        assert_eq!(doc.source_item_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_unchanged_sources_skip_generation() {
        let h = harness(vec![
            raw("1", "a", 0, None),
            raw("2", "b", 0, None),
            raw("3", "c", 0, None),
        ]);
        process(&h).await;
        SynthesisPhase.execute(&h.ctx).await.unwrap();
        let calls = h.backend.calls(ModelPhase::Synthesis);
        assert_eq!(calls, 1);

        let outcome = SynthesisPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.total, 0);
        assert_eq!(h.backend.calls(ModelPhase::Synthesis), calls);
    }

    #[tokio::test]
    async fn test_changed_member_regenerates() {
        let h = harness(vec![
            raw("1", "a", 0, None),
            raw("2", "b", 0, None),
            raw("3", "c", 0, None),
        ]);
        process(&h).await;
        SynthesisPhase.execute(&h.ctx).await.unwrap();
        let first = h.store.get_synthesis(&key()).await.unwrap().unwrap();

        let mut edited = raw("2", "b", 0, None);
        edited.text = "an edited post".into();
        h.source.set_items(vec![raw("1", "a", 0, None), edited, raw("3", "c", 0, None)]);
        process(&h).await;
        SynthesisPhase.execute(&h.ctx).await.unwrap();

        let second = h.store.get_synthesis(&key()).await.unwrap().unwrap();
        assert_ne!(second.source_hash, first.source_hash);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.generated_at >= first.generated_at);
        assert_eq!(h.backend.calls(ModelPhase::Synthesis), 2);
    }

    #[test]
    fn test_hash_ignores_item_order() {
        let a = ContentItem::from_raw(raw("1", "a", 0, None));
        let b = ContentItem::from_raw(raw("2", "b", 0, None));
        assert_eq!(
            synthesis_hash(&[a.clone(), b.clone()]),
            synthesis_hash(&[b, a])
        );
    }
}
