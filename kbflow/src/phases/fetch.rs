//! Fetch: ingest posts, detect threads, run the cache step.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{is_due, PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::core::{ContentItem, ItemUpdate, Phase, ProcessingStep, ProgressEvent, RawChange, RawItem};
use crate::errors::{PipelineError, Result};
use crate::threads::{Thread, ThreadDetector};
use crate::utils::{extract_hashtags, extract_links, normalize_whitespace};

/// The fetch phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchPhase;

#[derive(Debug, Default)]
struct IngestCounts {
    created: usize,
    changed: usize,
    unchanged: usize,
}

impl FetchPhase {
    /// Creates or updates the stored item for each raw post.
    async fn ingest(ctx: &PhaseContext, batch: Vec<RawItem>) -> Result<(IngestCounts, Vec<ContentItem>)> {
        let mut counts = IngestCounts::default();
        let mut items = Vec::with_capacity(batch.len());
        for raw in batch {
            let id = raw.source_id.clone();
            let guard = ctx.tracker.locks().acquire(&id).await;
            let item = match ctx.store.get_item(&id).await? {
                None => {
                    let item = ContentItem::from_raw(raw);
                    ctx.store.put_item(&item).await?;
                    counts.created += 1;
                    item
                }
                Some(mut item) => {
                    match item.apply_raw(raw) {
                        RawChange::Unchanged => counts.unchanged += 1,
                        RawChange::MetadataOnly => {
                            ctx.store.put_item(&item).await?;
                            counts.unchanged += 1;
                        }
                        RawChange::ContentChanged => {
                            ctx.store.put_item(&item).await?;
                            counts.changed += 1;
                            debug!(item_id = %id, "Content changed, downstream steps are stale");
                        }
                    }
                    item
                }
            };
            drop(guard);
            ctx.tracker.initialize(&item).await?;
            items.push(item);
        }
        Ok((counts, items))
    }

    /// Detects threads over the batch and writes memberships.
    ///
    /// Items that already belong to a thread keep it unless the run asks
    /// for a rebuild.
    async fn assign_threads(ctx: &PhaseContext, batch: &[ContentItem]) -> Result<usize> {
        let options = ctx.config.fetch();
        let candidates: Vec<ContentItem> = batch
            .iter()
            .filter(|i| options.rebuild_threads || i.thread_id.is_none())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let threads = ThreadDetector::new(options.threads).detect_threads(&candidates);
        for thread in &threads {
            let thread = match ctx.store.get_thread(&thread.id).await? {
                Some(existing) if existing.member_ids == thread.member_ids => existing,
                _ => thread.clone(),
            };
            ctx.store.put_thread(&thread).await?;
            for member in &thread.member_ids {
                Self::set_thread(ctx, member, &thread).await?;
            }
        }
        Ok(threads.iter().filter(|t| t.is_multi_item()).count())
    }

    async fn set_thread(ctx: &PhaseContext, item_id: &str, thread: &Thread) -> Result<()> {
        let _guard = ctx.tracker.locks().acquire(item_id).await;
        let Some(mut item) = ctx.store.get_item(item_id).await? else {
            return Ok(());
        };
        if item.thread_id.as_deref() != Some(thread.id.as_str()) {
            item.thread_id = Some(thread.id.clone());
            ctx.store.put_item(&item).await?;
        }
        Ok(())
    }
}

/// Cache step output for an item.
#[must_use]
pub fn cache_update(item: &ContentItem) -> ItemUpdate {
    let text = normalize_whitespace(&item.text);
    ItemUpdate::Cached {
        links: extract_links(&text),
        hashtags: extract_hashtags(&text),
    }
}

#[async_trait]
impl PhaseExecutor for FetchPhase {
    fn phase(&self) -> Phase {
        Phase::Fetch
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let options = ctx.config.fetch();
        let started = Instant::now();
        let fetched = ctx
            .guarded("fetch", || ctx.source.fetch_items(&options.source))
            .await?;
        let fetched_count = fetched.len();

        // Last occurrence of a duplicated id wins.
        let mut by_id = BTreeMap::new();
        let mut invalid = 0;
        for (position, raw) in fetched.into_iter().enumerate() {
            match raw.validate() {
                Ok(()) => {
                    by_id.insert(raw.source_id.clone(), raw);
                }
                Err(error) => {
                    invalid += 1;
                    warn!(item_id = %raw.source_id, error = %error, "Rejected fetched item");
                    ctx.emit(
                        ProgressEvent::item_failed(
                            ctx.execution_id,
                            Phase::Fetch,
                            &raw.source_id,
                            &error.to_string(),
                        )
                        .with_progress(position + 1, fetched_count)
                        .with_elapsed(started.elapsed().as_secs_f64() * 1000.0),
                    );
                }
            }
        }

        let (counts, batch) = Self::ingest(ctx, by_id.into_values().collect()).await?;
        let threads = Self::assign_threads(ctx, &batch).await?;
        info!(
            execution_id = %ctx.execution_id,
            fetched = fetched_count,
            created = counts.created,
            changed = counts.changed,
            unchanged = counts.unchanged,
            invalid,
            multi_item_threads = threads,
            "Fetch ingested"
        );

        let due: Vec<String> = ctx
            .items_with_status()
            .await?
            .into_iter()
            .filter(|(item, status)| is_due(item, status, ProcessingStep::Cache))
            .map(|(item, _)| item.source_id)
            .collect();
        let store = &ctx.store;
        let cache = ctx
            .run_step(Phase::Fetch, ProcessingStep::Cache, due, |id| async move {
                let item = store
                    .get_item(&id)
                    .await?
                    .ok_or_else(|| PipelineError::storage(format!("item '{id}' not found")))?;
                Ok(cache_update(&item))
            })
            .await?;

        let mut outcome = PhaseOutcome {
            processed: counts.created + counts.changed + counts.unchanged,
            total: fetched_count,
            failed: invalid,
            ..PhaseOutcome::default()
        };
        outcome.failed += cache.failed;
        outcome.interrupted = cache.interrupted;
        Ok(outcome)
    }
}
