//! Index generation: article references plus category and root indexes.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::core::{ContentItem, IndexDocument, IndexEntry, IndexScope, Phase, ProcessingStep};
use crate::errors::Result;
use crate::ports::synthesis_path;
use crate::state::{needs_processing, SubPhaseStatus};
use crate::utils::{now_utc, slugify};

/// Relative export path of an item's article, once it is categorized.
#[must_use]
pub fn article_ref(item: &ContentItem) -> Option<String> {
    let main = item.main_category.as_deref()?;
    let sub = item.sub_category.as_deref()?;
    let name = item.item_name.as_deref().unwrap_or("post");
    Some(format!(
        "{}/{}/{}-{}.md",
        slugify(main),
        slugify(sub),
        slugify(name),
        slugify(&item.source_id)
    ))
}

/// Items whose categorization is current and not parked for review.
pub(crate) fn is_publishable(item: &ContentItem, status: &SubPhaseStatus) -> bool {
    !status.needs_review && !needs_processing(item, status, ProcessingStep::Categorization, false)
}

/// Strips the leading `<main>/` so category index links resolve from the
/// category directory.
fn relative_to_category(path: &str) -> String {
    path.split_once('/')
        .map_or_else(|| path.to_string(), |(_, rest)| rest.to_string())
}

/// The index generation phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexPhase;

impl IndexPhase {
    /// Writes `article_ref` onto each item whose reference changed.
    async fn assign_refs(ctx: &PhaseContext, items: &[ContentItem]) -> Result<usize> {
        let mut updated = 0;
        for item in items {
            let Some(path) = article_ref(item) else {
                continue;
            };
            if item.article_ref.as_deref() == Some(path.as_str()) {
                continue;
            }
            let _guard = ctx.tracker.locks().acquire(&item.source_id).await;
            if let Some(mut current) = ctx.store.get_item(&item.source_id).await? {
                let path = article_ref(&current);
                if current.article_ref != path {
                    current.article_ref = path;
                    ctx.store.put_item(&current).await?;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn build(ctx: &PhaseContext, items: &[ContentItem]) -> Result<Vec<IndexDocument>> {
        let mut by_main: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();
        for item in items {
            let (Some(main), Some(sub), Some(path)) =
                (&item.main_category, &item.sub_category, article_ref(item))
            else {
                continue;
            };
            by_main.entry(main.clone()).or_default().push(IndexEntry {
                title: item.display_title(),
                path: relative_to_category(&path),
                group: Some(sub.clone()),
            });
        }
        for doc in ctx.store.list_synthesis().await? {
            if doc.is_stale || !by_main.contains_key(&doc.main_category) {
                continue;
            }
            if let Some(entries) = by_main.get_mut(&doc.main_category) {
                entries.push(IndexEntry {
                    title: format!("{} synthesis", doc.sub_category),
                    path: relative_to_category(&synthesis_path(&doc)),
                    group: Some(doc.sub_category.clone()),
                });
            }
        }

        let now = now_utc();
        let mut root_entries = Vec::with_capacity(by_main.len());
        let mut indexes = Vec::with_capacity(by_main.len() + 1);
        for (main, mut entries) in by_main {
            entries.sort_by(|a, b| (&a.group, &a.title, &a.path).cmp(&(&b.group, &b.title, &b.path)));
            let index = IndexDocument {
                scope: IndexScope::Category(main.clone()),
                title: main.clone(),
                entries,
                generated_at: now,
            };
            root_entries.push(IndexEntry {
                title: main,
                path: index.path(),
                group: None,
            });
            indexes.push(index);
        }
        indexes.push(IndexDocument {
            scope: IndexScope::Root,
            title: ctx.config.index().root_title,
            entries: root_entries,
            generated_at: now,
        });
        Ok(indexes)
    }
}

#[async_trait]
impl PhaseExecutor for IndexPhase {
    fn phase(&self) -> Phase {
        Phase::IndexGeneration
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let items: Vec<ContentItem> = ctx
            .items_with_status()
            .await?
            .into_iter()
            .filter(|(item, status)| is_publishable(item, status))
            .map(|(item, _)| item)
            .collect();
        let refs = Self::assign_refs(ctx, &items).await?;

        let existing: HashMap<IndexScope, IndexDocument> = ctx
            .store
            .list_indexes()
            .await?
            .into_iter()
            .map(|i| (i.scope.clone(), i))
            .collect();
        let indexes = Self::build(ctx, &items).await?;
        let total = indexes.len();
        let mut written = 0;
        for index in &indexes {
            let unchanged = existing
                .get(&index.scope)
                .is_some_and(|old| old.title == index.title && old.entries == index.entries);
            if unchanged {
                debug!(path = %index.path(), "Index unchanged");
                continue;
            }
            ctx.store.put_index(index).await?;
            written += 1;
        }

        info!(
            execution_id = %ctx.execution_id,
            articles = items.len(),
            refs_updated = refs,
            indexes = total,
            written,
            "Indexes generated"
        );
        Ok(PhaseOutcome {
            processed: written,
            total,
            ..PhaseOutcome::default()
        })
    }
}
