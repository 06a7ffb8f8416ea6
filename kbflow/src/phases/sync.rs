//! External sync: materialize the knowledge base and push it out.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::index::is_publishable;
use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::core::Phase;
use crate::errors::Result;
use crate::ports::ExportBundle;

/// The external sync phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalSyncPhase;

impl ExternalSyncPhase {
    async fn bundle(ctx: &PhaseContext) -> Result<ExportBundle> {
        let mut items: Vec<_> = ctx
            .items_with_status()
            .await?
            .into_iter()
            .filter(|(item, status)| item.article_ref.is_some() && is_publishable(item, status))
            .map(|(item, _)| item)
            .collect();
        items.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(ExportBundle {
            items,
            synthesis: ctx.store.list_synthesis().await?,
            indexes: ctx.store.list_indexes().await?,
        })
    }
}

#[async_trait]
impl PhaseExecutor for ExternalSyncPhase {
    fn phase(&self) -> Phase {
        Phase::ExternalSync
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let bundle = Self::bundle(ctx).await?;
        if bundle.is_empty() {
            debug!("Nothing to export");
            return Ok(PhaseOutcome::default());
        }

        let tree = ctx.exporter.materialize(&bundle).await?;
        let outcome = match ctx.guarded("sync", || ctx.exporter.sync(&tree)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(cleanup) = ctx.exporter.release(&tree).await {
                    warn!(root = %tree.root.display(), error = %cleanup, "Could not remove the export tree");
                }
                return Err(err);
            }
        };

        if ctx.config.sync().release_after_sync && outcome.release_ready {
            ctx.exporter.release(&tree).await?;
        } else if !outcome.release_ready {
            warn!(root = %tree.root.display(), "Destination not ready, keeping the export tree");
        }

        info!(
            execution_id = %ctx.execution_id,
            files = tree.files.len(),
            synced = outcome.files_synced,
            "Knowledge base synced"
        );
        Ok(PhaseOutcome {
            processed: outcome.files_synced,
            total: tree.files.len(),
            ..PhaseOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;
    use crate::core::ProcessingStep;
    use crate::errors::PipelineError;
    use crate::phases::test_support::{harness, Harness};
    use crate::phases::{ContentProcessingPhase, FetchPhase, IndexPhase, SynthesisPhase};
    use crate::ports::{Exporter, FileTreeExporter, Materialized, SyncOutcome};
    use std::path::Path;
    use std::sync::Arc;

    /// Stages like the file exporter but cannot reach the destination.
    struct UnreachableDestination(FileTreeExporter);

    #[async_trait]
    impl Exporter for UnreachableDestination {
        async fn materialize(&self, bundle: &ExportBundle) -> Result<Materialized> {
            self.0.materialize(bundle).await
        }

        async fn sync(&self, _tree: &Materialized) -> Result<SyncOutcome> {
            Err(PipelineError::storage("destination unreachable"))
        }

        async fn release(&self, tree: &Materialized) -> Result<()> {
            self.0.release(tree).await
        }
    }

    fn is_empty_dir(dir: &Path) -> bool {
        !dir.exists() || std::fs::read_dir(dir).unwrap().next().is_none()
    }

    fn files_under(dir: &Path) -> Vec<String> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                found.extend(files_under(&path));
            } else {
                found.push(path.file_name().unwrap().to_string_lossy().into_owned());
            }
        }
        found
    }

    async fn prepare(h: &Harness) {
        FetchPhase.execute(&h.ctx).await.unwrap();
        ContentProcessingPhase.execute(&h.ctx).await.unwrap();
        SynthesisPhase.execute(&h.ctx).await.unwrap();
        IndexPhase.execute(&h.ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_store_exports_nothing() {
        let h = harness(vec![]);
        let outcome = ExternalSyncPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::default());
        assert!(!h.staging.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_syncs_articles_indexes_and_synthesis() {
        let h = harness(vec![
            raw("1", "a", 0, None),
            raw("2", "b", 0, None),
            raw("3", "c", 0, None),
        ]);
        prepare(&h).await;

        let outcome = ExternalSyncPhase.execute(&h.ctx).await.unwrap();
        // Three articles, one synthesis, one category index and the root.
        assert_eq!(outcome.total, 6);
        assert_eq!(outcome.processed, 6);

        let out = h.staging.path().join("out");
        assert!(out.join("README.md").exists());
        assert!(out.join("programming/README.md").exists());
        assert!(out.join("programming/rust/_synthesis.md").exists());
        assert!(is_empty_dir(&h.staging.path().join("staging")));

        // Nothing changed, nothing synced.
        let again = ExternalSyncPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(again.total, 6);
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn test_failed_sync_removes_the_export_tree() {
        let mut h = harness(vec![
            raw("1", "a", 0, None),
            raw("2", "b", 0, None),
            raw("3", "c", 0, None),
        ]);
        prepare(&h).await;
        h.ctx.exporter = Arc::new(UnreachableDestination(FileTreeExporter::new(
            h.staging.path().join("staging"),
            h.staging.path().join("out"),
        )));

        let err = ExternalSyncPhase.execute(&h.ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)), "{err}");
        assert!(is_empty_dir(&h.staging.path().join("staging")));
        assert!(!h.staging.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_items_held_for_review_are_not_exported() {
        let h = harness(vec![
            raw("1", "a", 0, None),
            raw("2", "b", 0, None),
            raw("3", "c", 0, None),
        ]);
        prepare(&h).await;
        h.ctx
            .tracker
            .record_failure("2", ProcessingStep::Categorization, &PipelineError::validation("2", "empty category"))
            .await
            .unwrap();

        ExternalSyncPhase.execute(&h.ctx).await.unwrap();
        let exported = files_under(&h.staging.path().join("out"));
        assert!(exported.iter().any(|f| f.ends_with("-1.md")), "{exported:?}");
        assert!(!exported.iter().any(|f| f.ends_with("-2.md")), "{exported:?}");
    }
}
