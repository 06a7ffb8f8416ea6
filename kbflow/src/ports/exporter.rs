//! File/export collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::{ContentItem, IndexDocument, SynthesisDocument};
use crate::errors::{PipelineError, Result};
use crate::utils::slugify;

/// Everything the sync phase hands to the exporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    /// Items that have an article reference.
    pub items: Vec<ContentItem>,
    /// Current synthesis documents (stale ones included, marked as such).
    pub synthesis: Vec<SynthesisDocument>,
    /// Category and root indexes.
    pub indexes: Vec<IndexDocument>,
}

impl ExportBundle {
    /// Total number of documents in the bundle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len() + self.synthesis.len() + self.indexes.len()
    }

    /// Returns true if there is nothing to export.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transient file tree produced by [`Exporter::materialize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Materialized {
    /// Root of the tree.
    pub root: PathBuf,
    /// Paths relative to `root`.
    pub files: Vec<String>,
}

/// Result of [`Exporter::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Files whose content changed at the destination.
    pub files_synced: usize,
    /// The temporary tree may now be deleted.
    pub release_ready: bool,
}

/// Writes the knowledge base somewhere outside the pipeline.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Writes the bundle into a temporary file tree.
    async fn materialize(&self, bundle: &ExportBundle) -> Result<Materialized>;

    /// Pushes a materialized tree to the destination.
    async fn sync(&self, tree: &Materialized) -> Result<SyncOutcome>;

    /// Deletes the temporary tree.
    async fn release(&self, tree: &Materialized) -> Result<()>;
}

/// Writes markdown files under a staging directory and mirrors them into a
/// destination directory.
#[derive(Debug, Clone)]
pub struct FileTreeExporter {
    staging_root: PathBuf,
    destination: PathBuf,
}

impl FileTreeExporter {
    /// Creates an exporter.
    #[must_use]
    pub fn new(staging_root: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            destination: destination.into(),
        }
    }

    async fn write_file(root: &Path, relative: &str, body: &str) -> Result<()> {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    fn render_item(item: &ContentItem) -> String {
        let mut out = format!("# {}\n\n", item.display_title());
        if let Some(summary) = &item.summary {
            out.push_str(summary);
            out.push_str("\n\n");
        }
        out.push_str("> ");
        out.push_str(&item.text.replace('\n', "\n> "));
        out.push_str("\n\n");
        for media in &item.media {
            if let Some(description) = &media.description {
                out.push_str(&format!("- {} ({}): {}\n", media.kind, media.url, description));
            }
        }
        for link in &item.links {
            out.push_str(&format!("- <{link}>\n"));
        }
        out.push_str(&format!(
            "\n_{} · {}_\n",
            item.metadata.author_handle,
            item.metadata.created_at.to_rfc3339()
        ));
        out
    }

    fn render_synthesis(doc: &SynthesisDocument) -> String {
        let mut out = format!("# {} / {}\n\n", doc.main_category, doc.sub_category);
        if doc.is_stale {
            out.push_str("_This synthesis is stale._\n\n");
        }
        out.push_str(&doc.content);
        out.push('\n');
        out
    }
}

/// Path a synthesis document is exported to.
#[must_use]
pub fn synthesis_path(doc: &SynthesisDocument) -> String {
    format!(
        "{}/{}/_synthesis.md",
        slugify(&doc.main_category),
        slugify(&doc.sub_category)
    )
}

#[async_trait]
impl Exporter for FileTreeExporter {
    async fn materialize(&self, bundle: &ExportBundle) -> Result<Materialized> {
        let root = self
            .staging_root
            .join(format!("export-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&root).await?;

        let mut files = Vec::with_capacity(bundle.len());
        for item in &bundle.items {
            let Some(path) = &item.article_ref else {
                continue;
            };
            Self::write_file(&root, path, &Self::render_item(item)).await?;
            files.push(path.clone());
        }
        for doc in &bundle.synthesis {
            let path = synthesis_path(doc);
            Self::write_file(&root, &path, &Self::render_synthesis(doc)).await?;
            files.push(path);
        }
        for index in &bundle.indexes {
            let path = index.path();
            Self::write_file(&root, &path, &index.to_markdown()).await?;
            files.push(path);
        }
        files.sort();
        debug!(root = %root.display(), files = files.len(), "Export tree materialized");
        Ok(Materialized { root, files })
    }

    async fn sync(&self, tree: &Materialized) -> Result<SyncOutcome> {
        let mut files_synced = 0;
        for relative in &tree.files {
            let body = tokio::fs::read(tree.root.join(relative)).await?;
            let target = self.destination.join(relative);
            if let Ok(existing) = tokio::fs::read(&target).await {
                if existing == body {
                    continue;
                }
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, body).await?;
            files_synced += 1;
        }
        info!(
            destination = %self.destination.display(),
            files_synced,
            "Export synced"
        );
        Ok(SyncOutcome {
            files_synced,
            release_ready: true,
        })
    }

    async fn release(&self, tree: &Materialized) -> Result<()> {
        if !tree.root.starts_with(&self.staging_root) {
            return Err(PipelineError::Internal(format!(
                "refusing to delete {} outside the staging root",
                tree.root.display()
            )));
        }
        tokio::fs::remove_dir_all(&tree.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;
    use crate::core::{CategoryKey, ModelSelector};

    fn bundle() -> ExportBundle {
        let mut item = ContentItem::from_raw(raw("1", "alice", 0, None));
        item.item_name = Some("Tokio tips".into());
        item.summary = Some("How to use tokio.".into());
        item.article_ref = Some("rust/async/tokio-tips.md".into());

        let doc = SynthesisDocument::new(
            &CategoryKey::new("Rust", "Async"),
            "Overview".into(),
            vec!["1".into()],
            "h".into(),
            ModelSelector::new("a", "b"),
        );
        ExportBundle {
            items: vec![item],
            synthesis: vec![doc],
            indexes: vec![],
        }
    }

    #[tokio::test]
    async fn test_materialize_sync_release() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let exporter = FileTreeExporter::new(staging.path(), dest.path());

        let tree = exporter.materialize(&bundle()).await.unwrap();
        assert_eq!(
            tree.files,
            vec!["rust/async/_synthesis.md", "rust/async/tokio-tips.md"]
        );

        let outcome = exporter.sync(&tree).await.unwrap();
        assert_eq!(outcome.files_synced, 2);
        assert!(outcome.release_ready);
        let article = std::fs::read_to_string(dest.path().join("rust/async/tokio-tips.md")).unwrap();
        assert!(article.starts_with("# Tokio tips"));

        // Unchanged content is not rewritten.
        assert_eq!(exporter.sync(&tree).await.unwrap().files_synced, 0);

        exporter.release(&tree).await.unwrap();
        assert!(!tree.root.exists());
    }

    #[tokio::test]
    async fn test_release_outside_staging_is_refused() {
        let staging = tempfile::tempdir().unwrap();
        let exporter = FileTreeExporter::new(staging.path(), staging.path());
        let tree = Materialized {
            root: PathBuf::from("/tmp/elsewhere"),
            files: vec![],
        };
        assert!(exporter.release(&tree).await.is_err());
    }
}
