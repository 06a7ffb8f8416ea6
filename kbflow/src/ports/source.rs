//! Content source collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::core::{ItemMetadata, MediaKind, MediaRef, RawItem};
use crate::errors::Result;
use crate::utils::{parse_timestamp, Timestamp};

/// What to ask the content source for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source-specific collection name (bookmark folder, export file, ...).
    #[serde(default)]
    pub collection: Option<String>,
    /// Only posts created after this instant.
    #[serde(default)]
    pub since: Option<Timestamp>,
    /// Upper bound on returned posts.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Where bookmarked posts come from.
///
/// Rate limiting is signalled with [`crate::errors::PipelineError::rate_limited`];
/// the fetch phase waits out the delay and asks again.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Human-readable source name for logs.
    fn name(&self) -> &str;

    /// Returns the posts matching `config`.
    async fn fetch_items(&self, config: &SourceConfig) -> Result<Vec<RawItem>>;
}

/// One row of a bookmark export file.
#[derive(Debug, Clone, Deserialize)]
struct ExportRow {
    id: String,
    #[serde(default)]
    text: String,
    author_id: String,
    #[serde(default)]
    author_handle: String,
    created_at: String,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    reposts: u64,
    #[serde(default)]
    replies: u64,
    #[serde(default)]
    media: Vec<ExportMedia>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExportMedia {
    url: String,
    #[serde(default, rename = "type")]
    kind: MediaKind,
    #[serde(default)]
    alt: Option<String>,
}

impl ExportRow {
    fn into_raw(self) -> Option<RawItem> {
        let created_at = match parse_timestamp(&self.created_at) {
            Ok(ts) => ts,
            Err(err) => {
                warn!(item_id = %self.id, error = %err, "Skipping row with unreadable timestamp");
                return None;
            }
        };
        Some(RawItem {
            source_id: self.id,
            text: self.text,
            metadata: ItemMetadata {
                author_id: self.author_id,
                author_handle: self.author_handle,
                created_at,
                reply_to: self.reply_to,
                likes: self.likes,
                reposts: self.reposts,
                replies: self.replies,
            },
            media: self
                .media
                .into_iter()
                .map(|m| MediaRef {
                    url: m.url,
                    kind: m.kind,
                    alt_text: m.alt,
                    description: None,
                })
                .collect(),
        })
    }
}

/// Reads posts from a JSON bookmark export.
///
/// The file holds an array of rows with `id`, `text`, `author_id`,
/// `created_at` (unix seconds, RFC 3339 or the legacy
/// `Wed Oct 10 20:19:24 +0000 2018` form), optional `reply_to`,
/// engagement counters and `media`.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    name: String,
}

impl JsonFileSource {
    /// Creates a source over an export file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("json:{}", path.display());
        Self { path, name }
    }
}

#[async_trait]
impl ContentSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_items(&self, config: &SourceConfig) -> Result<Vec<RawItem>> {
        let body = tokio::fs::read_to_string(&self.path).await?;
        let rows: Vec<ExportRow> = serde_json::from_str(&body)?;

        let mut items: Vec<RawItem> = rows
            .into_iter()
            .filter_map(ExportRow::into_raw)
            .filter(|item| config.since.map_or(true, |since| item.metadata.created_at > since))
            .collect();
        if let Some(limit) = config.limit {
            items.truncate(limit);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXPORT: &str = r#"[
        {"id": "1", "text": "hello #rust", "author_id": "a", "created_at": "1700000000"},
        {"id": "2", "text": "reply", "author_id": "a", "created_at": "Tue Nov 14 22:14:00 +0000 2023",
         "reply_to": "1", "media": [{"url": "https://img/1.png", "type": "image", "alt": "chart"}]},
        {"id": "3", "text": "broken", "author_id": "b", "created_at": "yesterday"}
    ]"#;

    fn export_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXPORT.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_reads_export_and_skips_bad_rows() {
        let file = export_file();
        let source = JsonFileSource::new(file.path());
        let items = source.fetch_items(&SourceConfig::default()).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[1].metadata.reply_to.as_deref(), Some("1"));
        assert_eq!(items[1].media[0].alt_text.as_deref(), Some("chart"));
        assert!(source.name().starts_with("json:"));
    }

    #[tokio::test]
    async fn test_limit_and_since() {
        let file = export_file();
        let source = JsonFileSource::new(file.path());
        let limited = source
            .fetch_items(&SourceConfig {
                limit: Some(1),
                ..SourceConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let since = parse_timestamp("1700000000").unwrap();
        let newer = source
            .fetch_items(&SourceConfig {
                since: Some(since),
                ..SourceConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].source_id, "2");
    }

    #[tokio::test]
    async fn test_missing_file_is_storage_error() {
        let source = JsonFileSource::new("/nonexistent/export.json");
        let err = source
            .fetch_items(&SourceConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Storage);
    }
}
