//! Content items: captured posts and the fields each phase writes onto them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{ModelPhase, ModelSelector, ProcessingStep};
use crate::errors::{PipelineError, Result};
use crate::utils::{fingerprint, now_utc, Timestamp};

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image.
    #[default]
    Image,
    /// Video; analysed from its thumbnail.
    Video,
    /// Animated GIF.
    Gif,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Gif => write!(f, "gif"),
        }
    }
}

/// A media attachment reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Where the media can be fetched.
    pub url: String,
    /// Media kind.
    #[serde(default)]
    pub kind: MediaKind,
    /// Alt text supplied by the author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
    /// Description written by media analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MediaRef {
    /// Creates an image reference.
    #[must_use]
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Image,
            alt_text: None,
            description: None,
        }
    }
}

/// Author, timing and engagement data captured with a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Stable author identifier.
    pub author_id: String,
    /// Display handle.
    #[serde(default)]
    pub author_handle: String,
    /// When the post was created.
    pub created_at: Timestamp,
    /// Source id of the post this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Like counter at capture time.
    #[serde(default)]
    pub likes: u64,
    /// Repost counter at capture time.
    #[serde(default)]
    pub reposts: u64,
    /// Reply counter at capture time.
    #[serde(default)]
    pub replies: u64,
}

/// A post as returned by the content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Stable source identifier.
    pub source_id: String,
    /// Captured text.
    #[serde(default)]
    pub text: String,
    /// Author and timing data.
    pub metadata: ItemMetadata,
    /// Attached media.
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

impl RawItem {
    /// Checks the fields every ingested item must carry.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(PipelineError::validation("<unknown>", "missing source id"));
        }
        if self.metadata.author_id.trim().is_empty() {
            return Err(PipelineError::validation(&self.source_id, "missing author id"));
        }
        if self.text.trim().is_empty() && self.media.is_empty() {
            return Err(PipelineError::validation(
                &self.source_id,
                "item has neither text nor media",
            ));
        }
        Ok(())
    }
}

/// A `(main, sub)` category pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CategoryKey {
    /// Main category label.
    pub main: String,
    /// Sub category label.
    pub sub: String,
}

impl CategoryKey {
    /// Creates a category key.
    #[must_use]
    pub fn new(main: impl Into<String>, sub: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            sub: sub.into(),
        }
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main, self.sub)
    }
}

/// A stored embedding and what it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// The vector.
    pub vector: Vec<f32>,
    /// Fingerprint of the embedded content.
    pub fingerprint: String,
    /// Model that produced the vector.
    pub model: ModelSelector,
}

/// How an incoming raw item differs from the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawChange {
    /// Nothing changed.
    Unchanged,
    /// Only engagement counters or the handle changed.
    MetadataOnly,
    /// Fingerprinted content changed; downstream steps are stale.
    ContentChanged,
}

/// One captured post and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable source identifier.
    pub source_id: String,
    /// Captured text.
    pub text: String,
    /// Author, timing and engagement data.
    pub metadata: ItemMetadata,
    /// Attached media, with descriptions once analysed.
    #[serde(default)]
    pub media: Vec<MediaRef>,
    /// Thread this item belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Links found in the text (cache step).
    #[serde(default)]
    pub links: Vec<String>,
    /// Hashtags found in the text (cache step).
    #[serde(default)]
    pub hashtags: Vec<String>,
    /// Summary written by content understanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Main category label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_category: Option<String>,
    /// Sub category label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_category: Option<String>,
    /// Short title chosen during categorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    /// Path of the generated article.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_ref: Option<String>,
    /// Stored embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingRecord>,
    /// Which model produced which field.
    #[serde(default)]
    pub provenance: BTreeMap<ModelPhase, ModelSelector>,
    /// When the item was first ingested.
    pub ingested_at: Timestamp,
    /// Last write by any phase.
    pub updated_at: Timestamp,
}

impl ContentItem {
    /// Creates an item from a validated raw item.
    #[must_use]
    pub fn from_raw(raw: RawItem) -> Self {
        let now = now_utc();
        Self {
            source_id: raw.source_id,
            text: raw.text,
            metadata: raw.metadata,
            media: raw.media,
            thread_id: None,
            links: Vec::new(),
            hashtags: Vec::new(),
            summary: None,
            main_category: None,
            sub_category: None,
            item_name: None,
            article_ref: None,
            embedding: None,
            provenance: BTreeMap::new(),
            ingested_at: now,
            updated_at: now,
        }
    }

    /// Applies a re-fetched raw item to the ingest-owned fields.
    ///
    /// Derived fields are left alone; a content change shows up as a
    /// fingerprint mismatch in the state tracker instead.
    pub fn apply_raw(&mut self, raw: RawItem) -> RawChange {
        let before = self.content_fingerprint();
        let metadata_changed = self.metadata != raw.metadata;

        let previous_media = std::mem::take(&mut self.media);
        self.media = raw
            .media
            .into_iter()
            .map(|mut m| {
                if let Some(old) = previous_media
                    .iter()
                    .find(|old| old.url == m.url && old.kind == m.kind && old.alt_text == m.alt_text)
                {
                    m.description.clone_from(&old.description);
                }
                m
            })
            .collect();
        self.text = raw.text;
        self.metadata = raw.metadata;

        if self.content_fingerprint() != before {
            self.updated_at = now_utc();
            RawChange::ContentChanged
        } else if metadata_changed {
            self.updated_at = now_utc();
            RawChange::MetadataOnly
        } else {
            RawChange::Unchanged
        }
    }

    /// Hash over the ingested fields that invalidate processing when changed.
    ///
    /// Engagement counters and the display handle are excluded.
    #[must_use]
    pub fn content_fingerprint(&self) -> String {
        let mut fields = vec![
            self.source_id.clone(),
            self.text.clone(),
            self.metadata.author_id.clone(),
            self.metadata.reply_to.clone().unwrap_or_default(),
            self.metadata.created_at.to_rfc3339(),
        ];
        for m in &self.media {
            fields.push(format!(
                "{}|{}|{}",
                m.kind,
                m.url,
                m.alt_text.as_deref().unwrap_or_default()
            ));
        }
        fingerprint(&fields)
    }

    /// Hash over the inputs of a processing step.
    ///
    /// Each step sees the ingested content plus the outputs of the steps
    /// that feed it, never its own output.
    #[must_use]
    pub fn step_fingerprint(&self, step: ProcessingStep) -> String {
        let content = self.content_fingerprint();
        match step {
            ProcessingStep::Cache | ProcessingStep::MediaAnalysis => content,
            ProcessingStep::ContentUnderstanding => {
                fingerprint(&[content, self.media_descriptions()])
            }
            ProcessingStep::Categorization => fingerprint(&[
                content,
                self.media_descriptions(),
                self.summary.clone().unwrap_or_default(),
            ]),
        }
    }

    /// Hash over everything downstream documents are built from.
    #[must_use]
    pub fn knowledge_fingerprint(&self) -> String {
        fingerprint(&[
            self.content_fingerprint(),
            self.summary.clone().unwrap_or_default(),
            self.main_category.clone().unwrap_or_default(),
            self.sub_category.clone().unwrap_or_default(),
            self.item_name.clone().unwrap_or_default(),
        ])
    }

    /// All media descriptions joined, in attachment order.
    #[must_use]
    pub fn media_descriptions(&self) -> String {
        self.media
            .iter()
            .filter_map(|m| m.description.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The item's category pair, once both labels are set.
    #[must_use]
    pub fn category_key(&self) -> Option<CategoryKey> {
        match (&self.main_category, &self.sub_category) {
            (Some(main), Some(sub)) => Some(CategoryKey::new(main, sub)),
            _ => None,
        }
    }

    /// Title for articles and index entries.
    #[must_use]
    pub fn display_title(&self) -> String {
        self.item_name
            .clone()
            .unwrap_or_else(|| format!("Post {}", self.source_id))
    }

    /// Records which model produced a field.
    pub fn record_provenance(&mut self, phase: ModelPhase, selector: ModelSelector) {
        self.provenance.insert(phase, selector);
    }
}

/// The fields a processing step writes, applied under the item lock.
///
/// Each variant touches only the fields owned by its step.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemUpdate {
    /// Cache step output.
    Cached {
        /// Links found in the text.
        links: Vec<String>,
        /// Hashtags found in the text.
        hashtags: Vec<String>,
    },
    /// Media analysis output, keyed by media url.
    MediaAnalyzed {
        /// `(url, description)` pairs.
        descriptions: Vec<(String, String)>,
        /// Vision model used, if any media was analysed.
        model: Option<ModelSelector>,
    },
    /// Content understanding output.
    Understood {
        /// The summary.
        summary: String,
        /// Model used.
        model: ModelSelector,
    },
    /// Categorization output.
    Categorized {
        /// Main category label.
        main_category: String,
        /// Sub category label.
        sub_category: String,
        /// Short item title.
        item_name: String,
        /// Model used.
        model: ModelSelector,
    },
}

impl ItemUpdate {
    /// The step this update completes.
    #[must_use]
    pub fn step(&self) -> ProcessingStep {
        match self {
            Self::Cached { .. } => ProcessingStep::Cache,
            Self::MediaAnalyzed { .. } => ProcessingStep::MediaAnalysis,
            Self::Understood { .. } => ProcessingStep::ContentUnderstanding,
            Self::Categorized { .. } => ProcessingStep::Categorization,
        }
    }

    /// Writes the update onto an item.
    pub fn apply(self, item: &mut ContentItem) {
        match self {
            Self::Cached { links, hashtags } => {
                item.links = links;
                item.hashtags = hashtags;
            }
            Self::MediaAnalyzed { descriptions, model } => {
                for (url, description) in descriptions {
                    if let Some(media) = item.media.iter_mut().find(|m| m.url == url) {
                        media.description = Some(description);
                    }
                }
                if let Some(model) = model {
                    item.record_provenance(ModelPhase::Vision, model);
                }
            }
            Self::Understood { summary, model } => {
                item.summary = Some(summary);
                item.record_provenance(ModelPhase::Understanding, model);
            }
            Self::Categorized {
                main_category,
                sub_category,
                item_name,
                model,
            } => {
                item.main_category = Some(main_category);
                item.sub_category = Some(sub_category);
                item.item_name = Some(item_name);
                item.record_provenance(ModelPhase::Categorization, model);
            }
        }
        item.updated_at = now_utc();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    pub(crate) fn raw(id: &str, author: &str, secs: i64, reply_to: Option<&str>) -> RawItem {
        RawItem {
            source_id: id.to_string(),
            text: format!("post {id} by {author}"),
            metadata: ItemMetadata {
                author_id: author.to_string(),
                author_handle: format!("@{author}"),
                created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
                reply_to: reply_to.map(String::from),
                likes: 0,
                reposts: 0,
                replies: 0,
            },
            media: Vec::new(),
        }
    }

    #[test]
    fn test_validate_raw() {
        assert!(raw("1", "alice", 0, None).validate().is_ok());

        let mut no_author = raw("1", "", 0, None);
        no_author.metadata.author_id.clear();
        assert!(matches!(
            no_author.validate(),
            Err(PipelineError::Validation { .. })
        ));

        let mut empty = raw("2", "alice", 0, None);
        empty.text = "  ".into();
        assert!(empty.validate().is_err());
        empty.media.push(MediaRef::image("https://img/1.png"));
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn test_engagement_does_not_change_fingerprint() {
        let mut item = ContentItem::from_raw(raw("1", "alice", 0, None));
        let before = item.content_fingerprint();

        let mut again = raw("1", "alice", 0, None);
        again.metadata.likes = 99;
        assert_eq!(item.apply_raw(again), RawChange::MetadataOnly);
        assert_eq!(item.content_fingerprint(), before);
        assert_eq!(item.metadata.likes, 99);
    }

    #[test]
    fn test_text_change_changes_fingerprint_and_keeps_derived_fields() {
        let mut item = ContentItem::from_raw(raw("1", "alice", 0, None));
        item.summary = Some("old summary".into());
        let before = item.content_fingerprint();

        let mut edited = raw("1", "alice", 0, None);
        edited.text = "edited".into();
        assert_eq!(item.apply_raw(edited), RawChange::ContentChanged);
        assert_ne!(item.content_fingerprint(), before);
        assert_eq!(item.summary.as_deref(), Some("old summary"));
    }

    #[test]
    fn test_apply_raw_keeps_descriptions_for_unchanged_media() {
        let mut first = raw("1", "alice", 0, None);
        first.media.push(MediaRef::image("https://img/a.png"));
        let mut item = ContentItem::from_raw(first.clone());
        item.media[0].description = Some("a cat".into());

        first.text = "new text".into();
        item.apply_raw(first);
        assert_eq!(item.media[0].description.as_deref(), Some("a cat"));
    }

    #[test]
    fn test_step_fingerprints_chain_outputs() {
        let mut item = ContentItem::from_raw(raw("1", "alice", 0, None));
        let understanding = item.step_fingerprint(ProcessingStep::ContentUnderstanding);
        let categorization = item.step_fingerprint(ProcessingStep::Categorization);

        item.summary = Some("summary".into());
        assert_eq!(
            item.step_fingerprint(ProcessingStep::ContentUnderstanding),
            understanding
        );
        assert_ne!(
            item.step_fingerprint(ProcessingStep::Categorization),
            categorization
        );
    }

    #[test]
    fn test_updates_touch_only_their_fields() {
        let mut item = ContentItem::from_raw(raw("1", "alice", 0, None));
        let model = ModelSelector::new("local", "m");

        ItemUpdate::Understood {
            summary: "s".into(),
            model: model.clone(),
        }
        .apply(&mut item);
        assert_eq!(item.summary.as_deref(), Some("s"));
        assert!(item.main_category.is_none());

        let update = ItemUpdate::Categorized {
            main_category: "Rust".into(),
            sub_category: "Async".into(),
            item_name: "Tokio tips".into(),
            model: model.clone(),
        };
        assert_eq!(update.step(), ProcessingStep::Categorization);
        update.apply(&mut item);
        assert_eq!(item.category_key(), Some(CategoryKey::new("Rust", "Async")));
        assert_eq!(item.provenance.get(&ModelPhase::Categorization), Some(&model));
        assert_eq!(item.summary.as_deref(), Some("s"));
    }
}
