//! Derived documents: category synthesis and indexes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{CategoryKey, EmbeddingRecord, ModelPhase, ModelSelector};
use crate::utils::{fingerprint, now_utc, Timestamp};

/// A cross-item document for one `(main, sub)` category pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisDocument {
    /// Main category label.
    pub main_category: String,
    /// Sub category label.
    pub sub_category: String,
    /// Generated body.
    pub content: String,
    /// Sorted ids of the items the body was generated from.
    pub source_item_ids: Vec<String>,
    /// Hash over the sorted source ids and their fingerprints.
    pub source_hash: String,
    /// Set when the category no longer meets the population threshold.
    #[serde(default)]
    pub is_stale: bool,
    /// Which model produced the body and embedding.
    #[serde(default)]
    pub provenance: BTreeMap<ModelPhase, ModelSelector>,
    /// Stored embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingRecord>,
    /// First generation for this category; kept across regenerations.
    pub created_at: Timestamp,
    /// When the current body was generated.
    pub generated_at: Timestamp,
    /// Last regeneration or staleness change.
    pub updated_at: Timestamp,
}

impl SynthesisDocument {
    /// Creates a freshly generated document.
    #[must_use]
    pub fn new(
        key: &CategoryKey,
        content: String,
        source_item_ids: Vec<String>,
        source_hash: String,
        model: ModelSelector,
    ) -> Self {
        let now = now_utc();
        let mut provenance = BTreeMap::new();
        provenance.insert(ModelPhase::Synthesis, model);
        Self {
            main_category: key.main.clone(),
            sub_category: key.sub.clone(),
            content,
            source_item_ids,
            source_hash,
            is_stale: false,
            provenance,
            embedding: None,
            created_at: now,
            generated_at: now,
            updated_at: now,
        }
    }

    /// The category pair this document covers.
    #[must_use]
    pub fn key(&self) -> CategoryKey {
        CategoryKey::new(&self.main_category, &self.sub_category)
    }

    /// Hash of what an embedding of this document is computed from.
    #[must_use]
    pub fn embedding_fingerprint(&self) -> String {
        fingerprint(&[&self.main_category, &self.sub_category, &self.content])
    }
}

/// Scope of an index document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum IndexScope {
    /// The top-level index listing every main category.
    Root,
    /// One main category.
    Category(String),
}

/// One line of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Link text.
    pub title: String,
    /// Relative path of the target.
    pub path: String,
    /// Sub category the entry belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// A generated table of contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Root or category index.
    pub scope: IndexScope,
    /// Heading.
    pub title: String,
    /// Entries, sorted by group then title.
    pub entries: Vec<IndexEntry>,
    /// When the index was built.
    pub generated_at: Timestamp,
}

impl IndexDocument {
    /// Relative path the index is exported to.
    #[must_use]
    pub fn path(&self) -> String {
        match &self.scope {
            IndexScope::Root => "README.md".to_string(),
            IndexScope::Category(main) => format!("{}/README.md", crate::utils::slugify(main)),
        }
    }

    /// Renders the index as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n", self.title);
        let mut current_group: Option<&str> = None;
        for entry in &self.entries {
            if entry.group.as_deref() != current_group {
                current_group = entry.group.as_deref();
                if let Some(group) = current_group {
                    out.push_str(&format!("\n## {group}\n"));
                }
            }
            out.push_str(&format!("- [{}]({})\n", entry.title, entry.path));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_synthesis_records_provenance() {
        let key = CategoryKey::new("Rust", "Async");
        let doc = SynthesisDocument::new(
            &key,
            "body".into(),
            vec!["1".into(), "2".into(), "3".into()],
            "hash".into(),
            ModelSelector::new("local", "writer"),
        );
        assert_eq!(doc.key(), key);
        assert!(!doc.is_stale);
        assert_eq!(
            doc.provenance.get(&ModelPhase::Synthesis).map(ToString::to_string),
            Some("local/writer".to_string())
        );
    }

    #[test]
    fn test_index_markdown_groups_entries() {
        let index = IndexDocument {
            scope: IndexScope::Category("Rust Lang".into()),
            title: "Rust Lang".into(),
            entries: vec![
                IndexEntry {
                    title: "A".into(),
                    path: "async/a.md".into(),
                    group: Some("Async".into()),
                },
                IndexEntry {
                    title: "B".into(),
                    path: "async/b.md".into(),
                    group: Some("Async".into()),
                },
            ],
            generated_at: now_utc(),
        };
        assert_eq!(index.path(), "rust-lang/README.md");
        let md = index.to_markdown();
        assert_eq!(md.matches("## Async").count(), 1);
        assert!(md.contains("- [B](async/b.md)"));
    }
}
