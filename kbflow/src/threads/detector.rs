//! Thread detection over a fetched batch.
//!
//! Same-author replies within the gap window extend their parent's thread;
//! a reply from another author roots a thread of its own.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::core::{ContentItem, ModelSelector};
use crate::errors::{PipelineError, Result};
use crate::utils::{hash_sorted_pairs, now_utc, Timestamp};

fn default_max_gap_secs() -> u64 {
    3600
}

/// Thread detection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Largest gap between consecutive posts of one thread.
    #[serde(default = "default_max_gap_secs")]
    pub max_gap_secs: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_gap_secs: default_max_gap_secs(),
        }
    }
}

impl ThreadConfig {
    /// Rejects a zero window.
    pub fn validate(&self) -> Result<()> {
        if self.max_gap_secs == 0 {
            return Err(PipelineError::Config(
                "thread max_gap_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// A reply to a post outside the author's own sequence.
///
/// Recorded on the thread it roots, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossAuthorReply {
    /// The replying item.
    pub item_id: String,
    /// The post it replies to.
    pub target_id: String,
    /// Author of the target, when the target is in the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_author: Option<String>,
}

/// An ordered reply chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// `thread:<root source id>`.
    pub id: String,
    /// First post of the chain.
    pub root_id: String,
    /// Author of every member.
    pub author_id: String,
    /// Member ids in chronological order, root first.
    pub member_ids: Vec<String>,
    /// Set when the root replies to someone else's post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_author_reply: Option<CrossAuthorReply>,
    /// Summary of the whole chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collective_understanding: Option<String>,
    /// Hash of the member inputs the summary was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub understanding_fingerprint: Option<String>,
    /// Model that wrote the summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub understanding_model: Option<ModelSelector>,
    /// When the thread was detected.
    pub detected_at: Timestamp,
}

impl Thread {
    /// Deterministic id for a thread rooted at `root_id`.
    #[must_use]
    pub fn id_for(root_id: &str) -> String {
        format!("thread:{root_id}")
    }

    /// Returns true for a chain of two or more posts.
    #[must_use]
    pub fn is_multi_item(&self) -> bool {
        self.member_ids.len() > 1
    }

    /// Hash over members and their summaries, in member order.
    #[must_use]
    pub fn member_fingerprint(&self, items: &HashMap<String, ContentItem>) -> String {
        let pairs: Vec<(String, String)> = self
            .member_ids
            .iter()
            .enumerate()
            .map(|(pos, id)| {
                let summary = items
                    .get(id)
                    .and_then(|i| i.summary.clone())
                    .unwrap_or_default();
                (format!("{pos:06}:{id}"), summary)
            })
            .collect();
        hash_sorted_pairs(&pairs)
    }

    /// Returns true if the collective understanding is missing or was
    /// built from different member content.
    #[must_use]
    pub fn needs_understanding(&self, items: &HashMap<String, ContentItem>) -> bool {
        self.is_multi_item()
            && self.understanding_fingerprint.as_deref()
                != Some(self.member_fingerprint(items).as_str())
    }
}

/// Groups posts into threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadDetector {
    config: ThreadConfig,
}

impl ThreadDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new(config: ThreadConfig) -> Self {
        Self { config }
    }

    /// Splits `items` into threads.
    ///
    /// Same input batch, same boundaries: the result is sorted by thread id
    /// and does not depend on the order of `items`.
    #[must_use]
    pub fn detect_threads(&self, items: &[ContentItem]) -> Vec<Thread> {
        let authors: HashMap<&str, &str> = items
            .iter()
            .map(|i| (i.source_id.as_str(), i.metadata.author_id.as_str()))
            .collect();

        let mut by_author: BTreeMap<&str, Vec<&ContentItem>> = BTreeMap::new();
        for item in items {
            by_author
                .entry(item.metadata.author_id.as_str())
                .or_default()
                .push(item);
        }

        let max_gap = i64::try_from(self.config.max_gap_secs).unwrap_or(i64::MAX);
        let detected_at = now_utc();
        let mut threads = Vec::new();

        for (author, mut group) in by_author {
            group.sort_by(|a, b| {
                a.metadata
                    .created_at
                    .cmp(&b.metadata.created_at)
                    .then_with(|| a.source_id.cmp(&b.source_id))
            });

            let mut current: Option<Thread> = None;
            let mut previous: Option<&ContentItem> = None;

            for item in group {
                let continues = previous.is_some_and(|prev| {
                    let gap = (item.metadata.created_at - prev.metadata.created_at).num_seconds();
                    gap <= max_gap
                        && item.metadata.reply_to.as_deref() == Some(prev.source_id.as_str())
                });

                match current.as_mut() {
                    Some(thread) if continues => thread.member_ids.push(item.source_id.clone()),
                    _ => {
                        if let Some(done) = current.take() {
                            threads.push(done);
                        }
                        let cross_author_reply = item.metadata.reply_to.as_ref().and_then(|target| {
                            let target_author = authors.get(target.as_str()).copied();
                            (target_author != Some(author)).then(|| CrossAuthorReply {
                                item_id: item.source_id.clone(),
                                target_id: target.clone(),
                                target_author: target_author.map(String::from),
                            })
                        });
                        current = Some(Thread {
                            id: Thread::id_for(&item.source_id),
                            root_id: item.source_id.clone(),
                            author_id: author.to_string(),
                            member_ids: vec![item.source_id.clone()],
                            cross_author_reply,
                            collective_understanding: None,
                            understanding_fingerprint: None,
                            understanding_model: None,
                            detected_at,
                        });
                    }
                }
                previous = Some(item);
            }
            if let Some(done) = current {
                threads.push(done);
            }
        }

        threads.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(
            items = items.len(),
            threads = threads.len(),
            "Thread detection finished"
        );
        threads
    }
}
