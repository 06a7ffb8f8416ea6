//! Fixtures for pipeline tests and benchmarks.

use chrono::{TimeZone, Utc};

use crate::core::{ItemMetadata, MediaRef, ModelPhase, ModelSelector, RawItem};
use crate::models::RoutingConfig;

use super::mocks::{EMBED_MODEL, TEXT_MODEL, VISION_MODEL};

/// Epoch the fixture timestamps are offset from.
pub const FIXTURE_EPOCH_SECS: i64 = 1_700_000_000;

/// Routing with a default for every model phase on one scripted backend.
#[must_use]
pub fn default_routing(backend_id: &str) -> RoutingConfig {
    let sel = |model: &str| ModelSelector::new(backend_id, model);
    RoutingConfig::default()
        .with_default(ModelPhase::Vision, sel(VISION_MODEL))
        .with_default(ModelPhase::Understanding, sel(TEXT_MODEL))
        .with_default(ModelPhase::Categorization, sel(TEXT_MODEL))
        .with_default(ModelPhase::Synthesis, sel(TEXT_MODEL))
        .with_default(ModelPhase::Embedding, sel(EMBED_MODEL))
}

/// A post created `secs` after the fixture epoch.
#[must_use]
pub fn post(id: &str, author: &str, secs: i64, text: &str) -> RawItem {
    RawItem {
        source_id: id.to_string(),
        text: text.to_string(),
        metadata: ItemMetadata {
            author_id: author.to_string(),
            author_handle: format!("@{author}"),
            created_at: Utc
                .timestamp_opt(FIXTURE_EPOCH_SECS + secs, 0)
                .single()
                .unwrap_or_default(),
            reply_to: None,
            likes: 0,
            reposts: 0,
            replies: 0,
        },
        media: Vec::new(),
    }
}

/// A reply to `parent`.
#[must_use]
pub fn reply(id: &str, author: &str, secs: i64, parent: &str, text: &str) -> RawItem {
    let mut item = post(id, author, secs, text);
    item.metadata.reply_to = Some(parent.to_string());
    item
}

/// A post with one image attached.
#[must_use]
pub fn with_image(mut item: RawItem, url: &str) -> RawItem {
    item.media.push(MediaRef::image(url));
    item
}

/// `authors` authors each posting a self-reply chain of `chain_len`
/// posts, interleaved in time.
#[must_use]
pub fn thread_batch(authors: usize, chain_len: usize) -> Vec<RawItem> {
    let mut items = Vec::with_capacity(authors * chain_len);
    for a in 0..authors {
        let author = format!("author-{a}");
        for n in 0..chain_len {
            let id = format!("{a}-{n}");
            let secs = i64::try_from(n * authors + a).unwrap_or(i64::MAX) * 10;
            let text = format!("part {n} from {author}");
            items.push(if n == 0 {
                post(&id, &author, secs, &text)
            } else {
                reply(&id, &author, secs, &format!("{a}-{}", n - 1), &text)
            });
        }
    }
    items
}
