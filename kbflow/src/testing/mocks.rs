//! Scripted collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::{Capability, ModelPhase, ModelSelector, RawItem};
use crate::errors::{PipelineError, Result};
use crate::ports::{AiBackend, ContentSource, Generation, ModelInfo, Prompt, SourceConfig};

/// Models every scripted backend reports.
pub const VISION_MODEL: &str = "vision-model";
/// Text generation model.
pub const TEXT_MODEL: &str = "text-model";
/// Embedding model.
pub const EMBED_MODEL: &str = "embed-model";

/// Dimension of scripted embedding vectors.
pub const EMBEDDING_DIMENSIONS: usize = 8;

#[derive(Debug, Clone)]
struct CategoryRule {
    needle: String,
    main: String,
    sub: String,
}

/// An in-process AI backend with deterministic answers.
///
/// Answers are derived from the prompt input, so changed content yields
/// changed output. Calls are counted per model phase.
#[derive(Debug)]
pub struct ScriptedBackend {
    id: String,
    available: AtomicBool,
    probe_delay: Mutex<Duration>,
    probes: AtomicUsize,
    started: Mutex<HashMap<ModelPhase, usize>>,
    finished: Mutex<HashMap<ModelPhase, usize>>,
    embeds: AtomicUsize,
    failures_left: AtomicUsize,
    categories: Mutex<Vec<CategoryRule>>,
    blocks: Mutex<HashMap<ModelPhase, usize>>,
    unblocked: Notify,
}

impl ScriptedBackend {
    /// Creates an available backend.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            available: AtomicBool::new(true),
            probe_delay: Mutex::new(Duration::ZERO),
            probes: AtomicUsize::new(0),
            started: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            embeds: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            categories: Mutex::new(Vec::new()),
            blocks: Mutex::new(HashMap::new()),
            unblocked: Notify::new(),
        }
    }

    /// Delays every probe.
    #[must_use]
    pub fn with_probe_delay(self, delay: Duration) -> Self {
        self.set_probe_delay(delay);
        self
    }

    /// Changes the probe delay on a shared backend.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    /// Makes the backend reachable or not.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of probes served.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Generation calls that returned an answer for `phase`.
    #[must_use]
    pub fn calls(&self, phase: ModelPhase) -> usize {
        self.finished.lock().get(&phase).copied().unwrap_or(0)
    }

    /// Generation calls that returned an answer, across phases.
    #[must_use]
    pub fn generate_calls(&self) -> usize {
        self.finished.lock().values().sum()
    }

    /// Embedding calls served.
    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embeds.load(Ordering::SeqCst)
    }

    /// Answers categorization prompts containing `needle` with the given
    /// labels. Earlier rules win.
    pub fn set_category_for(&self, needle: &str, main: &str, sub: &str) {
        self.categories.lock().push(CategoryRule {
            needle: needle.to_string(),
            main: main.to_string(),
            sub: sub.to_string(),
        });
    }

    /// Lets the first `n` calls for `phase` through and holds every later
    /// one until [`ScriptedBackend::unblock`].
    pub fn block_after(&self, phase: ModelPhase, n: usize) {
        self.blocks.lock().insert(phase, n);
    }

    /// Releases held calls for `phase`.
    pub fn unblock(&self, phase: ModelPhase) {
        self.blocks.lock().remove(&phase);
        self.unblocked.notify_waiters();
    }

    /// Fails the next `n` generation calls with a transient error.
    pub fn fail_times(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn models() -> Vec<ModelInfo> {
        vec![
            ModelInfo::new(VISION_MODEL, [Capability::Vision]),
            ModelInfo::new(TEXT_MODEL, [Capability::TextGeneration]),
            ModelInfo::new(EMBED_MODEL, [Capability::Embeddings]),
        ]
    }

    fn check(&self, selector: &ModelSelector, capability: Capability, phase: ModelPhase) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PipelineError::transient(format!("backend '{}' unreachable", self.id)));
        }
        let known = Self::models()
            .iter()
            .any(|m| m.name == selector.model && m.supports(capability));
        if known {
            Ok(())
        } else {
            Err(PipelineError::model_unavailable(
                phase,
                format!("'{selector}' cannot serve {phase}"),
            ))
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn hold_if_blocked(&self, phase: ModelPhase, call: usize) {
        loop {
            let notified = self.unblocked.notified();
            let held = self.blocks.lock().get(&phase).is_some_and(|n| call > *n);
            if !held {
                return;
            }
            notified.await;
        }
    }

    fn categorize(&self, input: &str) -> serde_json::Value {
        let rule = self
            .categories
            .lock()
            .iter()
            .find(|r| input.contains(&r.needle))
            .cloned();
        let (main, sub) = rule.map_or_else(
            || ("Programming".to_string(), "Rust".to_string()),
            |r| (r.main, r.sub),
        );
        let name: String = first_line(input)
            .split_whitespace()
            .take(6)
            .collect::<Vec<_>>()
            .join(" ");
        serde_json::json!({
            "main_category": main,
            "sub_category": sub,
            "item_name": name,
        })
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

/// A unit vector derived from the text's hash.
fn vector_for(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let raw: Vec<f32> = digest
        .iter()
        .take(EMBEDDING_DIMENSIONS)
        .map(|b| f32::from(*b) - 127.5)
        .collect();
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    raw.into_iter().map(|x| x / norm).collect()
}

#[async_trait]
impl AiBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn probe(&self) -> Result<Vec<ModelInfo>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(PipelineError::transient(format!("backend '{}' unreachable", self.id)));
        }
        Ok(Self::models())
    }

    async fn generate(&self, prompt: &Prompt, selector: &ModelSelector) -> Result<Generation> {
        let phase = prompt.phase;
        self.check(selector, phase.required_capability(), phase)?;
        if self.take_failure() {
            return Err(PipelineError::transient("scripted failure"));
        }

        let call = {
            let mut started = self.started.lock();
            let n = started.entry(phase).or_insert(0);
            *n += 1;
            *n
        };
        self.hold_if_blocked(phase, call).await;

        let output = match phase {
            ModelPhase::Vision => Generation::Text(format!(
                "An image ({}) attached to: {}",
                prompt.images.join(", "),
                first_line(&prompt.input)
            )),
            ModelPhase::Understanding => Generation::Text(format!("Summary: {}", first_line(&prompt.input))),
            ModelPhase::Categorization => Generation::Structured(self.categorize(&prompt.input)),
            ModelPhase::Synthesis => Generation::Text(format!("Synthesis\n\n{}", prompt.input.trim())),
            ModelPhase::Embedding => {
                return Err(PipelineError::model_unavailable(phase, "use embed for vectors"));
            }
        };
        *self.finished.lock().entry(phase).or_insert(0) += 1;
        Ok(output)
    }

    async fn embed(&self, texts: &[String], selector: &ModelSelector) -> Result<Vec<Vec<f32>>> {
        self.check(selector, Capability::Embeddings, ModelPhase::Embedding)?;
        self.embeds.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| vector_for(t)).collect())
    }
}

/// A content source serving a mutable in-memory list.
#[derive(Debug, Default)]
pub struct StaticSource {
    items: Mutex<Vec<RawItem>>,
    fetches: AtomicUsize,
}

impl StaticSource {
    /// Creates a source serving `items`.
    #[must_use]
    pub fn new(items: Vec<RawItem>) -> Self {
        Self {
            items: Mutex::new(items),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Adds a post.
    pub fn push(&self, item: RawItem) {
        self.items.lock().push(item);
    }

    /// Replaces every post.
    pub fn set_items(&self, items: Vec<RawItem>) {
        *self.items.lock() = items;
    }

    /// Number of fetches served.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_items(&self, config: &SourceConfig) -> Result<Vec<RawItem>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let items = self.items.lock().clone();
        let filtered = items
            .into_iter()
            .filter(|i| config.since.map_or(true, |since| i.metadata.created_at > since));
        Ok(match config.limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        })
    }
}
