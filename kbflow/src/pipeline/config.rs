//! Pipeline run configuration.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::RetryConfig;
use crate::core::{ModelPhase, ModelSelector, Phase, ProcessingStep};
use crate::errors::{PipelineError, Result};
use crate::ports::SourceConfig;
use crate::threads::ThreadConfig;

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_item_timeout_ms() -> u64 {
    120_000
}

fn default_min_items() -> usize {
    3
}

fn default_max_items_per_synthesis() -> usize {
    50
}

fn default_batch_size() -> usize {
    16
}

fn default_root_title() -> String {
    "Knowledge Base".to_string()
}

/// Initialization phase options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationOptions {
    /// Probe every backend before work starts.
    #[serde(default = "default_true")]
    pub refresh_capabilities: bool,
}

impl Default for InitializationOptions {
    fn default() -> Self {
        Self {
            refresh_capabilities: true,
        }
    }
}

/// Fetch phase options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// What to ask the content source for.
    #[serde(default)]
    pub source: SourceConfig,
    /// Thread detection window.
    #[serde(default)]
    pub threads: ThreadConfig,
    /// Re-detect threads for items that already belong to one.
    #[serde(default)]
    pub rebuild_threads: bool,
}

/// Content processing phase options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentOptions {
    /// Build collective understanding for multi-item threads.
    #[serde(default = "default_true")]
    pub thread_understanding: bool,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            thread_understanding: true,
        }
    }
}

/// Synthesis generation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    /// Smallest category population that gets a document.
    #[serde(default = "default_min_items")]
    pub min_items: usize,
    /// Cap on items fed into one generation call.
    #[serde(default = "default_max_items_per_synthesis")]
    pub max_items_per_synthesis: usize,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            min_items: default_min_items(),
            max_items_per_synthesis: default_max_items_per_synthesis(),
        }
    }
}

/// Embedding generation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingOptions {
    /// Texts per embed call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// Index generation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Heading of the root index.
    #[serde(default = "default_root_title")]
    pub root_title: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            root_title: default_root_title(),
        }
    }
}

/// External sync options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Delete the temporary tree once the exporter allows it.
    #[serde(default = "default_true")]
    pub release_after_sync: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            release_after_sync: true,
        }
    }
}

/// Options for one phase, tagged by phase name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseOptions {
    /// Initialization.
    Initialization(InitializationOptions),
    /// Fetch.
    Fetch(FetchOptions),
    /// Content processing.
    ContentProcessing(ContentOptions),
    /// Synthesis generation.
    SynthesisGeneration(SynthesisOptions),
    /// Embedding generation.
    EmbeddingGeneration(EmbeddingOptions),
    /// Index generation.
    IndexGeneration(IndexOptions),
    /// External sync.
    ExternalSync(SyncOptions),
}

impl PhaseOptions {
    /// The phase these options belong to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Initialization(_) => Phase::Initialization,
            Self::Fetch(_) => Phase::Fetch,
            Self::ContentProcessing(_) => Phase::ContentProcessing,
            Self::SynthesisGeneration(_) => Phase::SynthesisGeneration,
            Self::EmbeddingGeneration(_) => Phase::EmbeddingGeneration,
            Self::IndexGeneration(_) => Phase::IndexGeneration,
            Self::ExternalSync(_) => Phase::ExternalSync,
        }
    }
}

/// Reprocess items from a step onward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceDirective {
    /// First step to rerun; later steps are rerun too.
    pub from: ProcessingStep,
    /// Items to reprocess; every item when absent.
    #[serde(default)]
    pub items: Option<Vec<String>>,
}

impl ForceDirective {
    /// Returns true if the directive covers `item_id`.
    #[must_use]
    pub fn applies_to(&self, item_id: &str) -> bool {
        self.items
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == item_id))
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parallel per-item workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-call timeout for network-bound item work.
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,
    /// Bound on one capability probe; falls back to `item_timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Phases not to run.
    #[serde(default)]
    pub skip_phases: Vec<Phase>,
    /// Per-run model overrides.
    #[serde(default)]
    pub model_overrides: HashMap<ModelPhase, ModelSelector>,
    /// Force-reprocess directives.
    #[serde(default)]
    pub force: Vec<ForceDirective>,
    /// Phase-specific options; missing phases use defaults.
    #[serde(default)]
    pub phases: Vec<PhaseOptions>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            item_timeout_ms: default_item_timeout_ms(),
            probe_timeout_ms: None,
            retry: RetryConfig::default(),
            skip_phases: Vec::new(),
            model_overrides: HashMap::new(),
            force: Vec::new(),
            phases: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Creates a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the capability probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Skips a phase.
    #[must_use]
    pub fn skip(mut self, phase: Phase) -> Self {
        self.skip_phases.push(phase);
        self
    }

    /// Overrides the model for a model phase.
    #[must_use]
    pub fn with_override(mut self, phase: ModelPhase, selector: ModelSelector) -> Self {
        self.model_overrides.insert(phase, selector);
        self
    }

    /// Adds a force directive.
    #[must_use]
    pub fn with_force(mut self, directive: ForceDirective) -> Self {
        self.force.push(directive);
        self
    }

    /// Sets options for a phase, replacing earlier ones for it.
    #[must_use]
    pub fn with_phase_options(mut self, options: PhaseOptions) -> Self {
        let phase = options.phase();
        self.phases.retain(|o| o.phase() != phase);
        self.phases.push(options);
        self
    }

    /// Returns true if `phase` is configured to be skipped.
    #[must_use]
    pub fn is_skipped(&self, phase: Phase) -> bool {
        self.skip_phases.contains(&phase)
    }

    /// Per-call timeout.
    #[must_use]
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    /// Capability probe timeout.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(self.item_timeout_ms))
    }

    /// Override for a model phase.
    #[must_use]
    pub fn override_for(&self, phase: ModelPhase) -> Option<&ModelSelector> {
        self.model_overrides.get(&phase)
    }

    /// Initialization options.
    #[must_use]
    pub fn initialization(&self) -> InitializationOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::Initialization(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Fetch options.
    #[must_use]
    pub fn fetch(&self) -> FetchOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::Fetch(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Content processing options.
    #[must_use]
    pub fn content(&self) -> ContentOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::ContentProcessing(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Synthesis options.
    #[must_use]
    pub fn synthesis(&self) -> SynthesisOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::SynthesisGeneration(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Embedding options.
    #[must_use]
    pub fn embedding(&self) -> EmbeddingOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::EmbeddingGeneration(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Index options.
    #[must_use]
    pub fn index(&self) -> IndexOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::IndexGeneration(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Sync options.
    #[must_use]
    pub fn sync(&self) -> SyncOptions {
        self.phases
            .iter()
            .find_map(|o| match o {
                PhaseOptions::ExternalSync(opts) => Some(opts.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Checks the configuration for values no run can use.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".into()));
        }
        if self.item_timeout_ms == 0 {
            return Err(PipelineError::Config("item_timeout_ms must be positive".into()));
        }
        if self.probe_timeout_ms == Some(0) {
            return Err(PipelineError::Config("probe_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for options in &self.phases {
            if !seen.insert(options.phase()) {
                return Err(PipelineError::Config(format!(
                    "options for phase '{}' given more than once",
                    options.phase()
                )));
            }
        }

        self.fetch().threads.validate()?;
        if self.synthesis().min_items == 0 {
            return Err(PipelineError::Config("synthesis min_items must be at least 1".into()));
        }
        if self.synthesis().max_items_per_synthesis == 0 {
            return Err(PipelineError::Config(
                "synthesis max_items_per_synthesis must be at least 1".into(),
            ));
        }
        if self.embedding().batch_size == 0 {
            return Err(PipelineError::Config("embedding batch_size must be at least 1".into()));
        }
        if self.force.iter().any(|f| f.items.as_ref().is_some_and(Vec::is_empty)) {
            return Err(PipelineError::Config(
                "force directive with an empty item list".into(),
            ));
        }
        Ok(())
    }
}
