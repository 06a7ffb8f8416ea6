//! Model routing with overrides, persisted defaults and fallbacks.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Availability, CapabilityCache};
use crate::core::{ModelPhase, ModelSelector};
use crate::errors::{PipelineError, Result};
use crate::ports::{AiBackend, Store};

fn default_ttl_secs() -> u64 {
    300
}

/// Router settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Selector used when neither override nor default is available.
    #[serde(default)]
    pub fallbacks: HashMap<ModelPhase, ModelSelector>,
    /// Defaults used until the store provides its own.
    #[serde(default)]
    pub initial_defaults: HashMap<ModelPhase, ModelSelector>,
    /// How long a probe result is trusted.
    #[serde(default = "default_ttl_secs")]
    pub capability_ttl_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fallbacks: HashMap::new(),
            initial_defaults: HashMap::new(),
            capability_ttl_secs: default_ttl_secs(),
        }
    }
}

impl RoutingConfig {
    /// Sets the fallback for a phase.
    #[must_use]
    pub fn with_fallback(mut self, phase: ModelPhase, selector: ModelSelector) -> Self {
        self.fallbacks.insert(phase, selector);
        self
    }

    /// Sets an initial default for a phase.
    #[must_use]
    pub fn with_default(mut self, phase: ModelPhase, selector: ModelSelector) -> Self {
        self.initial_defaults.insert(phase, selector);
        self
    }

    /// Sets the capability TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.capability_ttl_secs = ttl.as_secs();
        self
    }
}

/// Which rung of the resolution order produced a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Per-run override.
    Override,
    /// Persisted default.
    Default,
    /// Configured fallback.
    Fallback,
}

/// A resolved model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The model to call.
    pub selector: ModelSelector,
    /// Where it came from.
    pub source: SelectionSource,
}

/// Resolves the model for each phase.
pub struct ModelRouter {
    cache: CapabilityCache,
    defaults: RwLock<HashMap<ModelPhase, ModelSelector>>,
    fallbacks: HashMap<ModelPhase, ModelSelector>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("cache", &self.cache)
            .field("defaults", &*self.defaults.read())
            .field("fallbacks", &self.fallbacks)
            .finish_non_exhaustive()
    }
}

impl ModelRouter {
    /// Creates a router over a set of backends.
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn AiBackend>>, config: RoutingConfig, store: Arc<dyn Store>) -> Self {
        Self {
            cache: CapabilityCache::new(backends, Duration::from_secs(config.capability_ttl_secs)),
            defaults: RwLock::new(config.initial_defaults),
            fallbacks: config.fallbacks,
            store,
        }
    }

    /// The capability cache.
    #[must_use]
    pub fn cache(&self) -> &CapabilityCache {
        &self.cache
    }

    /// Merges persisted defaults over the current ones.
    pub async fn load_defaults(&self) -> Result<usize> {
        let stored = self.store.model_defaults().await?;
        let count = stored.len();
        self.defaults.write().extend(stored);
        debug!(count, "Model defaults loaded");
        Ok(count)
    }

    /// Changes and persists the default for a phase.
    pub async fn set_default(&self, phase: ModelPhase, selector: ModelSelector) -> Result<()> {
        self.store.put_model_default(phase, &selector).await?;
        self.defaults.write().insert(phase, selector);
        Ok(())
    }

    /// Current default for a phase.
    #[must_use]
    pub fn default_for(&self, phase: ModelPhase) -> Option<ModelSelector> {
        self.defaults.read().get(&phase).cloned()
    }

    /// Resolves the model for `phase`: override, then default, then
    /// fallback, taking the first one that is available.
    pub async fn resolve(
        &self,
        phase: ModelPhase,
        override_selector: Option<&ModelSelector>,
    ) -> Result<Resolution> {
        let capability = phase.required_capability();
        let candidates = [
            (override_selector.cloned(), SelectionSource::Override),
            (self.default_for(phase), SelectionSource::Default),
            (self.fallbacks.get(&phase).cloned(), SelectionSource::Fallback),
        ];

        let mut rejected = Vec::new();
        for (candidate, source) in candidates {
            let Some(selector) = candidate else {
                continue;
            };
            match self.cache.availability(&selector, capability).await {
                Availability::Available => {
                    if source == SelectionSource::Fallback {
                        warn!(
                            phase = %phase,
                            backend = %selector.backend,
                            model = %selector.model,
                            rejected = ?rejected,
                            "Using fallback model"
                        );
                    }
                    return Ok(Resolution { selector, source });
                }
                Availability::Missing(reason) | Availability::Unreachable(reason) => {
                    debug!(phase = %phase, selector = %selector, reason = %reason, "Candidate rejected");
                    rejected.push(format!("{selector}: {reason}"));
                }
            }
        }

        let reason = if rejected.is_empty() {
            "no model configured".to_string()
        } else {
            rejected.join("; ")
        };
        Err(PipelineError::model_unavailable(phase, reason))
    }

    /// Backend serving a selector.
    pub fn backend_for(&self, selector: &ModelSelector) -> Result<Arc<dyn AiBackend>> {
        self.cache.backend(&selector.backend).ok_or_else(|| {
            PipelineError::Config(format!("backend '{}' is not registered", selector.backend))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::InMemoryStore;
    use crate::testing::ScriptedBackend;

    fn router(
        backends: &[Arc<ScriptedBackend>],
        config: RoutingConfig,
    ) -> (ModelRouter, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let backends = backends
            .iter()
            .map(|b| b.clone() as Arc<dyn AiBackend>)
            .collect();
        (ModelRouter::new(backends, config, store.clone()), store)
    }

    #[tokio::test]
    async fn test_default_used_when_available() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        let config = RoutingConfig::default()
            .with_default(ModelPhase::Vision, ModelSelector::new("primary", "vision-model"));
        let (router, _) = router(&[primary], config);

        let res = router.resolve(ModelPhase::Vision, None).await.unwrap();
        assert_eq!(res.source, SelectionSource::Default);
        assert_eq!(res.selector.backend, "primary");
    }

    #[tokio::test]
    async fn test_falls_back_when_default_unavailable() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        primary.set_available(false);
        let local = Arc::new(ScriptedBackend::new("local"));
        let config = RoutingConfig::default()
            .with_default(ModelPhase::Vision, ModelSelector::new("primary", "vision-model"))
            .with_fallback(ModelPhase::Vision, ModelSelector::new("local", "vision-model"));
        let (router, _) = router(&[primary, local], config);

        let res = router.resolve(ModelPhase::Vision, None).await.unwrap();
        assert_eq!(res.source, SelectionSource::Fallback);
        assert_eq!(res.selector, ModelSelector::new("local", "vision-model"));
    }

    #[tokio::test]
    async fn test_override_without_capability_is_skipped() {
        let local = Arc::new(ScriptedBackend::new("local"));
        let config = RoutingConfig::default()
            .with_default(ModelPhase::Vision, ModelSelector::new("local", "vision-model"));
        let (router, _) = router(&[local], config);

        let text_only = ModelSelector::new("local", "text-model");
        let res = router
            .resolve(ModelPhase::Vision, Some(&text_only))
            .await
            .unwrap();
        assert_eq!(res.source, SelectionSource::Default);

        let vision = ModelSelector::new("local", "vision-model").with_param("detail", serde_json::json!("high"));
        let res = router.resolve(ModelPhase::Vision, Some(&vision)).await.unwrap();
        assert_eq!(res.source, SelectionSource::Override);
        assert_eq!(res.selector, vision);
    }

    #[tokio::test]
    async fn test_nothing_available_is_model_unavailable() {
        let local = Arc::new(ScriptedBackend::new("local"));
        local.set_available(false);
        let config = RoutingConfig::default()
            .with_fallback(ModelPhase::Embedding, ModelSelector::new("local", "embed-model"));
        let (router, _) = router(&[local], config);

        let err = router.resolve(ModelPhase::Embedding, None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ModelUnavailable {
                phase: ModelPhase::Embedding,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_set_default_persists_and_loads() {
        let local = Arc::new(ScriptedBackend::new("local"));
        let (router, store) = router(&[local.clone()], RoutingConfig::default());
        router
            .set_default(ModelPhase::Synthesis, ModelSelector::new("local", "text-model"))
            .await
            .unwrap();

        let reloaded = ModelRouter::new(
            vec![local as Arc<dyn AiBackend>],
            RoutingConfig::default(),
            store,
        );
        assert!(reloaded.default_for(ModelPhase::Synthesis).is_none());
        assert_eq!(reloaded.load_defaults().await.unwrap(), 1);
        assert_eq!(
            reloaded.default_for(ModelPhase::Synthesis),
            Some(ModelSelector::new("local", "text-model"))
        );
    }
}
