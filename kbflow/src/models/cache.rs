//! Capability discovery cache.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::{Capability, ModelSelector};
use crate::ports::{AiBackend, ModelInfo};

/// Default time a probe result stays valid.
pub const DEFAULT_CAPABILITY_TTL: Duration = Duration::from_secs(300);

/// Default bound on a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct ProbeEntry {
    probed_at: Instant,
    outcome: std::result::Result<Vec<ModelInfo>, String>,
}

impl ProbeEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.probed_at.elapsed() < ttl
    }
}

#[derive(Default)]
struct Slot {
    entry: RwLock<Option<ProbeEntry>>,
    refresh: Mutex<()>,
}

/// Whether a selector can serve a capability right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The latest probe lists the model with the capability.
    Available,
    /// The backend answered but the model or capability is missing.
    Missing(String),
    /// The backend is unknown or its latest probe failed.
    Unreachable(String),
}

impl Availability {
    /// Returns true for [`Availability::Available`].
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Per-backend probe results with a time-to-live.
///
/// Many workers read concurrently. At most one probe per backend is in
/// flight; readers holding a previously successful entry keep using it
/// while the probe runs, readers with nothing cached wait for it.
pub struct CapabilityCache {
    backends: HashMap<String, Arc<dyn AiBackend>>,
    slots: HashMap<String, Arc<Slot>>,
    ttl: Duration,
    probe_timeout: RwLock<Duration>,
}

impl std::fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityCache")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .field("probe_timeout", &*self.probe_timeout.read())
            .finish()
    }
}

impl CapabilityCache {
    /// Creates a cache over a set of backends.
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn AiBackend>>, ttl: Duration) -> Self {
        let mut by_id = HashMap::new();
        let mut slots = HashMap::new();
        for backend in backends {
            let id = backend.id().to_string();
            slots.insert(id.clone(), Arc::new(Slot::default()));
            by_id.insert(id, backend);
        }
        Self {
            backends: by_id,
            slots,
            ttl,
            probe_timeout: RwLock::new(DEFAULT_PROBE_TIMEOUT),
        }
    }

    /// Bounds every later probe. A probe that runs longer is recorded as
    /// failed.
    pub fn set_probe_timeout(&self, timeout: Duration) {
        *self.probe_timeout.write() = timeout;
    }

    /// Current probe bound.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        *self.probe_timeout.read()
    }

    /// Looks up a backend by id.
    #[must_use]
    pub fn backend(&self, id: &str) -> Option<Arc<dyn AiBackend>> {
        self.backends.get(id).cloned()
    }

    /// Registered backend ids, sorted.
    #[must_use]
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Checks whether `selector` can serve `capability`, probing if the
    /// cached entry expired.
    pub async fn availability(&self, selector: &ModelSelector, capability: Capability) -> Availability {
        let Some(entry) = self.entry(&selector.backend).await else {
            return Availability::Unreachable(format!("unknown backend '{}'", selector.backend));
        };
        match entry.outcome {
            Err(reason) => Availability::Unreachable(reason),
            Ok(models) => match models.iter().find(|m| m.name == selector.model) {
                None => Availability::Missing(format!("model '{selector}' not offered")),
                Some(model) if !model.supports(capability) => {
                    Availability::Missing(format!("model '{selector}' lacks {capability}"))
                }
                Some(_) => Availability::Available,
            },
        }
    }

    /// Probes one backend now, waiting for any in-flight probe first.
    pub async fn refresh(&self, backend_id: &str) -> bool {
        let (Some(backend), Some(slot)) = (self.backends.get(backend_id), self.slots.get(backend_id))
        else {
            return false;
        };
        let _guard = slot.refresh.lock().await;
        self.probe_into(backend.as_ref(), slot).await
    }

    /// Probes every backend, returning the ids that answered.
    pub async fn refresh_all(&self) -> Vec<String> {
        let ids = self.backend_ids();
        let results = futures::future::join_all(ids.iter().map(|id| self.refresh(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, ok)| ok.then_some(id))
            .collect()
    }

    async fn entry(&self, backend_id: &str) -> Option<ProbeEntry> {
        let backend = self.backends.get(backend_id)?;
        let slot = self.slots.get(backend_id)?;

        let cached = slot.entry.read().clone();
        if let Some(entry) = &cached {
            if entry.is_fresh(self.ttl) {
                return cached;
            }
        }

        if let Ok(_guard) = slot.refresh.try_lock() {
            let latest = slot.entry.read().clone();
            if latest.as_ref().is_some_and(|e| e.is_fresh(self.ttl)) {
                return latest;
            }
            self.probe_into(backend.as_ref(), slot).await;
            return slot.entry.read().clone();
        }

        // A probe is already running.
        if let Some(entry) = cached {
            if entry.outcome.is_ok() {
                debug!(backend = %backend_id, "Using stale capabilities during refresh");
                return Some(entry);
            }
        }
        let _wait = slot.refresh.lock().await;
        slot.entry.read().clone()
    }

    async fn probe_into(&self, backend: &dyn AiBackend, slot: &Slot) -> bool {
        let limit = self.probe_timeout();
        let outcome = match tokio::time::timeout(limit, backend.probe()).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!("probe timed out after {}ms", limit.as_millis())),
        };
        let ok = outcome.is_ok();
        match &outcome {
            Ok(models) => debug!(backend = %backend.id(), models = models.len(), "Backend probed"),
            Err(reason) => warn!(backend = %backend.id(), reason = %reason, "Backend probe failed"),
        }
        *slot.entry.write() = Some(ProbeEntry {
            probed_at: Instant::now(),
            outcome,
        });
        ok
    }
}
