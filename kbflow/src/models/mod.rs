//! Model routing.
//!
//! Resolution order per phase: per-run override, persisted default,
//! configured fallback. A candidate counts only if the latest probe of its
//! backend lists the model with the phase's required capability.

mod cache;
mod router;

pub use crate::core::{Capability, ModelSelector};
pub use cache::{Availability, CapabilityCache, DEFAULT_CAPABILITY_TTL, DEFAULT_PROBE_TIMEOUT};
pub use router::{ModelRouter, Resolution, RoutingConfig, SelectionSource};
