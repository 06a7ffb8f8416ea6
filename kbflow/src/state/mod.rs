//! Per-item processing state.
//!
//! - [`SubPhaseStatus`]: four completion flags plus staleness metadata
//! - [`SubPhaseTracker`]: decides what must run and performs transitions
//! - [`ItemLocks`]: per-item advisory locks

mod locks;
mod status;
mod tracker;

pub use locks::{ItemGuard, ItemLocks};
pub use status::{StepError, SubPhaseStatus, ERROR_HISTORY_LIMIT};
pub use tracker::{needs_processing, SubPhaseTracker};
