//! # Kbflow
//!
//! An incremental pipeline that turns bookmarked social posts into a
//! categorized, cross-referenced knowledge base.
//!
//! Each run walks seven phases in order:
//!
//! - **Initialization**: store check, model defaults, capability probe
//! - **Fetch**: ingest new bookmarks, cache their text, detect threads
//! - **Content processing**: media analysis, understanding, categorization
//! - **Synthesis generation**: one document per populated category
//! - **Embedding generation**: vectors for items and synthesis documents
//! - **Index generation**: article references and category indexes
//! - **External sync**: materialize the knowledge base and push it out
//!
//! Every item carries per-step completion flags with input fingerprints,
//! so a rerun only does the work whose inputs changed. Runs can be paused,
//! resumed (also after a restart) and aborted.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kbflow::prelude::*;
//!
//! let deps = OrchestratorDeps::new(store, source, vec![backend], exporter)
//!     .with_routing(routing);
//! let orchestrator = Orchestrator::new(deps);
//!
//! let id = orchestrator.start(PipelineConfig::default()).await?;
//! let execution = orchestrator.wait(id).await?;
//! println!("{}", execution.status);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod core;
pub mod errors;
pub mod events;
pub mod models;
pub mod observability;
pub mod phases;
pub mod pipeline;
pub mod ports;
pub mod state;
pub mod testing;
pub mod threads;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        ContentItem, ExecutionStatus, ModelPhase, ModelSelector, Phase, PhaseStatus,
        ProcessingStep, ProgressEvent, RawItem, SynthesisDocument,
    };
    pub use crate::errors::{PipelineError, Result};
    pub use crate::events::{BroadcastEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::models::{ModelRouter, RoutingConfig};
    pub use crate::observability::{init_logging, LogConfig, LogFormat};
    pub use crate::phases::{PhaseContext, PhaseExecutor, PhaseOutcome};
    pub use crate::pipeline::{
        ForceDirective, Orchestrator, OrchestratorDeps, PhaseOptions, PipelineConfig,
        PipelineExecution, RetryConfig, RunSignal,
    };
    pub use crate::ports::{AiBackend, ContentSource, Exporter, FileTreeExporter, InMemoryStore, Store};
    pub use crate::state::{SubPhaseStatus, SubPhaseTracker};
    pub use crate::threads::{Thread, ThreadDetector};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
