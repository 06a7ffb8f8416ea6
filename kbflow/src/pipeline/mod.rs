//! Pipeline configuration and execution.
//!
//! This module provides:
//! - Run configuration with per-phase options and force directives
//! - The persisted execution record and its resume cursor
//! - Pause, resume and abort signalling
//! - A bounded worker pool with retry and per-call timeouts
//! - The orchestrator that drives the seven phases

mod config;
mod control;
mod execution;
mod orchestrator;
mod pool;
mod retry;


pub use config::{
    ContentOptions, EmbeddingOptions, FetchOptions, ForceDirective, IndexOptions,
    InitializationOptions, PhaseOptions, PipelineConfig, SyncOptions, SynthesisOptions,
};
pub use control::{RunControl, RunSignal};
pub use execution::{Cursor, PhaseRecord, PipelineExecution};
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use pool::{PoolReport, WorkerPool};
pub use retry::{
    should_retry, with_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
    RetryState,
};
