//! Core domain model types for kbflow.
//!
//! This module contains the records the pipeline moves around:
//! - Phase, processing step and model phase enums
//! - Execution and phase status enums
//! - Content items, synthesis documents and indexes
//! - Progress events

mod documents;
mod event;
pub(crate) mod item;
mod phase;
mod selector;
mod status;

pub use documents::{IndexDocument, IndexEntry, IndexScope, SynthesisDocument};
pub use event::ProgressEvent;
pub use item::{
    CategoryKey, ContentItem, EmbeddingRecord, ItemMetadata, ItemUpdate, MediaKind, MediaRef,
    RawChange, RawItem,
};
pub use phase::{ModelPhase, Phase, ProcessingStep};
pub use selector::{Capability, ModelSelector};
pub use status::{ExecutionStatus, PhaseStatus};
