//! External collaborators.
//!
//! The pipeline talks to the outside world only through these traits:
//! content sources, AI backends, record storage and the exporter.

mod ai;
mod exporter;
mod source;
mod store;

pub use ai::{AiBackend, Generation, ModelInfo, Prompt};
pub use exporter::{
    synthesis_path, ExportBundle, Exporter, FileTreeExporter, Materialized, SyncOutcome,
};
pub use source::{ContentSource, JsonFileSource, SourceConfig};
pub use store::{InMemoryStore, ItemQuery, Store};
