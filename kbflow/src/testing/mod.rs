//! Testing utilities for kbflow pipelines.
//!
//! This module provides:
//! - A scripted AI backend and an in-memory content source
//! - Routing and post fixtures

mod fixtures;
mod mocks;

pub use fixtures::{default_routing, post, reply, thread_batch, with_image, FIXTURE_EPOCH_SECS};
pub use mocks::{
    ScriptedBackend, StaticSource, EMBEDDING_DIMENSIONS, EMBED_MODEL, TEXT_MODEL, VISION_MODEL,
};
