//! AI backend collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::{Capability, ModelPhase, ModelSelector};
use crate::errors::{PipelineError, Result};

/// A model reported by a backend probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name as the backend knows it.
    pub name: String,
    /// What the model can do.
    pub capabilities: BTreeSet<Capability>,
}

impl ModelInfo {
    /// Creates a model entry.
    #[must_use]
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Returns true if the model reports `capability`.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Input to a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// The phase making the call.
    pub phase: ModelPhase,
    /// What the model should do.
    pub instruction: String,
    /// The material to work on.
    pub input: String,
    /// Image urls for vision calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Prompt {
    /// Creates a text prompt.
    #[must_use]
    pub fn new(phase: ModelPhase, instruction: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            phase,
            instruction: instruction.into(),
            input: input.into(),
            images: Vec::new(),
        }
    }

    /// Attaches an image.
    #[must_use]
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.images.push(url.into());
        self
    }
}

/// Output of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Generation {
    /// Free text.
    Text(String),
    /// Structured output.
    Structured(serde_json::Value),
}

impl Generation {
    /// The output as trimmed text.
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Structured(value) => value.to_string(),
        }
    }

    /// The output as JSON, parsing text output if needed.
    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            Self::Structured(value) => Ok(value),
            Self::Text(text) => serde_json::from_str(text.trim()).map_err(PipelineError::from),
        }
    }
}

/// A capability-typed AI model provider.
#[async_trait]
pub trait AiBackend: Send + Sync {
    /// Identifier used in model selectors.
    fn id(&self) -> &str;

    /// Lists the backend's models and their capabilities.
    ///
    /// An error means the backend is unreachable.
    async fn probe(&self) -> Result<Vec<ModelInfo>>;

    /// Runs a generation call.
    async fn generate(&self, prompt: &Prompt, selector: &ModelSelector) -> Result<Generation>;

    /// Embeds each text, returning one vector per input.
    async fn embed(&self, texts: &[String], selector: &ModelSelector) -> Result<Vec<Vec<f32>>>;
}
