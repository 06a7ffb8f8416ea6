//! Model selectors and capabilities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A capability an AI backend may report for one of its models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accepts images as input.
    Vision,
    /// Produces text from a prompt.
    TextGeneration,
    /// Produces vector embeddings.
    Embeddings,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vision => write!(f, "vision"),
            Self::TextGeneration => write!(f, "text-generation"),
            Self::Embeddings => write!(f, "embeddings"),
        }
    }
}

/// Identifies which model serves a phase: `(backend, model, parameters)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelector {
    /// Backend identifier, as registered with the router.
    pub backend: String,
    /// Model name understood by that backend.
    pub model: String,
    /// Generation parameters (temperature, max tokens, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl ModelSelector {
    /// Creates a selector without parameters.
    #[must_use]
    pub fn new(backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a generation parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_display() {
        let sel = ModelSelector::new("ollama", "llava:13b");
        assert_eq!(sel.to_string(), "ollama/llava:13b");
    }

    #[test]
    fn test_selector_params_serialization() {
        let sel = ModelSelector::new("ollama", "qwen").with_param("temperature", serde_json::json!(0.2));
        let json = serde_json::to_value(&sel).unwrap();
        assert_eq!(json["params"]["temperature"], 0.2);

        let bare = serde_json::to_value(ModelSelector::new("a", "b")).unwrap();
        assert!(bare.get("params").is_none());
    }
}
