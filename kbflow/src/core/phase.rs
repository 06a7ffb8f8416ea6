//! Pipeline phases, content-processing steps and model phases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Capability;

/// One of the seven top-level pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Validate collaborators, load model defaults, apply force directives.
    Initialization,
    /// Pull new bookmarks from the content source and cache them.
    Fetch,
    /// Media analysis, content understanding and categorization.
    ContentProcessing,
    /// Per-category synthesis documents.
    SynthesisGeneration,
    /// Vector embeddings for items and synthesis documents.
    EmbeddingGeneration,
    /// Article references and category indexes.
    IndexGeneration,
    /// Export and sync to the external destination.
    ExternalSync,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 7] = [
        Self::Initialization,
        Self::Fetch,
        Self::ContentProcessing,
        Self::SynthesisGeneration,
        Self::EmbeddingGeneration,
        Self::IndexGeneration,
        Self::ExternalSync,
    ];

    /// Position of this phase in [`Phase::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }

    /// Phase at the given position, if any.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// The phase whose completion this phase requires.
    #[must_use]
    pub fn prerequisite(self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    /// Stable snake_case identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Fetch => "fetch",
            Self::ContentProcessing => "content_processing",
            Self::SynthesisGeneration => "synthesis_generation",
            Self::EmbeddingGeneration => "embedding_generation",
            Self::IndexGeneration => "index_generation",
            Self::ExternalSync => "external_sync",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-item processing step tracked by a completion flag.
///
/// `Cache` runs during Fetch; the other three are the ordered sub-phases of
/// Content Processing. Each step requires every step before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    /// Raw data captured and normalised.
    Cache,
    /// Attached media described by a vision model.
    MediaAnalysis,
    /// Post summarised by a text model.
    ContentUnderstanding,
    /// Main and sub category assigned.
    Categorization,
}

impl ProcessingStep {
    /// All steps in dependency order.
    pub const ALL: [Self; 4] = [
        Self::Cache,
        Self::MediaAnalysis,
        Self::ContentUnderstanding,
        Self::Categorization,
    ];

    /// The Content Processing sub-phases, in order.
    pub const SUB_PHASES: [Self; 3] = [
        Self::MediaAnalysis,
        Self::ContentUnderstanding,
        Self::Categorization,
    ];

    /// Position in [`ProcessingStep::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The step immediately before this one.
    #[must_use]
    pub fn prerequisite(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Every step that must be complete before this one may be marked.
    #[must_use]
    pub fn prerequisites(self) -> &'static [Self] {
        &Self::ALL[..self.index()]
    }

    /// This step and every step after it.
    #[must_use]
    pub fn and_downstream(self) -> &'static [Self] {
        &Self::ALL[self.index()..]
    }

    /// The model phase used by this step, if it calls a model.
    #[must_use]
    pub fn model_phase(self) -> Option<ModelPhase> {
        match self {
            Self::Cache => None,
            Self::MediaAnalysis => Some(ModelPhase::Vision),
            Self::ContentUnderstanding => Some(ModelPhase::Understanding),
            Self::Categorization => Some(ModelPhase::Categorization),
        }
    }

    /// Stable snake_case identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::MediaAnalysis => "media_analysis",
            Self::ContentUnderstanding => "content_understanding",
            Self::Categorization => "categorization",
        }
    }
}

impl fmt::Display for ProcessingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" | "cached" => Ok(Self::Cache),
            "media_analysis" | "media" => Ok(Self::MediaAnalysis),
            "content_understanding" | "understanding" => Ok(Self::ContentUnderstanding),
            "categorization" | "categorized" => Ok(Self::Categorization),
            other => Err(format!("unknown processing step '{other}'")),
        }
    }
}

/// A routing key for the model router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    /// Image and video description.
    Vision,
    /// Post summarisation and thread understanding.
    Understanding,
    /// Category assignment.
    Categorization,
    /// Category-level synthesis documents.
    Synthesis,
    /// Vector embeddings.
    Embedding,
}

impl ModelPhase {
    /// All model phases.
    pub const ALL: [Self; 5] = [
        Self::Vision,
        Self::Understanding,
        Self::Categorization,
        Self::Synthesis,
        Self::Embedding,
    ];

    /// Capability a model must report to serve this phase.
    #[must_use]
    pub fn required_capability(self) -> Capability {
        match self {
            Self::Vision => Capability::Vision,
            Self::Understanding | Self::Categorization | Self::Synthesis => {
                Capability::TextGeneration
            }
            Self::Embedding => Capability::Embeddings,
        }
    }

    /// Stable snake_case identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Understanding => "understanding",
            Self::Categorization => "categorization",
            Self::Synthesis => "synthesis",
            Self::Embedding => "embedding",
        }
    }
}

impl fmt::Display for ModelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown model phase '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::Initialization.index(), 0);
        assert_eq!(Phase::ExternalSync.index(), 6);
        assert_eq!(Phase::Fetch.prerequisite(), Some(Phase::Initialization));
        assert_eq!(Phase::Initialization.prerequisite(), None);
        assert_eq!(Phase::from_index(7), None);
    }

    #[test]
    fn test_step_prerequisites() {
        assert!(ProcessingStep::Cache.prerequisites().is_empty());
        assert_eq!(
            ProcessingStep::Categorization.prerequisites(),
            &[
                ProcessingStep::Cache,
                ProcessingStep::MediaAnalysis,
                ProcessingStep::ContentUnderstanding
            ]
        );
        assert_eq!(
            ProcessingStep::ContentUnderstanding.prerequisite(),
            Some(ProcessingStep::MediaAnalysis)
        );
    }

    #[test]
    fn test_step_downstream() {
        assert_eq!(
            ProcessingStep::ContentUnderstanding.and_downstream(),
            &[
                ProcessingStep::ContentUnderstanding,
                ProcessingStep::Categorization
            ]
        );
    }

    #[test]
    fn test_step_from_str() {
        assert_eq!(
            "categorization".parse::<ProcessingStep>(),
            Ok(ProcessingStep::Categorization)
        );
        assert_eq!("cached".parse::<ProcessingStep>(), Ok(ProcessingStep::Cache));
        assert!("bogus".parse::<ProcessingStep>().is_err());
    }

    #[test]
    fn test_model_phase_capability() {
        assert_eq!(ModelPhase::Vision.required_capability(), Capability::Vision);
        assert_eq!(
            ModelPhase::Synthesis.required_capability(),
            Capability::TextGeneration
        );
        assert_eq!("vision".parse::<ModelPhase>(), Ok(ModelPhase::Vision));
    }

    #[test]
    fn test_serialize_names() {
        assert_eq!(
            serde_json::to_string(&Phase::ContentProcessing).unwrap(),
            r#""content_processing""#
        );
        assert_eq!(
            serde_json::to_string(&ModelPhase::Embedding).unwrap(),
            r#""embedding""#
        );
    }
}
