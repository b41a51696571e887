use chrono::{serde::ts_seconds, DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Whether a model produces text or embedding vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Generation,
    Embedding,
}

impl Capability {
    /// Guesses the capability from a GGUF `general.architecture` value and the model name.
    pub fn from_architecture(architecture: &str, name: &str) -> Self {
        let architecture = architecture.to_ascii_lowercase();
        if matches!(architecture.as_str(), "bert" | "nomic-bert" | "jina-bert-v2")
            || name.to_ascii_lowercase().contains("embed")
        {
            Capability::Embedding
        } else {
            Capability::Generation
        }
    }
}

/// Represents a model entry in the registry file.
///
/// Persisted in `model_registry.json`, keyed by canonical model name.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelEntry {
    /// Canonical name, e.g. `qwen:0.5b`
    pub name: String,
    /// Weights file, relative to the models directory
    pub filename: String,
    pub size_bytes: u64,
    /// Architecture from the GGUF metadata (e.g. "llama", "bert")
    pub architecture: String,
    /// Prompt template, the default template is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adapters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projectors: Vec<String>,
    /// Model-stored default options
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// When the model was added to the registry
    #[serde(with = "ts_seconds")]
    pub added_date: DateTime<Utc>,
}

/// On-disk files that make up one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    pub model: PathBuf,
    pub adapters: Vec<PathBuf>,
    pub projectors: Vec<PathBuf>,
}

/// A resolved model: everything needed to load it and render prompts for it.
#[derive(Debug, Clone)]
pub struct ModelManifest {
    pub name: String,
    pub template: String,
    pub capability: Capability,
    pub artifacts: ModelArtifacts,
    pub options: Map<String, Value>,
    pub size_bytes: u64,
}

impl ModelManifest {
    pub fn is_embedding(&self) -> bool {
        self.capability == Capability::Embedding
    }
}

/// Row of the model listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub size_bytes: u64,
    pub template: String,
}

/// Progress of a pull; `completed` never decreases within one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressEvent {
    pub completed: u64,
    /// Zero when the remote did not announce a length
    pub total: u64,
}
