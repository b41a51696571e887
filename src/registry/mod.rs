//! # Model registry
//!
//! Resolves model names to on-disk artifacts, lists what is available
//! locally and pulls missing models from a remote store.
//!
//! [`Registry`] is the seam the session depends on; [`LocalRegistry`] is the
//! file-system implementation used by the CLI.

mod local;
mod name;
mod types;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use local::LocalRegistry;
pub use name::{canonical_name, ModelName, DEFAULT_NAMESPACE, DEFAULT_TAG};
pub use types::{Capability, ModelArtifacts, ModelEntry, ModelManifest, ModelSummary, ProgressEvent};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model '{0}' not found, try pulling it first")]
    NotFound(String),
    #[error("invalid model name '{0}', expected [namespace/]model[:tag]")]
    InvalidName(String),
    #[error("refusing insecure registry url {0}, set registry.insecure to allow it")]
    Insecure(String),
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry file is corrupt: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("failed to lock model registry")]
    Poisoned,
    #[error("pull cancelled")]
    Cancelled,
}

/// Store of locally available models.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolves `name` to the artifacts and metadata needed to load it.
    fn resolve(&self, name: &str) -> Result<ModelManifest, RegistryError>;

    /// Lists every locally available model.
    fn list(&self) -> Result<Vec<ModelSummary>, RegistryError>;

    /// Downloads `name` from the remote store, reporting progress as it goes.
    async fn pull(
        &self,
        cancel: &CancellationToken,
        name: &str,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<(), RegistryError>;

    /// Whether `name` resolves locally; a missing model is not an error.
    fn has(&self, name: &str) -> Result<bool, RegistryError> {
        match self.resolve(name) {
            Ok(_) => Ok(true),
            Err(RegistryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
