use thiserror::Error;

use crate::engine::EngineError;
use crate::registry::RegistryError;
use crate::template::TemplateError;

/// Everything a [`Session`](super::Session) operation can fail with.
///
/// Validation failures are returned synchronously from `chat`/`chat_json`;
/// only [`SessionError::Stream`] is ever delivered inside a chat stream.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unable to initialize llm library: {0}")]
    EngineInit(#[source] EngineError),

    #[error(transparent)]
    ModelResolution(#[from] RegistryError),

    #[error("{source}: this model may be incompatible with your version of llmcore. If you previously pulled this model, try updating it by running `llmcore pull {model}`")]
    IncompatibleModel { model: String, source: EngineError },

    #[error("failed to load model {model}: {source}")]
    EngineLoad { model: String, source: EngineError },

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("model {0} is not an embedding model")]
    NotEmbeddingModel(String),

    #[error("model {0} is an embedding model and cannot generate text")]
    EmbeddingOnlyModel(String),

    #[error("invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("generation failed: {0}")]
    Stream(#[source] EngineError),

    #[error("embedding failed: {0}")]
    Embedding(#[source] EngineError),

    #[error("request cancelled")]
    Cancelled,

    #[error("inference worker stopped unexpectedly: {0}")]
    Worker(String),
}

impl SessionError {
    pub(crate) fn invalid_option(key: &str, reason: impl Into<String>) -> Self {
        SessionError::InvalidOption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
