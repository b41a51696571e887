//! # Engine
//!
//! The contract between a [`Session`](crate::session::Session) and the
//! inference backend. An [`Engine`] turns model artifacts into a [`Runner`];
//! a runner turns a prompt into fragments delivered through a synchronous
//! callback.
//!
//! Runners are never invoked concurrently: the session holds its lock for
//! the whole duration of a predict call.

mod llama;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::registry::ModelArtifacts;
use crate::session::Options;

pub use llama::LlamaEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Init(String),
    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),
    #[error("{0}")]
    Load(String),
    #[error("prediction failed: {0}")]
    Predict(String),
    #[error("tokenization failed: {0}")]
    Encode(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// Output format requested from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Text,
    Json,
}

/// Everything a runner needs for one generation.
#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub prompt: String,
    pub format: Format,
    pub images: Vec<Vec<u8>>,
    pub options: Options,
}

/// One incremental piece of generated text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictResult {
    pub content: String,
    /// Set on the last fragment of a generation
    pub done: bool,
}

/// Factory for runners. Implementations must make [`Engine::init`] cheap to
/// call repeatedly; the session calls it before every load.
pub trait Engine: Send + Sync {
    /// Process-wide initialization, idempotent.
    fn init(&self) -> Result<(), EngineError>;

    fn load(&self, artifacts: &ModelArtifacts, options: &Options)
        -> Result<Box<dyn Runner>, EngineError>;
}

/// A loaded model instance.
pub trait Runner: Send + Sync {
    /// Runs one generation, calling `on_fragment` once per produced fragment
    /// in production order before returning.
    ///
    /// `cancel` is advisory: runners may stop early once it fires, but the
    /// caller never relies on it.
    fn predict(
        &self,
        cancel: &CancellationToken,
        request: &PredictRequest,
        on_fragment: &mut dyn FnMut(PredictResult),
    ) -> Result<(), EngineError>;

    fn encode(&self, text: &str) -> Result<Vec<i32>, EngineError>;

    fn embedding(&self, text: &str) -> Result<Vec<f64>, EngineError>;

    /// Releases engine resources. Called exactly once by the owning handle.
    fn close(&mut self);
}
