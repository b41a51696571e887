use std::sync::Arc;
use tracing::{info, warn};

use super::error::SessionError;
use super::options::{merge_options, Options};
use crate::engine::{Engine, EngineError, Runner};
use crate::registry::ModelManifest;

/// Phrase llama.cpp style engines use when weights cannot be read.
const LOAD_FAILURE_PHRASE: &str = "failed to load model";

/// A loaded runner together with the manifest it was loaded from.
///
/// The runner is closed exactly once: explicitly through the owning
/// session, or when the handle is dropped.
pub(crate) struct ModelHandle {
    runner: Box<dyn Runner>,
    pub(crate) manifest: ModelManifest,
    closed: bool,
}

impl ModelHandle {
    /// Initializes the engine and loads `manifest`. Blocking.
    pub(crate) fn open(
        engine: &Arc<dyn Engine>,
        manifest: ModelManifest,
        defaults: &Options,
    ) -> Result<Self, SessionError> {
        engine.init().map_err(SessionError::EngineInit)?;

        let options = merge_options(defaults, &manifest.options, None)?;
        info!(model = %manifest.name, path = %manifest.artifacts.model.display(), "loading model");

        let runner = engine
            .load(&manifest.artifacts, &options)
            .map_err(|e| classify_load_error(&manifest.name, e))?;

        info!(model = %manifest.name, capability = ?manifest.capability, "model ready");
        Ok(Self {
            runner,
            manifest,
            closed: false,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.manifest.name
    }

    pub(crate) fn is_embedding(&self) -> bool {
        self.manifest.is_embedding()
    }

    pub(crate) fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }

    /// Token count of `text` under this model's tokenizer.
    pub(crate) fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        self.runner.encode(text).map(|tokens| tokens.len())
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.runner.close();
            info!(model = %self.manifest.name, "model closed");
        }
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps a load failure to the error shown to the user.
///
/// Old weights are often incompatible with newer engine versions; those
/// failures get a hint to re-pull the model. A structured
/// [`EngineError::UnsupportedFormat`] is trusted first, the load-failure
/// phrase in the engine's message is the fallback.
pub(crate) fn classify_load_error(model: &str, err: EngineError) -> SessionError {
    let incompatible = matches!(err, EngineError::UnsupportedFormat(_))
        || err.to_string().contains(LOAD_FAILURE_PHRASE);
    if incompatible {
        warn!(model, "model failed to load and may be incompatible: {}", err);
        SessionError::IncompatibleModel {
            model: model.to_string(),
            source: err,
        }
    } else {
        SessionError::EngineLoad {
            model: model.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_is_incompatible() {
        let err = classify_load_error("qwen:0.5b", EngineError::UnsupportedFormat("ggml v1".into()));
        assert!(matches!(err, SessionError::IncompatibleModel { .. }));
        assert!(err.to_string().contains("llmcore pull qwen:0.5b"));
    }

    #[test]
    fn load_failure_phrase_falls_back_to_incompatible() {
        let err = classify_load_error("qwen:0.5b", EngineError::Load("failed to load model: bad tensor".into()));
        assert!(matches!(err, SessionError::IncompatibleModel { .. }));
    }

    #[test]
    fn other_failures_stay_generic() {
        let err = classify_load_error("qwen:0.5b", EngineError::Load("out of memory".into()));
        assert!(matches!(err, SessionError::EngineLoad { .. }));
    }
}
