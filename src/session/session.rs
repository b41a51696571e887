use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use super::error::SessionError;
use super::handle::ModelHandle;
use super::options::{merge_options, OptionMap, Options};
use super::stream::{self, ChatStream};
use super::types::{Message, Role};
use crate::engine::{Engine, Format, PredictRequest};
use crate::registry::{canonical_name, Registry};
use crate::template::chat_prompt;

type SharedState = Arc<Mutex<Option<ModelHandle>>>;

/// Owns at most one loaded model and serializes every use of it.
///
/// Load, reload, close and embedding hold the session lock while they run;
/// a chat holds it until its stream has fully wound down, so a second chat
/// waits for the first one to be drained or cancelled.
pub struct Session {
    registry: Arc<dyn Registry>,
    engine: Arc<dyn Engine>,
    defaults: Options,
    state: SharedState,
}

impl Session {
    /// An empty session; nothing is loaded until [`Session::reload`].
    pub fn new(registry: Arc<dyn Registry>, engine: Arc<dyn Engine>) -> Self {
        Self {
            registry,
            engine,
            defaults: Options::default(),
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the engine defaults, the lowest layer of every option merge.
    pub fn with_defaults(mut self, defaults: Options) -> Self {
        self.defaults = defaults;
        self
    }

    /// Creates a session with `name` loaded.
    pub async fn load(
        name: &str,
        registry: Arc<dyn Registry>,
        engine: Arc<dyn Engine>,
    ) -> Result<Self, SessionError> {
        let session = Self::new(registry, engine);
        session.reload(&CancellationToken::new(), name).await?;
        Ok(session)
    }

    /// Switches the session to `name`.
    ///
    /// Does nothing when `name` is already loaded. The new model is resolved
    /// before the current one is closed, so an unknown name leaves the
    /// session as it was. If loading fails after that the session is empty.
    pub async fn reload(&self, cancel: &CancellationToken, name: &str) -> Result<(), SessionError> {
        let mut guard = self.lock(cancel).await?;

        let requested = canonical_name(name);
        if let Some(current) = guard.as_ref() {
            if current.name() == requested {
                debug!(model = %requested, "model already loaded");
                return Ok(());
            }
        }

        let manifest = self.registry.resolve(name)?;

        if let Some(previous) = guard.take() {
            info!(from = %previous.name(), to = %manifest.name, "replacing loaded model");
            drop(previous);
        }

        let engine = Arc::clone(&self.engine);
        let defaults = self.defaults.clone();
        let handle = tokio::task::spawn_blocking(move || ModelHandle::open(&engine, manifest, &defaults))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))??;

        *guard = Some(handle);
        Ok(())
    }

    /// Releases the loaded model. Safe to call any number of times.
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        if let Some(handle) = guard.take() {
            drop(handle);
        }
    }

    /// Streams a reply to `messages`.
    ///
    /// Validation problems are returned here; only generation failures
    /// travel through the stream.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        overrides: Option<&OptionMap>,
    ) -> Result<ChatStream, SessionError> {
        self.start_chat(cancel, messages, overrides, Format::Text).await
    }

    /// Like [`Session::chat`], asking the engine for JSON output.
    pub async fn chat_json(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        overrides: Option<&OptionMap>,
    ) -> Result<ChatStream, SessionError> {
        self.start_chat(cancel, messages, overrides, Format::Json).await
    }

    /// Embeds `text` with the loaded embedding model.
    pub async fn embedding(&self, cancel: &CancellationToken, text: &str) -> Result<Vec<f64>, SessionError> {
        let guard = self.lock(cancel).await?;
        match guard.as_ref() {
            None => return Err(SessionError::NoModelLoaded),
            Some(handle) if !handle.is_embedding() => {
                return Err(SessionError::NotEmbeddingModel(handle.name().to_string()))
            }
            Some(_) => {}
        }

        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let handle = guard.as_ref().ok_or(SessionError::NoModelLoaded)?;
            handle
                .runner()
                .embedding(&text)
                .map_err(SessionError::Embedding)
        })
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?
    }

    /// Canonical name of the loaded model. Waits for a running chat to finish.
    pub async fn model_name(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.name().to_string())
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<OwnedMutexGuard<Option<ModelHandle>>, SessionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            guard = Arc::clone(&self.state).lock_owned() => Ok(guard),
        }
    }

    async fn start_chat(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        overrides: Option<&OptionMap>,
        format: Format,
    ) -> Result<ChatStream, SessionError> {
        let guard = self.lock(cancel).await?;
        let handle = guard.as_ref().ok_or(SessionError::NoModelLoaded)?;
        if handle.is_embedding() {
            return Err(SessionError::EmbeddingOnlyModel(handle.name().to_string()));
        }

        let options = merge_options(&self.defaults, &handle.manifest.options, overrides)?;

        // Rendering tokenizes through the engine.
        let window = options.num_ctx as usize;
        let conversation = messages.to_vec();
        let (guard, rendered) = tokio::task::spawn_blocking(move || {
            let rendered = match guard.as_ref() {
                Some(handle) => chat_prompt(&handle.manifest.template, &conversation, window, |text| {
                    handle.count_tokens(text)
                })
                .map_err(SessionError::from),
                None => Err(SessionError::NoModelLoaded),
            };
            (guard, rendered)
        })
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?;
        let prompt = rendered?;
        let handle = guard.as_ref().ok_or(SessionError::NoModelLoaded)?;

        let images = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.images.clone())
            .unwrap_or_default();

        let request_id = Uuid::new_v4();
        let span = info_span!("chat", %request_id, model = %handle.name());
        info!(
            parent: &span,
            messages = messages.len(),
            images = images.len(),
            ?format,
            "starting generation"
        );

        let request = PredictRequest {
            prompt,
            format,
            images,
            options,
        };
        Ok(stream::spawn(guard, request, cancel.clone(), span))
    }
}
