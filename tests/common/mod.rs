#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use llmcore::engine::{Engine, EngineError, Format, PredictRequest, PredictResult, Runner};
use llmcore::registry::{
    canonical_name, Capability, ModelArtifacts, ModelManifest, ModelSummary, ProgressEvent, Registry,
    RegistryError,
};
use llmcore::session::Options;
use llmcore::template::DEFAULT_TEMPLATE;

/// What the scripted engine observed.
#[derive(Debug, Default)]
pub struct Stats {
    pub loads: usize,
    pub closes: usize,
    pub active: usize,
    pub max_active: usize,
    pub predicts: usize,
    pub last_format: Option<Format>,
    pub last_options: Option<Options>,
    pub last_prompt: Option<String>,
    pub last_images: usize,
}

/// Fake engine whose runners replay a fixed list of fragments.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    pub stats: Arc<Mutex<Stats>>,
    pub fragments: Vec<String>,
    /// Fail the generation after this many fragments
    pub fail_after: Option<usize>,
    /// Panic after this many fragments
    pub panic_after: Option<usize>,
    /// Pause before each fragment
    pub delay: Duration,
    /// Pause inside every tokenizer call
    pub encode_delay: Duration,
    pub init_error: Option<String>,
    /// Load errors keyed by model file stem
    pub load_errors: HashMap<String, String>,
}

impl ScriptedEngine {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> std::sync::MutexGuard<'_, Stats> {
        self.stats.lock().unwrap()
    }
}

impl Engine for ScriptedEngine {
    fn init(&self) -> Result<(), EngineError> {
        match &self.init_error {
            Some(message) => Err(EngineError::Init(message.clone())),
            None => Ok(()),
        }
    }

    fn load(&self, artifacts: &ModelArtifacts, _options: &Options) -> Result<Box<dyn Runner>, EngineError> {
        let stem = artifacts
            .model
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(message) = self.load_errors.get(&stem) {
            if message == "unsupported" {
                return Err(EngineError::UnsupportedFormat(stem));
            }
            return Err(EngineError::Load(message.clone()));
        }
        self.stats().loads += 1;
        Ok(Box::new(ScriptedRunner {
            engine: self.clone(),
            closed: false,
        }))
    }
}

pub struct ScriptedRunner {
    engine: ScriptedEngine,
    closed: bool,
}

impl Runner for ScriptedRunner {
    fn predict(
        &self,
        _cancel: &CancellationToken,
        request: &PredictRequest,
        on_fragment: &mut dyn FnMut(PredictResult),
    ) -> Result<(), EngineError> {
        {
            let mut stats = self.engine.stats();
            stats.active += 1;
            stats.max_active = stats.max_active.max(stats.active);
            stats.predicts += 1;
            stats.last_format = Some(request.format);
            stats.last_options = Some(request.options.clone());
            stats.last_prompt = Some(request.prompt.clone());
            stats.last_images = request.images.len();
        }

        let mut result = Ok(());
        for (i, fragment) in self.engine.fragments.iter().enumerate() {
            if self.engine.fail_after == Some(i) {
                result = Err(EngineError::Predict("scripted failure".into()));
                break;
            }
            if self.engine.panic_after == Some(i) {
                // leave the stats mutex unpoisoned
                self.engine.stats().active -= 1;
                panic!("scripted panic");
            }
            if !self.engine.delay.is_zero() {
                std::thread::sleep(self.engine.delay);
            }
            on_fragment(PredictResult {
                content: fragment.clone(),
                done: false,
            });
        }

        self.engine.stats().active -= 1;
        result
    }

    fn encode(&self, text: &str) -> Result<Vec<i32>, EngineError> {
        if !self.engine.encode_delay.is_zero() {
            std::thread::sleep(self.engine.encode_delay);
        }
        Ok(text.split_whitespace().map(|_| 1).collect())
    }

    fn embedding(&self, text: &str) -> Result<Vec<f64>, EngineError> {
        Ok(vec![text.len() as f64, 0.5, -0.5])
    }

    fn close(&mut self) {
        assert!(!self.closed, "runner closed twice");
        self.closed = true;
        self.engine.stats().closes += 1;
    }
}

/// In-memory registry holding fixed manifests.
#[derive(Default)]
pub struct StaticRegistry {
    models: HashMap<String, ModelManifest>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, capability: Capability, options: Value) -> Self {
        let name = canonical_name(name);
        let stem = name.split(':').next().unwrap_or(&name).to_string();
        let options: Map<String, Value> = match options {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.models.insert(
            name.clone(),
            ModelManifest {
                name,
                template: DEFAULT_TEMPLATE.to_string(),
                capability,
                artifacts: ModelArtifacts {
                    model: PathBuf::from(format!("/models/{}.gguf", stem)),
                    adapters: Vec::new(),
                    projectors: Vec::new(),
                },
                options,
                size_bytes: 1024,
            },
        );
        self
    }

    pub fn generation(self, name: &str) -> Self {
        self.with(name, Capability::Generation, Value::Null)
    }

    pub fn embedding(self, name: &str) -> Self {
        self.with(name, Capability::Embedding, Value::Null)
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    fn resolve(&self, name: &str) -> Result<ModelManifest, RegistryError> {
        self.models
            .get(&canonical_name(name))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<ModelSummary>, RegistryError> {
        let mut models: Vec<ModelSummary> = self
            .models
            .values()
            .map(|m| ModelSummary {
                name: m.name.clone(),
                size_bytes: m.size_bytes,
                template: m.template.clone(),
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn pull(
        &self,
        _cancel: &CancellationToken,
        name: &str,
        _on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<(), RegistryError> {
        Err(RegistryError::NotFound(name.to_string()))
    }
}

/// Writes a minimal GGUF v3 file carrying only string metadata.
pub fn write_gguf(path: &Path, metadata: &[(&str, &str)]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"GGUF");
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&(metadata.len() as u64).to_le_bytes());
    for (key, value) in metadata {
        bytes.extend_from_slice(&(key.len() as u64).to_le_bytes());
        bytes.extend_from_slice(key.as_bytes());
        // string value type
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&(value.len() as u64).to_le_bytes());
        bytes.extend_from_slice(value.as_bytes());
    }
    std::fs::write(path, bytes).unwrap();
}
