use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::name::{canonical_name, ModelName, DEFAULT_TAG};
use super::types::{Capability, ModelArtifacts, ModelEntry, ModelManifest, ModelSummary, ProgressEvent};
use super::{Registry, RegistryError};
use crate::config::Settings;
use crate::gguf::{is_gguf_file, GgufMetadata};
use crate::template::DEFAULT_TEMPLATE;

const REGISTRY_FILE: &str = "model_registry.json";

/// Model store rooted at a models directory.
///
/// Weights live as `.gguf` files in the directory; `model_registry.json`
/// maps canonical names to them together with template and default options.
pub struct LocalRegistry {
    /// Directory where model files are stored
    pub models_dir: PathBuf,
    base_url: String,
    insecure: bool,
    client: reqwest::Client,
    entries: RwLock<HashMap<String, ModelEntry>>,
}

impl LocalRegistry {
    pub fn new(models_dir: PathBuf, base_url: impl Into<String>, insecure: bool) -> Self {
        Self {
            models_dir,
            base_url: base_url.into(),
            insecure,
            client: reqwest::Client::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.models.directory.clone(),
            settings.registry.base_url.clone(),
            settings.registry.insecure,
        )
    }

    /// Opens the registry: loads the registry file and adopts loose GGUF files.
    pub fn open(self) -> Result<Self, RegistryError> {
        self.scan(false)?;
        Ok(self)
    }

    fn registry_path(&self) -> PathBuf {
        self.models_dir.join(REGISTRY_FILE)
    }

    /// Gets the full path to a model file.
    pub fn model_path(&self, filename: &str) -> PathBuf {
        self.models_dir.join(filename)
    }

    fn ensure_models_dir(&self) -> Result<(), RegistryError> {
        if !self.models_dir.exists() {
            fs::create_dir_all(&self.models_dir)?;
            info!("Created models directory: {}", self.models_dir.display());
        }
        Ok(())
    }

    fn load_registry_file(&self) -> Result<HashMap<String, ModelEntry>, RegistryError> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, entries: &HashMap<String, ModelEntry>) -> Result<(), RegistryError> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.registry_path().with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.registry_path())?;
        Ok(())
    }

    /// Reloads the registry file and reconciles it with the directory contents.
    ///
    /// Entries whose weights vanished are dropped; GGUF files no entry refers
    /// to are adopted under a name derived from their file stem. With
    /// `show_progress` a spinner reports each file as it is inspected.
    pub fn scan(&self, show_progress: bool) -> Result<usize, RegistryError> {
        self.ensure_models_dir()?;
        let mut entries = self.load_registry_file()?;
        let before = entries.len();

        entries.retain(|name, entry| {
            let keep = self.model_path(&entry.filename).exists();
            if !keep {
                warn!(model = %name, file = %entry.filename, "model file missing, dropping registry entry");
            }
            keep
        });
        let mut changed = entries.len() != before;

        let known: HashSet<String> = entries.values().map(|e| e.filename.clone()).collect();
        let candidates: Vec<PathBuf> = fs::read_dir(&self.models_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
                    && !path
                        .file_name()
                        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
            })
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| !known.contains(name.to_string_lossy().as_ref()))
            })
            .collect();

        let pb = if show_progress && !candidates.is_empty() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        let total = candidates.len();
        let mut adopted = 0;
        for (i, path) in candidates.iter().enumerate() {
            let filename = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if let Some(pb) = &pb {
                pb.set_message(format!("Checking file: {}... ({}/{})", filename, i + 1, total));
            }
            if !is_gguf_file(path) {
                info!("Skipping non-GGUF file: {}", filename);
                continue;
            }
            let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let name = match ModelName::parse(&format!("{}:{}", stem, DEFAULT_TAG)) {
                Ok(name) => name.to_string(),
                Err(_) => {
                    warn!("Cannot derive a model name from {}, skipping", filename);
                    continue;
                }
            };
            if entries.contains_key(&name) {
                continue;
            }
            match self.describe(&name, &filename) {
                Ok(entry) => {
                    info!(model = %name, file = %filename, "adopted model file");
                    entries.insert(name, entry);
                    adopted += 1;
                    changed = true;
                }
                Err(e) => error!("Failed to inspect model file {}: {}", filename, e),
            }
        }

        if let Some(pb) = pb {
            pb.finish_with_message(format!(
                "Scan complete. Found {} new model{}",
                adopted,
                if adopted == 1 { "" } else { "s" }
            ));
        }

        if changed {
            self.save(&entries)?;
        }
        *self.entries.write().map_err(|_| RegistryError::Poisoned)? = entries;
        Ok(adopted)
    }

    /// Builds a registry entry for a weights file, reading what it can from the GGUF header.
    fn describe(&self, name: &str, filename: &str) -> Result<ModelEntry, RegistryError> {
        let path = self.model_path(filename);
        let size_bytes = fs::metadata(&path)?.len();
        let architecture = match GgufMetadata::read_file(&path) {
            Ok(meta) => {
                debug!(model = %name, general_name = ?meta.name(), context_length = ?meta.context_length(), "read GGUF metadata");
                // Embedded templates are Jinja, which the prompt renderer does not speak.
                if meta.has_chat_template() {
                    info!(model = %name, "model ships a chat template, using the default template instead");
                }
                meta.architecture().unwrap_or("unknown").to_string()
            }
            Err(e) => {
                warn!(model = %name, "could not read GGUF metadata: {}", e);
                "unknown".to_string()
            }
        };
        Ok(ModelEntry {
            name: name.to_string(),
            filename: filename.to_string(),
            size_bytes,
            capability: Capability::from_architecture(&architecture, name),
            architecture,
            template: None,
            adapters: Vec::new(),
            projectors: Vec::new(),
            params: Default::default(),
            added_date: Utc::now(),
        })
    }

    fn register(&self, entry: ModelEntry) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().map_err(|_| RegistryError::Poisoned)?;
        entries.insert(entry.name.clone(), entry);
        self.save(&entries)
    }

    fn manifest(&self, entry: &ModelEntry) -> ModelManifest {
        ModelManifest {
            name: entry.name.clone(),
            template: entry
                .template
                .clone()
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            capability: entry.capability,
            artifacts: ModelArtifacts {
                model: self.model_path(&entry.filename),
                adapters: entry.adapters.iter().map(|f| self.model_path(f)).collect(),
                projectors: entry.projectors.iter().map(|f| self.model_path(f)).collect(),
            },
            options: entry.params.clone(),
            size_bytes: entry.size_bytes,
        }
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        url: &str,
        partial: &Path,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<(), RegistryError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            response = self.client.get(url).send() => response?,
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(url.to_string()));
        }
        let response = response.error_for_status()?;

        let total = response.content_length().unwrap_or(0);
        let mut completed = 0u64;
        on_progress(ProgressEvent { completed, total });

        let mut file = tokio::fs::File::create(partial).await?;
        let mut body = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            completed += chunk.len() as u64;
            on_progress(ProgressEvent {
                completed,
                total: total.max(completed),
            });
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    fn resolve(&self, name: &str) -> Result<ModelManifest, RegistryError> {
        let key = ModelName::parse(name)?.to_string();
        let entries = self.entries.read().map_err(|_| RegistryError::Poisoned)?;
        let entry = entries
            .get(&key)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !self.model_path(&entry.filename).exists() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(self.manifest(entry))
    }

    fn list(&self) -> Result<Vec<ModelSummary>, RegistryError> {
        let entries = self.entries.read().map_err(|_| RegistryError::Poisoned)?;
        let mut models: Vec<ModelSummary> = entries
            .values()
            .map(|entry| {
                let manifest = self.manifest(entry);
                ModelSummary {
                    name: manifest.name,
                    size_bytes: manifest.size_bytes,
                    template: manifest.template,
                }
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn pull(
        &self,
        cancel: &CancellationToken,
        name: &str,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<(), RegistryError> {
        let model_name = ModelName::parse(name)?;
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), model_name.remote_path());
        if !self.insecure && !url.starts_with("https://") {
            return Err(RegistryError::Insecure(url));
        }
        self.ensure_models_dir()?;

        let filename = format!("{}.gguf", model_name.file_stem());
        let final_path = self.model_path(&filename);
        let partial = self.model_path(&format!("{}.partial", filename));
        info!(model = %model_name, %url, "pulling model");

        if let Err(e) = self.download(cancel, &url, &partial, on_progress).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!("no partial download to clean up: {}", cleanup);
            }
            return Err(match e {
                RegistryError::NotFound(_) => RegistryError::NotFound(name.to_string()),
                other => other,
            });
        }
        tokio::fs::rename(&partial, &final_path).await?;

        let canonical = canonical_name(name);
        let mut entry = self.describe(&canonical, &filename)?;
        // Re-pulling keeps the template and parameters a user may have edited.
        if let Some(existing) = self.entries.read().map_err(|_| RegistryError::Poisoned)?.get(&canonical) {
            entry.template = existing.template.clone();
            entry.params = existing.params.clone();
        }
        self.register(entry)?;
        info!(model = %canonical, "pull complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(dir.path().to_path_buf(), "https://example.com", false)
            .open()
            .unwrap();

        assert!(matches!(registry.resolve("ghost"), Err(RegistryError::NotFound(_))));
        assert!(!registry.has("ghost").unwrap());
        assert!(matches!(registry.has("a/b/c"), Err(RegistryError::InvalidName(_))));
    }

    #[tokio::test]
    async fn pull_refuses_plain_http_unless_insecure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(dir.path().to_path_buf(), "http://127.0.0.1:9", false);

        let err = registry
            .pull(&CancellationToken::new(), "qwen", &mut |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Insecure(_)));
    }
}
