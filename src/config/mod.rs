use serde::Deserialize;
use std::path::{Path, PathBuf};
use config::{Config, ConfigError, Environment, File};

/// Where models live on disk
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Directory holding the GGUF files and `model_registry.json`
    pub directory: PathBuf,
}

/// Remote store models are pulled from
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Base URL, files are fetched from `{base_url}/{namespace}/{model}/{tag}.gguf`
    pub base_url: String,
    /// Allow plain http
    #[serde(default)]
    pub insecure: bool,
}

/// Engine defaults, the lowest-precedence layer of every option merge
#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Controls randomness in generation (0.0-2.0)
    pub temperature: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Size of the context window for inference
    pub context_size: usize,
    /// Layers offloaded to the GPU
    #[serde(default)]
    pub n_gpu_layers: u32,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
}

fn default_true() -> bool {
    true
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Directory for the daily rolling log files
    pub file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub models: ModelConfig,
    pub registry: RegistryConfig,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Loads settings from, in increasing order of precedence:
    /// 1. `default.toml` in the config directory
    /// 2. `local.toml` in the config directory, if present
    /// 3. Environment variables prefixed with `LLMCORE_` (e.g. `LLMCORE_REGISTRY__INSECURE=true`)
    ///
    /// The config directory is `config_dir` when given, `./config` otherwise.
    pub fn new(config_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let config_dir = match config_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()
                .map_err(|e| ConfigError::Message(
                    format!("Failed to get current directory: {}", e)
                ))?
                .join("config"),
        };

        if !config_dir.exists() {
            return Err(ConfigError::Message(
                format!("Config directory not found at: {}", config_dir.display())
            ));
        }

        let default_config = config_dir.join("default.toml");
        if !default_config.exists() {
            return Err(ConfigError::Message(
                format!("Default configuration file not found at: {}", default_config.display())
            ));
        }
        let local_config = config_dir.join("local.toml");

        let settings = Config::builder()
            .add_source(File::from(default_config))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix("LLMCORE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;

        Ok(settings)
    }

    /// Checks value ranges and creates the models and log directories.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.models.directory.exists() {
            std::fs::create_dir_all(&self.models.directory).map_err(|e| {
                ConfigError::Message(format!(
                    "Failed to create models directory at {}: {}",
                    self.models.directory.display(), e
                ))
            })?;
        }

        if !(0.0..=2.0).contains(&self.inference.temperature) {
            return Err(ConfigError::Message(
                format!("Temperature must be between 0.0 and 2.0, got: {}", self.inference.temperature)
            ));
        }

        if self.inference.max_tokens == 0 {
            return Err(ConfigError::Message(
                "max_tokens must be greater than 0".to_string()
            ));
        }

        if self.inference.context_size == 0 || self.inference.context_size > u32::MAX as usize {
            return Err(ConfigError::Message(
                format!("context_size must be between 1 and {}, got: {}", u32::MAX, self.inference.context_size)
            ));
        }

        if self.registry.base_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "registry.base_url must not be empty".to_string()
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(ConfigError::Message(
                format!("Invalid logging level: {}. Must be one of: error, warn, info, debug, trace",
                    self.logging.level)
            )),
        }?;

        if let Some(log_dir) = &self.logging.file {
            if !log_dir.exists() {
                std::fs::create_dir_all(log_dir).map_err(|e| {
                    ConfigError::Message(format!(
                        "Failed to create log directory at {}: {}",
                        log_dir.display(), e
                    ))
                })?;
            }
        }

        Ok(())
    }
}
