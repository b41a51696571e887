//! Generation options and the three-layer merge used for every request.
//!
//! Precedence, lowest to highest: engine defaults, the defaults stored with
//! the model in the registry, and the overrides sent with a single request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::SessionError;
use crate::config::InferenceConfig;

/// Loosely typed option overrides as they arrive from callers and manifests.
pub type OptionMap = Map<String, Value>;

/// Fully resolved options for one load or one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Size of the context window in tokens
    pub num_ctx: u32,
    pub num_batch: u32,
    /// Layers offloaded to the GPU
    pub num_gpu: u32,
    /// Worker threads, 0 picks the number of available cores
    pub num_thread: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Sampling seed, negative values pick a random seed per request
    pub seed: i64,
    /// Maximum tokens to generate, negative means "until the context is full"
    pub num_predict: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub tfs_z: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub temperature: f32,
    pub stop: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            num_batch: 512,
            num_gpu: 0,
            num_thread: 0,
            use_mmap: true,
            use_mlock: false,
            seed: -1,
            num_predict: -1,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            typical_p: 1.0,
            tfs_z: 1.0,
            repeat_last_n: 64,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            temperature: 0.8,
            stop: Vec::new(),
        }
    }
}

impl Options {
    /// Engine defaults adjusted by the installation's `[inference]` settings.
    pub fn from_settings(inference: &InferenceConfig) -> Self {
        Self {
            num_ctx: inference.context_size as u32,
            num_predict: inference.max_tokens as i32,
            temperature: inference.temperature,
            num_gpu: inference.n_gpu_layers,
            use_mmap: inference.use_mmap,
            use_mlock: inference.use_mlock,
            ..Self::default()
        }
    }

    /// Overlays `overrides` on top of `self`, key by key.
    ///
    /// Unknown keys and values of the wrong JSON type are rejected with
    /// [`SessionError::InvalidOption`]; `self` is left untouched on error.
    pub fn apply(&mut self, overrides: &OptionMap) -> Result<(), SessionError> {
        let mut next = self.clone();
        for (key, value) in overrides {
            let key = key.as_str();
            match key {
                "num_ctx" => next.num_ctx = unsigned(key, value)?,
                "num_batch" => next.num_batch = unsigned(key, value)?,
                "num_gpu" => next.num_gpu = unsigned(key, value)?,
                "num_thread" => next.num_thread = unsigned(key, value)?,
                "use_mmap" => next.use_mmap = boolean(key, value)?,
                "use_mlock" => next.use_mlock = boolean(key, value)?,
                "seed" => next.seed = integer(key, value)?,
                "num_predict" => next.num_predict = narrow(key, integer(key, value)?)?,
                "top_k" => next.top_k = narrow(key, integer(key, value)?)?,
                "top_p" => next.top_p = float(key, value)?,
                "min_p" => next.min_p = float(key, value)?,
                "typical_p" => next.typical_p = float(key, value)?,
                "tfs_z" => next.tfs_z = float(key, value)?,
                "repeat_last_n" => next.repeat_last_n = narrow(key, integer(key, value)?)?,
                "repeat_penalty" => next.repeat_penalty = float(key, value)?,
                "presence_penalty" => next.presence_penalty = float(key, value)?,
                "frequency_penalty" => next.frequency_penalty = float(key, value)?,
                "temperature" => next.temperature = float(key, value)?,
                "stop" => next.stop = strings(key, value)?,
                _ => return Err(SessionError::invalid_option(key, "unknown option")),
            }
        }
        *self = next;
        Ok(())
    }
}

/// Resolves the options for one request.
///
/// Starts from `engine_defaults`, overlays the model's stored defaults and
/// then the request overrides. Pure: neither input is modified.
pub fn merge_options(
    engine_defaults: &Options,
    model_defaults: &OptionMap,
    request_overrides: Option<&OptionMap>,
) -> Result<Options, SessionError> {
    let mut options = engine_defaults.clone();
    options.apply(model_defaults)?;
    if let Some(overrides) = request_overrides {
        options.apply(overrides)?;
    }
    Ok(options)
}

// JSON numbers may arrive as floats ("num_ctx": 4096.0), accept them when integral.
fn integer(key: &str, value: &Value) -> Result<i64, SessionError> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(f as i64),
        _ => Err(SessionError::invalid_option(
            key,
            format!("expected an integer, got {}", value),
        )),
    }
}

fn unsigned(key: &str, value: &Value) -> Result<u32, SessionError> {
    let i = integer(key, value)?;
    u32::try_from(i)
        .map_err(|_| SessionError::invalid_option(key, format!("{} is out of range", i)))
}

fn narrow(key: &str, i: i64) -> Result<i32, SessionError> {
    i32::try_from(i)
        .map_err(|_| SessionError::invalid_option(key, format!("{} is out of range", i)))
}

fn float(key: &str, value: &Value) -> Result<f32, SessionError> {
    value
        .as_f64()
        .map(|f| f as f32)
        .ok_or_else(|| SessionError::invalid_option(key, format!("expected a number, got {}", value)))
}

fn boolean(key: &str, value: &Value) -> Result<bool, SessionError> {
    value
        .as_bool()
        .ok_or_else(|| SessionError::invalid_option(key, format!("expected a boolean, got {}", value)))
}

fn strings(key: &str, value: &Value) -> Result<Vec<String>, SessionError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    SessionError::invalid_option(key, format!("expected a string, got {}", item))
                })
            })
            .collect(),
        _ => Err(SessionError::invalid_option(
            key,
            format!("expected a string or list of strings, got {}", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> OptionMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("test helper expects an object"),
        }
    }

    #[test]
    fn request_overrides_win_over_model_defaults() {
        let model = map(json!({ "temperature": 0.2, "num_ctx": 4096 }));
        let request = map(json!({ "temperature": 0.7 }));

        let options = merge_options(&Options::default(), &model, Some(&request)).unwrap();

        assert_eq!(options.temperature, 0.7);
        assert_eq!(options.num_ctx, 4096);
        assert_eq!(options.top_k, Options::default().top_k);
    }

    #[test]
    fn model_defaults_apply_without_request() {
        let model = map(json!({ "stop": ["<|im_end|>", "</s>"], "num_predict": 128 }));

        let options = merge_options(&Options::default(), &model, None).unwrap();

        assert_eq!(options.stop, vec!["<|im_end|>".to_string(), "</s>".to_string()]);
        assert_eq!(options.num_predict, 128);
    }

    #[test]
    fn unknown_key_is_rejected_by_name() {
        let request = map(json!({ "temprature": 0.1 }));

        let err = merge_options(&Options::default(), &OptionMap::new(), Some(&request)).unwrap_err();

        match err {
            SessionError::InvalidOption { key, .. } => assert_eq!(key, "temprature"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_type_is_rejected() {
        let request = map(json!({ "use_mmap": "yes" }));
        assert!(matches!(
            merge_options(&Options::default(), &OptionMap::new(), Some(&request)),
            Err(SessionError::InvalidOption { .. })
        ));

        let negative = map(json!({ "num_ctx": -1 }));
        assert!(matches!(
            merge_options(&Options::default(), &OptionMap::new(), Some(&negative)),
            Err(SessionError::InvalidOption { .. })
        ));
    }

    #[test]
    fn integral_floats_are_accepted_for_integers() {
        let request = map(json!({ "num_ctx": 1024.0, "seed": 42 }));

        let options = merge_options(&Options::default(), &OptionMap::new(), Some(&request)).unwrap();

        assert_eq!(options.num_ctx, 1024);
        assert_eq!(options.seed, 42);
    }

    #[test]
    fn failed_apply_leaves_options_untouched() {
        let mut options = Options::default();
        let bad = map(json!({ "temperature": 0.1, "bogus": 1 }));

        assert!(options.apply(&bad).is_err());
        assert_eq!(options, Options::default());
    }
}
