use llama_cpp::standard_sampler::{SamplerStage, StandardSampler};
use llama_cpp::{EmbeddingsParams, LlamaModel, LlamaParams, SessionParams};
use once_cell::sync::OnceCell;
use std::num::NonZeroUsize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Engine, EngineError, Format, PredictRequest, PredictResult, Runner};
use crate::gguf::is_gguf_file;
use crate::registry::ModelArtifacts;
use crate::session::Options;

/// Threads available to the process, detected once.
static BACKEND_THREADS: OnceCell<NonZeroUsize> = OnceCell::new();

const JSON_INSTRUCTION: &str = "\nRespond only with valid JSON.\n";

/// [`Engine`] backed by llama.cpp through the `llama_cpp` crate.
#[derive(Debug, Default, Clone)]
pub struct LlamaEngine;

impl LlamaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for LlamaEngine {
    fn init(&self) -> Result<(), EngineError> {
        BACKEND_THREADS
            .get_or_try_init(|| {
                let threads = std::thread::available_parallelism()
                    .map_err(|e| EngineError::Init(format!("cannot detect CPU threads: {}", e)))?;
                info!(threads = threads.get(), "llama backend initialized");
                Ok(threads)
            })
            .map(|_| ())
    }

    fn load(&self, artifacts: &ModelArtifacts, options: &Options) -> Result<Box<dyn Runner>, EngineError> {
        let path = &artifacts.model;
        if !is_gguf_file(path) {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} is not a GGUF file",
                path.display()
            )));
        }
        if !artifacts.adapters.is_empty() || !artifacts.projectors.is_empty() {
            warn!(
                adapters = artifacts.adapters.len(),
                projectors = artifacts.projectors.len(),
                "adapters and projectors are not supported by the llama backend, ignoring"
            );
        }

        let llama_params = LlamaParams {
            n_gpu_layers: options.num_gpu,
            use_mmap: options.use_mmap,
            use_mlock: options.use_mlock,
            ..Default::default()
        };
        info!(
            path = %path.display(),
            n_gpu_layers = options.num_gpu,
            use_mmap = options.use_mmap,
            use_mlock = options.use_mlock,
            "loading model via llama_cpp"
        );
        let model = LlamaModel::load_from_file(path, llama_params)
            .map_err(|e| EngineError::Load(format!("failed to load model: {}", e)))?;
        info!("model loaded");

        let threads = BACKEND_THREADS.get().map_or(1, |t| t.get());
        Ok(Box::new(LlamaRunner {
            model: Some(model),
            threads,
        }))
    }
}

struct LlamaRunner {
    model: Option<LlamaModel>,
    threads: usize,
}

impl LlamaRunner {
    fn model(&self) -> Result<&LlamaModel, EngineError> {
        self.model
            .as_ref()
            .ok_or_else(|| EngineError::Predict("runner already closed".to_string()))
    }

    fn session_params(&self, options: &Options) -> SessionParams {
        let threads = if options.num_thread == 0 {
            self.threads as u32
        } else {
            options.num_thread
        };
        let seed = if options.seed < 0 {
            rand::random::<u32>()
        } else {
            options.seed as u32
        };
        SessionParams {
            n_ctx: options.num_ctx,
            n_batch: options.num_batch,
            n_threads: threads,
            n_threads_batch: threads,
            seed,
            ..Default::default()
        }
    }
}

fn sampler_for(options: &Options) -> StandardSampler {
    let mut stages = vec![SamplerStage::RepetitionPenalty {
        repetition_penalty: options.repeat_penalty,
        frequency_penalty: options.frequency_penalty,
        presence_penalty: options.presence_penalty,
        last_n: options.repeat_last_n,
    }];
    if options.top_k > 0 {
        stages.push(SamplerStage::TopK(options.top_k));
    }
    if options.tfs_z < 1.0 {
        stages.push(SamplerStage::TailFree(options.tfs_z));
    }
    if options.typical_p < 1.0 {
        stages.push(SamplerStage::Typical(options.typical_p));
    }
    stages.push(SamplerStage::TopP(options.top_p));
    if options.min_p > 0.0 {
        stages.push(SamplerStage::MinP(options.min_p));
    }
    stages.push(SamplerStage::Temperature(options.temperature));
    StandardSampler::new_softmax(stages, 1)
}

/// Returns the byte offset of the earliest stop sequence in `text`.
fn find_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

/// Byte length of the longest suffix of `text` that could still grow into a
/// stop sequence.
fn partial_stop_len(text: &str, stops: &[String]) -> usize {
    text.char_indices()
        .map(|(start, _)| &text[start..])
        .find(|tail| stops.iter().any(|s| s.len() > tail.len() && s.starts_with(tail)))
        .map_or(0, str::len)
}

/// Filters generated pieces so that no part of a stop sequence reaches the
/// caller, even when it is split across several pieces.
///
/// Text that may be the start of a stop sequence is held back until it
/// either completes the sequence (and is discarded) or no longer can.
struct StopScanner<'a> {
    stops: &'a [String],
    generated: String,
    emitted: usize,
}

impl<'a> StopScanner<'a> {
    fn new(stops: &'a [String]) -> Self {
        Self {
            stops,
            generated: String::new(),
            emitted: 0,
        }
    }

    /// Adds a piece and returns the text that is safe to emit, plus whether
    /// a stop sequence was reached.
    fn push(&mut self, piece: &str) -> (String, bool) {
        self.generated.push_str(piece);
        let pending = &self.generated[self.emitted..];

        if let Some(stop_at) = find_stop(pending, self.stops) {
            let text = pending[..stop_at].to_string();
            self.emitted = self.generated.len();
            return (text, true);
        }

        let safe = pending.len() - partial_stop_len(pending, self.stops);
        let text = pending[..safe].to_string();
        self.emitted += safe;
        (text, false)
    }

    /// Releases whatever was held back once generation ends without a stop.
    fn finish(&mut self) -> String {
        let rest = self.generated[self.emitted..].to_string();
        self.emitted = self.generated.len();
        rest
    }
}

impl Runner for LlamaRunner {
    fn predict(
        &self,
        cancel: &CancellationToken,
        request: &PredictRequest,
        on_fragment: &mut dyn FnMut(PredictResult),
    ) -> Result<(), EngineError> {
        let model = self.model()?;
        let options = &request.options;
        if !request.images.is_empty() {
            warn!(images = request.images.len(), "image inputs are not supported, ignoring");
        }

        let mut session = model
            .create_session(self.session_params(options))
            .map_err(|e| EngineError::Predict(format!("failed to create session: {}", e)))?;

        let mut prompt = request.prompt.clone();
        if request.format == Format::Json {
            prompt.push_str(JSON_INSTRUCTION);
        }
        session
            .advance_context(&prompt)
            .map_err(|e| EngineError::Predict(format!("failed to advance context: {}", e)))?;

        let max_tokens = if options.num_predict < 0 {
            options.num_ctx as usize
        } else {
            options.num_predict as usize
        };
        let completions = session
            .start_completing_with(sampler_for(options), max_tokens)
            .map_err(|e| EngineError::Predict(format!("failed to start completion: {}", e)))?;
        debug!(max_tokens, "completion started");

        let mut scanner = StopScanner::new(&options.stop);
        for piece in completions.into_strings() {
            if cancel.is_cancelled() {
                debug!("generation cancelled by caller");
                break;
            }
            let (text, stopped) = scanner.push(&piece);
            if !text.is_empty() {
                on_fragment(PredictResult {
                    content: text,
                    done: false,
                });
            }
            if stopped {
                debug!("stop sequence reached");
                break;
            }
        }
        let rest = scanner.finish();
        if !rest.is_empty() {
            on_fragment(PredictResult {
                content: rest,
                done: false,
            });
        }

        on_fragment(PredictResult {
            content: String::new(),
            done: true,
        });
        Ok(())
    }

    fn encode(&self, text: &str) -> Result<Vec<i32>, EngineError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EngineError::Encode("runner already closed".to_string()))?;
        let tokens = model
            .tokenize_bytes(text, false, true)
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn embedding(&self, text: &str) -> Result<Vec<f64>, EngineError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EngineError::Embedding("runner already closed".to_string()))?;
        let tokens = model
            .tokenize_bytes(text, true, false)
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let mut vectors = model
            .embeddings(&[tokens], EmbeddingsParams::default())
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EngineError::Embedding("engine returned no embedding".to_string()))?;
        Ok(vector.into_iter().map(f64::from).collect())
    }

    fn close(&mut self) {
        if self.model.take().is_some() {
            info!("llama model released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_earliest_stop_sequence() {
        let stops = vec!["</s>".to_string(), "\nUser:".to_string()];
        assert_eq!(find_stop("hello\nUser: hi</s>", &stops), Some(5));
        assert_eq!(find_stop("hello", &stops), None);
        assert_eq!(find_stop("hello", &[String::new()]), None);
    }

    fn scan(stops: &[&str], pieces: &[&str]) -> (Vec<String>, bool) {
        let stops: Vec<String> = stops.iter().map(|s| s.to_string()).collect();
        let mut scanner = StopScanner::new(&stops);
        let mut out = Vec::new();
        let mut stopped = false;
        for piece in pieces {
            let (text, hit) = scanner.push(piece);
            if !text.is_empty() {
                out.push(text);
            }
            if hit {
                stopped = true;
                break;
            }
        }
        if !stopped {
            let rest = scanner.finish();
            if !rest.is_empty() {
                out.push(rest);
            }
        }
        (out, stopped)
    }

    #[test]
    fn stop_split_across_pieces_is_not_emitted() {
        let (out, stopped) = scan(&["\nUser:"], &["Hi", "\n", "User", ":", " more"]);
        assert_eq!(out, vec!["Hi"]);
        assert!(stopped);
    }

    #[test]
    fn held_back_text_is_released_when_the_stop_does_not_complete() {
        let (out, stopped) = scan(&["\nUser:"], &["a", "\n", "Us", "ed it"]);
        assert_eq!(out.concat(), "a\nUsed it");
        assert!(!stopped);

        let (out, _) = scan(&["</s>"], &["done", "</"]);
        assert_eq!(out, vec!["done", "</"]);
    }

    #[test]
    fn text_before_a_stop_inside_one_piece_is_kept() {
        let (out, stopped) = scan(&["</s>"], &["Hello</s>ignored"]);
        assert_eq!(out, vec!["Hello"]);
        assert!(stopped);
    }

    #[test]
    fn pieces_pass_through_without_stops() {
        let (out, stopped) = scan(&[], &["a", "b"]);
        assert_eq!(out, vec!["a", "b"]);
        assert!(!stopped);
        assert_eq!(partial_stop_len("héllo</", &["</s>".to_string()]), 2);
    }

    #[test]
    fn rejects_non_gguf_artifacts_as_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, b"not a model").unwrap();
        let artifacts = ModelArtifacts {
            model: path,
            adapters: Vec::new(),
            projectors: Vec::new(),
        };

        let err = LlamaEngine::new()
            .load(&artifacts, &Options::default())
            .err()
            .expect("load should fail");

        assert!(matches!(err, EngineError::UnsupportedFormat(_)));
    }

    #[test]
    fn init_is_idempotent() {
        let engine = LlamaEngine::new();
        assert!(engine.init().is_ok());
        assert!(engine.init().is_ok());
    }
}
