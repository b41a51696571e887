use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llmcore::chat::{self, ChatOptions};
use llmcore::config::Settings;
use llmcore::engine::{Engine, LlamaEngine};
use llmcore::registry::{LocalRegistry, Registry};
use llmcore::session::{OptionMap, Options, Session};

#[derive(Parser)]
#[command(name = "llmcore", version, about = "Run local GGUF models from the terminal")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List models available locally
    List,
    /// Download a model from the registry
    Pull { model: String },
    /// Chat with a model interactively
    Chat {
        model: String,
        /// Ask the model to answer in JSON
        #[arg(long)]
        json: bool,
        /// System message for the conversation
        #[arg(long)]
        system: Option<String>,
        /// Generation option override, e.g. --option temperature=0.2
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_option)]
        options: Vec<(String, Value)>,
    },
    /// Print the embedding of a text as JSON
    Embed { model: String, text: String },
}

/// Parses `key=value`; the value is read as JSON and kept as a string when it is not valid JSON.
fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing option name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("failed to load configuration")?;

    let log_dir = settings.logging.file.as_deref().unwrap_or_else(|| Path::new("logs"));
    let file_appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        log_dir,
        "llmcore",
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .with_env_filter(filter)
        .init();

    info!("llmcore starting up");
    info!("Models directory: {}", settings.models.directory.display());

    let registry = Arc::new(
        LocalRegistry::from_settings(&settings)
            .open()
            .context("failed to open model registry")?,
    );

    match cli.command {
        Command::List => chat::handle_list(registry.as_ref()).await,
        Command::Pull { model } => chat::handle_pull(registry.as_ref(), &model).await,
        Command::Chat { model, json, system, options } => {
            chat::ensure_model(registry.as_ref(), &model).await?;
            let session = open_session(&settings, registry, &model).await?;
            let overrides: OptionMap = options.into_iter().collect();
            let result = chat::chat_loop(&session, ChatOptions { json, system, overrides }).await;
            session.close().await;
            result
        }
        Command::Embed { model, text } => {
            let session = open_session(&settings, registry, &model).await?;
            let result = chat::handle_embed(&session, &text).await;
            session.close().await;
            result
        }
    }
}

async fn open_session(settings: &Settings, registry: Arc<LocalRegistry>, model: &str) -> Result<Session> {
    let registry: Arc<dyn Registry> = registry;
    let engine: Arc<dyn Engine> = Arc::new(LlamaEngine::new());
    let session = Session::new(registry, engine).with_defaults(Options::from_settings(&settings.inference));

    println!("Loading {}...", model);
    session
        .reload(&CancellationToken::new(), model)
        .await
        .with_context(|| format!("failed to load {}", model))?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_values_are_parsed_as_json() {
        assert_eq!(parse_option("num_ctx=4096").unwrap(), ("num_ctx".to_string(), Value::from(4096)));
        assert_eq!(parse_option("stop=[\"</s>\"]").unwrap().1, serde_json::json!(["</s>"]));
    }

    #[test]
    fn non_json_values_stay_strings() {
        assert_eq!(parse_option("stop=END").unwrap().1, Value::String("END".into()));
        assert!(parse_option("temperature").is_err());
        assert!(parse_option("=1").is_err());
    }
}
