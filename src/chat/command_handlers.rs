use anyhow::{bail, Context, Result};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{stdin, stdout, IsTerminal, Write};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chat::display::display_models_table;
use crate::registry::{ProgressEvent, Registry};
use crate::session::Session;

/// `llmcore list`
pub async fn handle_list(registry: &dyn Registry) -> Result<()> {
    let models = registry.list().context("failed to list models")?;
    display_models_table(&models);
    Ok(())
}

fn pull_progress_bar() -> ProgressBar {
    // Nothing to draw when the output is piped.
    if !stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb
}

/// `llmcore pull <model>`. Ctrl-C aborts the download.
pub async fn handle_pull(registry: &dyn Registry, name: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let pb = pull_progress_bar();
    let mut on_progress = |event: ProgressEvent| {
        if event.total > 0 {
            pb.set_length(event.total);
        }
        pb.set_position(event.completed);
    };

    let result = tokio::select! {
        result = registry.pull(&cancel, name, &mut on_progress) => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            pb.abandon_with_message("cancelled");
            bail!("pull of {} cancelled", name);
        }
    };

    match result {
        Ok(()) => {
            pb.finish_and_clear();
            info!(model = name, "model pulled");
            println!("{} {}", "Pulled".green(), name.bold());
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(e).with_context(|| format!("failed to pull {}", name))
        }
    }
}

/// Asks a yes/no question on the terminal.
fn confirm(question: &str) -> Result<bool> {
    print!("{} ", question);
    stdout().flush()?;
    let mut answer = String::new();
    stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

/// Makes sure `name` is available locally, offering to pull it if not.
pub async fn ensure_model(registry: &dyn Registry, name: &str) -> Result<()> {
    if registry.has(name)? {
        return Ok(());
    }
    println!("Model {} is not available locally.", name.bold());
    if !confirm("Pull model? (y/n)")? {
        bail!("model not found");
    }
    handle_pull(registry, name).await
}

/// `llmcore embed <model> <text>`
pub async fn handle_embed(session: &Session, text: &str) -> Result<()> {
    let vector = session
        .embedding(&CancellationToken::new(), text)
        .await
        .context("failed to compute embedding")?;
    println!("{}", serde_json::to_string(&vector)?);
    Ok(())
}
