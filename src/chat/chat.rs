use anyhow::Result;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{stdout, Write};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{Message, OptionMap, Session};

/// Per-conversation settings taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Ask the model for JSON output
    pub json: bool,
    /// System message seeded at the start of the conversation
    pub system: Option<String>,
    /// Request overrides sent with every message
    pub overrides: OptionMap,
}

fn print_help(model: &str) {
    println!("\n{} {}", "Chatting with".cyan(), model.bold());
    println!("{}", "=".repeat(60).bright_cyan());
    println!("{} - Exit the chat", "exit, bye, quit".green());
    println!("{}           - Forget the conversation so far", "clear".green());
    println!("{}          - Interrupt a reply", "Ctrl-C".green());
    println!();
}

/// Streams one reply to stdout. Returns what was received before the
/// stream ended, which after a Ctrl-C is a partial reply.
async fn stream_reply(
    session: &Session,
    history: &[Message],
    options: &ChatOptions,
) -> Result<String> {
    let cancel = CancellationToken::new();
    let overrides = (!options.overrides.is_empty()).then_some(&options.overrides);
    let mut stream = if options.json {
        session.chat_json(&cancel, history, overrides).await?
    } else {
        session.chat(&cancel, history, overrides).await?
    };

    let mut reply = String::new();
    loop {
        tokio::select! {
            chunk = stream.recv() => match chunk {
                Some(Ok(fragment)) => {
                    print!("{}", fragment.content.bright_cyan());
                    stdout().flush()?;
                    reply.push_str(&fragment.content);
                }
                Some(Err(e)) => {
                    println!();
                    warn!("reply failed: {}", e);
                    println!("{} {}", "Error:".red(), e);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                println!("\n{}", "[Generation Interrupted]".yellow());
                break;
            }
        }
    }
    println!();
    Ok(reply)
}

/// Interactive chat with the model loaded in `session`.
pub async fn chat_loop(session: &Session, options: ChatOptions) -> Result<()> {
    let model = session.model_name().await.unwrap_or_default();
    print_help(&model);

    let seed: Vec<Message> = options.system.iter().map(Message::system).collect();
    let mut history = seed.clone();
    let mut rl = DefaultEditor::new()?;

    loop {
        let input = match rl.readline("You: ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        remember(&mut rl, input);

        match input.to_lowercase().as_str() {
            "exit" | "bye" | "quit" => break,
            "clear" => {
                history = seed.clone();
                println!("{}", "Conversation cleared".yellow());
                continue;
            }
            _ => {}
        }

        history.push(Message::user(input));
        print!("{} ", format!("[{}]", model).bold().yellow());
        stdout().flush()?;

        match stream_reply(session, &history, &options).await {
            Ok(reply) if !reply.is_empty() => history.push(Message::assistant(reply)),
            Ok(_) => {
                history.pop();
            }
            Err(e) => {
                // Rejected before generation started, drop the message.
                history.pop();
                println!("\n{} {:#}", "Error:".red(), e);
            }
        }
    }

    info!(messages = history.len(), "chat ended");
    println!("Goodbye!");
    Ok(())
}

/// Adds a line to the editor history. Returns whether it was recorded.
fn remember(rl: &mut DefaultEditor, input: &str) -> bool {
    match rl.add_history_entry(input) {
        Ok(added) => added,
        Err(e) => {
            debug!("could not add history entry: {}", e);
            false
        }
    }
}
