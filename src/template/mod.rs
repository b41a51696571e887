//! # Prompt templates
//!
//! Renders a conversation into the single prompt string an engine expects.
//!
//! Templates understand three variables, `{{ .System }}`, `{{ .Prompt }}` and
//! `{{ .Response }}`, plus `{{ if .Var }} ... {{ end }}` blocks. `{{-` and
//! `-}}` trim whitespace on the adjacent side, as in Go templates.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Display;
use thiserror::Error;
use tracing::debug;

use crate::session::{Message, Role};

/// ChatML, used for models that do not carry their own template.
pub const DEFAULT_TEMPLATE: &str = "{{ if .System }}<|im_start|>system\n{{ .System }}<|im_end|>\n{{ end }}{{ if .Prompt }}<|im_start|>user\n{{ .Prompt }}<|im_end|>\n{{ end }}<|im_start|>assistant\n{{ .Response }}<|im_end|>\n";

/// Token cost assumed for every image attachment.
pub const IMAGE_TOKENS: usize = 768;

static ACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(-?)\s*(.*?)\s*(-?)\}\}").expect("static regex"));

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unsupported template action '{0}'")]
    UnsupportedAction(String),
    #[error("unknown template variable '.{0}'")]
    UnknownVariable(String),
    #[error("unbalanced template: {0}")]
    Unbalanced(String),
    #[error("failed to count prompt tokens: {0}")]
    TokenCount(String),
    #[error("conversation is empty")]
    EmptyConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    System,
    Prompt,
    Response,
}

impl Var {
    fn parse(name: &str) -> Result<Self, TemplateError> {
        match name {
            "System" => Ok(Var::System),
            "Prompt" => Ok(Var::Prompt),
            "Response" => Ok(Var::Response),
            other => Err(TemplateError::UnknownVariable(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Var(Var),
    If(Var),
    End,
}

fn variable(expr: &str) -> Result<Var, TemplateError> {
    match expr.strip_prefix('.') {
        Some(name) => Var::parse(name),
        None => Err(TemplateError::UnsupportedAction(expr.to_string())),
    }
}

fn parse(template: &str) -> Result<Vec<Node>, TemplateError> {
    let mut nodes = Vec::new();
    let mut last = 0;
    let mut trim_next = false;
    let mut depth = 0usize;

    for caps in ACTION.captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let mut text = &template[last..whole.start];
        if trim_next {
            text = text.trim_start();
        }
        if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
            text = text.trim_end();
        }
        if !text.is_empty() {
            nodes.push(Node::Text(text.to_string()));
        }

        let expr = caps.get(2).map_or("", |m| m.as_str());
        let node = if let Some(cond) = expr.strip_prefix("if ") {
            depth += 1;
            Node::If(variable(cond.trim())?)
        } else if expr == "end" {
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| TemplateError::Unbalanced("{{ end }} without {{ if }}".into()))?;
            Node::End
        } else {
            Node::Var(variable(expr)?)
        };
        nodes.push(node);

        trim_next = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
        last = whole.end;
    }

    let mut tail = &template[last..];
    if trim_next {
        tail = tail.trim_start();
    }
    if !tail.is_empty() {
        nodes.push(Node::Text(tail.to_string()));
    }
    if depth != 0 {
        return Err(TemplateError::Unbalanced("{{ if }} without {{ end }}".into()));
    }
    Ok(nodes)
}

/// One rendered unit of conversation: an optional system message, a user
/// prompt and the assistant's response to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Turn {
    pub system: String,
    pub prompt: String,
    pub response: String,
    images: usize,
    tokens: usize,
}

impl Turn {
    fn get(&self, var: Var) -> &str {
        match var {
            Var::System => &self.system,
            Var::Prompt => &self.prompt,
            Var::Response => &self.response,
        }
    }

    fn is_empty(&self) -> bool {
        self.system.is_empty() && self.prompt.is_empty() && self.response.is_empty()
    }
}

/// Renders one turn. With `generate` rendering stops at `{{ .Response }}`,
/// leaving the prompt open for the model to complete.
pub fn render(template: &str, turn: &Turn, generate: bool) -> Result<String, TemplateError> {
    let nodes = parse(template)?;
    let mut out = String::new();
    // One entry per open `if`; output is produced only while all are true.
    let mut active: Vec<bool> = Vec::new();

    for node in &nodes {
        let emitting = active.iter().all(|a| *a);
        match node {
            Node::If(var) => active.push(!turn.get(*var).is_empty()),
            Node::End => {
                active.pop();
            }
            Node::Text(text) if emitting => out.push_str(text),
            Node::Var(Var::Response) if emitting && generate => break,
            Node::Var(var) if emitting => out.push_str(turn.get(*var)),
            _ => {}
        }
    }
    Ok(out)
}

fn group_turns(messages: &[Message]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut current = Turn::default();

    for message in messages {
        match message.role {
            Role::System => {
                if !current.is_empty() {
                    turns.push(std::mem::take(&mut current));
                }
                current.system = message.content.clone();
            }
            Role::User => {
                if !current.prompt.is_empty() || !current.response.is_empty() {
                    turns.push(std::mem::take(&mut current));
                }
                current.prompt = message.content.clone();
                current.images += message.image_count();
            }
            Role::Assistant => {
                if !current.response.is_empty() {
                    turns.push(std::mem::take(&mut current));
                }
                current.response = message.content.clone();
            }
        }
    }
    if !current.is_empty() {
        turns.push(current);
    }
    turns
}

fn count_turn<F, E>(turn: &Turn, count_tokens: &mut F) -> Result<usize, TemplateError>
where
    F: FnMut(&str) -> Result<usize, E>,
    E: Display,
{
    let text = format!("{}{}{}", turn.system, turn.prompt, turn.response);
    let tokens = count_tokens(&text).map_err(|e| TemplateError::TokenCount(e.to_string()))?;
    Ok(tokens + turn.images * IMAGE_TOKENS)
}

/// Renders a whole conversation so that it fits in `window` tokens.
///
/// Turns are dropped from the front until the prompt fits or a single turn
/// remains. A system message from a dropped turn is carried into the new
/// first turn so the model keeps its instructions.
pub fn chat_prompt<F, E>(
    template: &str,
    messages: &[Message],
    window: usize,
    mut count_tokens: F,
) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Result<usize, E>,
    E: Display,
{
    let mut turns = group_turns(messages);
    if turns.is_empty() {
        return Err(TemplateError::EmptyConversation);
    }
    for turn in turns.iter_mut() {
        turn.tokens = count_turn(turn, &mut count_tokens)?;
    }

    loop {
        // +1 for the BOS token
        let required: usize = turns.iter().map(|t| t.tokens).sum::<usize>() + 1;
        if required <= window || turns.len() == 1 {
            break;
        }
        let dropped = turns.remove(0);
        debug!(dropped_tokens = dropped.tokens, required, window, "truncating conversation");
        if !dropped.system.is_empty() && turns[0].system.is_empty() {
            turns[0].system = dropped.system;
            turns[0].tokens = count_turn(&turns[0], &mut count_tokens)?;
        }
    }

    let last = turns.len() - 1;
    let mut prompt = String::new();
    for (i, turn) in turns.iter().enumerate() {
        prompt.push_str(&render(template, turn, i == last)?);
    }
    Ok(prompt)
}
