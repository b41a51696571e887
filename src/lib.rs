//! llmcore keeps one local GGUF model loaded and streams chat replies from it.
//!
//! [`session::Session`] is the entry point: it loads models resolved by a
//! [`registry::Registry`] into an [`engine::Engine`] and turns conversations
//! into cancellable [`session::ChatStream`]s.

pub mod chat;
pub mod config;
pub mod engine;
pub mod gguf;
pub mod registry;
pub mod session;
pub mod template;
