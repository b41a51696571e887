//! # Session
//!
//! Single-model session management: the lifecycle of the loaded model,
//! the lock that keeps it single-user and the pipeline that turns a
//! conversation into a cancellable stream of fragments.

mod error;
mod handle;
mod options;
mod session;
mod stream;
mod types;

pub use error::SessionError;
pub use options::{merge_options, OptionMap, Options};
pub use session::Session;
pub use stream::{ChatChunk, ChatStream, FragmentPublisher};
pub use types::{Message, Role};
