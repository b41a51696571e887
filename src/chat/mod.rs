//! Terminal front end: the interactive chat loop and the one-shot commands.

mod display;

mod chat;

mod command_handlers;

pub use chat::{chat_loop, ChatOptions};
pub use command_handlers::{ensure_model, handle_embed, handle_list, handle_pull};
pub use display::human_bytes;
