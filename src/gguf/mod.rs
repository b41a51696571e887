mod reader;
mod types;

pub use reader::{is_gguf_file, GgufMetadata};
pub use types::{GgufError, GgufValue, GgufValueType, GGUF_MAGIC};
