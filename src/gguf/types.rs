use std::fmt;
use thiserror::Error;

/// The magic number that identifies GGUF files ("GGUF" read as little-endian u32)
pub const GGUF_MAGIC: u32 = 0x4655_4747;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("invalid GGUF file: {0}")]
    InvalidFormat(String),
    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
    #[error("I/O error reading GGUF file: {0}")]
    Io(#[from] std::io::Error),
}

/// GGUF metadata value types as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgufValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl TryFrom<u32> for GgufValueType {
    type Error = GgufError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => GgufValueType::U8,
            1 => GgufValueType::I8,
            2 => GgufValueType::U16,
            3 => GgufValueType::I16,
            4 => GgufValueType::U32,
            5 => GgufValueType::I32,
            6 => GgufValueType::F32,
            7 => GgufValueType::Bool,
            8 => GgufValueType::String,
            9 => GgufValueType::Array,
            10 => GgufValueType::U64,
            11 => GgufValueType::I64,
            12 => GgufValueType::F64,
            other => {
                return Err(GgufError::InvalidFormat(format!(
                    "unknown value type {}",
                    other
                )))
            }
        })
    }
}

impl GgufValueType {
    /// Encoded size of fixed-width types, `None` for strings and arrays.
    pub fn fixed_size(self) -> Option<u64> {
        match self {
            GgufValueType::U8 | GgufValueType::I8 | GgufValueType::Bool => Some(1),
            GgufValueType::U16 | GgufValueType::I16 => Some(2),
            GgufValueType::U32 | GgufValueType::I32 | GgufValueType::F32 => Some(4),
            GgufValueType::U64 | GgufValueType::I64 | GgufValueType::F64 => Some(8),
            GgufValueType::String | GgufValueType::Array => None,
        }
    }
}

/// A decoded metadata value. Arrays keep only their shape; the registry
/// never needs their contents (vocabularies run to hundreds of thousands of entries).
#[derive(Clone, PartialEq)]
pub enum GgufValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array { element_type: GgufValueType, len: u64 },
}

impl GgufValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            GgufValue::Int(i) => Some(*i),
            GgufValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }
}

impl fmt::Debug for GgufValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GgufValue::String(s) => write!(f, "String({:?})", s),
            GgufValue::Int(i) => write!(f, "Int({})", i),
            GgufValue::Float(fl) => write!(f, "Float({})", fl),
            GgufValue::Bool(b) => write!(f, "Bool({})", b),
            GgufValue::Array { element_type, len } => write!(f, "Array({:?} x {})", element_type, len),
        }
    }
}
