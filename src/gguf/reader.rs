use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use super::types::{GgufError, GgufValue, GgufValueType, GGUF_MAGIC};

/// Longest key or string value accepted. Chat templates are the largest
/// strings in practice and stay far below this.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Deepest nesting of array values accepted.
const MAX_ARRAY_DEPTH: usize = 4;

/// Header and key/value metadata of a GGUF file. Tensor descriptors are not read.
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: BTreeMap<String, GgufValue>,
}

impl GgufMetadata {
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self, GgufError> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        Self::read_from(&mut reader)
    }

    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, GgufError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidFormat("invalid magic number".into()));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if !(1..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let tensor_count = read_len(reader, version)?;
        let metadata_count = read_len(reader, version)?;
        debug!(version, tensor_count, metadata_count, "reading GGUF header");

        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_count {
            let key = read_string(reader, version)?;
            let value_type = GgufValueType::try_from(reader.read_u32::<LittleEndian>()?)?;
            let value = read_value(reader, value_type, version)?;
            metadata.insert(key, value);
        }

        Ok(Self {
            version,
            tensor_count,
            metadata,
        })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(GgufValue::as_str)
    }

    pub fn architecture(&self) -> Option<&str> {
        self.get_str("general.architecture")
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("general.name")
    }

    /// Whether the file embeds a `tokenizer.chat_template`.
    pub fn has_chat_template(&self) -> bool {
        self.get_str("tokenizer.chat_template")
            .is_some_and(|template| !template.trim().is_empty())
    }

    /// Context length the model was trained with, if recorded.
    pub fn context_length(&self) -> Option<i64> {
        let arch = self.architecture()?;
        self.metadata
            .get(&format!("{}.context_length", arch))
            .and_then(GgufValue::as_int)
    }
}

/// Version 1 files store lengths as u32, later versions as u64.
fn read_len<R: Read>(reader: &mut R, version: u32) -> Result<u64, GgufError> {
    Ok(if version >= 2 {
        reader.read_u64::<LittleEndian>()?
    } else {
        reader.read_u32::<LittleEndian>()? as u64
    })
}

fn checked_string_len(len: u64) -> Result<u64, GgufError> {
    if len > MAX_STRING_LEN {
        return Err(GgufError::InvalidFormat(format!(
            "string of {} bytes exceeds the {} byte limit",
            len, MAX_STRING_LEN
        )));
    }
    Ok(len)
}

fn read_string<R: Read>(reader: &mut R, version: u32) -> Result<String, GgufError> {
    let len = checked_string_len(read_len(reader, version)?)?;
    // Grows with the bytes actually present instead of trusting `len` up front.
    let mut buffer = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buffer)?;
    if buffer.len() as u64 != len {
        return Err(GgufError::InvalidFormat(format!(
            "string truncated: expected {} bytes, found {}",
            len,
            buffer.len()
        )));
    }
    String::from_utf8(buffer)
        .map_err(|e| GgufError::InvalidFormat(format!("invalid UTF-8 in string: {}", e)))
}

fn read_value<R: Read + Seek>(
    reader: &mut R,
    value_type: GgufValueType,
    version: u32,
) -> Result<GgufValue, GgufError> {
    Ok(match value_type {
        GgufValueType::U8 => GgufValue::Int(reader.read_u8()? as i64),
        GgufValueType::I8 => GgufValue::Int(reader.read_i8()? as i64),
        GgufValueType::U16 => GgufValue::Int(reader.read_u16::<LittleEndian>()? as i64),
        GgufValueType::I16 => GgufValue::Int(reader.read_i16::<LittleEndian>()? as i64),
        GgufValueType::U32 => GgufValue::Int(reader.read_u32::<LittleEndian>()? as i64),
        GgufValueType::I32 => GgufValue::Int(reader.read_i32::<LittleEndian>()? as i64),
        GgufValueType::U64 => GgufValue::Int(reader.read_u64::<LittleEndian>()? as i64),
        GgufValueType::I64 => GgufValue::Int(reader.read_i64::<LittleEndian>()?),
        GgufValueType::F32 => GgufValue::Float(reader.read_f32::<LittleEndian>()? as f64),
        GgufValueType::F64 => GgufValue::Float(reader.read_f64::<LittleEndian>()?),
        GgufValueType::Bool => GgufValue::Bool(reader.read_u8()? != 0),
        GgufValueType::String => GgufValue::String(read_string(reader, version)?),
        GgufValueType::Array => {
            let element_type = GgufValueType::try_from(reader.read_u32::<LittleEndian>()?)?;
            let len = read_len(reader, version)?;
            skip_elements(reader, element_type, len, version, 1)?;
            GgufValue::Array { element_type, len }
        }
    })
}

fn skip_elements<R: Read + Seek>(
    reader: &mut R,
    element_type: GgufValueType,
    len: u64,
    version: u32,
    depth: usize,
) -> Result<(), GgufError> {
    if depth > MAX_ARRAY_DEPTH {
        return Err(GgufError::InvalidFormat(format!(
            "arrays nested deeper than {} levels",
            MAX_ARRAY_DEPTH
        )));
    }
    if let Some(size) = element_type.fixed_size() {
        let bytes = size
            .checked_mul(len)
            .and_then(|b| i64::try_from(b).ok())
            .ok_or_else(|| GgufError::InvalidFormat(format!("array of {} elements is too large", len)))?;
        reader.seek(SeekFrom::Current(bytes))?;
        return Ok(());
    }
    for _ in 0..len {
        match element_type {
            GgufValueType::String => {
                let str_len = checked_string_len(read_len(reader, version)?)?;
                let skip = i64::try_from(str_len)
                    .map_err(|_| GgufError::InvalidFormat("string length overflow".into()))?;
                reader.seek(SeekFrom::Current(skip))?;
            }
            GgufValueType::Array => {
                let nested = GgufValueType::try_from(reader.read_u32::<LittleEndian>()?)?;
                let nested_len = read_len(reader, version)?;
                skip_elements(reader, nested, nested_len, version, depth + 1)?;
            }
            _ => unreachable!("fixed-size element types are skipped above"),
        }
    }
    Ok(())
}

/// Checks the magic number without parsing the rest of the file.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let Ok(mut file) = File::open(path.as_ref()) else {
        return false;
    };
    matches!(file.read_u32::<LittleEndian>(), Ok(magic) if magic == GGUF_MAGIC)
}
