use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

use super::RegistryError;

pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

static PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("static regex"));

/// A parsed model reference of the form `[namespace/]model[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelName {
    pub namespace: String,
    pub model: String,
    pub tag: String,
}

impl ModelName {
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidName(raw.to_string());
        let raw_trimmed = raw.trim();

        let (path, tag) = match raw_trimmed.rsplit_once(':') {
            Some((path, tag)) => (path, tag),
            None => (raw_trimmed, DEFAULT_TAG),
        };
        let (namespace, model) = match path.split_once('/') {
            Some((namespace, model)) => (namespace, model),
            None => (DEFAULT_NAMESPACE, path),
        };

        for part in [namespace, model, tag] {
            if !PART.is_match(part) {
                return Err(invalid());
            }
        }

        Ok(Self {
            namespace: namespace.to_string(),
            model: model.to_string(),
            tag: tag.to_string(),
        })
    }

    /// File stem used for the weights inside the models directory.
    pub fn file_stem(&self) -> String {
        if self.namespace == DEFAULT_NAMESPACE {
            format!("{}-{}", self.model, self.tag)
        } else {
            format!("{}-{}-{}", self.namespace, self.model, self.tag)
        }
    }

    /// Path of the weights relative to the remote registry base URL.
    pub fn remote_path(&self) -> String {
        format!("{}/{}/{}.gguf", self.namespace, self.model, self.tag)
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != DEFAULT_NAMESPACE {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{}:{}", self.model, self.tag)
    }
}

/// Canonical form of `raw`, or `raw` itself when it does not parse.
pub fn canonical_name(raw: &str) -> String {
    ModelName::parse(raw)
        .map(|name| name.to_string())
        .unwrap_or_else(|_| raw.to_string())
}
