//! Where source declarations come from.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::drivers::SourceConfig;

/// Source declarations keyed by source name.
pub type SourceConfigs = HashMap<String, SourceConfig>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown format of sources configuration. Expected map, json string representation or string starting with file:// or http(s)://")]
    UnknownFormat,

    #[error("failed to parse sources payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("sources are configured more than once: {0}")]
    Conflict(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The one active mode of obtaining source declarations.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcesProvider {
    /// Structured configuration, loaded once.
    Static(SourceConfigs),
    /// A JSON document given inline, loaded once.
    InlineJson(String),
    /// A local file, polled for changes.
    File(PathBuf),
    /// An HTTP(S) resource, polled for changes.
    Http(String),
}

impl SourcesProvider {
    /// Interpret a string setting: `http(s)://` and `file://` URIs are polled,
    /// a `{...}` value is inline JSON.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if value.starts_with("http://") || value.starts_with("https://") {
            Ok(Self::Http(value.to_string()))
        } else if let Some(path) = value.strip_prefix("file://") {
            Ok(Self::File(PathBuf::from(path)))
        } else if value.starts_with('{') && value.ends_with('}') {
            Ok(Self::InlineJson(value.to_string()))
        } else {
            Err(ConfigError::UnknownFormat)
        }
    }

    /// Whether the provider is polled for changes.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::File(_) | Self::Http(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Static(configs) => format!("static ({} sources)", configs.len()),
            Self::InlineJson(_) => "inline json".to_string(),
            Self::File(path) => format!("file://{}", path.display()),
            Self::Http(url) => url.clone(),
        }
    }
}

/// Decode a JSON payload mapping source names to declarations.
pub fn parse_from_bytes(payload: &[u8]) -> Result<SourceConfigs, ConfigError> {
    Ok(serde_json::from_slice(payload)?)
}
