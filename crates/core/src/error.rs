//! Error types for avdroid configuration
//!
//! Configuration errors are reported before any build step starts.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration resolution error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unsupported ABI '{0}' (supported: arm64-v8a, armeabi-v7a, x86, x86_64)")]
    UnsupportedAbi(String),

    #[error("Invalid command line: {0}")]
    InvalidArguments(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path:?}: {source}")]
    ConfigFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    ConfigFileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for configuration resolution
pub type Result<T> = std::result::Result<T, ConfigError>;
