//! Provisioning errors
//!
//! None of these are retried internally; a rerun resumes from whatever was
//! already provisioned.

use std::path::{Path, PathBuf};

/// Toolchain / source provisioning error
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Download of {url} failed with HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("Invalid NDK at {path:?}: {reason}")]
    InvalidNdk { path: PathBuf, reason: String },
    #[error("Toolchain for {abi} not found at {path:?}")]
    ToolchainNotFound { abi: String, path: PathBuf },
    #[error("Tag '{tag}' does not exist in {repo}")]
    UnknownTag { repo: String, tag: String },
    #[error("git {action} failed for {repo}: {detail}")]
    Git {
        repo: String,
        action: &'static str,
        detail: String,
        log: PathBuf,
    },
    #[error("Host dependency installation failed: {detail}")]
    HostDependency { detail: String, log: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Log holding the failed command's transcript, if one was written
    pub fn log(&self) -> Option<&Path> {
        match self {
            ProvisionError::Git { log, .. } | ProvisionError::HostDependency { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// Result type alias for provisioning
pub type Result<T> = std::result::Result<T, ProvisionError>;
