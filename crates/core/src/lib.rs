//! avdroid Core - configuration and shared plumbing
//!
//! This crate provides the pieces every pipeline stage shares: the ABI model,
//! the resolved [`BuildConfig`], the configuration error type and the
//! [`CommandRunner`] abstraction over external processes.

pub mod abi;
pub mod config;
pub mod error;
pub mod process;

pub use abi::Abi;
pub use config::{BuildConfig, ConfigFile, ConfigOverrides};
pub use error::{ConfigError, Result};
pub use process::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};

/// avdroid version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
