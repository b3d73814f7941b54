//! avdroid Build Engine
//!
//! Drives one ABI at a time through dav1d, FFmpeg and the tool-entry library,
//! verifies the result and stages it into the release layout.

pub mod artifacts;
pub mod dav1d;
pub mod ffmpeg_build;
pub mod runner;
pub mod stage;
pub mod tool_lib;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use artifacts::{AbiLayout, BuildArtifactSet};
pub use dav1d::Dav1dInstall;
pub use ffmpeg_build::FfmpegInstall;
pub use runner::{AbiStage, AbiState, Pipeline, PipelineError, PipelineSummary, Sources};
pub use stage::{StagedAbi, Stager};
pub use tool_lib::{LinkMode, LinkOutcome, ToolLibrary};
pub use verify::{DependencyReport, VerificationError, VerifiedArtifacts, Verifier};

use std::path::{Path, PathBuf};

use avdroid_core::process::run_logged;
use avdroid_core::{Abi, CommandOutput, CommandRunner, CommandSpec};

/// Build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{step} failed for {abi} (log: {log:?})")]
    StepFailed {
        abi: Abi,
        step: &'static str,
        log: PathBuf,
    },
    #[error("Linking the tool library failed for {abi} after {} attempt(s)", .logs.len())]
    LinkFailed { abi: Abi, logs: Vec<PathBuf> },
    #[error("Expected build output missing: {0:?}")]
    MissingOutput(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Logs worth showing the user when this error is reported
    pub fn logs(&self) -> Vec<PathBuf> {
        match self {
            BuildError::StepFailed { log, .. } => vec![log.clone()],
            BuildError::LinkFailed { logs, .. } => logs.clone(),
            _ => Vec::new(),
        }
    }
}

/// Run one build step, turning a non-zero exit into [`BuildError::StepFailed`]
pub(crate) async fn run_step<R: CommandRunner>(
    runner: &R,
    abi: Abi,
    step: &'static str,
    spec: &CommandSpec,
    log: &Path,
) -> Result<CommandOutput, BuildError> {
    let output = run_logged(runner, spec, log).await?;
    if !output.success {
        return Err(BuildError::StepFailed {
            abi,
            step,
            log: log.to_path_buf(),
        });
    }
    Ok(output)
}
