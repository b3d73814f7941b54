//! avdroid - FFmpeg + dav1d for Android
//!
//! Builds FFmpeg with the dav1d AV1 decoder for a set of Android ABIs and
//! stages the shared libraries, headers and a `libffmpegkit.so` tool library
//! into a release directory.
//!
//! ## Architecture
//!
//! - `avdroid-core`: ABI model, configuration resolution, process execution
//! - `avdroid-android-toolchain`: host tools, NDK and source provisioning
//! - `avdroid-build-engine`: per-ABI build state machine, verifier and stager

pub mod cli;
pub mod logging;

use std::path::Path;

use tracing::error;

use avdroid_android_toolchain::HttpFetcher;
use avdroid_build_engine::{Pipeline, PipelineError, PipelineSummary};
use avdroid_core::process::log_tail;
use avdroid_core::{BuildConfig, ConfigOverrides, SystemRunner};

/// Lines of each relevant log printed when a run fails
pub const LOG_TAIL_LINES: usize = 40;

/// Timeout for the NDK download, which is a few hundred megabytes
const DOWNLOAD_TIMEOUT_SECS: u64 = 3600;

/// Resolve the configuration and run the pipeline against the real host
pub async fn run(overrides: &ConfigOverrides) -> Result<PipelineSummary, PipelineError> {
    let config = BuildConfig::resolve(overrides, |key| std::env::var(key).ok())?;
    let fetcher = HttpFetcher::new(DOWNLOAD_TIMEOUT_SECS)?;
    Pipeline::new(&config, &SystemRunner, fetcher).run().await
}

/// Print an error and the tail of every log that explains it
pub fn report_failure(err: &PipelineError) {
    error!("{}", err);
    for log in err.diagnostic_logs() {
        print_log_tail(&log);
    }
}

fn print_log_tail(log: &Path) {
    match log_tail(log, LOG_TAIL_LINES) {
        Ok(lines) => {
            eprintln!("---- last {} lines of {} ----", lines.len(), log.display());
            for line in lines {
                eprintln!("{}", line);
            }
        }
        Err(e) => eprintln!("(could not read {}: {})", log.display(), e),
    }
}
