//! avdroid - FFmpeg + dav1d cross-compilation for Android
//!
//! Parses the command line, installs logging and runs the build pipeline.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::info;

use avdroid::cli::Cli;
use avdroid::logging::init_logging;
use avdroid_build_engine::PipelineError;
use avdroid_core::ConfigError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            let err = PipelineError::from(ConfigError::InvalidArguments(e.to_string()));
            return ExitCode::from(err.exit_code());
        }
    };

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    let overrides = cli.into_overrides();
    match avdroid::run(&overrides).await {
        Ok(summary) => {
            for staged in &summary.staged {
                info!(
                    "{}: {} libraries ({} link)",
                    staged.abi,
                    staged.libraries.len(),
                    staged.link_mode
                );
            }
            info!("Release written to {:?}", summary.output_dir);
            ExitCode::SUCCESS
        }
        Err(e) => {
            avdroid::report_failure(&e);
            ExitCode::from(e.exit_code())
        }
    }
}
