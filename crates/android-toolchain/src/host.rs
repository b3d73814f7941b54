//! Host tool detection
//!
//! The build shells out to a handful of host tools. Missing ones are installed
//! through `apt-get` unless the user opted out with `AVDROID_SKIP_HOST_DEPS`.

use std::path::Path;
use tracing::{info, warn};
use which::which;

use avdroid_core::process::run_logged;
use avdroid_core::{CommandRunner, CommandSpec};

use crate::error::{ProvisionError, Result};

/// A host executable and the Debian package that provides it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTool {
    pub binary: &'static str,
    pub package: &'static str,
}

pub const REQUIRED_TOOLS: &[HostTool] = &[
    HostTool { binary: "git", package: "git" },
    HostTool { binary: "meson", package: "meson" },
    HostTool { binary: "ninja", package: "ninja-build" },
    HostTool { binary: "pkg-config", package: "pkg-config" },
    HostTool { binary: "make", package: "make" },
    HostTool { binary: "nasm", package: "nasm" },
];

/// Tools from [`REQUIRED_TOOLS`] that `is_present` reports as absent
pub fn missing_tools<F>(is_present: F) -> Vec<HostTool>
where
    F: Fn(&str) -> bool,
{
    REQUIRED_TOOLS
        .iter()
        .filter(|tool| !is_present(tool.binary))
        .copied()
        .collect()
}

/// What [`ensure_host_tools`] ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostToolsStatus {
    AllPresent,
    Installed(Vec<HostTool>),
    Skipped(Vec<HostTool>),
}

/// Check host tools on PATH and install missing ones unless `skip` is set
pub async fn ensure_host_tools<R: CommandRunner>(runner: &R, skip: bool, log_path: &Path) -> Result<HostToolsStatus> {
    let missing = missing_tools(|binary| which(binary).is_ok());
    install_missing(runner, missing, skip, log_path).await
}

async fn install_missing<R: CommandRunner>(
    runner: &R,
    missing: Vec<HostTool>,
    skip: bool,
    log_path: &Path,
) -> Result<HostToolsStatus> {
    if missing.is_empty() {
        info!("All host tools present");
        return Ok(HostToolsStatus::AllPresent);
    }

    let names: Vec<&str> = missing.iter().map(|t| t.binary).collect();
    if skip {
        warn!("Host dependency installation skipped; missing: {}", names.join(", "));
        return Ok(HostToolsStatus::Skipped(missing));
    }

    info!("Installing host tools: {}", names.join(", "));
    let use_sudo = !running_as_root(runner).await;

    let update = apt_command(use_sudo).args(["update", "-qq"]);
    let install = apt_command(use_sudo)
        .args(["install", "-y", "--no-install-recommends"])
        .args(missing.iter().map(|t| t.package));

    for spec in [update, install] {
        let output = run_logged(runner, &spec, log_path).await?;
        if !output.success {
            return Err(ProvisionError::HostDependency {
                detail: format!("`{}` failed: {}", spec.display(), output.stderr.trim()),
                log: log_path.to_path_buf(),
            });
        }
    }

    Ok(HostToolsStatus::Installed(missing))
}

fn apt_command(use_sudo: bool) -> CommandSpec {
    let spec = if use_sudo {
        CommandSpec::new("sudo").arg("apt-get")
    } else {
        CommandSpec::new("apt-get")
    };
    spec.env("DEBIAN_FRONTEND", "noninteractive")
}

async fn running_as_root<R: CommandRunner>(runner: &R) -> bool {
    match runner.run(&CommandSpec::new("id").arg("-u")).await {
        Ok(output) => output.success && output.stdout.trim() == "0",
        Err(_) => false,
    }
}
