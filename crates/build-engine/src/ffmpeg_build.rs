//! FFmpeg build
//!
//! Configures the shared FFmpeg checkout for one ABI, builds and installs it,
//! and records the generated `config.h`.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use avdroid_android_toolchain::{SourceCheckout, ToolchainDescriptor};
use avdroid_core::process::run_logged;
use avdroid_core::{Abi, CommandRunner, CommandSpec};

use crate::artifacts::AbiLayout;
use crate::dav1d::Dav1dInstall;
use crate::{run_step, BuildError};

/// An FFmpeg install tree for one ABI
#[derive(Debug, Clone)]
pub struct FfmpegInstall {
    pub prefix: PathBuf,
    pub include_dir: PathBuf,
    pub lib_dir: PathBuf,
    /// Copy of the `config.h` this install was built with
    pub config_record: PathBuf,
}

/// `./configure` arguments for one ABI
pub fn configure_args(
    tc: &ToolchainDescriptor,
    dav1d: &Dav1dInstall,
    prefix: &Path,
    enable_static: bool,
) -> Vec<String> {
    let mut args = vec![
        format!("--prefix={}", prefix.display()),
        "--target-os=android".to_string(),
        format!("--arch={}", tc.arch),
        format!("--cpu={}", tc.cpu_model),
        "--enable-cross-compile".to_string(),
        format!("--cross-prefix={}", tc.cross_prefix),
        format!("--cc={}", tc.cc.display()),
        format!("--cxx={}", tc.cxx.display()),
        format!("--ar={}", tc.ar.display()),
        format!("--ranlib={}", tc.ranlib.display()),
        format!("--strip={}", tc.strip.display()),
        format!("--nm={}", tc.nm.display()),
        format!("--sysroot={}", tc.sysroot.display()),
        format!("--pkg-config={}", dav1d.pkg_config_shim.display()),
        format!("--extra-cflags=-I{} -fPIC", dav1d.include_dir.display()),
        format!("--extra-ldflags=-L{}", dav1d.lib_dir.display()),
        "--enable-pic".to_string(),
        "--enable-shared".to_string(),
    ];

    args.push(if enable_static { "--enable-static" } else { "--disable-static" }.to_string());
    args.extend(
        [
            "--disable-iconv",
            "--enable-libdav1d",
            "--disable-doc",
            "--disable-ffplay",
            "--disable-ffprobe",
            "--disable-debug",
        ]
        .map(String::from),
    );

    args.push(if tc.neon { "--enable-neon" } else { "--disable-neon" }.to_string());
    if tc.abi == Abi::X86 {
        // text relocations from the x86 asm are rejected by the Android linker
        args.push("--disable-asm".to_string());
    }
    args
}

/// Clean, configure, build and install FFmpeg for the descriptor's ABI.
///
/// The checkout is configured in-tree, so it is borrowed mutably for the
/// duration of the build.
pub async fn build_ffmpeg<R: CommandRunner>(
    runner: &R,
    tc: &ToolchainDescriptor,
    layout: &AbiLayout,
    source: &mut SourceCheckout,
    dav1d: &Dav1dInstall,
    jobs: usize,
    enable_static: bool,
) -> Result<FfmpegInstall, BuildError> {
    info!("Building FFmpeg {} for {}", source.tag(), tc.abi);
    let log = layout.log("ffmpeg");
    let src = source.path().to_path_buf();

    let distclean = CommandSpec::new("make").current_dir(&src).arg("distclean");
    let cleaned = run_logged(runner, &distclean, &log).await?;
    if !cleaned.success {
        // a fresh checkout has no config.mak
        warn!("make distclean failed for {}, continuing", tc.abi);
    }

    let prefix = layout.ffmpeg_prefix();
    if prefix.exists() {
        std::fs::remove_dir_all(&prefix)?;
    }

    let configure = CommandSpec::new("./configure")
        .current_dir(&src)
        .args(configure_args(tc, dav1d, &prefix, enable_static));
    if let Err(e) = run_step(runner, tc.abi, "configure", &configure, &log).await {
        append_config_log(&src, &log);
        return Err(e);
    }

    let make = CommandSpec::new("make")
        .current_dir(&src)
        .arg(format!("-j{}", jobs));
    run_step(runner, tc.abi, "make", &make, &log).await?;

    let install = CommandSpec::new("make").current_dir(&src).arg("install");
    run_step(runner, tc.abi, "make-install", &install, &log).await?;

    let config_h = src.join("config.h");
    if !config_h.exists() {
        return Err(BuildError::MissingOutput(config_h));
    }
    let config_record = layout.config_record();
    std::fs::copy(&config_h, &config_record)?;

    let result = FfmpegInstall {
        include_dir: prefix.join("include"),
        lib_dir: prefix.join("lib"),
        prefix,
        config_record,
    };
    if !result.lib_dir.is_dir() {
        return Err(BuildError::MissingOutput(result.lib_dir));
    }

    info!("FFmpeg installed to {:?}", result.prefix);
    Ok(result)
}

/// Append FFmpeg's own `ffbuild/config.log` to the step log
fn append_config_log(src: &Path, log: &Path) {
    use std::io::Write;

    let config_log = src.join("ffbuild").join("config.log");
    let Ok(content) = std::fs::read_to_string(&config_log) else {
        return;
    };
    let appended = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(log)
        .and_then(|mut file| {
            writeln!(file, "# ---- {} ----", config_log.display())?;
            file.write_all(content.as_bytes())
        });
    if let Err(e) = appended {
        warn!("Could not append {:?} to {:?}: {}", config_log, log, e);
    }
}
