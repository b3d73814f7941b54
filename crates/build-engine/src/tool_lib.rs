//! Tool-entry library
//!
//! Builds `libffmpegkit.so`: the ffmpeg command-line program compiled as a
//! shared object whose `main` is exported as `ffmpeg_main`.
//!
//! Linking is a two-attempt strategy. The first attempt links against the
//! freshly built shared FFmpeg libraries; if that fails and static fallback is
//! enabled, a second attempt pulls in the static archives whole.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use avdroid_android_toolchain::{SourceCheckout, ToolchainDescriptor};
use avdroid_core::process::run_logged;
use avdroid_core::{Abi, CommandRunner, CommandSpec};

use crate::artifacts::AbiLayout;
use crate::dav1d::Dav1dInstall;
use crate::ffmpeg_build::FfmpegInstall;
use crate::{run_step, BuildError};

pub const TOOL_LIBRARY: &str = "libffmpegkit.so";
pub const ENTRY_SYMBOL: &str = "ffmpeg_main";

/// FFmpeg libraries in link order
pub const FFMPEG_LIBS: &[&str] = &[
    "avdevice",
    "avfilter",
    "avformat",
    "avcodec",
    "swresample",
    "swscale",
    "avutil",
];

/// fftools objects that carry their own `main`
const EXCLUDED_OBJECTS: &[&str] = &["ffmpeg.o", "ffprobe.o", "ffplay.o"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    Shared,
    StaticWholeArchive,
}

impl LinkMode {
    fn log_name(self) -> &'static str {
        match self {
            LinkMode::Shared => "link-shared",
            LinkMode::StaticWholeArchive => "link-static",
        }
    }
}

impl std::fmt::Display for LinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkMode::Shared => write!(f, "shared"),
            LinkMode::StaticWholeArchive => write!(f, "static (whole-archive)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkAttempt {
    pub mode: LinkMode,
    pub log: PathBuf,
    pub success: bool,
}

/// Result of the link strategy
#[derive(Debug, Clone)]
pub enum LinkOutcome {
    Linked {
        library: PathBuf,
        mode: LinkMode,
        attempts: Vec<LinkAttempt>,
    },
    FailedWithLog { attempts: Vec<LinkAttempt> },
}

impl LinkOutcome {
    pub fn attempts(&self) -> &[LinkAttempt] {
        match self {
            LinkOutcome::Linked { attempts, .. } | LinkOutcome::FailedWithLog { attempts } => attempts,
        }
    }

    /// Collapse into the library or a [`BuildError::LinkFailed`] carrying
    /// every attempt's log
    pub fn into_result(self, abi: Abi) -> Result<ToolLibrary, BuildError> {
        match self {
            LinkOutcome::Linked { library, mode, .. } => Ok(ToolLibrary { path: library, mode }),
            LinkOutcome::FailedWithLog { attempts } => Err(BuildError::LinkFailed {
                abi,
                logs: attempts.into_iter().map(|a| a.log).collect(),
            }),
        }
    }
}

/// A linked tool library
#[derive(Debug, Clone)]
pub struct ToolLibrary {
    pub path: PathBuf,
    pub mode: LinkMode,
}

/// Compile the entry object with `main` renamed
pub fn compile_entry_spec(tc: &ToolchainDescriptor, src: &Path, ffmpeg: &FfmpegInstall, out: &Path) -> CommandSpec {
    CommandSpec::new(&tc.cc)
        .args(["-c", "-fPIC", "-O2"])
        .arg(format!("-I{}", src.display()))
        .arg(format!("-I{}", src.join("fftools").display()))
        .arg(format!("-I{}", ffmpeg.include_dir.display()))
        .arg(format!("-Dmain={}", ENTRY_SYMBOL))
        .arg("-o")
        .arg(out)
        .arg(src.join("fftools").join("ffmpeg.c"))
}

/// Link command for one attempt
pub fn link_spec(
    mode: LinkMode,
    tc: &ToolchainDescriptor,
    ffmpeg: &FfmpegInstall,
    dav1d: &Dav1dInstall,
    entry: &Path,
    objects: &[PathBuf],
    out: &Path,
) -> CommandSpec {
    let spec = CommandSpec::new(&tc.cc)
        .args(["-shared", "-fPIC"])
        .arg(format!("-Wl,-soname,{}", TOOL_LIBRARY))
        .arg("-Wl,--no-undefined")
        .arg("-o")
        .arg(out)
        .arg(entry)
        .args(objects);

    match mode {
        LinkMode::Shared => spec
            .arg(format!("-L{}", ffmpeg.lib_dir.display()))
            .args(FFMPEG_LIBS.iter().map(|lib| format!("-l{}", lib)))
            .arg("-lm"),
        LinkMode::StaticWholeArchive => spec
            .arg("-Wl,--whole-archive")
            .args(
                FFMPEG_LIBS
                    .iter()
                    .map(|lib| ffmpeg.lib_dir.join(format!("lib{}.a", lib)))
                    .filter(|archive| archive.exists()),
            )
            .arg("-Wl,--no-whole-archive")
            .arg(dav1d.static_library())
            .args(["-lm", "-lz", "-ldl", "-Wl,-Bsymbolic"]),
    }
}

/// Object files from the fftools tree, minus those defining `main`
pub fn collect_objects(src: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let pattern = format!(
        "{}/fftools/**/*.o",
        glob::Pattern::escape(&src.to_string_lossy())
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| BuildError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

    let mut objects = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| BuildError::Io(e.into()))?;
        let excluded = path
            .file_name()
            .map(|name| EXCLUDED_OBJECTS.iter().any(|ex| name == *ex))
            .unwrap_or(true);
        if !excluded {
            objects.push(path);
        }
    }
    objects.sort();
    Ok(objects)
}

/// Compile and link the tool-entry library.
///
/// Returns `Err` only when the entry object cannot be compiled; link failures
/// are reported through [`LinkOutcome::FailedWithLog`].
pub async fn build_tool_library<R: CommandRunner>(
    runner: &R,
    tc: &ToolchainDescriptor,
    layout: &AbiLayout,
    source: &mut SourceCheckout,
    ffmpeg: &FfmpegInstall,
    dav1d: &Dav1dInstall,
    static_fallback: bool,
) -> Result<LinkOutcome, BuildError> {
    let src = source.path().to_path_buf();
    let tool_dir = layout.tool_dir();
    if tool_dir.exists() {
        std::fs::remove_dir_all(&tool_dir)?;
    }
    std::fs::create_dir_all(&tool_dir)?;

    let entry = tool_dir.join("ffmpeg_main.o");
    let compile = compile_entry_spec(tc, &src, ffmpeg, &entry);
    run_step(runner, tc.abi, "tool-compile", &compile, &layout.log("tool-compile")).await?;

    let objects = collect_objects(&src)?;
    let out = tool_dir.join(TOOL_LIBRARY);

    let modes: &[LinkMode] = if static_fallback {
        &[LinkMode::Shared, LinkMode::StaticWholeArchive]
    } else {
        &[LinkMode::Shared]
    };

    let mut attempts = Vec::with_capacity(modes.len());
    for &mode in modes {
        let log = layout.log(mode.log_name());
        let spec = link_spec(mode, tc, ffmpeg, dav1d, &entry, &objects, &out);
        let output = run_logged(runner, &spec, &log).await?;
        let success = output.success && out.exists();
        attempts.push(LinkAttempt { mode, log, success });

        if success {
            info!("Linked {} for {} ({})", TOOL_LIBRARY, tc.abi, mode);
            return Ok(LinkOutcome::Linked {
                library: out,
                mode,
                attempts,
            });
        }
        warn!("{} link of {} failed for {}", mode, TOOL_LIBRARY, tc.abi);
    }

    Ok(LinkOutcome::FailedWithLog { attempts })
}
