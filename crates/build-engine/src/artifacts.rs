//! Build artifacts
//!
//! Per-ABI directory layout, post-build cleanup and assembly of the
//! [`BuildArtifactSet`] handed to the verifier.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use avdroid_android_toolchain::ToolchainDescriptor;
use avdroid_core::{Abi, BuildConfig, CommandRunner, CommandSpec};

use crate::ffmpeg_build::FfmpegInstall;
use crate::tool_lib::{LinkMode, ToolLibrary};
use crate::{run_step, BuildError};

/// File name of the version marker, per ABI and at the output root
pub const VERSION_FILE: &str = "VERSION";

/// Where one ABI's intermediate files and logs live
#[derive(Debug, Clone)]
pub struct AbiLayout {
    abi: Abi,
    root: PathBuf,
    logs: PathBuf,
}

impl AbiLayout {
    pub fn new(config: &BuildConfig, abi: Abi) -> Self {
        Self {
            abi,
            root: config.abi_build_dir(abi),
            logs: config.log_dir(abi),
        }
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> &Path {
        &self.logs
    }

    pub fn dav1d_build_dir(&self) -> PathBuf {
        self.root.join("dav1d-build")
    }

    pub fn dav1d_cross_file(&self) -> PathBuf {
        self.root.join("dav1d-cross.ini")
    }

    pub fn dav1d_prefix(&self) -> PathBuf {
        self.root.join("dav1d")
    }

    pub fn pkg_config_shim(&self) -> PathBuf {
        self.root.join("pkg-config-shim")
    }

    pub fn ffmpeg_prefix(&self) -> PathBuf {
        self.root.join("ffmpeg")
    }

    /// Copy of FFmpeg's generated `config.h` for this ABI
    pub fn config_record(&self) -> PathBuf {
        self.root.join("ffmpeg-config.h")
    }

    pub fn tool_dir(&self) -> PathBuf {
        self.root.join("tool")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn dependency_report(&self) -> PathBuf {
        self.root.join("DEPENDENCIES.txt")
    }

    pub fn log(&self, step: &str) -> PathBuf {
        self.logs.join(format!("{}.log", step))
    }
}

/// Output of the headers-copied stage
#[derive(Debug, Clone)]
pub struct AssembledOutput {
    pub abi: Abi,
    pub out_dir: PathBuf,
    pub libraries: Vec<PathBuf>,
    pub include_dir: PathBuf,
    pub config_record: PathBuf,
    pub tool_library: PathBuf,
    pub link_mode: LinkMode,
}

/// Everything one ABI produced. Immutable once built.
#[derive(Debug, Clone)]
pub struct BuildArtifactSet {
    pub abi: Abi,
    /// Shared objects, sorted by file name
    pub libraries: Vec<PathBuf>,
    pub include_dir: PathBuf,
    pub config_record: PathBuf,
    pub tool_library: PathBuf,
    pub link_mode: LinkMode,
    pub version_marker: String,
    pub version_file: PathBuf,
}

/// Drop static archives and pkg-config files from the install tree and
/// strip every shared object
pub async fn finalize_install<R: CommandRunner>(
    runner: &R,
    toolchain: &ToolchainDescriptor,
    ffmpeg: &FfmpegInstall,
    tool: &ToolLibrary,
    log: &Path,
) -> Result<(), BuildError> {
    let mut removed = 0;
    for entry in std::fs::read_dir(&ffmpeg.lib_dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "a").unwrap_or(false) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    let pkgconfig = ffmpeg.lib_dir.join("pkgconfig");
    if pkgconfig.exists() {
        std::fs::remove_dir_all(&pkgconfig)?;
    }
    debug!("Removed {} static archives from {:?}", removed, ffmpeg.lib_dir);

    let mut libraries = shared_objects(&ffmpeg.lib_dir)?;
    libraries.push(tool.path.clone());
    for library in &libraries {
        let spec = CommandSpec::new(&toolchain.strip)
            .arg("--strip-unneeded")
            .arg(library);
        run_step(runner, toolchain.abi, "strip", &spec, log).await?;
    }

    info!("Finalized {} shared objects for {}", libraries.len(), toolchain.abi);
    Ok(())
}

/// Copy headers and shared objects into the ABI's `out/` directory
pub fn assemble_output(
    layout: &AbiLayout,
    ffmpeg: &FfmpegInstall,
    tool: &ToolLibrary,
) -> Result<AssembledOutput, BuildError> {
    let out_dir = layout.out_dir();
    if out_dir.exists() {
        std::fs::remove_dir_all(&out_dir)?;
    }
    let lib_dir = out_dir.join("lib");
    let include_dir = out_dir.join("include");
    std::fs::create_dir_all(&lib_dir)?;

    if !ffmpeg.include_dir.is_dir() {
        return Err(BuildError::MissingOutput(ffmpeg.include_dir.clone()));
    }
    copy_tree(&ffmpeg.include_dir, &include_dir)?;

    let mut sources = shared_objects(&ffmpeg.lib_dir)?;
    sources.push(tool.path.clone());

    let mut libraries = Vec::with_capacity(sources.len());
    for source in sources {
        let name = source
            .file_name()
            .ok_or_else(|| BuildError::MissingOutput(source.clone()))?;
        let dest = lib_dir.join(name);
        std::fs::copy(&source, &dest)?;
        libraries.push(dest);
    }
    libraries.sort();

    let tool_library = lib_dir.join(crate::tool_lib::TOOL_LIBRARY);
    Ok(AssembledOutput {
        abi: layout.abi(),
        out_dir,
        libraries,
        include_dir,
        config_record: ffmpeg.config_record.clone(),
        tool_library,
        link_mode: tool.mode,
    })
}

/// Write the per-ABI version marker and seal the artifact set
pub fn stamp_version(assembled: AssembledOutput, marker: &str) -> Result<BuildArtifactSet, BuildError> {
    let version_file = assembled.out_dir.join(VERSION_FILE);
    std::fs::write(&version_file, format!("{}\n", marker))?;

    Ok(BuildArtifactSet {
        abi: assembled.abi,
        libraries: assembled.libraries,
        include_dir: assembled.include_dir,
        config_record: assembled.config_record,
        tool_library: assembled.tool_library,
        link_mode: assembled.link_mode,
        version_marker: marker.to_string(),
        version_file,
    })
}

/// `*.so` files directly inside `dir`, sorted
pub fn shared_objects(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "so").unwrap_or(false) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Recursively copy a directory tree
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_shared_objects_skip_archives_and_pc() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("libavutil.so"));
        touch(&dir.path().join("libavcodec.so"));
        touch(&dir.path().join("libavcodec.a"));
        touch(&dir.path().join("pkgconfig/libavcodec.pc"));

        let found = shared_objects(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["libavcodec.so", "libavutil.so"]);
    }

    #[test]
    fn test_copy_tree_nested() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("src/libavutil/avutil.h"));
        touch(&dir.path().join("src/libavcodec/avcodec.h"));

        let copied = copy_tree(&dir.path().join("src"), &dir.path().join("dst")).unwrap();
        assert_eq!(copied, 2);
        assert!(dir.path().join("dst/libavutil/avutil.h").exists());
    }

    #[test]
    fn test_assemble_and_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = avdroid_core::ConfigOverrides {
            work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = BuildConfig::resolve(&overrides, |_| None).unwrap();
        let layout = AbiLayout::new(&config, Abi::X86_64);

        let prefix = layout.ffmpeg_prefix();
        touch(&prefix.join("include/libavutil/avutil.h"));
        touch(&prefix.join("lib/libavutil.so"));
        let tool_path = layout.tool_dir().join(crate::tool_lib::TOOL_LIBRARY);
        touch(&tool_path);

        let ffmpeg = FfmpegInstall {
            prefix: prefix.clone(),
            include_dir: prefix.join("include"),
            lib_dir: prefix.join("lib"),
            config_record: layout.config_record(),
        };
        let tool = ToolLibrary {
            path: tool_path,
            mode: LinkMode::Shared,
        };

        let assembled = assemble_output(&layout, &ffmpeg, &tool).unwrap();
        assert_eq!(assembled.libraries.len(), 2);
        assert!(assembled.include_dir.join("libavutil/avutil.h").exists());
        assert!(assembled.tool_library.exists());

        let set = stamp_version(assembled, "n8.0-3").unwrap();
        assert_eq!(std::fs::read_to_string(&set.version_file).unwrap(), "n8.0-3\n");
        assert_eq!(set.version_marker, "n8.0-3");
    }
}
