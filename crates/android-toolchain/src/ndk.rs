//! NDK Toolchain
//!
//! Derives the per-ABI [`ToolchainDescriptor`] from an NDK installation.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use avdroid_core::Abi;

use crate::error::{ProvisionError, Result};

/// Compiler and binutils for one ABI at one API level.
///
/// Derived deterministically from (ABI, NDK root, API level, host tag) and
/// never mutated afterwards; stages receive it by shared reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainDescriptor {
    pub abi: Abi,
    pub api_level: u32,
    pub arch: &'static str,
    pub cpu_model: &'static str,
    pub target_triple: &'static str,
    pub meson_cpu_family: &'static str,
    pub neon: bool,
    /// Prefix handed to FFmpeg's `--cross-prefix` (`<bin>/llvm-`)
    pub cross_prefix: String,
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub ar: PathBuf,
    pub ranlib: PathBuf,
    pub strip: PathBuf,
    pub nm: PathBuf,
    pub readelf: PathBuf,
    pub sysroot: PathBuf,
}

impl ToolchainDescriptor {
    /// Derive the descriptor without touching the filesystem
    pub fn derive(abi: Abi, ndk_root: &Path, api_level: u32, host_tag: &str) -> Self {
        let prebuilt = llvm_prebuilt_dir(ndk_root, host_tag);
        let bin_dir = prebuilt.join("bin");
        let clang = format!("{}{}-clang", abi.clang_triple(), api_level);

        Self {
            abi,
            api_level,
            arch: abi.arch(),
            cpu_model: abi.cpu_model(),
            target_triple: abi.target_triple(),
            meson_cpu_family: abi.meson_cpu_family(),
            neon: abi.is_arm(),
            cross_prefix: format!("{}/llvm-", bin_dir.display()),
            cc: bin_dir.join(&clang),
            cxx: bin_dir.join(format!("{}++", clang)),
            ar: bin_dir.join("llvm-ar"),
            ranlib: bin_dir.join("llvm-ranlib"),
            strip: bin_dir.join("llvm-strip"),
            nm: bin_dir.join("llvm-nm"),
            readelf: bin_dir.join("llvm-readelf"),
            sysroot: prebuilt.join("sysroot"),
        }
    }

    /// Paths that must exist before a build can use this descriptor
    pub fn required_paths(&self) -> [&Path; 4] {
        [
            self.cc.as_path(),
            self.ar.as_path(),
            self.nm.as_path(),
            self.sysroot.as_path(),
        ]
    }
}

/// An extracted NDK
#[derive(Debug, Clone)]
pub struct NdkInstallation {
    root: PathBuf,
    revision: String,
    host_tag: String,
}

impl NdkInstallation {
    /// Open an NDK root, reading `Pkg.Revision` from `source.properties`
    pub async fn from_path(root: PathBuf) -> Result<Self> {
        let source_props = root.join("source.properties");
        if !source_props.exists() {
            return Err(ProvisionError::InvalidNdk {
                path: root,
                reason: "source.properties not found".into(),
            });
        }

        let content = tokio::fs::read_to_string(&source_props).await?;
        let revision = parse_revision(&content).ok_or_else(|| ProvisionError::InvalidNdk {
            path: root.clone(),
            reason: "Pkg.Revision missing from source.properties".into(),
        })?;

        info!("Using NDK {} at {:?}", revision, root);
        Ok(Self {
            root,
            revision,
            host_tag: detect_host_tag().to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Get the toolchain for a specific ABI and API level, checking that the
    /// compiler and sysroot are actually there
    pub fn toolchain(&self, abi: Abi, api_level: u32) -> Result<ToolchainDescriptor> {
        let descriptor = ToolchainDescriptor::derive(abi, &self.root, api_level, &self.host_tag);
        for path in descriptor.required_paths() {
            if !path.exists() {
                return Err(ProvisionError::ToolchainNotFound {
                    abi: abi.abi_name().to_string(),
                    path: path.to_path_buf(),
                });
            }
        }
        debug!("Toolchain for {}: cc={:?}", abi, descriptor.cc);
        Ok(descriptor)
    }
}

fn llvm_prebuilt_dir(ndk_root: &Path, host_tag: &str) -> PathBuf {
    ndk_root
        .join("toolchains")
        .join("llvm")
        .join("prebuilt")
        .join(host_tag)
}

fn parse_revision(source_properties: &str) -> Option<String> {
    source_properties.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "Pkg.Revision").then(|| value.trim().to_string())
    })
}

/// Detect the host platform tag used in the NDK prebuilt layout
pub fn detect_host_tag() -> &'static str {
    if cfg!(windows) {
        "windows-x86_64"
    } else if cfg!(target_os = "macos") {
        "darwin-x86_64"
    } else {
        "linux-x86_64"
    }
}
