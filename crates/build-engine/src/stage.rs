//! Release staging
//!
//! Lays verified artifacts out as
//!
//! ```text
//! <output>/
//!   <abi>/lib/*.so
//!   <abi>/VERSION
//!   include/
//!   VERSION
//!   build-info.json
//! ```
//!
//! The release is assembled in a sibling `<output>.partial` directory and
//! renamed over `<output>` only once every ABI has been staged. Each ABI
//! directory inside it is assembled under a hidden name and renamed into place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use avdroid_core::{Abi, BuildConfig};

use crate::artifacts::{copy_tree, VERSION_FILE};
use crate::tool_lib::LinkMode;
use crate::verify::VerifiedArtifacts;

pub const BUILD_INFO_FILE: &str = "build-info.json";
const INCLUDE_DIR: &str = "include";

/// One ABI as it landed in the output directory
#[derive(Debug, Clone)]
pub struct StagedAbi {
    pub abi: Abi,
    pub dir: PathBuf,
    pub libraries: Vec<String>,
    pub link_mode: LinkMode,
}

#[derive(Debug, Serialize)]
struct BuildInfo<'a> {
    version: String,
    ffmpeg_tag: &'a str,
    dav1d_tag: &'a str,
    ndk_version: &'a str,
    min_api_level: u32,
    internal_version: &'a str,
    built_at: DateTime<Utc>,
    abis: Vec<BuildInfoAbi<'a>>,
}

#[derive(Debug, Serialize)]
struct BuildInfoAbi<'a> {
    abi: &'a str,
    link_mode: LinkMode,
    libraries: &'a [String],
}

pub struct Stager {
    root: PathBuf,
    partial: PathBuf,
    headers_staged: bool,
}

impl Stager {
    /// Clear `root` and start a fresh release layout next to it
    pub fn prepare(root: &Path) -> std::io::Result<Self> {
        let partial = partial_dir(root);
        for dir in [root, partial.as_path()] {
            if dir.exists() {
                info!("Clearing output directory {:?}", dir);
                std::fs::remove_dir_all(dir)?;
            }
        }
        std::fs::create_dir_all(&partial)?;
        Ok(Self {
            root: root.to_path_buf(),
            partial,
            headers_staged: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the release is assembled in until [`Stager::finish`]
    pub fn partial(&self) -> &Path {
        &self.partial
    }

    /// Throw away everything staged so far
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.partial) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {:?}: {}", self.partial, e);
            }
        }
    }

    /// Copy one verified ABI into the output directory.
    ///
    /// The first call also stages the public headers.
    pub fn stage(&mut self, verified: &VerifiedArtifacts) -> std::io::Result<StagedAbi> {
        let artifacts = verified.artifacts();
        let abi = artifacts.abi;
        let staging = self.partial.join(format!(".staging-{}", abi));
        let target = self.partial.join(abi.abi_name());
        for dir in [&staging, &target] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }

        let lib_dir = staging.join("lib");
        std::fs::create_dir_all(&lib_dir)?;
        let mut libraries = Vec::new();
        for library in &artifacts.libraries {
            let Some(name) = library.file_name() else {
                continue;
            };
            if library.extension().map(|e| e != "so").unwrap_or(true) {
                debug!("Not staging {:?}", library);
                continue;
            }
            std::fs::copy(library, lib_dir.join(name))?;
            libraries.push(name.to_string_lossy().into_owned());
        }
        std::fs::write(
            staging.join(VERSION_FILE),
            format!("{}\n", artifacts.version_marker),
        )?;

        if !self.headers_staged {
            self.stage_headers(&artifacts.include_dir)?;
        }

        std::fs::rename(&staging, &target)?;
        info!("Staged {} libraries for {}", libraries.len(), abi);

        Ok(StagedAbi {
            abi,
            dir: self.root.join(abi.abi_name()),
            libraries,
            link_mode: artifacts.link_mode,
        })
    }

    fn stage_headers(&mut self, include_dir: &Path) -> std::io::Result<()> {
        let staging = self.partial.join(".staging-include");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        let copied = copy_tree(include_dir, &staging)?;
        std::fs::rename(&staging, self.partial.join(INCLUDE_DIR))?;
        self.headers_staged = true;
        debug!("Staged {} header files", copied);
        Ok(())
    }

    /// Write the top-level version marker and `build-info.json`, then move
    /// the release into place
    pub fn finish(self, config: &BuildConfig, staged: &[StagedAbi]) -> std::io::Result<PathBuf> {
        if let Err(e) = self.write_metadata(config, staged) {
            self.discard();
            return Err(e);
        }
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::rename(&self.partial, &self.root)?;

        info!("Release ready in {:?}", self.root);
        Ok(self.root)
    }

    fn write_metadata(&self, config: &BuildConfig, staged: &[StagedAbi]) -> std::io::Result<()> {
        let version = config.version_marker();
        std::fs::write(self.partial.join(VERSION_FILE), format!("{}\n", version))?;

        let info = BuildInfo {
            version,
            ffmpeg_tag: config.ffmpeg_tag(),
            dav1d_tag: config.dav1d_tag(),
            ndk_version: config.ndk_version(),
            min_api_level: config.min_api_level(),
            internal_version: config.internal_version(),
            built_at: Utc::now(),
            abis: staged
                .iter()
                .map(|s| BuildInfoAbi {
                    abi: s.abi.abi_name(),
                    link_mode: s.link_mode,
                    libraries: &s.libraries,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?;
        std::fs::write(self.partial.join(BUILD_INFO_FILE), json)
    }
}

fn partial_dir(root: &Path) -> PathBuf {
    let mut name = root.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    root.with_file_name(name)
}
