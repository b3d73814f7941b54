//! Artifact verification
//!
//! Every produced artifact set passes through [`Verifier::verify`] before it
//! can be staged. The only way to obtain a [`VerifiedArtifacts`] is through a
//! successful verification.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use avdroid_android_toolchain::ToolchainDescriptor;
use avdroid_core::process::run_logged;
use avdroid_core::{Abi, CommandRunner, CommandSpec};

use crate::artifacts::{AbiLayout, BuildArtifactSet};
use crate::tool_lib::ENTRY_SYMBOL;

static SYMBOL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[0-9a-fA-F]+\s+)?([A-Za-z])\s+(\S+)\s*$").unwrap());

static NEEDED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(NEEDED\)\s+Shared library:\s*\[([^\]]+)\]").unwrap());

const DECODER_FLAG: &str = "CONFIG_LIBDAV1D_DECODER";

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("No FFmpeg shared libraries were produced for {abi}")]
    NoArtifacts { abi: Abi },
    #[error("The libdav1d decoder is not enabled for {abi} (see {config:?})")]
    DecoderMissing { abi: Abi, config: PathBuf },
    #[error("{artifact:?} imports forbidden symbols: {}", .symbols.join(", "))]
    ForbiddenSymbols { artifact: PathBuf, symbols: Vec<String> },
    #[error("{artifact:?} depends on forbidden library {library}")]
    ForbiddenDependency { artifact: PathBuf, library: String },
    #[error("{library:?} does not export {}", ENTRY_SYMBOL)]
    EntryPointMissing { library: PathBuf },
    #[error("Public headers for {abi} differ from the first ABI at {path}")]
    HeaderMismatch { abi: Abi, path: String },
    #[error("{tool} failed on {artifact:?}: {detail}")]
    Inspect {
        tool: &'static str,
        artifact: PathBuf,
        detail: String,
        log: PathBuf,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VerificationError {
    /// Log holding the failed inspection's transcript
    pub fn log(&self) -> Option<&Path> {
        match self {
            VerificationError::Inspect { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// SHA-256 of every file in a header tree, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderDigest(BTreeMap<String, String>);

impl HeaderDigest {
    pub fn of(dir: &Path) -> std::io::Result<Self> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(std::io::Error::other)?
                .to_string_lossy()
                .replace('\\', "/");
            let data = std::fs::read(entry.path())?;
            files.insert(relative, hex::encode(Sha256::digest(&data)));
        }
        Ok(Self(files))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First relative path that is missing, extra or different
    pub fn first_difference(&self, other: &HeaderDigest) -> Option<String> {
        for (path, digest) in &self.0 {
            if other.0.get(path) != Some(digest) {
                return Some(path.clone());
            }
        }
        other.0.keys().find(|path| !self.0.contains_key(*path)).cloned()
    }
}

/// Dynamic dependencies of every artifact in one ABI
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    pub abi: Option<Abi>,
    pub entries: Vec<(String, Vec<String>)>,
}

impl fmt::Display for DependencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(abi) = self.abi {
            writeln!(f, "# Dynamic dependencies for {}", abi)?;
        }
        for (artifact, needed) in &self.entries {
            writeln!(f, "{}:", artifact)?;
            if needed.is_empty() {
                writeln!(f, "  (none)")?;
            }
            for library in needed {
                writeln!(f, "  {}", library)?;
            }
        }
        Ok(())
    }
}

/// An artifact set that passed every check
#[derive(Debug, Clone)]
pub struct VerifiedArtifacts {
    artifacts: BuildArtifactSet,
    headers: HeaderDigest,
    report: DependencyReport,
}

impl VerifiedArtifacts {
    pub fn abi(&self) -> Abi {
        self.artifacts.abi
    }

    pub fn artifacts(&self) -> &BuildArtifactSet {
        &self.artifacts
    }

    pub fn headers(&self) -> &HeaderDigest {
        &self.headers
    }

    pub fn report(&self) -> &DependencyReport {
        &self.report
    }

    #[cfg(test)]
    pub(crate) fn assume_verified(artifacts: BuildArtifactSet) -> Self {
        Self {
            artifacts,
            headers: HeaderDigest::default(),
            report: DependencyReport::default(),
        }
    }
}

/// `(kind, name)` pairs from `llvm-nm` output, symbol versions stripped
pub fn parse_symbols(output: &str) -> Vec<(char, String)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = SYMBOL_LINE.captures(line)?;
            let kind = caps[1].chars().next()?;
            let name = caps[2].split('@').next().unwrap_or(&caps[2]).to_string();
            Some((kind, name))
        })
        .collect()
}

pub fn is_forbidden_symbol(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("iconv") || lower.starts_with("libiconv")
}

/// Library names from the NEEDED entries of `llvm-readelf -d`
pub fn parse_needed(output: &str) -> Vec<String> {
    NEEDED_LINE
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Whether a generated `config.h` enables the libdav1d decoder
pub fn decoder_enabled(config_h: &str) -> bool {
    config_h.lines().any(|line| {
        let mut parts = line.split_whitespace();
        parts.next() == Some("#define") && parts.next() == Some(DECODER_FLAG) && parts.next() == Some("1")
    })
}

pub struct Verifier<'a, R> {
    runner: &'a R,
    toolchain: &'a ToolchainDescriptor,
    log: PathBuf,
    report_path: PathBuf,
}

impl<'a, R: CommandRunner> Verifier<'a, R> {
    pub fn new(runner: &'a R, toolchain: &'a ToolchainDescriptor, layout: &AbiLayout) -> Self {
        Self {
            runner,
            toolchain,
            log: layout.log("verify"),
            report_path: layout.dependency_report(),
        }
    }

    /// Check an artifact set. `canonical` is the header digest of the first
    /// ABI; `None` while verifying the first ABI itself.
    pub async fn verify(
        &self,
        artifacts: BuildArtifactSet,
        canonical: Option<&HeaderDigest>,
    ) -> Result<VerifiedArtifacts, VerificationError> {
        let abi = artifacts.abi;
        if !artifacts.libraries.iter().any(|lib| *lib != artifacts.tool_library) {
            return Err(VerificationError::NoArtifacts { abi });
        }

        let config = std::fs::read_to_string(&artifacts.config_record)?;
        if !decoder_enabled(&config) {
            return Err(VerificationError::DecoderMissing {
                abi,
                config: artifacts.config_record.clone(),
            });
        }

        let mut report = DependencyReport {
            abi: Some(abi),
            entries: Vec::with_capacity(artifacts.libraries.len()),
        };
        for library in &artifacts.libraries {
            let undefined = self.nm(library, "--undefined-only").await?;
            let forbidden: Vec<String> = parse_symbols(&undefined)
                .into_iter()
                .map(|(_, name)| name)
                .filter(|name| is_forbidden_symbol(name))
                .collect();
            if !forbidden.is_empty() {
                return Err(VerificationError::ForbiddenSymbols {
                    artifact: library.clone(),
                    symbols: forbidden,
                });
            }

            let needed = self.needed(library).await?;
            if let Some(bad) = needed.iter().find(|lib| lib.starts_with("libiconv")) {
                return Err(VerificationError::ForbiddenDependency {
                    artifact: library.clone(),
                    library: bad.clone(),
                });
            }

            let name = library
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            report.entries.push((name, needed));
        }

        if !artifacts.libraries.contains(&artifacts.tool_library) {
            return Err(VerificationError::EntryPointMissing {
                library: artifacts.tool_library.clone(),
            });
        }
        let defined = self.nm(&artifacts.tool_library, "--defined-only").await?;
        let exported = parse_symbols(&defined)
            .iter()
            .any(|(kind, name)| *kind == 'T' && name == ENTRY_SYMBOL);
        if !exported {
            return Err(VerificationError::EntryPointMissing {
                library: artifacts.tool_library.clone(),
            });
        }

        let headers = HeaderDigest::of(&artifacts.include_dir)?;
        if let Some(difference) = canonical.and_then(|c| c.first_difference(&headers)) {
            return Err(VerificationError::HeaderMismatch { abi, path: difference });
        }

        std::fs::write(&self.report_path, report.to_string())?;
        info!(
            "Verified {} artifacts for {} ({} headers)",
            artifacts.libraries.len(),
            abi,
            headers.len()
        );
        debug!("{}", report);

        Ok(VerifiedArtifacts {
            artifacts,
            headers,
            report,
        })
    }

    async fn nm(&self, artifact: &Path, filter: &str) -> Result<String, VerificationError> {
        let spec = CommandSpec::new(&self.toolchain.nm)
            .args(["-D", filter])
            .arg(artifact);
        self.inspect("llvm-nm", artifact, spec).await
    }

    async fn needed(&self, artifact: &Path) -> Result<Vec<String>, VerificationError> {
        let spec = CommandSpec::new(&self.toolchain.readelf).arg("-d").arg(artifact);
        Ok(parse_needed(&self.inspect("llvm-readelf", artifact, spec).await?))
    }

    async fn inspect(
        &self,
        tool: &'static str,
        artifact: &Path,
        spec: CommandSpec,
    ) -> Result<String, VerificationError> {
        let output = run_logged(self.runner, &spec, &self.log).await?;
        if !output.success {
            return Err(VerificationError::Inspect {
                tool,
                artifact: artifact.to_path_buf(),
                detail: output.stderr.trim().to_string(),
                log: self.log.clone(),
            });
        }
        Ok(output.stdout)
    }
}
