//! Build Configuration
//!
//! Resolves the immutable [`BuildConfig`] from three layers:
//! - command line overrides
//! - `AVDROID_*` environment variables
//! - an optional TOML config file
//!
//! Anything left unset falls back to the documented defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abi::Abi;
use crate::error::{ConfigError, Result};

pub const DEFAULT_FFMPEG_TAG: &str = "n8.0";
pub const DEFAULT_DAV1D_TAG: &str = "1.5.1";
pub const DEFAULT_NDK_VERSION: &str = "r27c";
pub const DEFAULT_MIN_API_LEVEL: u32 = 24;
pub const DEFAULT_INTERNAL_VERSION: &str = "1";

/// Job count used when the CPU count cannot be detected
pub const FALLBACK_JOBS: usize = 4;

/// Accepted `--min-api-level` range
pub const MIN_SUPPORTED_API: u32 = 21;
pub const MAX_SUPPORTED_API: u32 = 35;

pub const ENV_ABIS: &str = "AVDROID_ABIS";
pub const ENV_FFMPEG_TAG: &str = "AVDROID_FFMPEG_TAG";
pub const ENV_DAV1D_TAG: &str = "AVDROID_DAV1D_TAG";
pub const ENV_NDK_VERSION: &str = "AVDROID_NDK_VERSION";
pub const ENV_MIN_API_LEVEL: &str = "AVDROID_MIN_API_LEVEL";
pub const ENV_INTERNAL_VERSION: &str = "AVDROID_INTERNAL_VERSION";
pub const ENV_JOBS: &str = "AVDROID_JOBS";
pub const ENV_WORK_DIR: &str = "AVDROID_WORK_DIR";
pub const ENV_OUTPUT_DIR: &str = "AVDROID_OUTPUT_DIR";
pub const ENV_NDK_SHA256: &str = "AVDROID_NDK_SHA256";
pub const ENV_SKIP_HOST_DEPS: &str = "AVDROID_SKIP_HOST_DEPS";

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub abis: Vec<String>,
    pub ffmpeg_tag: Option<String>,
    pub dav1d_tag: Option<String>,
    pub ndk_version: Option<String>,
    pub min_api_level: Option<u32>,
    pub internal_version: Option<String>,
    pub jobs: Option<usize>,
    pub work_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub no_static_fallback: bool,
}

/// On-disk configuration (`--config avdroid.toml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigFile {
    pub abis: Option<Vec<String>>,
    pub ffmpeg_tag: Option<String>,
    pub dav1d_tag: Option<String>,
    pub ndk_version: Option<String>,
    pub ndk_sha256: Option<String>,
    pub min_api_level: Option<u32>,
    pub internal_version: Option<String>,
    pub jobs: Option<usize>,
    pub work_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub static_fallback: Option<bool>,
}

impl ConfigFile {
    /// Load and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigFileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ConfigFileParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved build configuration. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildConfig {
    abis: Vec<Abi>,
    ffmpeg_tag: String,
    dav1d_tag: String,
    ndk_version: String,
    ndk_sha256: Option<String>,
    min_api_level: u32,
    internal_version: String,
    jobs: usize,
    static_fallback: bool,
    work_dir: PathBuf,
    output_dir: PathBuf,
    skip_host_deps: bool,
}

impl BuildConfig {
    /// Resolve a configuration from overrides and an environment lookup.
    ///
    /// `env` is injected so resolution stays free of process-global state;
    /// the binary passes `|k| std::env::var(k).ok()`.
    pub fn resolve<F>(overrides: &ConfigOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match &overrides.config_file {
            Some(path) => {
                debug!("Loading configuration from {:?}", path);
                ConfigFile::load(path)?
            }
            None => ConfigFile::default(),
        };
        Self::resolve_layers(overrides, &env, &file)
    }

    fn resolve_layers<F>(overrides: &ConfigOverrides, env: &F, file: &ConfigFile) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let abi_names: Vec<String> = if !overrides.abis.is_empty() {
            overrides.abis.clone()
        } else if let Some(list) = env(ENV_ABIS) {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            file.abis.clone().unwrap_or_default()
        };
        let abis = parse_abi_list(&abi_names)?;

        let ffmpeg_tag = pick_string(&overrides.ffmpeg_tag, env(ENV_FFMPEG_TAG), &file.ffmpeg_tag, DEFAULT_FFMPEG_TAG);
        let dav1d_tag = pick_string(&overrides.dav1d_tag, env(ENV_DAV1D_TAG), &file.dav1d_tag, DEFAULT_DAV1D_TAG);
        let ndk_version = pick_string(&overrides.ndk_version, env(ENV_NDK_VERSION), &file.ndk_version, DEFAULT_NDK_VERSION);
        let internal_version = pick_string(
            &overrides.internal_version,
            env(ENV_INTERNAL_VERSION),
            &file.internal_version,
            DEFAULT_INTERNAL_VERSION,
        );
        validate_token("ffmpeg-tag", &ffmpeg_tag)?;
        validate_token("dav1d-tag", &dav1d_tag)?;
        validate_token("ndk-version", &ndk_version)?;
        validate_token("internal-version", &internal_version)?;

        let min_api_level = match overrides.min_api_level {
            Some(level) => level,
            None => match env(ENV_MIN_API_LEVEL) {
                Some(raw) => parse_number(ENV_MIN_API_LEVEL, &raw)?,
                None => file.min_api_level.unwrap_or(DEFAULT_MIN_API_LEVEL),
            },
        };
        if !(MIN_SUPPORTED_API..=MAX_SUPPORTED_API).contains(&min_api_level) {
            return Err(ConfigError::invalid(
                "min-api-level",
                &min_api_level.to_string(),
                format!("must be between {} and {}", MIN_SUPPORTED_API, MAX_SUPPORTED_API),
            ));
        }

        let jobs = match overrides.jobs {
            Some(jobs) => jobs,
            None => match env(ENV_JOBS) {
                Some(raw) => parse_number(ENV_JOBS, &raw)?,
                None => file.jobs.unwrap_or_else(|| jobs_or_fallback(num_cpus::get())),
            },
        };
        if jobs == 0 {
            return Err(ConfigError::invalid("jobs", "0", "must be at least 1"));
        }

        let work_dir = overrides
            .work_dir
            .clone()
            .or_else(|| env(ENV_WORK_DIR).map(PathBuf::from))
            .or_else(|| file.work_dir.clone())
            .unwrap_or_else(|| PathBuf::from("build"));
        let output_dir = overrides
            .output_dir
            .clone()
            .or_else(|| env(ENV_OUTPUT_DIR).map(PathBuf::from))
            .or_else(|| file.output_dir.clone())
            .unwrap_or_else(|| work_dir.join("output"));

        let static_fallback = !overrides.no_static_fallback && file.static_fallback.unwrap_or(true);
        let ndk_sha256 = env(ENV_NDK_SHA256).or_else(|| file.ndk_sha256.clone());
        let skip_host_deps = env(ENV_SKIP_HOST_DEPS).map(|v| is_truthy(&v)).unwrap_or(false);

        Ok(Self {
            abis,
            ffmpeg_tag,
            dav1d_tag,
            ndk_version,
            ndk_sha256,
            min_api_level,
            internal_version,
            jobs,
            static_fallback,
            work_dir,
            output_dir,
            skip_host_deps,
        })
    }

    pub fn abis(&self) -> &[Abi] {
        &self.abis
    }

    pub fn ffmpeg_tag(&self) -> &str {
        &self.ffmpeg_tag
    }

    pub fn dav1d_tag(&self) -> &str {
        &self.dav1d_tag
    }

    pub fn ndk_version(&self) -> &str {
        &self.ndk_version
    }

    pub fn ndk_sha256(&self) -> Option<&str> {
        self.ndk_sha256.as_deref()
    }

    pub fn min_api_level(&self) -> u32 {
        self.min_api_level
    }

    pub fn internal_version(&self) -> &str {
        &self.internal_version
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Whether FFmpeg also builds static archives for the fallback link
    pub fn static_fallback(&self) -> bool {
        self.static_fallback
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn skip_host_deps(&self) -> bool {
        self.skip_host_deps
    }

    /// Directory holding upstream source checkouts
    pub fn sources_dir(&self) -> PathBuf {
        self.work_dir.join("src")
    }

    /// Directory holding per-ABI intermediate build trees
    pub fn abi_build_dir(&self, abi: Abi) -> PathBuf {
        self.work_dir.join("abi").join(abi.abi_name())
    }

    /// Directory holding per-step logs for one ABI
    pub fn log_dir(&self, abi: Abi) -> PathBuf {
        self.work_dir.join("logs").join(abi.abi_name())
    }

    /// String written into every `VERSION` marker
    pub fn version_marker(&self) -> String {
        format!("{}-{}", self.ffmpeg_tag, self.internal_version)
    }
}

/// Collapse duplicates (first-seen order wins) and fall back to the default set
fn parse_abi_list(names: &[String]) -> Result<Vec<Abi>> {
    if names.is_empty() {
        return Ok(Abi::defaults().to_vec());
    }

    let mut abis = Vec::with_capacity(names.len());
    for name in names {
        let abi: Abi = name.parse()?;
        if !abis.contains(&abi) {
            abis.push(abi);
        }
    }
    Ok(abis)
}

fn pick_string(flag: &Option<String>, env: Option<String>, file: &Option<String>, default: &str) -> String {
    flag.clone()
        .or(env)
        .or_else(|| file.clone())
        .unwrap_or_else(|| default.to_string())
}

/// Tags and versions end up in file names and git refspecs
fn validate_token(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ConfigError::invalid(key, value, "must not be empty"));
    }
    if value.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
        return Err(ConfigError::invalid(key, value, "must not contain whitespace or path separators"));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, raw, "expected a non-negative integer"))
}

fn jobs_or_fallback(detected: usize) -> usize {
    if detected == 0 {
        FALLBACK_JOBS
    } else {
        detected
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
