//! Build Runner
//!
//! Coordinates the whole run: provisioning, then every ABI in order through
//! its build state machine, then the release metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use avdroid_android_toolchain::{
    ensure_host_tools, ArchiveFetcher, NdkInstallation, NdkProvisioner, ProvisionError, SourceCheckout,
    SourceProvisioner, ToolchainDescriptor, DAV1D_REPO, FFMPEG_REPO,
};
use avdroid_core::{Abi, BuildConfig, CommandRunner, ConfigError};

use crate::artifacts::{assemble_output, finalize_install, stamp_version, AbiLayout, AssembledOutput, BuildArtifactSet};
use crate::dav1d::{build_dav1d, Dav1dInstall};
use crate::ffmpeg_build::{build_ffmpeg, FfmpegInstall};
use crate::stage::{StagedAbi, Stager};
use crate::tool_lib::{build_tool_library, ToolLibrary};
use crate::verify::{HeaderDigest, VerificationError, VerifiedArtifacts, Verifier};
use crate::BuildError;

/// Any failure that aborts the run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisionError),
    #[error("Build error: {0}")]
    Build(#[from] BuildError),
    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Provisioning(_) => 3,
            PipelineError::Build(_) => 4,
            PipelineError::Verification(_) => 5,
            PipelineError::Io(_) => 1,
        }
    }

    /// Logs relevant to this failure
    pub fn diagnostic_logs(&self) -> Vec<PathBuf> {
        match self {
            PipelineError::Build(e) => e.logs(),
            PipelineError::Provisioning(e) => e.log().map(Path::to_path_buf).into_iter().collect(),
            PipelineError::Verification(e) => e.log().map(Path::to_path_buf).into_iter().collect(),
            PipelineError::Config(_) | PipelineError::Io(_) => Vec::new(),
        }
    }
}

/// Stages of the per-ABI state machine, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AbiStage {
    Provisioned,
    DependencyBuilt,
    PrimaryBuilt,
    SecondaryBuilt,
    HeadersCopied,
    VersionStamped,
    Verified,
    Staged,
}

impl fmt::Display for AbiStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbiStage::Provisioned => "provisioned",
            AbiStage::DependencyBuilt => "dependency-built",
            AbiStage::PrimaryBuilt => "primary-built",
            AbiStage::SecondaryBuilt => "secondary-built",
            AbiStage::HeadersCopied => "headers-copied",
            AbiStage::VersionStamped => "version-stamped",
            AbiStage::Verified => "verified",
            AbiStage::Staged => "staged",
        };
        f.write_str(name)
    }
}

/// Per-ABI state, carrying the result of the stage that produced it
#[derive(Debug)]
pub enum AbiState {
    Provisioned,
    DependencyBuilt {
        dav1d: Dav1dInstall,
    },
    PrimaryBuilt {
        dav1d: Dav1dInstall,
        ffmpeg: FfmpegInstall,
    },
    SecondaryBuilt {
        ffmpeg: FfmpegInstall,
        tool: ToolLibrary,
    },
    HeadersCopied {
        assembled: AssembledOutput,
    },
    VersionStamped {
        artifacts: BuildArtifactSet,
    },
    Verified {
        verified: VerifiedArtifacts,
    },
    Staged {
        verified: VerifiedArtifacts,
        staged: StagedAbi,
    },
}

impl AbiState {
    pub fn stage(&self) -> AbiStage {
        match self {
            AbiState::Provisioned => AbiStage::Provisioned,
            AbiState::DependencyBuilt { .. } => AbiStage::DependencyBuilt,
            AbiState::PrimaryBuilt { .. } => AbiStage::PrimaryBuilt,
            AbiState::SecondaryBuilt { .. } => AbiStage::SecondaryBuilt,
            AbiState::HeadersCopied { .. } => AbiStage::HeadersCopied,
            AbiState::VersionStamped { .. } => AbiStage::VersionStamped,
            AbiState::Verified { .. } => AbiStage::Verified,
            AbiState::Staged { .. } => AbiStage::Staged,
        }
    }
}

/// The two upstream checkouts. The FFmpeg tree is configured in place, so
/// it is only ever handed out mutably.
#[derive(Debug)]
pub struct Sources {
    pub ffmpeg: SourceCheckout,
    pub dav1d: SourceCheckout,
}

/// Drives one ABI from `provisioned` to `staged`
struct AbiBuild<'a, R> {
    runner: &'a R,
    config: &'a BuildConfig,
    toolchain: &'a ToolchainDescriptor,
    layout: AbiLayout,
    sources: &'a mut Sources,
    stager: &'a mut Stager,
    canonical_headers: Option<&'a HeaderDigest>,
}

impl<'a, R: CommandRunner> AbiBuild<'a, R> {
    async fn run(mut self) -> Result<(VerifiedArtifacts, StagedAbi), PipelineError> {
        let abi = self.toolchain.abi;
        if self.layout.log_dir().exists() {
            std::fs::remove_dir_all(self.layout.log_dir())?;
        }
        std::fs::create_dir_all(self.layout.log_dir())?;

        let mut state = AbiState::Provisioned;
        info!(abi = %abi, stage = %state.stage(), "Starting ABI build");
        loop {
            state = match self.advance(state).await {
                Ok(AbiState::Staged { verified, staged }) => {
                    info!(abi = %abi, stage = %AbiStage::Staged, "ABI complete");
                    return Ok((verified, staged));
                }
                Ok(next) => next,
                Err(e) => {
                    error!(abi = %abi, "ABI build failed: {}", e);
                    return Err(e);
                }
            };
            info!(abi = %abi, stage = %state.stage(), "Stage complete");
        }
    }

    async fn advance(&mut self, state: AbiState) -> Result<AbiState, PipelineError> {
        let tc = self.toolchain;
        let next = match state {
            AbiState::Provisioned => {
                let dav1d = build_dav1d(self.runner, tc, &self.layout, &self.sources.dav1d, self.config.jobs()).await?;
                AbiState::DependencyBuilt { dav1d }
            }
            AbiState::DependencyBuilt { dav1d } => {
                let ffmpeg = build_ffmpeg(
                    self.runner,
                    tc,
                    &self.layout,
                    &mut self.sources.ffmpeg,
                    &dav1d,
                    self.config.jobs(),
                    self.config.static_fallback(),
                )
                .await?;
                AbiState::PrimaryBuilt { dav1d, ffmpeg }
            }
            AbiState::PrimaryBuilt { dav1d, ffmpeg } => {
                let outcome = build_tool_library(
                    self.runner,
                    tc,
                    &self.layout,
                    &mut self.sources.ffmpeg,
                    &ffmpeg,
                    &dav1d,
                    self.config.static_fallback(),
                )
                .await?;
                let tool = outcome.into_result(tc.abi)?;
                finalize_install(self.runner, tc, &ffmpeg, &tool, &self.layout.log("finalize")).await?;
                AbiState::SecondaryBuilt { ffmpeg, tool }
            }
            AbiState::SecondaryBuilt { ffmpeg, tool } => AbiState::HeadersCopied {
                assembled: assemble_output(&self.layout, &ffmpeg, &tool)?,
            },
            AbiState::HeadersCopied { assembled } => AbiState::VersionStamped {
                artifacts: stamp_version(assembled, &self.config.version_marker())?,
            },
            AbiState::VersionStamped { artifacts } => {
                let verifier = Verifier::new(self.runner, tc, &self.layout);
                AbiState::Verified {
                    verified: verifier.verify(artifacts, self.canonical_headers).await?,
                }
            }
            AbiState::Verified { verified } => {
                let staged = self.stager.stage(&verified)?;
                AbiState::Staged { verified, staged }
            }
            staged @ AbiState::Staged { .. } => staged,
        };
        Ok(next)
    }
}

/// What a successful run produced
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub output_dir: PathBuf,
    pub ndk_revision: String,
    pub staged: Vec<StagedAbi>,
}

/// The full multi-ABI run
pub struct Pipeline<'a, R, F> {
    config: &'a BuildConfig,
    runner: &'a R,
    fetcher: F,
}

impl<'a, R: CommandRunner, F: ArchiveFetcher> Pipeline<'a, R, F> {
    pub fn new(config: &'a BuildConfig, runner: &'a R, fetcher: F) -> Self {
        Self { config, runner, fetcher }
    }

    /// Run every stage for every configured ABI. The first error aborts.
    pub async fn run(self) -> Result<PipelineSummary, PipelineError> {
        let config = self.config;
        let abis: Vec<&str> = config.abis().iter().map(Abi::abi_name).collect();
        info!(
            "Building FFmpeg {} with dav1d {} for {} (API {})",
            config.ffmpeg_tag(),
            config.dav1d_tag(),
            abis.join(", "),
            config.min_api_level()
        );

        let logs = config.work_dir().join("logs");
        ensure_host_tools(self.runner, config.skip_host_deps(), &logs.join("host-tools.log")).await?;

        let ndk_dir = NdkProvisioner::new(self.fetcher, config.work_dir().join("ndk"))
            .ensure(config.ndk_version(), config.ndk_sha256())
            .await?;
        let ndk = NdkInstallation::from_path(ndk_dir).await?;
        let toolchains = config
            .abis()
            .iter()
            .map(|&abi| ndk.toolchain(abi, config.min_api_level()))
            .collect::<Result<Vec<_>, _>>()?;

        let provisioner = SourceProvisioner::new(self.runner, config.sources_dir(), logs.join("sources.log"));
        let mut sources = Sources {
            ffmpeg: provisioner.ensure(FFMPEG_REPO, config.ffmpeg_tag()).await?,
            dav1d: provisioner.ensure(DAV1D_REPO, config.dav1d_tag()).await?,
        };

        let mut stager = Stager::prepare(config.output_dir())?;
        let mut canonical_headers: Option<HeaderDigest> = None;
        let mut staged = Vec::with_capacity(toolchains.len());

        for toolchain in &toolchains {
            let build = AbiBuild {
                runner: self.runner,
                config,
                toolchain,
                layout: AbiLayout::new(config, toolchain.abi),
                sources: &mut sources,
                stager: &mut stager,
                canonical_headers: canonical_headers.as_ref(),
            };
            let (verified, abi_staged) = match build.run().await {
                Ok(done) => done,
                Err(e) => {
                    stager.discard();
                    return Err(e);
                }
            };
            if canonical_headers.is_none() {
                canonical_headers = Some(verified.headers().clone());
            }
            staged.push(abi_staged);
        }

        let output_dir = stager.finish(config, &staged)?;
        Ok(PipelineSummary {
            output_dir,
            ndk_revision: ndk.revision().to_string(),
            staged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_checkout, fake_ndk, FakeBuildHost, NoNetwork};
    use crate::tool_lib::LinkMode;
    use avdroid_core::config::{DEFAULT_NDK_VERSION, ENV_SKIP_HOST_DEPS};
    use avdroid_core::ConfigOverrides;

    fn config(work: &Path, abis: &[&str], tweak: impl FnOnce(&mut ConfigOverrides)) -> BuildConfig {
        let mut overrides = ConfigOverrides {
            abis: abis.iter().map(|s| s.to_string()).collect(),
            min_api_level: Some(26),
            internal_version: Some("3".into()),
            jobs: Some(2),
            work_dir: Some(work.to_path_buf()),
            ..Default::default()
        };
        tweak(&mut overrides);
        BuildConfig::resolve(&overrides, |key| (key == ENV_SKIP_HOST_DEPS).then(|| "1".to_string())).unwrap()
    }

    fn workspace(work: &Path) {
        fake_ndk(&work.join("ndk"), DEFAULT_NDK_VERSION, 26);
        fake_checkout(&work.join("src"), "ffmpeg");
        fake_checkout(&work.join("src"), "dav1d");
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(AbiStage::DependencyBuilt.to_string(), "dependency-built");
        assert_eq!(AbiStage::VersionStamped.to_string(), "version-stamped");
        assert!(AbiStage::Provisioned < AbiStage::Staged);
    }

    #[tokio::test]
    async fn test_single_abi_release() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["arm64-v8a"], |_| {});
        let host = FakeBuildHost::default();

        let summary = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap();

        let out = work.join("output");
        assert_eq!(summary.output_dir, out);
        assert_eq!(summary.ndk_revision, "27.2.12479018");
        assert_eq!(summary.staged.len(), 1);
        assert_eq!(summary.staged[0].link_mode, LinkMode::Shared);

        let lib = out.join("arm64-v8a/lib");
        assert!(lib.join("libffmpegkit.so").exists());
        assert!(lib.join("libavcodec.so").exists());
        assert!(!lib.join("libavcodec.a").exists());
        let version = std::fs::read_to_string(out.join("arm64-v8a/VERSION")).unwrap();
        assert!(version.contains('3'));
        assert!(out.join("include/libavcodec/avcodec.h").exists());
        assert!(out.join("VERSION").exists());
        assert!(out.join("build-info.json").exists());
        assert!(work.join("abi/arm64-v8a/DEPENDENCIES.txt").exists());

        // checkouts already at the tag: no clone, no ls-remote
        assert!(host.calls_to("git").iter().all(|c| c.starts_with("git rev-parse")));

        let configure = host.calls_to("configure").join(" ");
        assert!(configure.contains("--enable-neon"));
        assert!(configure.contains("--enable-static"));
        assert!(host.calls_to("-clang").iter().any(|c| c.contains("-Dmain=ffmpeg_main")));
    }

    #[tokio::test]
    async fn test_multiple_abis_share_headers() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["arm64-v8a", "x86_64"], |_| {});
        let host = FakeBuildHost::default();

        let summary = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap();
        let abis: Vec<Abi> = summary.staged.iter().map(|s| s.abi).collect();
        assert_eq!(abis, vec![Abi::Arm64V8a, Abi::X86_64]);

        assert_eq!(host.calls_to("make").iter().filter(|c| c.ends_with("distclean")).count(), 2);
        assert!(work.join("output/x86_64/lib/libffmpegkit.so").exists());
        let configure = host.calls_to("configure");
        assert!(configure[1].contains("--disable-neon"));
    }

    #[tokio::test]
    async fn test_forbidden_symbol_blocks_staging() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["arm64-v8a"], |_| {});
        let host = FakeBuildHost {
            iconv_in: Some("libavcodec.so"),
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
        match err {
            PipelineError::Verification(VerificationError::ForbiddenSymbols { symbols, .. }) => {
                assert_eq!(symbols, vec!["iconv_open"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!work.join("output").exists());
        assert!(!work.join("output.partial").exists());
    }

    #[tokio::test]
    async fn test_later_abi_failure_leaves_no_release() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        std::fs::create_dir_all(work.join("output/mips")).unwrap();
        let config = config(&work, &["arm64-v8a", "x86_64"], |_| {});
        let host = FakeBuildHost {
            iconv_in: Some("x86_64/out/lib/libavcodec.so"),
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Verification(VerificationError::ForbiddenSymbols { .. })
        ));
        // arm64-v8a verified and staged before x86_64 failed
        assert!(work.join("abi/arm64-v8a/DEPENDENCIES.txt").exists());
        assert!(!work.join("output").exists());
        assert!(!work.join("output.partial").exists());
    }

    #[tokio::test]
    async fn test_tool_library_alone_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["arm64-v8a"], |_| {});
        let host = FakeBuildHost {
            install_shared: false,
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Verification(VerificationError::NoArtifacts { abi: Abi::Arm64V8a })
        ));
        assert!(!work.join("output").exists());
    }

    #[tokio::test]
    async fn test_inspection_failure_points_at_verify_log() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["x86_64"], |_| {});
        let host = FakeBuildHost {
            readelf_fails: true,
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
        let logs = err.diagnostic_logs();
        assert_eq!(logs, vec![work.join("logs/x86_64/verify.log")]);
        let content = std::fs::read_to_string(&logs[0]).unwrap();
        assert!(content.contains("not an ELF file"));
    }

    #[test]
    fn test_provisioning_failure_points_at_its_log() {
        let err: PipelineError = ProvisionError::Git {
            repo: "ffmpeg".into(),
            action: "clone",
            detail: "Could not resolve host".into(),
            log: PathBuf::from("/w/logs/sources.log"),
        }
        .into();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.diagnostic_logs(), vec![PathBuf::from("/w/logs/sources.log")]);

        let err: PipelineError = ProvisionError::UnknownTag {
            repo: "ffmpeg".into(),
            tag: "n99.0".into(),
        }
        .into();
        assert!(err.diagnostic_logs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_decoder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["x86_64"], |_| {});
        let host = FakeBuildHost {
            decoder_enabled: false,
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Verification(VerificationError::DecoderMissing { abi: Abi::X86_64, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["x86_64"], |_| {});
        let host = FakeBuildHost {
            export_entry: false,
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Verification(VerificationError::EntryPointMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_link_failure_falls_back_to_static() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["armeabi-v7a"], |_| {});
        let host = FakeBuildHost {
            fail_shared_link: true,
            ..Default::default()
        };

        let summary = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap();
        assert_eq!(summary.staged[0].link_mode, LinkMode::StaticWholeArchive);

        let logs = work.join("logs/armeabi-v7a");
        assert!(logs.join("link-shared.log").exists());
        assert!(logs.join("link-static.log").exists());
        let static_link = host
            .calls_to("-clang")
            .into_iter()
            .find(|c| c.contains("--whole-archive"))
            .unwrap();
        assert!(static_link.contains("libavcodec.a"));
        assert!(static_link.contains("libdav1d.a"));
    }

    #[tokio::test]
    async fn test_both_links_failing_reports_both_logs() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["arm64-v8a"], |_| {});
        let host = FakeBuildHost {
            fail_shared_link: true,
            fail_static_link: true,
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
        let logs = err.diagnostic_logs();
        assert_eq!(logs.len(), 2);
        for log in &logs {
            let content = std::fs::read_to_string(log).unwrap();
            assert!(content.contains("undefined symbol"));
        }
        assert!(!work.join("output").exists());
    }

    #[tokio::test]
    async fn test_without_static_fallback_only_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        workspace(&work);
        let config = config(&work, &["x86"], |o| o.no_static_fallback = true);
        let host = FakeBuildHost {
            fail_shared_link: true,
            ..Default::default()
        };

        let err = Pipeline::new(&config, &host, NoNetwork).run().await.unwrap_err();
        match err {
            PipelineError::Build(BuildError::LinkFailed { abi, logs }) => {
                assert_eq!(abi, Abi::X86);
                assert_eq!(logs.len(), 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let configure = host.calls_to("configure").join(" ");
        assert!(configure.contains("--disable-static"));
        assert!(configure.contains("--disable-asm"));
    }

    #[test]
    fn test_unsupported_abi_fails_before_any_step() {
        let overrides = ConfigOverrides {
            abis: vec!["mips".into()],
            ..Default::default()
        };
        let err: PipelineError = BuildConfig::resolve(&overrides, |_| None).unwrap_err().into();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("mips"));
    }
}
