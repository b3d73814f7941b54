//! Android Toolchain Provisioning
//!
//! Handles everything that must exist before a build can start:
//! - host build tools (git, meson, ninja, ...)
//! - the Android NDK, downloaded and extracted once per version
//! - per-ABI compiler/binutils descriptors derived from the NDK
//! - FFmpeg and dav1d source checkouts at pinned tags

pub mod downloader;
pub mod error;
pub mod host;
pub mod ndk;
pub mod sources;

pub use downloader::{ArchiveFetcher, HttpFetcher, NdkProvisioner};
pub use error::{ProvisionError, Result};
pub use host::{ensure_host_tools, HostToolsStatus};
pub use ndk::{NdkInstallation, ToolchainDescriptor};
pub use sources::{SourceCheckout, SourceProvisioner, UpstreamRepo, DAV1D_REPO, FFMPEG_REPO};
