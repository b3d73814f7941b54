//! Command line interface

use std::path::PathBuf;

use clap::Parser;

use avdroid_core::ConfigOverrides;

#[derive(Parser, Debug)]
#[command(
    name = "avdroid",
    author,
    version,
    about = "Cross-compile FFmpeg with dav1d for Android ABIs",
    long_about = "Provisions the Android NDK and upstream sources, builds dav1d and FFmpeg \
                  for each requested ABI, links libffmpegkit.so, verifies the result and \
                  stages a release directory."
)]
pub struct Cli {
    /// Target ABI (repeatable, or comma separated)
    #[arg(long = "abi", value_name = "ABI", value_delimiter = ',')]
    pub abis: Vec<String>,

    /// FFmpeg release tag
    #[arg(long, value_name = "TAG")]
    pub ffmpeg_tag: Option<String>,

    /// dav1d release tag
    #[arg(long, value_name = "TAG")]
    pub dav1d_tag: Option<String>,

    /// Android NDK version (e.g. r27c)
    #[arg(long, value_name = "VERSION")]
    pub ndk_version: Option<String>,

    /// Minimum Android API level
    #[arg(long, value_name = "LEVEL")]
    pub min_api_level: Option<u32>,

    /// Internal release version recorded in the VERSION markers
    #[arg(long, value_name = "VERSION")]
    pub internal_version: Option<String>,

    /// Parallel compiler jobs (default: number of CPUs)
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Directory for the NDK, sources, intermediate builds and logs
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Release directory (default: <work-dir>/output)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Fail instead of retrying the tool library link against static archives
    #[arg(long)]
    pub no_static_fallback: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            abis: self.abis,
            ffmpeg_tag: self.ffmpeg_tag,
            dav1d_tag: self.dav1d_tag,
            ndk_version: self.ndk_version,
            min_api_level: self.min_api_level,
            internal_version: self.internal_version,
            jobs: self.jobs,
            work_dir: self.work_dir,
            output_dir: self.output_dir,
            config_file: self.config,
            no_static_fallback: self.no_static_fallback,
        }
    }
}
