//! Android ABI targets
//!
//! Every per-ABI constant the build needs (compiler triple, FFmpeg arch/cpu,
//! meson cpu family) is answered here so nothing downstream has to match on
//! ABI names again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Target ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Abi {
    #[serde(rename = "arm64-v8a")]
    Arm64V8a,
    #[serde(rename = "armeabi-v7a")]
    ArmeabiV7a,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Abi {
    /// Get the ABI name as used in the `lib/<abi>` layout
    pub fn abi_name(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "arm64-v8a",
            Abi::ArmeabiV7a => "armeabi-v7a",
            Abi::X86 => "x86",
            Abi::X86_64 => "x86_64",
        }
    }

    /// Triple used for the API-suffixed clang wrappers (`<triple><api>-clang`)
    pub fn clang_triple(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "aarch64-linux-android",
            Abi::ArmeabiV7a => "armv7a-linux-androideabi",
            Abi::X86 => "i686-linux-android",
            Abi::X86_64 => "x86_64-linux-android",
        }
    }

    /// GNU target triple (differs from the clang triple on 32-bit ARM)
    pub fn target_triple(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "aarch64-linux-android",
            Abi::ArmeabiV7a => "arm-linux-androideabi",
            Abi::X86 => "i686-linux-android",
            Abi::X86_64 => "x86_64-linux-android",
        }
    }

    /// Value for FFmpeg's `--arch`
    pub fn arch(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "aarch64",
            Abi::ArmeabiV7a => "arm",
            Abi::X86 => "x86",
            Abi::X86_64 => "x86_64",
        }
    }

    /// Value for FFmpeg's `--cpu` and meson's `cpu`
    pub fn cpu_model(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "armv8-a",
            Abi::ArmeabiV7a => "armv7-a",
            Abi::X86 => "i686",
            Abi::X86_64 => "x86-64",
        }
    }

    /// `cpu_family` for the meson `[host_machine]` section
    pub fn meson_cpu_family(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "aarch64",
            Abi::ArmeabiV7a => "arm",
            Abi::X86 => "x86",
            Abi::X86_64 => "x86_64",
        }
    }

    pub fn is_arm(&self) -> bool {
        matches!(self, Abi::Arm64V8a | Abi::ArmeabiV7a)
    }

    /// Get all supported ABIs
    pub fn all() -> &'static [Abi] {
        &[Abi::Arm64V8a, Abi::ArmeabiV7a, Abi::X86, Abi::X86_64]
    }

    /// ABIs built when none are requested
    pub fn defaults() -> &'static [Abi] {
        &[Abi::Arm64V8a, Abi::ArmeabiV7a, Abi::X86_64]
    }
}

impl FromStr for Abi {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "arm64-v8a" => Ok(Abi::Arm64V8a),
            "armeabi-v7a" => Ok(Abi::ArmeabiV7a),
            "x86" => Ok(Abi::X86),
            "x86_64" => Ok(Abi::X86_64),
            other => Err(ConfigError::UnsupportedAbi(other.to_string())),
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abi_name())
    }
}
