//! dav1d dependency build
//!
//! Cross-compiles dav1d with meson into an ABI-scoped prefix as a static
//! library, then writes a synthetic `dav1d.pc` and a pkg-config shim that only
//! answers for dav1d so FFmpeg's configure cannot pick up anything else.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use avdroid_android_toolchain::{SourceCheckout, ToolchainDescriptor};
use avdroid_core::{CommandRunner, CommandSpec};

use crate::artifacts::AbiLayout;
use crate::{run_step, BuildError};

/// A dav1d install tree for one ABI
#[derive(Debug, Clone)]
pub struct Dav1dInstall {
    pub prefix: PathBuf,
    pub include_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub pkg_config_dir: PathBuf,
    pub pkg_config_shim: PathBuf,
    pub version: String,
}

impl Dav1dInstall {
    fn at(prefix: PathBuf, shim: PathBuf, version: &str) -> Self {
        let lib_dir = prefix.join("lib");
        Self {
            include_dir: prefix.join("include"),
            pkg_config_dir: lib_dir.join("pkgconfig"),
            lib_dir,
            prefix,
            pkg_config_shim: shim,
            version: version.trim_start_matches('v').to_string(),
        }
    }

    pub fn static_library(&self) -> PathBuf {
        self.lib_dir.join("libdav1d.a")
    }
}

/// Render a meson cross file pinned to the descriptor's tools
pub fn cross_file(tc: &ToolchainDescriptor) -> String {
    format!(
        "[binaries]\n\
         c = {cc}\n\
         cpp = {cxx}\n\
         ar = {ar}\n\
         strip = {strip}\n\
         nm = {nm}\n\
         \n\
         [built-in options]\n\
         c_args = ['-fPIC']\n\
         cpp_args = ['-fPIC']\n\
         \n\
         [host_machine]\n\
         system = 'android'\n\
         cpu_family = {family}\n\
         cpu = {cpu}\n\
         endian = 'little'\n",
        cc = meson_string(&tc.cc.to_string_lossy()),
        cxx = meson_string(&tc.cxx.to_string_lossy()),
        ar = meson_string(&tc.ar.to_string_lossy()),
        strip = meson_string(&tc.strip.to_string_lossy()),
        nm = meson_string(&tc.nm.to_string_lossy()),
        family = meson_string(tc.meson_cpu_family),
        cpu = meson_string(tc.cpu_model),
    )
}

fn meson_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Synthetic `dav1d.pc` describing the static install
pub fn pkg_config_file(prefix: &Path, version: &str) -> String {
    format!(
        "prefix={prefix}\n\
         libdir=${{prefix}}/lib\n\
         includedir=${{prefix}}/include\n\
         \n\
         Name: dav1d\n\
         Description: AV1 decoding library\n\
         Version: {version}\n\
         Libs: -L${{libdir}} -ldav1d -lm\n\
         Cflags: -I${{includedir}}\n",
        prefix = prefix.display(),
        version = version.trim_start_matches('v'),
    )
}

/// Shell script standing in for `pkg-config`: flag-only queries and lookups
/// of `dav1d` go to the real tool restricted to `pc_dir`, anything else fails.
///
/// FFmpeg's configure passes `dav1d >= 0.5.0` unquoted, so comparison
/// operators and version numbers arrive as separate arguments.
pub fn pkg_config_shim(pc_dir: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         for arg in \"$@\"; do\n\
         \x20 case \"$arg\" in\n\
         \x20   --*) ;;\n\
         \x20   dav1d|\"dav1d \"*) ;;\n\
         \x20   '<'|'<='|'='|'>='|'>'|'!=') ;;\n\
         \x20   [0-9]*) ;;\n\
         \x20   *) exit 1 ;;\n\
         \x20 esac\n\
         done\n\
         PKG_CONFIG_LIBDIR={dir} PKG_CONFIG_PATH='' exec pkg-config \"$@\"\n",
        dir = sh_quote(&pc_dir.to_string_lossy()),
    )
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Build and install dav1d for the descriptor's ABI
pub async fn build_dav1d<R: CommandRunner>(
    runner: &R,
    tc: &ToolchainDescriptor,
    layout: &AbiLayout,
    source: &SourceCheckout,
    jobs: usize,
) -> Result<Dav1dInstall, BuildError> {
    info!("Building dav1d {} for {}", source.tag(), tc.abi);

    std::fs::create_dir_all(layout.root())?;
    let build_dir = layout.dav1d_build_dir();
    if build_dir.exists() {
        std::fs::remove_dir_all(&build_dir)?;
    }
    let install = Dav1dInstall::at(layout.dav1d_prefix(), layout.pkg_config_shim(), source.tag());
    if install.prefix.exists() {
        std::fs::remove_dir_all(&install.prefix)?;
    }

    let cross = layout.dav1d_cross_file();
    std::fs::write(&cross, cross_file(tc))?;
    debug!("Wrote meson cross file {:?}", cross);

    let setup = CommandSpec::new("meson")
        .current_dir(source.path())
        .arg("setup")
        .arg(&build_dir)
        .arg("--cross-file")
        .arg(&cross)
        .arg("--prefix")
        .arg(&install.prefix)
        .args([
            "--libdir",
            "lib",
            "--buildtype",
            "release",
            "--default-library",
            "static",
            "-Denable_tools=false",
            "-Denable_tests=false",
        ]);
    run_step(runner, tc.abi, "meson-setup", &setup, &layout.log("dav1d")).await?;

    let ninja = CommandSpec::new("ninja")
        .arg("-C")
        .arg(&build_dir)
        .arg("-j")
        .arg(jobs.to_string())
        .arg("install");
    run_step(runner, tc.abi, "ninja-install", &ninja, &layout.log("dav1d")).await?;

    if !install.static_library().exists() {
        return Err(BuildError::MissingOutput(install.static_library()));
    }

    std::fs::create_dir_all(&install.pkg_config_dir)?;
    std::fs::write(
        install.pkg_config_dir.join("dav1d.pc"),
        pkg_config_file(&install.prefix, &install.version),
    )?;
    write_executable(&install.pkg_config_shim, &pkg_config_shim(&install.pkg_config_dir))?;

    info!("dav1d installed to {:?}", install.prefix);
    Ok(install)
}

fn write_executable(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
