//! Fake build host shared by the build-engine tests.
//!
//! Answers the commands the pipeline issues and creates the files real tools
//! would leave behind.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use avdroid_android_toolchain::ndk::detect_host_tag;
use avdroid_android_toolchain::{ArchiveFetcher, ProvisionError};
use avdroid_core::{Abi, CommandOutput, CommandRunner, CommandSpec};

#[derive(Default)]
pub(crate) struct Prefixes {
    dav1d: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
}

pub struct FakeBuildHost {
    pub calls: Mutex<Vec<CommandSpec>>,
    pub decoder_enabled: bool,
    pub fail_shared_link: bool,
    pub fail_static_link: bool,
    pub export_entry: bool,
    /// Path suffix of a library that imports `iconv_open`
    pub iconv_in: Option<&'static str>,
    /// Whether `make install` leaves shared FFmpeg libraries behind
    pub install_shared: bool,
    pub readelf_fails: bool,
    pub(crate) prefixes: Mutex<Prefixes>,
}

impl Default for FakeBuildHost {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            decoder_enabled: true,
            fail_shared_link: false,
            fail_static_link: false,
            export_entry: true,
            iconv_in: None,
            install_shared: true,
            readelf_fails: false,
            prefixes: Mutex::new(Prefixes::default()),
        }
    }
}

impl FakeBuildHost {
    /// Rendered command lines of every call whose program ends with `program`
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program.ends_with(program))
            .map(|c| c.display())
            .collect()
    }

    fn answer(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let program = Path::new(&spec.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let cwd = spec.cwd.clone().unwrap_or_default();

        let output = match program.as_str() {
            "id" => CommandOutput::ok("0\n"),
            "git" => match args.first().copied() {
                Some("rev-parse") => CommandOutput::ok("cafe\n"),
                Some("clone") => {
                    touch(&PathBuf::from(args[args.len() - 1]).join(".git/HEAD"))?;
                    CommandOutput::ok("")
                }
                _ => CommandOutput::ok(""),
            },
            "meson" => {
                if let Some(prefix) = value_after(&args, "--prefix") {
                    self.prefixes.lock().unwrap().dav1d = Some(PathBuf::from(prefix));
                }
                std::fs::create_dir_all(args[1])?;
                CommandOutput::ok("")
            }
            "ninja" => {
                if let Some(prefix) = self.prefixes.lock().unwrap().dav1d.clone() {
                    touch(&prefix.join("include/dav1d/dav1d.h"))?;
                    touch(&prefix.join("lib/libdav1d.a"))?;
                    touch(&prefix.join("lib/pkgconfig/dav1d.pc"))?;
                }
                CommandOutput::ok("")
            }
            "configure" => {
                let prefix = args
                    .iter()
                    .find_map(|a| a.strip_prefix("--prefix="))
                    .map(PathBuf::from);
                self.prefixes.lock().unwrap().ffmpeg = prefix;
                let flag = if self.decoder_enabled { 1 } else { 0 };
                std::fs::write(
                    cwd.join("config.h"),
                    format!("#define CONFIG_H264_DECODER 1\n#define CONFIG_LIBDAV1D_DECODER {}\n", flag),
                )?;
                CommandOutput::ok("")
            }
            "make" => match args.first().copied() {
                Some("distclean") => CommandOutput::failed(2, "No rule to make target 'distclean'"),
                Some("install") => {
                    if let Some(prefix) = self.prefixes.lock().unwrap().ffmpeg.clone() {
                        touch(&prefix.join("include/libavcodec/avcodec.h"))?;
                        touch(&prefix.join("include/libavutil/avutil.h"))?;
                        for lib in ["libavcodec.a", "libavutil.a"] {
                            touch(&prefix.join("lib").join(lib))?;
                        }
                        if self.install_shared {
                            for lib in ["libavcodec.so", "libavutil.so"] {
                                touch(&prefix.join("lib").join(lib))?;
                            }
                        }
                        touch(&prefix.join("lib/pkgconfig/libavcodec.pc"))?;
                    }
                    CommandOutput::ok("")
                }
                _ => {
                    for obj in ["ffmpeg.o", "cmdutils.o", "ffmpeg_opt.o", "ffprobe.o"] {
                        touch(&cwd.join("fftools").join(obj))?;
                    }
                    CommandOutput::ok("")
                }
            },
            "llvm-strip" => CommandOutput::ok(""),
            "llvm-nm" => self.nm(&args),
            "llvm-readelf" if self.readelf_fails => {
                CommandOutput::failed(1, "llvm-readelf: error: not an ELF file")
            }
            "llvm-readelf" => CommandOutput::ok(
                " 0x0000000000000001 (NEEDED)             Shared library: [libm.so]\n\
                 \x200x0000000000000001 (NEEDED)             Shared library: [libc.so]\n",
            ),
            name if name.ends_with("-clang") => self.clang(&args)?,
            _ => CommandOutput::ok(""),
        };
        Ok(output)
    }

    fn clang(&self, args: &[&str]) -> std::io::Result<CommandOutput> {
        let out = value_after(args, "-o").map(PathBuf::from);
        let failing = if args.contains(&"-Wl,--whole-archive") {
            self.fail_static_link
        } else {
            args.contains(&"-shared") && self.fail_shared_link
        };
        if failing {
            return Ok(CommandOutput::failed(1, "ld.lld: error: undefined symbol: av_log"));
        }
        if let Some(out) = out {
            touch(&out)?;
        }
        Ok(CommandOutput::ok(""))
    }

    fn nm(&self, args: &[&str]) -> CommandOutput {
        let target = args.last().copied().unwrap_or_default();

        if args.contains(&"--defined-only") {
            let mut out = String::from("0000000000001000 T av_log\n");
            if self.export_entry {
                out.push_str("0000000000002000 T ffmpeg_main\n");
            }
            return CommandOutput::ok(out);
        }

        let mut out = String::from("                 U memcpy\n                 U malloc@LIBC\n");
        if self.iconv_in.is_some_and(|suffix| target.ends_with(suffix)) {
            out.push_str("                 U iconv_open\n");
        }
        CommandOutput::ok(out)
    }
}

impl CommandRunner for FakeBuildHost {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        self.answer(spec)
    }
}

/// Fetcher that fails the test if the network is touched
pub struct NoNetwork;

impl ArchiveFetcher for NoNetwork {
    async fn fetch(&self, url: &str, _dest: &Path) -> Result<u64, ProvisionError> {
        panic!("unexpected download of {}", url);
    }
}

/// Lay out an extracted NDK with the tools the descriptor checks for
pub fn fake_ndk(install_root: &Path, version: &str, api_level: u32) -> PathBuf {
    let root = install_root.join(format!("android-ndk-{}", version));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("source.properties"), "Pkg.Desc = Android NDK\nPkg.Revision = 27.2.12479018\n").unwrap();

    let prebuilt = root.join("toolchains/llvm/prebuilt").join(detect_host_tag());
    std::fs::create_dir_all(prebuilt.join("sysroot")).unwrap();
    let bin = prebuilt.join("bin");
    for abi in Abi::all() {
        touch(&bin.join(format!("{}{}-clang", abi.clang_triple(), api_level))).unwrap();
    }
    for tool in ["llvm-ar", "llvm-nm", "llvm-strip", "llvm-readelf", "llvm-ranlib"] {
        touch(&bin.join(tool)).unwrap();
    }
    root
}

/// A checked-out source tree with a `.git` directory
pub fn fake_checkout(sources_dir: &Path, name: &str) -> PathBuf {
    let path = sources_dir.join(name);
    std::fs::create_dir_all(path.join(".git")).unwrap();
    std::fs::create_dir_all(path.join("fftools")).unwrap();
    path
}

fn value_after<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1).copied())
}

fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"")
}
