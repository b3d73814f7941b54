//! NDK Downloader
//!
//! Downloads and extracts the Android NDK exactly once per version.

use std::future::Future;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};

const NDK_BASE_URL: &str = "https://dl.google.com/android/repository";

/// Fetches a remote archive to a local file
pub trait ArchiveFetcher {
    /// Download `url` into `dest`, returning the number of bytes written
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<u64>> + Send;
}

/// HTTP fetcher with a terminal progress bar
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        info!("Downloading {} to {:?}", url, dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let progress = match response.content_length() {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => ProgressBar::new_spinner(),
        };

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress.set_position(downloaded);
        }

        file.flush().await?;
        progress.finish_and_clear();

        info!("Download complete: {:?} ({} bytes)", dest, downloaded);
        Ok(downloaded)
    }
}

/// URL of the NDK archive for the current host
pub fn ndk_archive_url(version: &str) -> String {
    format!("{}/android-ndk-{}-{}.zip", NDK_BASE_URL, version, host_os())
}

fn host_os() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    }
}

/// Ensures an extracted NDK exists under `install_root`
pub struct NdkProvisioner<F> {
    fetcher: F,
    install_root: PathBuf,
}

impl<F: ArchiveFetcher> NdkProvisioner<F> {
    pub fn new(fetcher: F, install_root: PathBuf) -> Self {
        Self { fetcher, install_root }
    }

    /// Directory the NDK of `version` lives in once provisioned
    pub fn ndk_dir(&self, version: &str) -> PathBuf {
        self.install_root.join(format!("android-ndk-{}", version))
    }

    /// Download and extract the NDK unless it is already present.
    ///
    /// Extraction happens in a staging directory that is renamed into place
    /// at the end, so the existence check never sees a half-extracted NDK.
    pub async fn ensure(&self, version: &str, sha256: Option<&str>) -> Result<PathBuf> {
        let ndk_dir = self.ndk_dir(version);
        if ndk_dir.exists() {
            info!("NDK {} already present at {:?}", version, ndk_dir);
            return Ok(ndk_dir);
        }

        tokio::fs::create_dir_all(&self.install_root).await?;
        let archive = self
            .install_root
            .join(format!("android-ndk-{}-{}.zip.part", version, host_os()));
        let staging = self.install_root.join(format!(".android-ndk-{}.extract", version));

        self.fetcher.fetch(&ndk_archive_url(version), &archive).await?;

        if let Some(expected) = sha256 {
            let actual = sha256_file(&archive).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                tokio::fs::remove_file(&archive).await?;
                return Err(ProvisionError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!("Checksum verified");
        }

        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        extract_zip(&archive, &staging).await?;

        let extracted = locate_extracted_root(&staging, version)?;
        tokio::fs::rename(&extracted, &ndk_dir).await?;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!("Failed to remove staging directory {:?}: {}", staging, e);
        }
        tokio::fs::remove_file(&archive).await?;

        info!("NDK {} installed to {:?}", version, ndk_dir);
        Ok(ndk_dir)
    }
}

/// The archive holds a single `android-ndk-<version>/` directory
fn locate_extracted_root(staging: &Path, version: &str) -> Result<PathBuf> {
    let expected = staging.join(format!("android-ndk-{}", version));
    if expected.is_dir() {
        return Ok(expected);
    }

    let dirs: Vec<PathBuf> = std::fs::read_dir(staging)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(ProvisionError::Extraction(format!(
            "expected one top-level directory in NDK archive, found {}",
            dirs.len()
        ))),
    }
}

/// SHA-256 of a file as lowercase hex
pub async fn sha256_file(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

/// Extract a ZIP file, preserving unix modes and symlinks
pub async fn extract_zip(archive: &Path, target_dir: &Path) -> Result<()> {
    info!("Extracting {:?} to {:?}", archive, target_dir);

    let archive = archive.to_path_buf();
    let target_dir = target_dir.to_path_buf();

    // zip is synchronous
    tokio::task::spawn_blocking(move || extract_zip_blocking(&archive, &target_dir))
        .await
        .map_err(|e| ProvisionError::Extraction(e.to_string()))?
}

fn extract_zip_blocking(archive: &Path, target_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ProvisionError::Extraction(e.to_string()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ProvisionError::Extraction(e.to_string()))?;

        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| ProvisionError::Extraction(format!("unsafe entry path: {}", entry.name())))?;
        let outpath = target_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            const S_IFMT: u32 = 0o170000;
            const S_IFLNK: u32 = 0o120000;
            if entry.unix_mode().map(|m| m & S_IFMT == S_IFLNK).unwrap_or(false) {
                let mut link_target = String::new();
                std::io::Read::read_to_string(&mut entry, &mut link_target)?;
                std::os::unix::fs::symlink(link_target, &outpath)?;
                continue;
            }
        }

        let mut outfile = std::fs::File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a tiny fake NDK archive and counts requests
    struct FakeFetcher {
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    impl ArchiveFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(url.ends_with(".zip"));
            write_fake_ndk(dest, "r27c");
            Ok(std::fs::metadata(dest)?.len())
        }
    }

    fn write_fake_ndk(dest: &Path, version: &str) {
        let file = std::fs::File::create(dest).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let root = format!("android-ndk-{}", version);
        let exec = zip::write::FileOptions::default().unix_permissions(0o755);

        zip.add_directory(format!("{}/", root), Default::default()).unwrap();
        zip.start_file(format!("{}/source.properties", root), Default::default())
            .unwrap();
        zip.write_all(b"Pkg.Revision = 27.2.12479018\n").unwrap();
        zip.start_file(format!("{}/ndk-build", root), exec).unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_ndk_archive_url() {
        let url = ndk_archive_url("r27c");
        assert!(url.starts_with("https://dl.google.com/android/repository/android-ndk-r27c-"));
        assert!(url.ends_with(".zip"));
    }

    #[tokio::test]
    async fn test_ensure_fetches_once() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = NdkProvisioner::new(FakeFetcher::new(), dir.path().to_path_buf());

        let first = provisioner.ensure("r27c", None).await.unwrap();
        assert!(first.join("source.properties").exists());
        assert_eq!(provisioner.fetcher.calls.load(Ordering::SeqCst), 1);

        let second = provisioner.ensure("r27c", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provisioner.fetcher.calls.load(Ordering::SeqCst), 1);

        // archive and staging directory are cleaned up
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["android-ndk-r27c".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_preserves_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let provisioner = NdkProvisioner::new(FakeFetcher::new(), dir.path().to_path_buf());
        let ndk = provisioner.ensure("r27c", None).await.unwrap();

        let mode = std::fs::metadata(ndk.join("ndk-build")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = NdkProvisioner::new(FakeFetcher::new(), dir.path().to_path_buf());

        let err = provisioner.ensure("r27c", Some("00ff")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ChecksumMismatch { .. }));
        assert!(!provisioner.ndk_dir("r27c").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
