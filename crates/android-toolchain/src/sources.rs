//! Upstream source checkouts
//!
//! Clone-or-update of the FFmpeg and dav1d repositories at a pinned tag,
//! driven through the `git` CLI.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use avdroid_core::process::run_logged;
use avdroid_core::{CommandRunner, CommandSpec};

use crate::error::{ProvisionError, Result};

/// An upstream repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamRepo {
    pub name: &'static str,
    pub url: &'static str,
}

pub const FFMPEG_REPO: UpstreamRepo = UpstreamRepo {
    name: "ffmpeg",
    url: "https://github.com/FFmpeg/FFmpeg.git",
};

pub const DAV1D_REPO: UpstreamRepo = UpstreamRepo {
    name: "dav1d",
    url: "https://code.videolan.org/videolan/dav1d.git",
};

/// A working tree checked out at `tag`.
///
/// Builds that configure in-tree mutate the checkout, so stages that touch
/// it take `&mut SourceCheckout`; two ABIs can never share it concurrently.
#[derive(Debug)]
pub struct SourceCheckout {
    repo: UpstreamRepo,
    path: PathBuf,
    tag: String,
}

impl SourceCheckout {
    pub fn repo(&self) -> UpstreamRepo {
        self.repo
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Clones upstream repositories into a sources directory
pub struct SourceProvisioner<'a, R> {
    runner: &'a R,
    sources_dir: PathBuf,
    log_path: PathBuf,
}

impl<'a, R: CommandRunner> SourceProvisioner<'a, R> {
    pub fn new(runner: &'a R, sources_dir: PathBuf, log_path: PathBuf) -> Self {
        Self {
            runner,
            sources_dir,
            log_path,
        }
    }

    /// Make sure `repo` is checked out at `tag`.
    ///
    /// An existing checkout already sitting on the tag is reused without any
    /// network access. Otherwise the tag is confirmed with `git ls-remote`
    /// first so an unknown tag fails before anything is cloned.
    pub async fn ensure(&self, repo: UpstreamRepo, tag: &str) -> Result<SourceCheckout> {
        let path = self.sources_dir.join(repo.name);
        let checkout = SourceCheckout {
            repo,
            path: path.clone(),
            tag: tag.to_string(),
        };

        let exists = path.join(".git").exists();
        if exists && self.head_matches_tag(&path, tag).await? {
            info!("{} already checked out at {}", repo.name, tag);
            return Ok(checkout);
        }

        self.check_remote_tag(repo, tag).await?;

        if exists {
            info!("Updating {} to {}", repo.name, tag);
            self.git(
                repo,
                "fetch",
                CommandSpec::new("git")
                    .current_dir(&path)
                    .args(["fetch", "--depth", "1", "--force", "origin"])
                    .arg(format!("refs/tags/{tag}:refs/tags/{tag}")),
            )
            .await?;
            self.git(
                repo,
                "checkout",
                CommandSpec::new("git")
                    .current_dir(&path)
                    .args(["checkout", "--force", "--detach"])
                    .arg(format!("refs/tags/{}", tag)),
            )
            .await?;
        } else {
            info!("Cloning {} at {}", repo.name, tag);
            tokio::fs::create_dir_all(&self.sources_dir).await?;
            self.git(
                repo,
                "clone",
                CommandSpec::new("git")
                    .args(["clone", "--depth", "1", "--branch", tag, repo.url])
                    .arg(&path),
            )
            .await?;
        }

        Ok(checkout)
    }

    async fn head_matches_tag(&self, path: &Path, tag: &str) -> Result<bool> {
        let head = self
            .runner
            .run(&CommandSpec::new("git").current_dir(path).args(["rev-parse", "HEAD"]))
            .await?;
        let tagged = self
            .runner
            .run(
                &CommandSpec::new("git")
                    .current_dir(path)
                    .args(["rev-parse", "--verify", "--quiet"])
                    .arg(format!("refs/tags/{}^{{commit}}", tag)),
            )
            .await?;

        let matches = head.success && tagged.success && head.stdout.trim() == tagged.stdout.trim();
        debug!("HEAD of {:?} matches {}: {}", path, tag, matches);
        Ok(matches)
    }

    async fn check_remote_tag(&self, repo: UpstreamRepo, tag: &str) -> Result<()> {
        let spec = CommandSpec::new("git")
            .args(["ls-remote", "--exit-code", "--tags", repo.url])
            .arg(format!("refs/tags/{}", tag));
        let output = run_logged(self.runner, &spec, &self.log_path).await?;

        match output.code {
            Some(0) => Ok(()),
            // --exit-code: 2 means the remote answered but had no matching ref
            Some(2) => Err(ProvisionError::UnknownTag {
                repo: repo.name.to_string(),
                tag: tag.to_string(),
            }),
            _ => Err(ProvisionError::Git {
                repo: repo.name.to_string(),
                action: "ls-remote",
                detail: output.stderr.trim().to_string(),
                log: self.log_path.clone(),
            }),
        }
    }

    async fn git(&self, repo: UpstreamRepo, action: &'static str, spec: CommandSpec) -> Result<()> {
        let output = run_logged(self.runner, &spec, &self.log_path).await?;
        if !output.success {
            return Err(ProvisionError::Git {
                repo: repo.name.to_string(),
                action,
                detail: output.stderr.trim().to_string(),
                log: self.log_path.clone(),
            });
        }
        Ok(())
    }
}
