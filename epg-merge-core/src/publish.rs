//! Git publisher: commits the saved guide into a working copy and pushes it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PublishConfig;
use crate::contract::{PublishError, PublishOutcome, Publisher};

#[derive(Debug, Clone)]
pub struct GitPublisher {
    repo_dir: PathBuf,
    paths: Vec<PathBuf>,
    remote: String,
    branch: String,
    push: bool,
}

impl GitPublisher {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            paths: Vec::new(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            push: true,
        }
    }

    /// Paths to stage; when empty, the saved file itself is staged.
    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>, branch: impl Into<String>) -> Self {
        self.remote = remote.into();
        self.branch = branch.into();
        self
    }

    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, PublishError> {
        debug!(repo = %self.repo_dir.display(), ?args, "[PUBLISH] git");
        Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(args)
            .output()
            .await
            .map_err(PublishError::Launch)
    }

    /// Current stash tip, if any.
    async fn stash_tip(&self) -> Option<String> {
        let output = self
            .git(&["rev-parse", "-q", "--verify", "refs/stash"])
            .await
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Rebases local work onto the remote branch before committing.
    ///
    /// A failed pull is retried once with the working tree stashed. Pull failures
    /// only warn. A stash that cannot be popped is an error.
    async fn sync_with_remote(&self) -> Result<(), PublishError> {
        let pull = ["pull", "--rebase", self.remote.as_str(), self.branch.as_str()];
        match self.git_checked(&pull).await {
            Ok(()) => {
                info!(remote = %self.remote, branch = %self.branch, "[PUBLISH] Rebased");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "[PUBLISH] Pull with rebase failed, retrying with stash")
            }
        }

        let before = self.stash_tip().await;
        if let Err(e) = self.git_checked(&["stash"]).await {
            warn!(error = %e, "[PUBLISH] Stash failed");
        }
        let stashed = self
            .stash_tip()
            .await
            .is_some_and(|tip| before.as_ref() != Some(&tip));

        match self.git_checked(&pull).await {
            Ok(()) => info!(
                remote = %self.remote,
                branch = %self.branch,
                "[PUBLISH] Rebased onto remote after stash"
            ),
            Err(e) => {
                warn!(error = %e, "[PUBLISH] Pull failed again, continuing without sync");
                // Errors when no rebase is in progress.
                let _ = self.git(&["rebase", "--abort"]).await;
            }
        }

        if stashed {
            self.git_checked(&["stash", "pop"]).await?;
        }
        Ok(())
    }

    /// Pushes, retrying once with `--force-with-lease` when the plain push is rejected.
    async fn push_to_remote(&self) -> Result<(), PublishError> {
        let remote = self.remote.as_str();
        let branch = self.branch.as_str();
        if let Err(e) = self.git_checked(&["push", remote, branch]).await {
            warn!(error = %e, "[PUBLISH] Push rejected, retrying with lease");
            self.git_checked(&["push", "--force-with-lease", remote, branch]).await?;
        }
        Ok(())
    }

    /// Runs git and maps a non-zero exit to [`PublishError::Command`].
    async fn git_checked(&self, args: &[&str]) -> Result<(), PublishError> {
        let output = self.git(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(PublishError::Command {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

impl From<&PublishConfig> for GitPublisher {
    fn from(config: &PublishConfig) -> Self {
        GitPublisher::new(&config.repo_dir)
            .with_paths(config.paths.clone())
            .with_remote(&config.remote, &config.branch)
            .with_push(config.push)
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, path: &Path, label: &str) -> Result<PublishOutcome, PublishError> {
        let staged: Vec<String> = if self.paths.is_empty() {
            vec![path.to_string_lossy().into_owned()]
        } else {
            self.paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect()
        };

        let mut add = vec!["add", "-A", "--"];
        add.extend(staged.iter().map(String::as_str));
        self.git_checked(&add).await?;

        if self.push {
            self.sync_with_remote().await?;
            self.git_checked(&add).await?;
        }

        // `diff --cached --quiet` exits 0 when the index matches HEAD.
        let diff = self.git(&["diff", "--cached", "--quiet"]).await?;
        if diff.status.success() {
            info!(repo = %self.repo_dir.display(), "[PUBLISH] Nothing to commit");
            return Ok(PublishOutcome::NothingToPublish);
        }

        let message = format!("Auto commit at {label}");
        self.git_checked(&["commit", "-m", &message]).await?;
        info!(repo = %self.repo_dir.display(), message = %message, "[PUBLISH] Committed");

        if self.push {
            self.push_to_remote().await?;
            info!(remote = %self.remote, branch = %self.branch, "[PUBLISH] Pushed");
        }
        Ok(PublishOutcome::Published)
    }
}
