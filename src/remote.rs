//! Version-control collaborator.
//!
//! [`RemoteRepository`] is the seam between the reconciliation engine and
//! git. The engine only needs three things from it: a read-only snapshot of
//! the upstream library, a way to publish local changes, and a check for
//! uncommitted work. [`GitRemote`] implements them by shelling out to the
//! `git` binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::Config;
use crate::error::{Result, SyncError};

#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Materialize the upstream snapshot somewhere below `workspace` and
    /// return its root. The caller owns `workspace` and removes it.
    async fn fetch(&self, url: &str, workspace: &Path) -> Result<PathBuf>;

    /// Stage the tracked roots of `repo`, commit them and push `branch`.
    async fn push(&self, repo: &Path, branch: &str, message: &str) -> anyhow::Result<()>;

    /// Whether the tracked roots of `repo` have uncommitted changes.
    async fn has_uncommitted_changes(&self, repo: &Path) -> anyhow::Result<bool>;
}

/// [`RemoteRepository`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitRemote {
    branch: String,
    tracked: Vec<String>,
}

impl GitRemote {
    pub fn new(branch: impl Into<String>, tracked: Vec<String>) -> Self {
        Self {
            branch: branch.into(),
            tracked,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.remote.branch.clone(),
            vec![
                config.library.prompts_subdir.clone(),
                config.library.fragments_subdir.clone(),
            ],
        )
    }
}

async fn git(repo: &Path, args: &[&str]) -> anyhow::Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args[0]))
}

#[async_trait]
impl RemoteRepository for GitRemote {
    async fn fetch(&self, url: &str, workspace: &Path) -> Result<PathBuf> {
        let dest = workspace.join("snapshot");
        let fetch_err = |message: String| SyncError::Fetch {
            url: url.to_string(),
            message,
        };

        tracing::info!(url, branch = %self.branch, "cloning remote snapshot");
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch"])
            .arg(&self.branch)
            .arg(url)
            .arg(&dest)
            .output()
            .await
            .map_err(|e| fetch_err(format!("failed to execute 'git clone': {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fetch_err(format!("git clone failed: {}", stderr.trim())));
        }

        Ok(dest)
    }

    async fn push(&self, repo: &Path, branch: &str, message: &str) -> anyhow::Result<()> {
        let mut add: Vec<&str> = vec!["add", "--all", "--"];
        add.extend(self.tracked.iter().map(String::as_str));
        let output = git(repo, &add).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git add failed: {}", stderr.trim());
        }

        // Exit code 0 means nothing is staged.
        let staged = git(repo, &["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            tracing::info!("nothing to commit");
        } else {
            let output = git(repo, &["commit", "-m", message]).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("git commit failed: {}", stderr.trim());
            }
        }

        let refspec = format!("HEAD:{}", branch);
        let output = git(repo, &["push", "origin", &refspec]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git push failed: {}", stderr.trim());
        }

        tracing::info!(branch, "pushed");
        Ok(())
    }

    async fn has_uncommitted_changes(&self, repo: &Path) -> anyhow::Result<bool> {
        let mut args: Vec<&str> = vec!["status", "--porcelain", "--"];
        args.extend(self.tracked.iter().map(String::as_str));
        let output = git(repo, &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git status failed: {}", stderr.trim());
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git_available() -> bool {
        StdCommand::new("git").arg("--version").output().is_ok()
    }

    fn run(repo: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(["-c", "user.name=psync", "-c", "user.email=psync@localhost"])
            .args(args)
            .current_dir(repo)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn upstream() -> TempDir {
        let tmp = TempDir::new().unwrap();
        run(tmp.path(), &["init", "-q", "-b", "main"]);
        std::fs::create_dir_all(tmp.path().join("prompts/a")).unwrap();
        std::fs::write(tmp.path().join("prompts/a/prompt.md"), "hello").unwrap();
        run(tmp.path(), &["add", "."]);
        run(tmp.path(), &["commit", "-q", "-m", "seed"]);
        tmp
    }

    fn remote() -> GitRemote {
        GitRemote::new("main", vec!["prompts".into(), "fragments".into()])
    }

    #[tokio::test]
    async fn fetch_clones_snapshot() {
        if !git_available() {
            return;
        }
        let up = upstream();
        let workspace = TempDir::new().unwrap();
        let url = format!("file://{}", up.path().display());

        let root = remote().fetch(&url, workspace.path()).await.unwrap();
        assert!(root.starts_with(workspace.path()));
        assert_eq!(
            std::fs::read_to_string(root.join("prompts/a/prompt.md")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn fetch_of_missing_repo_is_fetch_error() {
        if !git_available() {
            return;
        }
        let workspace = TempDir::new().unwrap();
        let missing = workspace.path().join("nope");
        let url = format!("file://{}", missing.display());
        let err = remote().fetch(&url, workspace.path()).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { .. }));
    }

    #[tokio::test]
    async fn detects_uncommitted_changes_in_tracked_roots() {
        if !git_available() {
            return;
        }
        let repo = upstream();
        assert!(!remote().has_uncommitted_changes(repo.path()).await.unwrap());

        std::fs::write(repo.path().join("untracked-root.txt"), "x").unwrap();
        assert!(!remote().has_uncommitted_changes(repo.path()).await.unwrap());

        std::fs::write(repo.path().join("prompts/a/prompt.md"), "changed").unwrap();
        assert!(remote().has_uncommitted_changes(repo.path()).await.unwrap());
    }
}
