//! Commits a build's workspace.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Records the workspace state and returns the commit sha.
#[async_trait]
pub trait GitCommitter: Send + Sync {
    async fn commit_all(&self, workspace: &Path, message: &str) -> Result<String>;
}

/// [`GitCommitter`] over the `git` CLI. Initializes the repository on first
/// use.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
    author_name: String,
    author_email: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            author_name: "kiln".to_string(),
            author_email: "kiln@localhost".to_string(),
        }
    }
}

impl GitCli {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
            ..Self::default()
        }
    }

    async fn git(&self, workspace: &Path, args: &[&str]) -> Result<String> {
        debug!(workspace = %workspace.display(), ?args, "running git");
        let output = Command::new(&self.binary)
            .arg("-C")
            .arg(workspace)
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("running {} {}", self.binary, args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitCommitter for GitCli {
    async fn commit_all(&self, workspace: &Path, message: &str) -> Result<String> {
        if !workspace.join(".git").exists() {
            self.git(workspace, &["init", "-q"]).await?;
        }
        self.git(workspace, &["add", "-A"]).await?;
        self.git(workspace, &["commit", "-q", "--allow-empty", "-m", message])
            .await?;
        self.git(workspace, &["rev-parse", "HEAD"]).await
    }
}
