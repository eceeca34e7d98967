//! Git adapter for version discovery and publishing.
//!
//! Every git interaction goes through this small wrapper around `git`
//! subprocess calls so failures carry the exact command and stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to publish)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Push `HEAD` to the same-named branch on `remote`.
    #[instrument(skip_all, fields(remote))]
    pub fn push_head(&self, remote: &str) -> Result<()> {
        let branch = self.current_branch()?;
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", remote, &refspec])?;
        Ok(())
    }

    /// Create an annotated tag at `HEAD`.
    #[instrument(skip_all, fields(tag))]
    pub fn tag_annotated(&self, tag: &str, message: &str) -> Result<()> {
        self.run_checked(&["tag", "-a", tag, "-m", message])?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, tag))]
    pub fn push_tag(&self, remote: &str, tag: &str) -> Result<()> {
        let refspec = format!("refs/tags/{tag}");
        self.run_checked(&["push", remote, &refspec])?;
        Ok(())
    }

    /// Tag names advertised by `remote` (read-only).
    #[instrument(skip_all, fields(remote))]
    pub fn remote_tags(&self, remote: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-remote", "--tags", "--refs", remote])?;
        Ok(parse_ls_remote_tags(&out))
    }

    pub fn local_tags(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["tag", "--list"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Configured URL of `remote`, if any.
    pub fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let output = self.run(&["remote", "get-url", remote])?;
        if !output.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(url).filter(|u| !u.is_empty()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Extract tag names from `git ls-remote --tags` output.
fn parse_ls_remote_tags(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|reference| reference.strip_prefix("refs/tags/"))
        .map(|tag| tag.trim_end_matches("^{}").to_string())
        .collect()
}
