//! Commit, push and release through git.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::io::git::Git;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub success: bool,
    pub url: Option<String>,
}

/// Publishing collaborator. Every call mutates shared repository state.
pub trait Publisher {
    fn commit(&self, project: &str, message: &str) -> Result<()>;
    fn push(&self, project: &str) -> Result<()>;
    fn create_release(&self, target: &str, version: &str, notes: &str) -> Result<ReleaseOutcome>;
    fn verify_release(&self, target: &str, version: &str) -> Result<bool>;
}

/// Releases are annotated tags `<prefix><version>` pushed to `remote`.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    git: Git,
    remote: String,
    tag_prefix: String,
    url_template: String,
}

impl GitPublisher {
    pub fn new(
        git: Git,
        remote: impl Into<String>,
        tag_prefix: impl Into<String>,
        url_template: impl Into<String>,
    ) -> Self {
        Self {
            git,
            remote: remote.into(),
            tag_prefix: tag_prefix.into(),
            url_template: url_template.into(),
        }
    }

    pub fn tag_for(&self, version: &str) -> String {
        format!("{}{version}", self.tag_prefix)
    }
}

impl Publisher for GitPublisher {
    #[instrument(skip_all, fields(project))]
    fn commit(&self, _project: &str, message: &str) -> Result<()> {
        self.git.add_all()?;
        if !self.git.commit_staged(message)? {
            return Err(anyhow!("nothing to commit: tasks left the work tree unchanged"));
        }
        info!(sha = %self.git.head_short_sha(12)?, "release commit created");
        Ok(())
    }

    #[instrument(skip_all, fields(project, remote = %self.remote))]
    fn push(&self, _project: &str) -> Result<()> {
        self.git.push_head(&self.remote)
    }

    #[instrument(skip_all, fields(target, version))]
    fn create_release(&self, _target: &str, version: &str, notes: &str) -> Result<ReleaseOutcome> {
        let tag = self.tag_for(version);
        self.git.tag_annotated(&tag, notes)?;
        self.git.push_tag(&self.remote, &tag)?;
        let remote_url = self
            .git
            .remote_url(&self.remote)?
            .unwrap_or_else(|| self.remote.clone());
        let url = render_release_url(&self.url_template, &remote_url, &tag);
        info!(%tag, %url, "release tag pushed");
        Ok(ReleaseOutcome {
            success: true,
            url: Some(url),
        })
    }

    #[instrument(skip_all, fields(target, version))]
    fn verify_release(&self, _target: &str, version: &str) -> Result<bool> {
        let tag = self.tag_for(version);
        Ok(self.git.remote_tags(&self.remote)?.contains(&tag))
    }
}

/// Expand `{remote}` and `{tag}`; a trailing `.git` on the remote is dropped.
pub fn render_release_url(template: &str, remote_url: &str, tag: &str) -> String {
    let remote = remote_url.trim_end_matches('/');
    let remote = remote.strip_suffix(".git").unwrap_or(remote);
    template.replace("{remote}", remote).replace("{tag}", tag)
}
