//! Current released version of a project.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::version::SemVer;
use crate::io::git::Git;

/// Source of the version most recently released for a project.
pub trait VersionSource {
    /// Raw version text, e.g. `3.0.61`. Parsing happens in the protocol.
    fn current_version(&self, project: &str) -> Result<String>;
}

/// Highest semver tag on the remote, falling back to local tags.
#[derive(Debug, Clone)]
pub struct GitTagVersionSource {
    git: Git,
    remote: String,
    tag_prefix: String,
}

impl GitTagVersionSource {
    pub fn new(git: Git, remote: impl Into<String>, tag_prefix: impl Into<String>) -> Self {
        Self {
            git,
            remote: remote.into(),
            tag_prefix: tag_prefix.into(),
        }
    }
}

impl VersionSource for GitTagVersionSource {
    #[instrument(skip_all, fields(project, remote = %self.remote))]
    fn current_version(&self, project: &str) -> Result<String> {
        let tags = match self.git.remote_tags(&self.remote) {
            Ok(tags) => tags,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "remote tags unavailable, using local tags");
                self.git.local_tags()?
            }
        };
        let version = highest_version(&tags, &self.tag_prefix).unwrap_or(SemVer::ZERO);
        debug!(%version, tags = tags.len(), "current version");
        Ok(version.to_string())
    }
}

/// Highest version among `tags` carrying `prefix`; other tags are ignored.
pub fn highest_version(tags: &[String], prefix: &str) -> Option<SemVer> {
    tags.iter()
        .filter_map(|tag| tag.strip_prefix(prefix))
        .filter_map(|raw| raw.parse::<SemVer>().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_numerically_highest_prefixed_tag() {
        let tags: Vec<String> = ["v3.0.9", "v3.0.61", "nightly", "v3.0.61-rc1", "x9.9.9"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(highest_version(&tags, "v"), Some(SemVer::new(3, 0, 61)));
        assert_eq!(highest_version(&[], "v"), None);
    }
}
