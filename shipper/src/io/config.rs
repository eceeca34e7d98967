//! Shipper configuration stored under `.shipper/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::constraints::ConstraintLimits;
use crate::core::version::BumpKind;
use crate::io::atomic::write_atomic;

/// Shipper configuration (TOML).
///
/// This file is edited by humans and committed with the project. Missing
/// fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShipperConfig {
    /// Project id used for learning records and the execution lock.
    /// Empty means "use the project directory name".
    pub project: String,

    /// Extra path prefixes tasks may never touch.
    pub protected_paths: Vec<String>,

    pub negotiation: NegotiationConfig,
    pub completion: CompletionConfig,
    pub version: VersionConfig,
    pub publish: PublishConfig,
    pub snapshot: SnapshotConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// A negotiation makes at most `max_retries + 1` completion calls.
    pub max_retries: u32,
    pub max_tasks: usize,
    pub max_content_chars: usize,
    pub max_content_lines: usize,
    pub completion_timeout_secs: u64,
    /// Learned solutions injected into one prompt.
    pub max_injected_solutions: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_tasks: 3,
            max_content_chars: 2000,
            max_content_lines: 120,
            completion_timeout_secs: 300,
            max_injected_solutions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// Command that reads the prompt on stdin and prints the response.
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VersionConfig {
    pub bump: BumpKind,
    pub tag_prefix: String,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            bump: BumpKind::Patch,
            tag_prefix: "v".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublishConfig {
    pub remote: String,
    /// `{remote}` expands to the remote URL, `{tag}` to the release tag.
    pub release_url_template: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            release_url_template: "{remote}/releases/tag/{tag}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            protected_paths: Vec::new(),
            negotiation: NegotiationConfig::default(),
            completion: CompletionConfig::default(),
            version: VersionConfig::default(),
            publish: PublishConfig::default(),
            snapshot: SnapshotConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl ShipperConfig {
    pub fn validate(&self) -> Result<()> {
        let n = &self.negotiation;
        if n.max_tasks == 0 {
            return Err(anyhow!("negotiation.max_tasks must be > 0"));
        }
        if n.max_content_chars == 0 {
            return Err(anyhow!("negotiation.max_content_chars must be > 0"));
        }
        if n.max_content_lines == 0 {
            return Err(anyhow!("negotiation.max_content_lines must be > 0"));
        }
        if n.completion_timeout_secs == 0 {
            return Err(anyhow!("negotiation.completion_timeout_secs must be > 0"));
        }
        if self.history.capacity == 0 {
            return Err(anyhow!("history.capacity must be > 0"));
        }
        if self.completion.command.is_empty() || self.completion.command[0].trim().is_empty() {
            return Err(anyhow!("completion.command must be a non-empty array"));
        }
        if self.completion.output_limit_bytes == 0 {
            return Err(anyhow!("completion.output_limit_bytes must be > 0"));
        }
        if self.publish.remote.trim().is_empty() {
            return Err(anyhow!("publish.remote must not be empty"));
        }
        Ok(())
    }

    /// Project id, falling back to the name of `root`.
    pub fn project_id(&self, root: &Path) -> String {
        let configured = self.project.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
        root.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn limits(&self) -> ConstraintLimits {
        ConstraintLimits {
            max_tasks: self.negotiation.max_tasks,
            max_content_chars: self.negotiation.max_content_chars,
            max_content_lines: self.negotiation.max_content_lines,
            protected_paths: self.protected_paths.clone(),
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation.completion_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ShipperConfig::default()`.
pub fn load_config(path: &Path) -> Result<ShipperConfig> {
    if !path.exists() {
        let cfg = ShipperConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ShipperConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ShipperConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
