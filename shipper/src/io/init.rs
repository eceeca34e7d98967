//! Initialization helpers for `.shipper/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::{ShipperConfig, write_config};

/// All canonical paths within `.shipper/` for a project root.
#[derive(Debug, Clone)]
pub struct ShipperPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub todos_path: PathBuf,
    pub learning_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub executions_dir: PathBuf,
    pub history_path: PathBuf,
    pub lock_path: PathBuf,
}

impl ShipperPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".shipper");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: state_dir.join("config.toml"),
            gitignore_path: state_dir.join(".gitignore"),
            todos_path: state_dir.join("todos.json"),
            learning_dir: state_dir.join("learning"),
            snapshots_dir: state_dir.join("snapshots"),
            executions_dir: state_dir.join("executions"),
            history_path: state_dir.join("history.json"),
            lock_path: state_dir.join("lock"),
        }
    }

    pub fn execution_path(&self, execution_id: &str) -> PathBuf {
        self.executions_dir.join(format!("{execution_id}.json"))
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Rewrite `config.toml` and `.gitignore` even if present.
    pub force: bool,
}

/// Create `.shipper/` scaffolding in `root`. Safe to run repeatedly.
#[instrument(skip_all, fields(root = %root.display(), force = options.force))]
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ShipperPaths> {
    let paths = ShipperPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "shipper init: .shipper exists but is not a directory"
        ));
    }

    for dir in [
        &paths.state_dir,
        &paths.learning_dir,
        &paths.snapshots_dir,
        &paths.executions_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    if options.force || !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, SHIPPER_GITIGNORE)
            .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    }
    if options.force || !paths.config_path.exists() {
        let cfg = ShipperConfig {
            project: ShipperConfig::default().project_id(root),
            ..ShipperConfig::default()
        };
        write_config(&paths.config_path, &cfg)?;
    }
    if !paths.todos_path.exists() {
        fs::write(&paths.todos_path, "[]\n")
            .with_context(|| format!("write file {}", paths.todos_path.display()))?;
    }
    debug!("layout initialised");
    Ok(paths)
}

/// Refuse to run against a project whose `.shipper/` layout is missing or unsafe.
pub fn ensure_layout(paths: &ShipperPaths) -> Result<()> {
    if !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "{} missing (run `shipper init`)",
            paths.state_dir.display()
        ));
    }
    let gitignore = fs::read_to_string(&paths.gitignore_path)
        .with_context(|| format!("read {}", paths.gitignore_path.display()))?;
    if !gitignore.lines().any(|line| line.trim() == "*") {
        return Err(anyhow!(
            "{} must ignore every state file (`*`); run `shipper init --force`",
            paths.gitignore_path.display()
        ));
    }
    Ok(())
}

const SHIPPER_GITIGNORE: &str = "*\n!.gitignore\n!config.toml\n";
