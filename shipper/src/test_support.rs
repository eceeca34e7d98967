//! Scripted collaborators and a throwaway git project for tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::core::types::ExpectedTask;
use crate::io::completion::{CompletionError, CompletionRequest, CompletionService};
use crate::io::config::{ShipperConfig, load_config, write_config};
use crate::io::init::{InitOptions, ShipperPaths, init_project};
use crate::io::publish::{Publisher, ReleaseOutcome};
use crate::io::snapshot::SnapshotStore;
use crate::io::todo_store::{TodoItem, TodoStore};
use crate::io::version_source::VersionSource;

/// JSON for one `create_file` task.
pub fn create_task(id: &str, filename: &str, content: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "create_file",
        "description": format!("create {filename}"),
        "filename": filename,
        "content": content,
    })
}

/// A `{"tasks": [...]}` response body.
pub fn tasks_response(tasks: &[serde_json::Value]) -> String {
    json!({ "tasks": tasks }).to_string()
}

/// `count` distinct `create_file` tasks under `src/`.
pub fn many_tasks_response(count: usize) -> String {
    let tasks: Vec<_> = (1..=count)
        .map(|i| create_task(&i.to_string(), &format!("src/file_{i}.rs"), "// generated\n"))
        .collect();
    tasks_response(&tasks)
}

/// Completion service that replays queued responses and records every prompt.
///
/// Once the queue is empty it answers with an empty task list.
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    responses: RefCell<VecDeque<Result<String, CompletionError>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self::with_results(responses.into_iter().map(|r| Ok(r.into())))
    }

    pub fn with_results(results: impl IntoIterator<Item = Result<String, CompletionError>>) -> Self {
        Self {
            responses: RefCell::new(results.into_iter().collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }
}

impl CompletionService for ScriptedCompletion {
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(tasks_response(&[])))
    }
}

/// Version source returning a fixed string.
#[derive(Debug)]
pub struct FakeVersionSource {
    version: String,
    calls: Cell<usize>,
}

impl FakeVersionSource {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl VersionSource for FakeVersionSource {
    fn current_version(&self, _project: &str) -> Result<String> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.version.clone())
    }
}

/// Snapshot store that only records labels; ids are `snap-<n>`.
#[derive(Debug, Default)]
pub struct FakeSnapshotStore {
    labels: RefCell<Vec<String>>,
    rollbacks: RefCell<Vec<String>>,
    fail: bool,
}

impl FakeSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create_snapshot` call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.borrow().clone()
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.borrow().clone()
    }
}

impl SnapshotStore for FakeSnapshotStore {
    fn create_snapshot(&self, _project: &str, label: &str) -> Result<String> {
        if self.fail {
            return Err(anyhow!("snapshot storage unavailable"));
        }
        let mut labels = self.labels.borrow_mut();
        labels.push(label.to_string());
        Ok(format!("snap-{}", labels.len()))
    }

    fn rollback(&self, _project: &str, snapshot_id: &str) -> Result<bool> {
        self.rollbacks.borrow_mut().push(snapshot_id.to_string());
        Ok(snapshot_id.starts_with("snap-"))
    }
}

/// Publisher that records calls as `commit:<msg>`, `push`, `create_release:<v>`, `verify_release:<v>`.
#[derive(Debug)]
pub struct RecordingPublisher {
    calls: RefCell<Vec<String>>,
    verify: bool,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            verify: true,
        }
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `verify_release` reports the release missing.
    pub fn unverified() -> Self {
        Self {
            verify: false,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn commit(&self, _project: &str, message: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("commit:{message}"));
        Ok(())
    }

    fn push(&self, _project: &str) -> Result<()> {
        self.calls.borrow_mut().push("push".to_string());
        Ok(())
    }

    fn create_release(&self, _target: &str, version: &str, _notes: &str) -> Result<ReleaseOutcome> {
        self.calls
            .borrow_mut()
            .push(format!("create_release:{version}"));
        Ok(ReleaseOutcome {
            success: true,
            url: Some(format!("https://example.test/releases/v{version}")),
        })
    }

    fn verify_release(&self, _target: &str, version: &str) -> Result<bool> {
        self.calls
            .borrow_mut()
            .push(format!("verify_release:{version}"));
        Ok(self.verify)
    }
}

/// Temporary git repository with one commit and an initialised `.shipper/`.
///
/// The project id is always `demo`.
pub struct TestProject {
    dir: TempDir,
    paths: ShipperPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let root = dir.path();
        git(root, &["init", "-q", "-b", "main"])?;
        git(root, &["config", "user.name", "Shipper Test"])?;
        git(root, &["config", "user.email", "shipper@example.test"])?;
        git(root, &["config", "commit.gpgsign", "false"])?;
        git(root, &["config", "tag.gpgsign", "false"])?;
        fs::write(root.join("README.md"), "# demo\n").context("write README")?;

        let paths = init_project(root, &InitOptions::default())?;
        let cfg = ShipperConfig {
            project: "demo".to_string(),
            ..ShipperConfig::default()
        };
        write_config(&paths.config_path, &cfg)?;
        git(root, &["add", "-A"])?;
        git(root, &["commit", "-q", "-m", "initial"])?;
        Ok(Self { dir, paths })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> &ShipperPaths {
        &self.paths
    }

    pub fn config(&self) -> Result<ShipperConfig> {
        load_config(&self.paths.config_path)
    }

    /// Load, modify and rewrite `config.toml`.
    pub fn update_config(&self, update: impl FnOnce(&mut ShipperConfig)) -> Result<ShipperConfig> {
        let mut cfg = self.config()?;
        update(&mut cfg);
        write_config(&self.paths.config_path, &cfg)?;
        Ok(cfg)
    }

    pub fn todos(&self) -> TodoStore {
        TodoStore::new(&self.paths.todos_path)
    }

    pub fn add_todo(&self, instruction: &str, expect: Vec<ExpectedTask>) -> Result<TodoItem> {
        self.todos().add(instruction, expect)
    }

    pub fn file(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Run git in the project and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        git(self.root(), args)
    }

    /// Create a bare repository next to the project and register it as `origin`.
    pub fn add_bare_remote(&self) -> Result<PathBuf> {
        let remote = self.dir.path().join(".shipper").join("remote.git");
        fs::create_dir_all(&remote).context("create bare remote dir")?;
        git(&remote, &["init", "-q", "--bare"])?;
        let url = remote.to_string_lossy().into_owned();
        self.git(&["remote", "add", "origin", &url])?;
        Ok(remote)
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
