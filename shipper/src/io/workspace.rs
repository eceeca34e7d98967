//! Applying accepted tasks to the work tree.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::types::TaskSpec;

/// Top-level directories that are never listed, snapshotted or modified.
pub const EXCLUDED_TOP_LEVEL: &[&str] = &[".git", ".shipper", "target"];

/// Paths changed by one `apply_tasks` call, in task order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceChanges {
    pub touched: Vec<String>,
    pub created: Vec<String>,
}

/// Write, overwrite or delete files as the tasks describe.
#[instrument(skip_all, fields(root = %root.display(), tasks = tasks.len()))]
pub fn apply_tasks(root: &Path, tasks: &[TaskSpec]) -> Result<WorkspaceChanges> {
    let mut changes = WorkspaceChanges::default();
    for task in tasks {
        let rel = task.filename();
        let path = resolve(root, rel)?;
        match task {
            TaskSpec::CreateFile { content, .. } | TaskSpec::UpdateFile { content, .. } => {
                let existed = path.exists();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::write(&path, content)
                    .with_context(|| format!("write {}", path.display()))?;
                if !existed {
                    changes.created.push(rel.to_string());
                }
            }
            TaskSpec::DeleteFile { .. } => {
                if !path.is_file() {
                    return Err(anyhow!("task {}: cannot delete missing file {rel}", task.id()));
                }
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            }
        }
        debug!(task = task.id(), kind = %task.task_type(), path = rel, "task applied");
        changes.touched.push(rel.to_string());
    }
    Ok(changes)
}

fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let relative = Path::new(rel);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if rel.trim().is_empty() || !safe {
        return Err(anyhow!("refusing to touch path outside the project: {rel}"));
    }
    Ok(root.join(relative))
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry.depth() == 1
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_TOP_LEVEL.contains(&name))
}

/// Regular files under `root`, relative and sorted, skipping state directories.
pub fn project_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e))
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        files.push(rel.to_path_buf());
    }
    Ok(files)
}

/// At most `limit` project files as `/`-separated strings, plus the total count.
pub fn list_project_files(root: &Path, limit: usize) -> Result<(Vec<String>, usize)> {
    let files = project_files(root)?;
    let total = files.len();
    let listed = files
        .iter()
        .take(limit)
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    Ok((listed, total))
}
