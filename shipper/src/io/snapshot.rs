//! Point-in-time copies of the work tree for manual rollback.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::write_json_atomic;
use crate::io::workspace::project_files;

/// Storage collaborator for pre- and post-mutation snapshots.
pub trait SnapshotStore {
    fn create_snapshot(&self, project: &str, label: &str) -> Result<String>;
    /// Restore `snapshot_id`; `false` when no such snapshot exists for `project`.
    fn rollback(&self, project: &str, snapshot_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotManifest {
    id: String,
    project: String,
    label: String,
    created_at: String,
    files: Vec<String>,
}

/// Copies the work tree (minus `.git`, `.shipper` and `target`) into `.shipper/snapshots/<id>/files/`.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
    snapshots_dir: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>, snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshots_dir: snapshots_dir.into(),
        }
    }

    fn manifest_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir.join(snapshot_id).join("manifest.json")
    }

    fn files_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir.join(snapshot_id).join("files")
    }

    fn allocate_id(&self, label: &str) -> String {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let base = format!("snap-{stamp}-{}", sanitize(label));
        let mut id = base.clone();
        let mut n = 1;
        while self.snapshots_dir.join(&id).exists() {
            n += 1;
            id = format!("{base}-{n}");
        }
        id
    }
}

impl SnapshotStore for FsSnapshotStore {
    #[instrument(skip_all, fields(project, label))]
    fn create_snapshot(&self, project: &str, label: &str) -> Result<String> {
        let id = self.allocate_id(label);
        let files_dir = self.files_dir(&id);
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("create snapshot dir {}", files_dir.display()))?;

        let files = project_files(&self.root)?;
        for rel in &files {
            copy_file(&self.root.join(rel), &files_dir.join(rel))?;
        }
        let manifest = SnapshotManifest {
            id: id.clone(),
            project: project.to_string(),
            label: label.to_string(),
            created_at: Utc::now().to_rfc3339(),
            files: files.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
        };
        write_json_atomic(&self.manifest_path(&id), &manifest)?;
        info!(snapshot = %id, files = files.len(), "snapshot created");
        Ok(id)
    }

    #[instrument(skip_all, fields(project, snapshot_id))]
    fn rollback(&self, project: &str, snapshot_id: &str) -> Result<bool> {
        if snapshot_id.contains(['/', '\\']) || snapshot_id.starts_with('.') {
            return Err(anyhow!("invalid snapshot id `{snapshot_id}`"));
        }
        let manifest_path = self.manifest_path(snapshot_id);
        if !manifest_path.is_file() {
            warn!("snapshot not found");
            return Ok(false);
        }
        let contents = fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()))?;
        let manifest: SnapshotManifest = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", manifest_path.display()))?;
        if manifest.project != project {
            warn!(owner = %manifest.project, "snapshot belongs to another project");
            return Ok(false);
        }

        let keep: BTreeSet<PathBuf> = manifest.files.iter().map(PathBuf::from).collect();
        for rel in project_files(&self.root)? {
            if !keep.contains(&rel) {
                let path = self.root.join(&rel);
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                debug!(path = %rel.display(), "removed file absent from snapshot");
            }
        }
        let files_dir = self.files_dir(snapshot_id);
        for rel in &keep {
            copy_file(&files_dir.join(rel), &self.root.join(rel))?;
        }
        info!(files = keep.len(), "snapshot restored");
        Ok(true)
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::copy(from, to).with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
