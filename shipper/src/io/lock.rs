//! One execution at a time per project.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

/// Another process holds the project lock.
#[derive(Debug, Error)]
#[error(
    "project is busy: lock {} is held ({holder}); remove it if no shipper run is active",
    path.display()
)]
pub struct ProjectBusy {
    pub path: PathBuf,
    pub holder: String,
}

/// Exclusive lock file. Removed when dropped.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    /// Create the lock file or fail with [`ProjectBusy`] when it already exists.
    ///
    /// A lock whose recorded pid is known to be dead is left over from a
    /// crashed run; it is removed and the lock taken once more.
    pub fn acquire(path: &Path, execution_id: &str) -> Result<Self> {
        match Self::try_create(path, execution_id)? {
            Some(lock) => Ok(lock),
            None => {
                let holder = read_holder(path);
                if !holder_is_dead(&holder) {
                    return Err(busy(path, holder));
                }
                warn!(lock = %path.display(), %holder, "removing stale project lock");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("remove stale lock {}", path.display()));
                    }
                }
                Self::try_create(path, execution_id)?
                    .ok_or_else(|| busy(path, read_holder(path)))
            }
        }
    }

    /// `None` when the lock file already exists.
    fn try_create(path: &Path, execution_id: &str) -> Result<Option<Self>> {
        let mut file = match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", path.display()));
            }
        };
        let lock = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "{execution_id} pid={}", std::process::id())
            .with_context(|| format!("write lock {}", path.display()))?;
        debug!(lock = %path.display(), "project lock acquired");
        Ok(Some(lock))
    }
}

fn busy(path: &Path, holder: String) -> anyhow::Error {
    ProjectBusy {
        path: path.to_path_buf(),
        holder,
    }
    .into()
}

fn read_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// True only when the holder names a pid and the process table shows it gone.
/// Without `/proc` liveness cannot be decided and the holder counts as alive.
fn holder_is_dead(holder: &str) -> bool {
    let Some(pid) = holder
        .split_whitespace()
        .find_map(|field| field.strip_prefix("pid="))
        .and_then(|pid| pid.parse::<u32>().ok())
    else {
        return false;
    };
    let proc_root = Path::new("/proc");
    proc_root.is_dir() && !proc_root.join(pid.to_string()).exists()
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), "failed to release project lock: {err}");
        }
    }
}
