//! TODO list storage (`.shipper/todos.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ExpectedTask;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub instruction: String,
    /// Expected task shapes, compared position by position during negotiation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<ExpectedTask>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_version: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// JSON-file backed TODO list. Every mutation rewrites the file atomically.
#[derive(Debug, Clone)]
pub struct TodoStore {
    path: PathBuf,
}

impl TodoStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All TODOs in insertion order. A missing file is an empty list.
    pub fn list(&self) -> Result<Vec<TodoItem>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read todos {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse todos {}", self.path.display()))
    }

    pub fn get(&self, id: &str) -> Result<Option<TodoItem>> {
        Ok(self.list()?.into_iter().find(|todo| todo.id == id))
    }

    pub fn add(&self, instruction: &str, expect: Vec<ExpectedTask>) -> Result<TodoItem> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(anyhow!("instruction must not be empty"));
        }
        let mut todos = self.list()?;
        let next = todos
            .iter()
            .filter_map(|todo| todo.id.strip_prefix("todo-")?.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let todo = TodoItem {
            id: format!("todo-{next}"),
            instruction: instruction.to_string(),
            expect,
            done: false,
            released_version: None,
            created_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };
        todos.push(todo.clone());
        write_json_atomic(&self.path, &todos)?;
        debug!(id = %todo.id, "todo added");
        Ok(todo)
    }

    /// Mark `id` done with the version it shipped in.
    pub fn mark_done(&self, id: &str, version: &str) -> Result<TodoItem> {
        let mut todos = self.list()?;
        let todo = todos
            .iter_mut()
            .find(|todo| todo.id == id)
            .ok_or_else(|| anyhow!("unknown todo {id}"))?;
        todo.done = true;
        todo.released_version = Some(version.to_string());
        todo.completed_at = Some(Utc::now().to_rfc3339());
        let updated = todo.clone();
        write_json_atomic(&self.path, &todos)?;
        debug!(id, version, "todo marked done");
        Ok(updated)
    }
}
