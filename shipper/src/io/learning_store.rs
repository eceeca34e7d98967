//! Per-project memory of negotiation failures and their solutions.
//!
//! Records are keyed by `(project, signature)`; repeated failures with the same
//! signature bump a counter on one record. Each project lives in its own file
//! under `.shipper/learning/`, rewritten atomically after every mutation.
//! Records are never deleted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::signature::{derive_signature, normalize_message, signature_prefix};
use crate::core::types::{Complexity, ViolationKind};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    Unresolved,
    Learned,
    Dodge,
    Resolved,
}

/// Circumstances of the most recent occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub retry_index: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedError {
    pub project: String,
    pub signature: String,
    pub error_type: String,
    pub normalized_message: String,
    pub occurrences: u64,
    pub first_seen: String,
    pub last_seen: String,
    pub last_context: ErrorContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    pub status: ErrorStatus,
}

impl LearnedError {
    /// True when a solution exists and the error is not marked fixed.
    pub fn has_solution(&self) -> bool {
        self.solution.is_some() && matches!(self.status, ErrorStatus::Learned | ErrorStatus::Dodge)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectFile {
    project: String,
    errors: Vec<LearnedError>,
}

/// Learning records for every project under one directory.
///
/// Constructed once per process and passed by reference.
#[derive(Debug)]
pub struct LearningStore {
    dir: PathBuf,
    projects: BTreeMap<String, BTreeMap<String, LearnedError>>,
}

impl LearningStore {
    /// Load every project file in `dir`. A missing directory is an empty store.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<Self> {
        let mut projects = BTreeMap::new();
        if dir.is_dir() {
            let mut paths: Vec<PathBuf> = fs::read_dir(dir)
                .with_context(|| format!("read learning dir {}", dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect();
            paths.sort();
            for path in paths {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("read learning file {}", path.display()))?;
                let file: ProjectFile = serde_json::from_str(&contents)
                    .with_context(|| format!("parse learning file {}", path.display()))?;
                let records: BTreeMap<String, LearnedError> = file
                    .errors
                    .into_iter()
                    .map(|e| (e.signature.clone(), e))
                    .collect();
                projects.insert(file.project, records);
            }
        }
        debug!(projects = projects.len(), "learning store loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            projects,
        })
    }

    /// Record an occurrence of an error and return its signature.
    ///
    /// Upserts the `(project, signature)` record: the counter increments, the
    /// context is replaced, and `solution` overwrites the stored one when given.
    #[instrument(skip_all, fields(project, error_type))]
    pub fn learn_from_error(
        &mut self,
        project: &str,
        error_type: &str,
        message: &str,
        context: ErrorContext,
        solution: Option<&str>,
    ) -> Result<String> {
        let signature = derive_signature(error_type, message);
        let now = Utc::now().to_rfc3339();
        let records = self.projects.entry(project.to_string()).or_default();
        let record = records
            .entry(signature.clone())
            .or_insert_with(|| LearnedError {
                project: project.to_string(),
                signature: signature.clone(),
                error_type: error_type.to_string(),
                normalized_message: normalize_message(message),
                occurrences: 0,
                first_seen: now.clone(),
                last_seen: now.clone(),
                last_context: ErrorContext::default(),
                solution: None,
                status: ErrorStatus::Unresolved,
            });
        record.occurrences += 1;
        record.last_seen = now;
        record.last_context = context;
        if let Some(solution) = solution.map(str::trim).filter(|s| !s.is_empty()) {
            record.solution = Some(solution.to_string());
        }
        record.status = match (&record.solution, error_type == ViolationKind::Dodge.as_str()) {
            (None, _) => ErrorStatus::Unresolved,
            (Some(_), true) => ErrorStatus::Dodge,
            (Some(_), false) => ErrorStatus::Learned,
        };
        debug!(
            signature = %signature,
            occurrences = record.occurrences,
            status = ?record.status,
            "error learned"
        );
        self.persist(project)?;
        Ok(signature)
    }

    /// Records of `project` whose signature belongs to `error_type`, most frequent first.
    pub fn get_similar_errors(&self, project: &str, error_type: &str) -> Vec<&LearnedError> {
        let prefix = signature_prefix(error_type);
        let mut similar: Vec<&LearnedError> = self
            .errors(project)
            .into_iter()
            .filter(|e| e.signature.starts_with(&prefix))
            .collect();
        similar.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        similar
    }

    pub fn has_learned_solution(&self, project: &str, signature: &str) -> bool {
        self.get(project, signature)
            .is_some_and(LearnedError::has_solution)
    }

    /// Solution text to inject into the next prompt, if one is learned.
    pub fn get_error_context_for_retry(&self, project: &str, signature: &str) -> Option<&str> {
        self.get(project, signature)
            .filter(|e| e.has_solution())
            .and_then(|e| e.solution.as_deref())
    }

    /// Mark a record fixed. Returns `false` when no such record exists.
    #[instrument(skip_all, fields(project, signature))]
    pub fn resolve_error_as_bugfix(&mut self, project: &str, signature: &str) -> Result<bool> {
        let Some(record) = self
            .projects
            .get_mut(project)
            .and_then(|records| records.get_mut(signature))
        else {
            return Ok(false);
        };
        record.status = ErrorStatus::Resolved;
        record.last_seen = Utc::now().to_rfc3339();
        info!("error marked resolved");
        self.persist(project)?;
        Ok(true)
    }

    /// Learned solutions for failures seen before on instructions of the same
    /// complexity, most frequent first.
    pub fn predicted_solutions(
        &self,
        project: &str,
        complexity: Complexity,
        limit: usize,
    ) -> Vec<&LearnedError> {
        let mut predicted: Vec<&LearnedError> = self
            .errors(project)
            .into_iter()
            .filter(|e| e.has_solution() && e.last_context.complexity == Some(complexity))
            .collect();
        predicted.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        predicted.truncate(limit);
        predicted
    }

    pub fn get(&self, project: &str, signature: &str) -> Option<&LearnedError> {
        self.projects.get(project)?.get(signature)
    }

    /// Every record for `project`, ordered by signature.
    pub fn errors(&self, project: &str) -> Vec<&LearnedError> {
        self.projects
            .get(project)
            .map(|records| records.values().collect())
            .unwrap_or_default()
    }

    fn project_path(&self, project: &str) -> PathBuf {
        let file: String = project
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file.trim_start_matches('.')))
    }

    fn persist(&self, project: &str) -> Result<()> {
        let file = ProjectFile {
            project: project.to_string(),
            errors: self.errors(project).into_iter().cloned().collect(),
        };
        write_json_atomic(&self.project_path(project), &file)
    }
}
