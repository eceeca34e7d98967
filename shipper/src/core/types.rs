//! Shared deterministic types for the negotiation and protocol core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File operation kinds a completion response may propose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CreateFile,
    UpdateFile,
    DeleteFile,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::CreateFile => "create_file",
            TaskType::UpdateFile => "update_file",
            TaskType::DeleteFile => "delete_file",
        }
    }

    /// Parse a task type, accepting the short verbs some completions emit.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "create_file" | "create" | "new_file" => Some(TaskType::CreateFile),
            "update_file" | "update" | "modify" | "edit" => Some(TaskType::UpdateFile),
            "delete_file" | "delete" | "remove" => Some(TaskType::DeleteFile),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical task, produced from raw completion output by [`crate::core::adapter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    CreateFile {
        id: String,
        description: String,
        filename: String,
        content: String,
    },
    UpdateFile {
        id: String,
        description: String,
        filename: String,
        content: String,
    },
    DeleteFile {
        id: String,
        description: String,
        filename: String,
    },
}

impl TaskSpec {
    pub fn id(&self) -> &str {
        match self {
            TaskSpec::CreateFile { id, .. }
            | TaskSpec::UpdateFile { id, .. }
            | TaskSpec::DeleteFile { id, .. } => id,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskSpec::CreateFile { .. } => TaskType::CreateFile,
            TaskSpec::UpdateFile { .. } => TaskType::UpdateFile,
            TaskSpec::DeleteFile { .. } => TaskType::DeleteFile,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            TaskSpec::CreateFile { description, .. }
            | TaskSpec::UpdateFile { description, .. }
            | TaskSpec::DeleteFile { description, .. } => description,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            TaskSpec::CreateFile { filename, .. }
            | TaskSpec::UpdateFile { filename, .. }
            | TaskSpec::DeleteFile { filename, .. } => filename,
        }
    }

    /// File body for mutating tasks; `None` for deletions.
    pub fn content(&self) -> Option<&str> {
        match self {
            TaskSpec::CreateFile { content, .. } | TaskSpec::UpdateFile { content, .. } => {
                Some(content)
            }
            TaskSpec::DeleteFile { .. } => None,
        }
    }
}

/// Expected shape of one task, recorded on a TODO ahead of negotiation.
///
/// Unset fields are not compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ExpectedTask {
    /// Parse the CLI form `<type>:<filename>` (either side may be empty).
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, filename) = raw.split_once(':')?;
        let task_type = if kind.trim().is_empty() {
            None
        } else {
            Some(TaskType::parse(kind)?)
        };
        let filename = Some(filename.trim().to_string()).filter(|f| !f.is_empty());
        if task_type.is_none() && filename.is_none() {
            return None;
        }
        Some(Self {
            id: None,
            task_type,
            filename,
        })
    }
}

/// Failure classes surfaced by negotiation and the constraint engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NoTasks,
    TooManyTasks,
    TaskMismatch,
    Malformed,
    Truncation,
    Dodge,
    /// Completion call exceeded its time budget.
    Timeout,
    /// Completion backend failed before producing text.
    CompletionFailed,
    /// Non-fatal policy breach (paths, protected files).
    ConstraintViolation,
    FatalConstraintViolation,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::NoTasks => "no_tasks",
            ViolationKind::TooManyTasks => "too_many_tasks",
            ViolationKind::TaskMismatch => "task_mismatch",
            ViolationKind::Malformed => "malformed",
            ViolationKind::Truncation => "truncation",
            ViolationKind::Dodge => "dodge",
            ViolationKind::Timeout => "timeout",
            ViolationKind::CompletionFailed => "completion_failed",
            ViolationKind::ConstraintViolation => "constraint_violation",
            ViolationKind::FatalConstraintViolation => "fatal_constraint_violation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            ViolationKind::NoTasks,
            ViolationKind::TooManyTasks,
            ViolationKind::TaskMismatch,
            ViolationKind::Malformed,
            ViolationKind::Truncation,
            ViolationKind::Dodge,
            ViolationKind::Timeout,
            ViolationKind::CompletionFailed,
            ViolationKind::ConstraintViolation,
            ViolationKind::FatalConstraintViolation,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broken rule, with the action and state observed when it was checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub constraint_id: String,
    pub kind: ViolationKind,
    pub message: String,
    pub context: Value,
}

impl ConstraintViolation {
    pub fn new(
        constraint_id: impl Into<String>,
        kind: ViolationKind,
        message: impl Into<String>,
        context: Value,
    ) -> Self {
        Self {
            constraint_id: constraint_id.into(),
            kind,
            message: message.into(),
            context,
        }
    }
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.kind, self.constraint_id, self.message)
    }
}

/// Structural class of an instruction, used to shape prompts and predict failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Complex,
    Ambiguous,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Complex => "complex",
            Complexity::Ambiguous => "ambiguous",
        }
    }
}

/// The fixed protocol steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    FetchRemoteVersion,
    CalculateNextVersion,
    SnapshotBefore,
    BuildContext,
    CallCompletionService,
    ValidateResponse,
    ExecuteTasks,
    SnapshotAfter,
    Commit,
    Push,
    CreateRelease,
    VerifyRelease,
    MarkDone,
}

impl StepId {
    pub const ALL: [StepId; 13] = [
        StepId::FetchRemoteVersion,
        StepId::CalculateNextVersion,
        StepId::SnapshotBefore,
        StepId::BuildContext,
        StepId::CallCompletionService,
        StepId::ValidateResponse,
        StepId::ExecuteTasks,
        StepId::SnapshotAfter,
        StepId::Commit,
        StepId::Push,
        StepId::CreateRelease,
        StepId::VerifyRelease,
        StepId::MarkDone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::FetchRemoteVersion => "fetch_remote_version",
            StepId::CalculateNextVersion => "calculate_next_version",
            StepId::SnapshotBefore => "snapshot_before",
            StepId::BuildContext => "build_context",
            StepId::CallCompletionService => "call_completion_service",
            StepId::ValidateResponse => "validate_response",
            StepId::ExecuteTasks => "execute_tasks",
            StepId::SnapshotAfter => "snapshot_after",
            StepId::Commit => "commit",
            StepId::Push => "push",
            StepId::CreateRelease => "create_release",
            StepId::VerifyRelease => "verify_release",
            StepId::MarkDone => "mark_done",
        }
    }

    /// 1-based position in the fixed sequence.
    pub fn number(self) -> u8 {
        Self::ALL
            .iter()
            .position(|step| *step == self)
            .map_or(0, |idx| idx as u8 + 1)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_spec_serializes_with_type_tag() {
        let task = TaskSpec::CreateFile {
            id: "t1".to_string(),
            description: "add readme".to_string(),
            filename: "README.md".to_string(),
            content: "hi\n".to_string(),
        };
        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(value["type"], "create_file");
        assert_eq!(value["filename"], "README.md");
    }

    #[test]
    fn task_type_parse_accepts_short_verbs() {
        assert_eq!(TaskType::parse("create"), Some(TaskType::CreateFile));
        assert_eq!(TaskType::parse("Update-File"), Some(TaskType::UpdateFile));
        assert_eq!(TaskType::parse("remove"), Some(TaskType::DeleteFile));
        assert_eq!(TaskType::parse("rename_file"), None);
    }

    #[test]
    fn expected_task_parses_cli_form() {
        let expected = ExpectedTask::parse("create_file:src/lib.rs").expect("parse");
        assert_eq!(expected.task_type, Some(TaskType::CreateFile));
        assert_eq!(expected.filename.as_deref(), Some("src/lib.rs"));
        assert_eq!(
            ExpectedTask::parse(":docs/a.md").and_then(|e| e.filename),
            Some("docs/a.md".to_string())
        );
        assert!(ExpectedTask::parse("nonsense").is_none());
        assert!(ExpectedTask::parse("bogus:file.rs").is_none());
    }

    #[test]
    fn step_numbers_follow_fixed_order() {
        assert_eq!(StepId::FetchRemoteVersion.number(), 1);
        assert_eq!(StepId::CallCompletionService.number(), 5);
        assert_eq!(StepId::MarkDone.number(), 13);
    }

    #[test]
    fn violation_kind_names_round_trip() {
        for kind in [ViolationKind::NoTasks, ViolationKind::FatalConstraintViolation] {
            assert_eq!(ViolationKind::parse(kind.as_str()), Some(kind));
        }
        let json = serde_json::to_string(&ViolationKind::TooManyTasks).expect("json");
        assert_eq!(json, "\"too_many_tasks\"");
    }
}
