//! Immutable constraint engine gating negotiation output and protocol actions.
//!
//! The rule set is built once from [`ConstraintLimits`] and never changes for
//! the lifetime of the engine; every check is a pure function of the action
//! and the [`ConstraintContext`] handed in by the caller.

use std::path::{Component, Path};

use serde_json::{Value, json};
use thiserror::Error;

use crate::core::types::{ConstraintViolation, StepId, StepStatus, ViolationKind};

/// Tunable bounds that parameterize the built-in rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintLimits {
    pub max_tasks: usize,
    pub max_content_chars: usize,
    pub max_content_lines: usize,
    /// Extra path prefixes that tasks may never touch.
    pub protected_paths: Vec<String>,
}

impl Default for ConstraintLimits {
    fn default() -> Self {
        Self {
            max_tasks: 3,
            max_content_chars: 2000,
            max_content_lines: 120,
            protected_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Output,
    Filesystem,
    Conduct,
    /// Checked by the executor only; never rendered into prompts.
    Process,
}

impl Category {
    fn heading(self) -> &'static str {
        match self {
            Category::Output => "Output",
            Category::Filesystem => "Filesystem",
            Category::Conduct => "Conduct",
            Category::Process => "Process",
        }
    }
}

/// Declaration order is prompt order within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

/// Predicate evaluated against an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Mutating and publishing steps need a successful `snapshot_before`.
    SnapshotBeforeMutation,
    /// `action` requires `step` to have succeeded earlier in the execution.
    RequiresStep { action: &'static str, step: StepId },
    NonEmptyTaskList,
    MaxTasks(usize),
    ContentBounds { max_chars: usize, max_lines: usize },
    RelativePath,
    ProtectedPaths(Vec<String>),
    /// Prompt-only guidance; never violated by an action.
    Guidance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub id: &'static str,
    pub category: Category,
    pub text: String,
    pub rule: Rule,
    pub severity: Severity,
    pub fatal: bool,
}

/// Something the negotiator or executor is about to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    SubmitTasks { count: usize },
    ProposeContent { filename: &'a str, content: &'a str },
    WriteFile { path: &'a str },
    DeleteFile { path: &'a str },
    ExecuteTasks,
    Commit,
    Push,
    CreateRelease,
    MarkDone,
}

impl Action<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SubmitTasks { .. } => "submit_tasks",
            Action::ProposeContent { .. } => "propose_content",
            Action::WriteFile { .. } => "write_file",
            Action::DeleteFile { .. } => "delete_file",
            Action::ExecuteTasks => "execute_tasks",
            Action::Commit => "commit",
            Action::Push => "push",
            Action::CreateRelease => "create_release",
            Action::MarkDone => "mark_done",
        }
    }

    fn is_guarded_by_snapshot(&self) -> bool {
        matches!(
            self,
            Action::ExecuteTasks | Action::Commit | Action::Push | Action::CreateRelease
        )
    }

    fn path(&self) -> Option<&str> {
        match self {
            Action::WriteFile { path } | Action::DeleteFile { path } => Some(path),
            _ => None,
        }
    }

    fn snapshot(&self) -> Value {
        match self {
            Action::SubmitTasks { count } => json!({ "action": self.name(), "count": count }),
            Action::ProposeContent { filename, content } => json!({
                "action": self.name(),
                "filename": filename,
                "chars": content.chars().count(),
                "lines": content.lines().count(),
            }),
            Action::WriteFile { path } | Action::DeleteFile { path } => {
                json!({ "action": self.name(), "path": path })
            }
            _ => json!({ "action": self.name() }),
        }
    }
}

/// Execution state visible to the engine when an action is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintContext {
    pub project: String,
    pub execution_id: Option<String>,
    pub steps: Vec<(StepId, StepStatus)>,
    pub snapshot_before_id: Option<String>,
}

impl ConstraintContext {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    pub fn status(&self, step: StepId) -> StepStatus {
        self.steps
            .iter()
            .find(|(id, _)| *id == step)
            .map_or(StepStatus::Pending, |(_, status)| *status)
    }

    fn snapshot(&self) -> Value {
        let steps: serde_json::Map<String, Value> = self
            .steps
            .iter()
            .map(|(id, status)| (id.as_str().to_string(), json!(status)))
            .collect();
        json!({
            "project": self.project,
            "execution_id": self.execution_id,
            "snapshot_before_id": self.snapshot_before_id,
            "steps": steps,
        })
    }
}

/// Raised by [`ConstraintEngine::check_before_action`] when a fatal rule breaks.
#[derive(Debug, Clone, Error)]
#[error("fatal constraint violation: {violation}")]
pub struct FatalViolation {
    pub violation: ConstraintViolation,
}

/// Read-only rule set shared by reference across negotiation and execution.
#[derive(Debug, Clone)]
pub struct ConstraintEngine {
    constraints: Vec<Constraint>,
    limits: ConstraintLimits,
}

impl ConstraintEngine {
    pub fn new(limits: ConstraintLimits) -> Self {
        let constraints = builtin_constraints(&limits);
        Self {
            constraints,
            limits,
        }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn limits(&self) -> &ConstraintLimits {
        &self.limits
    }

    /// Evaluate every rule against `action`, returning all violations (fatal or not).
    pub fn validate_action(
        &self,
        action: &Action<'_>,
        context: &ConstraintContext,
    ) -> Vec<ConstraintViolation> {
        self.constraints
            .iter()
            .filter_map(|constraint| {
                let message = evaluate(&constraint.rule, action, context)?;
                let kind = if constraint.fatal {
                    ViolationKind::FatalConstraintViolation
                } else {
                    kind_for_rule(&constraint.rule)
                };
                Some(ConstraintViolation::new(
                    constraint.id,
                    kind,
                    message,
                    json!({ "action": action.snapshot(), "state": context.snapshot() }),
                ))
            })
            .collect()
    }

    /// Gate a sensitive action. Fatal violations become an error; the rest are returned.
    pub fn check_before_action(
        &self,
        action: &Action<'_>,
        context: &ConstraintContext,
    ) -> Result<Vec<ConstraintViolation>, FatalViolation> {
        let violations = self.validate_action(action, context);
        if let Some(fatal) = violations
            .iter()
            .find(|v| v.kind == ViolationKind::FatalConstraintViolation)
        {
            return Err(FatalViolation {
                violation: fatal.clone(),
            });
        }
        Ok(violations)
    }

    /// Render the prompt-facing rules as text, grouped by category in a fixed
    /// order. Within a category the most severe rules come first.
    pub fn build_system_prompt(&self, context: &ConstraintContext) -> String {
        let mut visible: Vec<&Constraint> = self
            .constraints
            .iter()
            .filter(|c| c.category != Category::Process)
            .collect();
        visible.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.severity.cmp(&b.severity))
                .then_with(|| a.id.cmp(b.id))
        });

        let mut buf = String::new();
        if context.project.is_empty() {
            buf.push_str("You are changing a project under these constraints.\n");
        } else {
            buf.push_str(&format!(
                "You are changing project `{}` under these constraints.\n",
                context.project
            ));
        }
        let mut current: Option<Category> = None;
        for constraint in visible {
            if current != Some(constraint.category) {
                buf.push_str(&format!("\n## {}\n", constraint.category.heading()));
                current = Some(constraint.category);
            }
            buf.push_str(&format!("- [{}] {}\n", constraint.id, constraint.text));
        }
        buf
    }
}

fn builtin_constraints(limits: &ConstraintLimits) -> Vec<Constraint> {
    let mut protected = vec![".git".to_string(), ".shipper".to_string()];
    for path in &limits.protected_paths {
        let trimmed = path.trim().trim_end_matches('/').to_string();
        if !trimmed.is_empty() && !protected.contains(&trimmed) {
            protected.push(trimmed);
        }
    }
    let protected_list = protected
        .iter()
        .map(|p| format!("`{p}/`"))
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        Constraint {
            id: "process.snapshot_before_mutation",
            category: Category::Process,
            text: "A pre-mutation snapshot must complete before tasks run or anything is published."
                .to_string(),
            rule: Rule::SnapshotBeforeMutation,
            severity: Severity::Critical,
            fatal: true,
        },
        Constraint {
            id: "process.commit_before_push",
            category: Category::Process,
            text: "Push only after the release commit succeeded.".to_string(),
            rule: Rule::RequiresStep {
                action: "push",
                step: StepId::Commit,
            },
            severity: Severity::Critical,
            fatal: true,
        },
        Constraint {
            id: "process.push_before_release",
            category: Category::Process,
            text: "Create a release only after the push succeeded.".to_string(),
            rule: Rule::RequiresStep {
                action: "create_release",
                step: StepId::Push,
            },
            severity: Severity::Critical,
            fatal: true,
        },
        Constraint {
            id: "process.verified_before_done",
            category: Category::Process,
            text: "Mark a TODO done only after its release was verified.".to_string(),
            rule: Rule::RequiresStep {
                action: "mark_done",
                step: StepId::VerifyRelease,
            },
            severity: Severity::Critical,
            fatal: true,
        },
        Constraint {
            id: "output.json_only",
            category: Category::Output,
            text: "Reply with one JSON object of the form {\"tasks\": [...]} and nothing else."
                .to_string(),
            rule: Rule::Guidance,
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "output.task_fields",
            category: Category::Output,
            text: "Every task has `id`, `type` (create_file, update_file or delete_file), \
                   `description` and `filename`; create and update tasks also carry the full \
                   file `content`."
                .to_string(),
            rule: Rule::Guidance,
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "output.non_empty",
            category: Category::Output,
            text: "Return at least one task.".to_string(),
            rule: Rule::NonEmptyTaskList,
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "output.max_tasks",
            category: Category::Output,
            text: format!("Return at most {} tasks.", limits.max_tasks),
            rule: Rule::MaxTasks(limits.max_tasks),
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "output.content_bounds",
            category: Category::Output,
            text: format!(
                "Keep each file under {} characters and {} lines.",
                limits.max_content_chars, limits.max_content_lines
            ),
            rule: Rule::ContentBounds {
                max_chars: limits.max_content_chars,
                max_lines: limits.max_content_lines,
            },
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "fs.relative_paths",
            category: Category::Filesystem,
            text: "Use project-relative filenames; never absolute paths or `..`.".to_string(),
            rule: Rule::RelativePath,
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "fs.protected_paths",
            category: Category::Filesystem,
            text: format!("Never touch {protected_list}."),
            rule: Rule::ProtectedPaths(protected),
            severity: Severity::Error,
            fatal: false,
        },
        Constraint {
            id: "conduct.no_dodge",
            category: Category::Conduct,
            text: "Do not apologise, refuse or defer the work; always deliver concrete file changes."
                .to_string(),
            rule: Rule::Guidance,
            severity: Severity::Warning,
            fatal: false,
        },
    ]
}

fn kind_for_rule(rule: &Rule) -> ViolationKind {
    match rule {
        Rule::NonEmptyTaskList => ViolationKind::NoTasks,
        Rule::MaxTasks(_) => ViolationKind::TooManyTasks,
        Rule::ContentBounds { .. } => ViolationKind::Truncation,
        _ => ViolationKind::ConstraintViolation,
    }
}

/// Return a message when `rule` is broken by `action`.
fn evaluate(rule: &Rule, action: &Action<'_>, context: &ConstraintContext) -> Option<String> {
    match rule {
        Rule::SnapshotBeforeMutation => {
            if !action.is_guarded_by_snapshot() {
                return None;
            }
            let status = context.status(StepId::SnapshotBefore);
            if status == StepStatus::Success && context.snapshot_before_id.is_some() {
                return None;
            }
            Some(format!(
                "{} attempted without a completed snapshot_before (status {:?})",
                action.name(),
                status
            ))
        }
        Rule::RequiresStep {
            action: name,
            step,
        } => {
            if action.name() != *name || context.status(*step) == StepStatus::Success {
                return None;
            }
            Some(format!(
                "{} attempted before {} succeeded (status {:?})",
                name,
                step,
                context.status(*step)
            ))
        }
        Rule::NonEmptyTaskList => match action {
            Action::SubmitTasks { count: 0 } => Some("response contains no tasks".to_string()),
            _ => None,
        },
        Rule::MaxTasks(max) => match action {
            Action::SubmitTasks { count } if count > max => Some(format!(
                "response contains {count} tasks but at most {max} are allowed"
            )),
            _ => None,
        },
        Rule::ContentBounds {
            max_chars,
            max_lines,
        } => match action {
            Action::ProposeContent { filename, content } => {
                let chars = content.chars().count();
                let lines = content.lines().count();
                if chars > *max_chars {
                    Some(format!(
                        "content for {filename} has {chars} characters (limit {max_chars})"
                    ))
                } else if lines > *max_lines {
                    Some(format!(
                        "content for {filename} has {lines} lines (limit {max_lines})"
                    ))
                } else {
                    None
                }
            }
            _ => None,
        },
        Rule::RelativePath => {
            let path = action.path()?;
            relative_path_error(path)
        }
        Rule::ProtectedPaths(prefixes) => {
            let path = action.path()?;
            let hit = prefixes.iter().find(|prefix| under_prefix(path, prefix))?;
            Some(format!("{path} is inside protected path {hit}/"))
        }
        Rule::Guidance => None,
    }
}

fn relative_path_error(path: &str) -> Option<String> {
    if path.trim().is_empty() {
        return Some("empty filename".to_string());
    }
    let looks_like_drive = path.len() >= 2 && path.as_bytes()[1] == b':';
    if path.starts_with('/') || path.starts_with('\\') || looks_like_drive {
        return Some(format!("{path} is absolute"));
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
        || path.split(['/', '\\']).any(|part| part == "..")
    {
        return Some(format!("{path} escapes the project root"));
    }
    None
}

/// True if the first components of `path` equal those of `prefix`.
fn under_prefix(path: &str, prefix: &str) -> bool {
    let path_parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let prefix_parts: Vec<&str> = prefix
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    !prefix_parts.is_empty()
        && path_parts.len() >= prefix_parts.len()
        && path_parts[..prefix_parts.len()] == prefix_parts[..]
}
