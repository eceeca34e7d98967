//! Validation of a raw completion response into an accepted task list.
//!
//! The first broken rule wins: a response either yields its full task list or
//! exactly one violation. Task lists are never trimmed to an accepted subset.
//! Destinations are checked here too, so path violations are learned and
//! retried like any other miss.

use serde_json::json;

use crate::core::adapter::{AdaptError, adapt_task, check_envelope, extract_tasks};
use crate::core::constraints::{Action, ConstraintContext, ConstraintEngine};
use crate::core::dodge::detect_dodge;
use crate::core::types::{ConstraintViolation, ExpectedTask, TaskSpec, ViolationKind};

const JSON_ONLY: &str = "output.json_only";
const TASK_FIELDS: &str = "output.task_fields";
const EXPECTED_TASKS: &str = "output.expected_tasks";
const NO_DODGE: &str = "conduct.no_dodge";

const EXCERPT_CHARS: usize = 200;

/// Parse and check `raw`, returning canonical tasks or the first violation.
pub fn validate_response(
    raw: &str,
    expected: &[ExpectedTask],
    engine: &ConstraintEngine,
    context: &ConstraintContext,
) -> Result<Vec<TaskSpec>, ConstraintViolation> {
    let raw_tasks = match extract_tasks(raw) {
        Ok(tasks) => tasks,
        Err(err) => return Err(unparsable(raw, &err)),
    };

    let count_check = engine.validate_action(
        &Action::SubmitTasks {
            count: raw_tasks.len(),
        },
        context,
    );
    if let Some(violation) = count_check.into_iter().next() {
        return Err(violation);
    }

    if let Err(err) = check_envelope(&raw_tasks) {
        return Err(ConstraintViolation::new(
            TASK_FIELDS,
            ViolationKind::Malformed,
            err.to_string(),
            json!({ "tasks": raw_tasks.len() }),
        ));
    }

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (index, raw_task) in raw_tasks.iter().enumerate() {
        let task = adapt_task(index, raw_task).map_err(|err| {
            ConstraintViolation::new(
                TASK_FIELDS,
                ViolationKind::Malformed,
                err.to_string(),
                json!({ "task": raw_task }),
            )
        })?;
        tasks.push(task);
    }

    if let Some(violation) = check_expected(expected, &tasks) {
        return Err(violation);
    }

    for (index, task) in tasks.iter().enumerate() {
        if let Some(violation) = task_dodge(index, task) {
            return Err(violation);
        }
        if let Some(content) = task.content() {
            let action = Action::ProposeContent {
                filename: task.filename(),
                content,
            };
            if let Some(violation) = engine.validate_action(&action, context).into_iter().next() {
                return Err(violation);
            }
        }
    }

    if let Some(violation) = check_task_paths(&tasks, engine, context).into_iter().next() {
        return Err(violation);
    }

    Ok(tasks)
}

/// Check each task's destination against the filesystem rules.
pub fn check_task_paths(
    tasks: &[TaskSpec],
    engine: &ConstraintEngine,
    context: &ConstraintContext,
) -> Vec<ConstraintViolation> {
    tasks
        .iter()
        .flat_map(|task| {
            let action = match task {
                TaskSpec::DeleteFile { filename, .. } => Action::DeleteFile { path: filename },
                _ => Action::WriteFile {
                    path: task.filename(),
                },
            };
            engine.validate_action(&action, context)
        })
        .collect()
}

fn unparsable(raw: &str, err: &AdaptError) -> ConstraintViolation {
    let excerpt: String = raw.trim().chars().take(EXCERPT_CHARS).collect();
    if let Some(hit) = detect_dodge(raw) {
        return ConstraintViolation::new(
            NO_DODGE,
            ViolationKind::Dodge,
            format!("response evades the task ({}: \"{}\")", hit.label, hit.phrase),
            json!({ "excerpt": excerpt }),
        );
    }
    ConstraintViolation::new(
        JSON_ONLY,
        ViolationKind::Malformed,
        err.to_string(),
        json!({ "excerpt": excerpt }),
    )
}

fn task_dodge(index: usize, task: &TaskSpec) -> Option<ConstraintViolation> {
    let hit = detect_dodge(task.description())
        .or_else(|| task.content().and_then(detect_dodge))?;
    Some(ConstraintViolation::new(
        NO_DODGE,
        ViolationKind::Dodge,
        format!(
            "task {} (index {index}) evades the work ({}: \"{}\")",
            index + 1,
            hit.label,
            hit.phrase
        ),
        json!({ "task_id": task.id(), "filename": task.filename() }),
    ))
}

/// Compare tasks position by position and report the first divergence.
fn check_expected(expected: &[ExpectedTask], tasks: &[TaskSpec]) -> Option<ConstraintViolation> {
    if expected.is_empty() {
        return None;
    }
    let positions = expected.len().max(tasks.len());
    let (index, detail) = (0..positions).find_map(|index| {
        let detail = match (expected.get(index), tasks.get(index)) {
            (Some(want), Some(got)) => field_divergence(want, got)?,
            (Some(want), None) => format!("is missing; expected {}", describe_expected(want)),
            (None, Some(got)) => format!(
                "was not expected ({} {})",
                got.task_type(),
                got.filename()
            ),
            (None, None) => return None,
        };
        Some((index, detail))
    })?;
    Some(ConstraintViolation::new(
        EXPECTED_TASKS,
        ViolationKind::TaskMismatch,
        format!("task {} (index {index}) {detail}", index + 1),
        json!({
            "index": index,
            "expected": expected,
            "actual": tasks
                .iter()
                .map(|t| json!({ "id": t.id(), "type": t.task_type(), "filename": t.filename() }))
                .collect::<Vec<_>>(),
        }),
    ))
}

fn field_divergence(want: &ExpectedTask, got: &TaskSpec) -> Option<String> {
    if let Some(id) = want.id.as_deref() {
        if id != got.id() {
            return Some(format!("has id `{}`, expected `{id}`", got.id()));
        }
    }
    if let Some(task_type) = want.task_type {
        if task_type != got.task_type() {
            return Some(format!(
                "has type {}, expected {task_type}",
                got.task_type()
            ));
        }
    }
    if let Some(filename) = want.filename.as_deref() {
        if filename != got.filename() {
            return Some(format!(
                "targets {}, expected {filename}",
                got.filename()
            ));
        }
    }
    None
}

fn describe_expected(want: &ExpectedTask) -> String {
    let kind = want.task_type.map_or("any", |t| t.as_str());
    let file = want.filename.as_deref().unwrap_or("any file");
    format!("{kind} {file}")
}
