//! Boundary adapter from raw completion text to canonical [`TaskSpec`] values.
//!
//! Completions name the same field several ways (`filename`, `file_path`,
//! `file`; `content`, `code`, `html`) and often wrap JSON in prose or code
//! fences. Everything past this module sees one shape.

use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::types::{TaskSpec, TaskType};

const TASK_ENVELOPE_SCHEMA: &str = include_str!("../../schemas/task_envelope.schema.json");

const ID_FIELDS: &[&str] = &["id", "task_id"];
const TYPE_FIELDS: &[&str] = &["type", "action", "task_type"];
const DESCRIPTION_FIELDS: &[&str] = &["description", "desc", "summary"];
const FILENAME_FIELDS: &[&str] = &["filename", "file_path", "file", "path"];
const CONTENT_FIELDS: &[&str] = &["content", "code", "html", "body"];

static ENVELOPE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(TASK_ENVELOPE_SCHEMA).expect("task envelope schema should be JSON");
    jsonschema::validator_for(&schema).expect("task envelope schema should compile")
});

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z]*\s*\n(.*?)```").expect("fence pattern should be valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdaptError {
    #[error("response contains no parsable JSON")]
    NotJson,
    #[error("response does not match the task envelope: {0}")]
    Envelope(String),
    #[error("task {} (index {index}) is missing field `{field}`", .index + 1)]
    MissingField { index: usize, field: &'static str },
    #[error("task {} (index {index}) field `{field}` must be a string", .index + 1)]
    NotAString { index: usize, field: &'static str },
    #[error("task {} (index {index}) has unknown type `{value}`", .index + 1)]
    UnknownType { index: usize, value: String },
}

/// Locate the task envelope in `raw` and return its task list.
///
/// Accepts a bare JSON document, JSON inside a fenced block, or JSON embedded
/// in prose. A bare array is treated as the `tasks` list. Only the outer
/// shape is checked here; items are checked by [`check_envelope`] once the
/// caller has bounded the count.
pub fn extract_tasks(raw: &str) -> Result<Vec<Value>, AdaptError> {
    let value = parse_json_candidates(raw).ok_or(AdaptError::NotJson)?;
    let envelope = match value {
        Value::Array(items) => return Ok(items),
        Value::Object(mut map) => match map.remove("tasks") {
            Some(Value::Array(tasks)) => return Ok(tasks),
            Some(other) => {
                map.insert("tasks".to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    };
    Err(envelope_error(&envelope))
}

/// Check extracted tasks against the envelope schema.
pub fn check_envelope(tasks: &[Value]) -> Result<(), AdaptError> {
    let envelope = json!({ "tasks": tasks });
    if ENVELOPE_VALIDATOR.is_valid(&envelope) {
        return Ok(());
    }
    Err(envelope_error(&envelope))
}

fn envelope_error(envelope: &Value) -> AdaptError {
    let messages: Vec<String> = ENVELOPE_VALIDATOR
        .iter_errors(envelope)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return AdaptError::Envelope("expected an object with a `tasks` array".to_string());
    }
    AdaptError::Envelope(messages.join("; "))
}

/// Convert one raw task object into a canonical [`TaskSpec`].
pub fn adapt_task(index: usize, raw: &Value) -> Result<TaskSpec, AdaptError> {
    let Some(task) = raw.as_object() else {
        return Err(AdaptError::Envelope(format!(
            "task {} (index {index}) is not an object",
            index + 1
        )));
    };

    let id = required(task, index, "id", ID_FIELDS)?;
    let type_raw = required(task, index, "type", TYPE_FIELDS)?;
    let task_type = TaskType::parse(&type_raw).ok_or(AdaptError::UnknownType {
        index,
        value: type_raw.clone(),
    })?;
    let description = required(task, index, "description", DESCRIPTION_FIELDS)?;
    let filename = required(task, index, "filename", FILENAME_FIELDS)?;

    let spec = match task_type {
        TaskType::CreateFile => TaskSpec::CreateFile {
            id,
            description,
            filename,
            content: content(task, index)?,
        },
        TaskType::UpdateFile => TaskSpec::UpdateFile {
            id,
            description,
            filename,
            content: content(task, index)?,
        },
        TaskType::DeleteFile => TaskSpec::DeleteFile {
            id,
            description,
            filename,
        },
    };
    Ok(spec)
}

fn parse_json_candidates(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let fenced = FENCED
        .captures_iter(trimmed)
        .filter_map(|caps| caps.get(1))
        .find_map(|body| serde_json::from_str(body.as_str().trim()).ok());
    if fenced.is_some() {
        return fenced;
    }
    [('{', '}'), ('[', ']')]
        .into_iter()
        .find_map(|(open, close)| {
            let start = trimmed.find(open)?;
            let end = trimmed.rfind(close)?;
            if start >= end {
                return None;
            }
            serde_json::from_str(&trimmed[start..=end]).ok()
        })
}

fn lookup<'a>(task: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|key| task.get(*key))
        .filter(|value| !value.is_null())
}

fn required(
    task: &Map<String, Value>,
    index: usize,
    field: &'static str,
    aliases: &[&str],
) -> Result<String, AdaptError> {
    let value = lookup(task, aliases).ok_or(AdaptError::MissingField { index, field })?;
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if field == "id" => n.to_string(),
        _ => return Err(AdaptError::NotAString { index, field }),
    };
    if text.is_empty() {
        return Err(AdaptError::MissingField { index, field });
    }
    Ok(text)
}

fn content(task: &Map<String, Value>, index: usize) -> Result<String, AdaptError> {
    match lookup(task, CONTENT_FIELDS) {
        None => Err(AdaptError::MissingField {
            index,
            field: "content",
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(AdaptError::NotAString {
            index,
            field: "content",
        }),
    }
}
