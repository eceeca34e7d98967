//! Explicit retry state for one negotiation.
//!
//! `attempt` is the 0-based index of the completion call in flight; a
//! negotiation bounded by `max` retries makes at most `max + 1` calls.

use crate::core::constraints::ConstraintLimits;
use crate::core::types::{Complexity, ConstraintViolation, ViolationKind};

/// How the next prompt changes after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Ask for fewer or smaller tasks.
    NarrowScope,
    /// Repeat the violated bound explicitly.
    InjectBoundReminder,
    /// Present the instruction as separate sub-steps.
    Resplit,
}

impl RetryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryAction::NarrowScope => "narrow_scope",
            RetryAction::InjectBoundReminder => "inject_bound_reminder",
            RetryAction::Resplit => "resplit",
        }
    }

    /// Prompt text explaining what went wrong and what to do differently.
    pub fn guidance(self, violation: &ConstraintViolation, limits: &ConstraintLimits) -> String {
        let mut text = format!(
            "Your previous response was rejected ({}): {}.",
            violation.kind, violation.message
        );
        match self {
            RetryAction::NarrowScope => text.push_str(&format!(
                " Narrow the scope: return at most {} tasks and keep each file under {} \
                 characters and {} lines. Leave remaining work for a later TODO.",
                limits.max_tasks, limits.max_content_chars, limits.max_content_lines
            )),
            RetryAction::InjectBoundReminder => text.push_str(&format!(
                " Reply with exactly one JSON object {{\"tasks\": [...]}} holding between 1 and \
                 {} tasks, each with id, type, description, filename and content.",
                limits.max_tasks
            )),
            RetryAction::Resplit => text.push_str(
                " Work through the numbered sub-steps below in order and produce concrete file \
                 changes for them. Do not apologise or defer any part.",
            ),
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub max: u32,
    pub last_violation: Option<ConstraintViolation>,
}

impl RetryState {
    pub fn new(max: u32) -> Self {
        Self {
            attempt: 0,
            max,
            last_violation: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max
    }

    /// Completion calls made so far, counting the one in flight.
    pub fn calls(&self) -> u32 {
        self.attempt + 1
    }

    /// Record the failure of the current attempt and move to the next one.
    ///
    /// Returns `None` once the retry bound is spent; the state is then final.
    pub fn advance(
        &mut self,
        violation: ConstraintViolation,
        complexity: Complexity,
    ) -> Option<RetryAction> {
        let action = next_action(violation.kind, complexity);
        self.last_violation = Some(violation);
        if !self.can_retry() {
            return None;
        }
        self.attempt += 1;
        Some(action)
    }
}

/// Choose how to reshape the prompt after a violation of `kind`.
pub fn next_action(kind: ViolationKind, complexity: Complexity) -> RetryAction {
    match kind {
        ViolationKind::TooManyTasks | ViolationKind::Truncation => RetryAction::NarrowScope,
        ViolationKind::Dodge => RetryAction::Resplit,
        _ if complexity == Complexity::Complex => RetryAction::Resplit,
        _ => RetryAction::InjectBoundReminder,
    }
}

/// Standard remediation recorded as the learned solution for `kind`.
///
/// Completion-boundary failures carry no remediation; they stay unresolved.
pub fn remediation_for(kind: ViolationKind, limits: &ConstraintLimits) -> Option<String> {
    let text = match kind {
        ViolationKind::NoTasks => {
            "Always return at least one concrete task; if the change is small, return a single \
             update_file task."
                .to_string()
        }
        ViolationKind::TooManyTasks => format!(
            "Split the work: return at most {} tasks and leave the rest for follow-up TODOs.",
            limits.max_tasks
        ),
        ViolationKind::TaskMismatch => {
            "Match the expected tasks exactly, in the listed order, with the listed types and \
             filenames."
                .to_string()
        }
        ViolationKind::Malformed => {
            "Reply with only the JSON object {\"tasks\": [...]}; every task needs id, type, \
             description, filename and, unless deleting, the full content."
                .to_string()
        }
        ViolationKind::Truncation => format!(
            "Keep every file under {} characters and {} lines; prefer several small files.",
            limits.max_content_chars, limits.max_content_lines
        ),
        ViolationKind::Dodge => {
            "Do not apologise or defer; write the complete change even if it is partial in \
             scope."
                .to_string()
        }
        ViolationKind::ConstraintViolation => {
            "Only touch project-relative paths outside protected directories.".to_string()
        }
        ViolationKind::Timeout
        | ViolationKind::CompletionFailed
        | ViolationKind::FatalConstraintViolation => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn violation(kind: ViolationKind) -> ConstraintViolation {
        ConstraintViolation::new("test", kind, "boom", Value::Null)
    }

    #[test]
    fn zero_retries_allows_a_single_call() {
        let mut state = RetryState::new(0);
        assert!(!state.can_retry());
        assert_eq!(
            state.advance(violation(ViolationKind::Malformed), Complexity::Simple),
            None
        );
        assert_eq!(state.calls(), 1);
        assert_eq!(
            state.last_violation.map(|v| v.kind),
            Some(ViolationKind::Malformed)
        );
    }

    #[test]
    fn advance_stops_at_bound() {
        let mut state = RetryState::new(2);
        let mut actions = Vec::new();
        while let Some(action) = state.advance(violation(ViolationKind::NoTasks), Complexity::Simple)
        {
            actions.push(action);
        }
        assert_eq!(actions.len(), 2);
        assert_eq!(state.calls(), 3);
        assert_eq!(state.attempt, 2);
    }

    #[test]
    fn actions_follow_violation_kind() {
        assert_eq!(
            next_action(ViolationKind::TooManyTasks, Complexity::Complex),
            RetryAction::NarrowScope
        );
        assert_eq!(
            next_action(ViolationKind::Dodge, Complexity::Simple),
            RetryAction::Resplit
        );
        assert_eq!(
            next_action(ViolationKind::Malformed, Complexity::Complex),
            RetryAction::Resplit
        );
        assert_eq!(
            next_action(ViolationKind::Timeout, Complexity::Simple),
            RetryAction::InjectBoundReminder
        );
    }

    #[test]
    fn guidance_names_violation_and_bound() {
        let limits = ConstraintLimits::default();
        let text = RetryAction::NarrowScope.guidance(&violation(ViolationKind::TooManyTasks), &limits);
        assert!(text.contains("too_many_tasks"));
        assert!(text.contains("at most 3 tasks"));
    }

    #[test]
    fn completion_failures_have_no_remediation() {
        let limits = ConstraintLimits::default();
        assert!(remediation_for(ViolationKind::Timeout, &limits).is_none());
        assert!(
            remediation_for(ViolationKind::TooManyTasks, &limits)
                .expect("text")
                .contains("at most 3 tasks")
        );
    }
}
