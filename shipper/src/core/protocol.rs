//! Audit record and state machine for one protocol execution.
//!
//! Steps advance strictly in [`StepId::ALL`] order. The first failure ends the
//! execution: the failing step is FAILED and every later step is SKIPPED
//! without running. Timestamps are supplied by the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::constraints::ConstraintContext;
use crate::core::types::{ConstraintViolation, ExecutionStatus, StepId, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub id: u8,
    pub name: StepId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl ProtocolStep {
    fn pending(name: StepId) -> Self {
        Self {
            id: name.number(),
            name,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("execution is {0:?}; no further transitions allowed")]
    Finished(ExecutionStatus),
    #[error("step {step} cannot start: next step is {expected:?}")]
    OutOfOrder {
        step: StepId,
        expected: Option<StepId>,
    },
    #[error("step {step} is {status:?}, expected RUNNING")]
    NotRunning { step: StepId, status: StepStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolExecution {
    pub execution_id: String,
    pub todo_id: String,
    pub project: String,
    pub status: ExecutionStatus,
    pub steps: Vec<ProtocolStep>,
    pub violations: Vec<ConstraintViolation>,
    pub created_files: Vec<String>,
    pub current_version: Option<String>,
    pub next_version: Option<String>,
    pub snapshot_before_id: Option<String>,
    pub snapshot_after_id: Option<String>,
    pub release_url: Option<String>,
    pub negotiation_attempts: u32,
    /// Set when the execution stopped after mutating the work tree.
    pub rollback_required: bool,
    pub started_at: String,
    pub ended_at: Option<String>,
}

/// Compact view of an execution kept in the history ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub todo_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_url: Option<String>,
    pub rollback_required: bool,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl ProtocolExecution {
    pub fn new(
        execution_id: impl Into<String>,
        todo_id: impl Into<String>,
        project: impl Into<String>,
        started_at: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            todo_id: todo_id.into(),
            project: project.into(),
            status: ExecutionStatus::Running,
            steps: StepId::ALL.into_iter().map(ProtocolStep::pending).collect(),
            violations: Vec::new(),
            created_files: Vec::new(),
            current_version: None,
            next_version: None,
            snapshot_before_id: None,
            snapshot_after_id: None,
            release_url: None,
            negotiation_attempts: 0,
            rollback_required: false,
            started_at: started_at.into(),
            ended_at: None,
        }
    }

    pub fn step(&self, name: StepId) -> &ProtocolStep {
        &self.steps[usize::from(name.number() - 1)]
    }

    fn step_mut(&mut self, name: StepId) -> &mut ProtocolStep {
        &mut self.steps[usize::from(name.number() - 1)]
    }

    /// First step still PENDING, if any.
    pub fn next_pending(&self) -> Option<StepId> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.name)
    }

    pub fn running_step(&self) -> Option<StepId> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.name)
    }

    pub fn first_failure(&self) -> Option<&ProtocolStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Finished(self.status));
        }
        Ok(())
    }

    /// Move the next PENDING step to RUNNING. Any other step is out of order.
    pub fn start_step(&mut self, name: StepId, at: &str) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let expected = if self.running_step().is_some() {
            None
        } else {
            self.next_pending()
        };
        if expected != Some(name) {
            return Err(TransitionError::OutOfOrder {
                step: name,
                expected,
            });
        }
        let step = self.step_mut(name);
        step.status = StepStatus::Running;
        step.started_at = Some(at.to_string());
        Ok(())
    }

    pub fn complete_step(&mut self, name: StepId, at: &str) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let step = self.step_mut(name);
        if step.status != StepStatus::Running {
            return Err(TransitionError::NotRunning {
                step: name,
                status: step.status,
            });
        }
        step.status = StepStatus::Success;
        step.ended_at = Some(at.to_string());
        Ok(())
    }

    /// Fail a RUNNING step: the execution becomes FAILED and the rest SKIPPED.
    pub fn fail_step(
        &mut self,
        name: StepId,
        error: impl Into<String>,
        at: &str,
    ) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let step = self.step_mut(name);
        if step.status != StepStatus::Running {
            return Err(TransitionError::NotRunning {
                step: name,
                status: step.status,
            });
        }
        step.status = StepStatus::Failed;
        step.error = Some(error.into());
        step.ended_at = Some(at.to_string());
        self.skip_remaining(at);
        self.rollback_required = self.needs_rollback();
        self.close(ExecutionStatus::Failed, at);
        Ok(())
    }

    /// Record the next PENDING step as SKIPPED without running it.
    pub fn skip_step(
        &mut self,
        name: StepId,
        reason: impl Into<String>,
        at: &str,
    ) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let expected = self.next_pending();
        if self.running_step().is_some() || expected != Some(name) {
            return Err(TransitionError::OutOfOrder {
                step: name,
                expected,
            });
        }
        let step = self.step_mut(name);
        step.status = StepStatus::Skipped;
        step.error = Some(reason.into());
        step.ended_at = Some(at.to_string());
        Ok(())
    }

    /// Stop the execution: a RUNNING step is FAILED, the rest SKIPPED.
    pub fn abort(&mut self, reason: impl Into<String>, at: &str) -> Result<(), TransitionError> {
        self.ensure_running()?;
        let reason = reason.into();
        if let Some(running) = self.running_step() {
            let step = self.step_mut(running);
            step.status = StepStatus::Failed;
            step.error = Some(reason.clone());
            step.ended_at = Some(at.to_string());
        } else if let Some(next) = self.next_pending() {
            let step = self.step_mut(next);
            step.status = StepStatus::Skipped;
            step.error = Some(reason);
            step.ended_at = Some(at.to_string());
        }
        self.skip_remaining(at);
        self.rollback_required = self.needs_rollback();
        self.close(ExecutionStatus::Aborted, at);
        Ok(())
    }

    /// Close an execution whose steps have all run: COMPLETED only if every step succeeded.
    pub fn finish(&mut self, at: &str) -> Result<ExecutionStatus, TransitionError> {
        self.ensure_running()?;
        if let Some(step) = self.running_step().or_else(|| self.next_pending()) {
            return Err(TransitionError::OutOfOrder {
                step,
                expected: None,
            });
        }
        let status = if self
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Success)
        {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.close(status, at);
        Ok(status)
    }

    fn skip_remaining(&mut self, at: &str) {
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
                step.ended_at = Some(at.to_string());
            }
        }
    }

    fn close(&mut self, status: ExecutionStatus, at: &str) {
        self.status = status;
        self.ended_at = Some(at.to_string());
    }

    /// True once `execute_tasks` has started; the work tree may have changed.
    pub fn mutated(&self) -> bool {
        matches!(
            self.step(StepId::ExecuteTasks).status,
            StepStatus::Running | StepStatus::Success | StepStatus::Failed
        )
    }

    /// A snapshot exists and the work tree may differ from it. Without a
    /// snapshot the engine never lets tasks run.
    fn needs_rollback(&self) -> bool {
        self.mutated() && self.snapshot_before_id.is_some()
    }

    /// State handed to the constraint engine before a guarded action.
    pub fn constraint_context(&self) -> ConstraintContext {
        ConstraintContext {
            project: self.project.clone(),
            execution_id: Some(self.execution_id.clone()),
            steps: self.steps.iter().map(|s| (s.name, s.status)).collect(),
            snapshot_before_id: self.snapshot_before_id.clone(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        let failure = self.first_failure();
        ExecutionSummary {
            execution_id: self.execution_id.clone(),
            todo_id: self.todo_id.clone(),
            status: self.status,
            failed_step: failure.map(|s| s.name),
            error: failure.and_then(|s| s.error.clone()),
            next_version: self.next_version.clone(),
            release_url: self.release_url.clone(),
            rollback_required: self.rollback_required,
            started_at: self.started_at.clone(),
            ended_at: self.ended_at.clone(),
        }
    }
}

/// Human-readable step trace, one line per step.
pub fn render_trace(execution: &ProtocolExecution) -> String {
    let mut buf = format!(
        "execution {} ({}) {}\n",
        execution.execution_id,
        execution.todo_id,
        execution.status.as_str()
    );
    for step in &execution.steps {
        buf.push_str(&format!(
            "{:>3}. {:<24} {}",
            step.id,
            step.name.as_str(),
            step.status.as_str()
        ));
        if let Some(error) = &step.error {
            buf.push_str(&format!("  {error}"));
        }
        buf.push('\n');
    }
    if execution.rollback_required {
        if let Some(snapshot) = &execution.snapshot_before_id {
            buf.push_str(&format!(
                "rollback required: run `shipper rollback {snapshot}`\n"
            ));
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const AT: &str = "2026-01-01T00:00:00Z";

    fn execution() -> ProtocolExecution {
        ProtocolExecution::new("exec-1", "todo-1", "demo", AT)
    }

    fn run_through(exec: &mut ProtocolExecution, last: StepId) {
        for step in StepId::ALL {
            exec.start_step(step, AT).expect("start");
            exec.complete_step(step, AT).expect("complete");
            if step == last {
                break;
            }
        }
    }

    #[test]
    fn new_execution_has_thirteen_pending_steps() {
        let exec = execution();
        assert_eq!(exec.steps.len(), 13);
        assert!(exec.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(exec.steps[0].id, 1);
        assert_eq!(exec.steps[12].name, StepId::MarkDone);
    }

    #[test]
    fn all_success_completes() {
        let mut exec = execution();
        run_through(&mut exec, StepId::MarkDone);
        assert_eq!(exec.finish(AT), Ok(ExecutionStatus::Completed));
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn failure_skips_every_later_step() {
        let mut exec = execution();
        run_through(&mut exec, StepId::BuildContext);
        exec.start_step(StepId::CallCompletionService, AT).expect("start");
        exec.fail_step(StepId::CallCompletionService, "no_tasks", AT)
            .expect("fail");

        assert_eq!(exec.status, ExecutionStatus::Failed);
        let failed = exec.first_failure().expect("failed step");
        assert_eq!(failed.name, StepId::CallCompletionService);
        assert!(
            exec.steps[5..]
                .iter()
                .all(|s| s.status == StepStatus::Skipped)
        );
        assert!(matches!(
            exec.start_step(StepId::ValidateResponse, AT),
            Err(TransitionError::Finished(ExecutionStatus::Failed))
        ));
        assert!(!exec.rollback_required);
    }

    #[test]
    fn steps_cannot_run_out_of_order() {
        let mut exec = execution();
        assert_eq!(
            exec.start_step(StepId::Push, AT),
            Err(TransitionError::OutOfOrder {
                step: StepId::Push,
                expected: Some(StepId::FetchRemoteVersion),
            })
        );
        exec.start_step(StepId::FetchRemoteVersion, AT).expect("start");
        assert!(exec.start_step(StepId::CalculateNextVersion, AT).is_err());
    }

    #[test]
    fn abort_after_mutation_requires_rollback() {
        let mut exec = execution();
        exec.snapshot_before_id = Some("snap-1".to_string());
        run_through(&mut exec, StepId::SnapshotAfter);
        exec.start_step(StepId::Commit, AT).expect("start");
        exec.abort("fatal", AT).expect("abort");

        assert_eq!(exec.status, ExecutionStatus::Aborted);
        assert_eq!(exec.step(StepId::Commit).status, StepStatus::Failed);
        assert_eq!(exec.step(StepId::MarkDone).status, StepStatus::Skipped);
        assert!(exec.rollback_required);
        assert!(render_trace(&exec).contains("shipper rollback snap-1"));
    }

    #[test]
    fn skipped_step_prevents_completion() {
        let mut exec = execution();
        run_through(&mut exec, StepId::CalculateNextVersion);
        exec.skip_step(StepId::SnapshotBefore, "disabled", AT)
            .expect("skip");
        for step in &StepId::ALL[3..] {
            exec.start_step(*step, AT).expect("start");
            exec.complete_step(*step, AT).expect("complete");
        }
        assert_eq!(exec.finish(AT), Ok(ExecutionStatus::Failed));
    }

    #[test]
    fn constraint_context_mirrors_steps() {
        let mut exec = execution();
        run_through(&mut exec, StepId::SnapshotBefore);
        let ctx = exec.constraint_context();
        assert_eq!(ctx.status(StepId::SnapshotBefore), StepStatus::Success);
        assert_eq!(ctx.status(StepId::Commit), StepStatus::Pending);
        assert_eq!(ctx.execution_id.as_deref(), Some("exec-1"));
    }

    #[test]
    fn summary_reports_failed_step() {
        let mut exec = execution();
        exec.start_step(StepId::FetchRemoteVersion, AT).expect("start");
        exec.fail_step(StepId::FetchRemoteVersion, "remote unreachable", AT)
            .expect("fail");
        let summary = exec.summary();
        assert_eq!(summary.failed_step, Some(StepId::FetchRemoteVersion));
        assert_eq!(summary.error.as_deref(), Some("remote unreachable"));
        assert_eq!(summary.status, ExecutionStatus::Failed);
    }
}
