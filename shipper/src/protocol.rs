//! Orchestration for `shipper run`: the 13-step release protocol for one TODO.
//!
//! Steps run one at a time in [`StepId::ALL`] order. The first failure stops
//! the execution and every later step is recorded SKIPPED. A fatal constraint
//! violation, or cancellation between steps, aborts it instead. The full
//! record is written to `.shipper/executions/` whatever the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::constraints::{Action, ConstraintEngine, FatalViolation};
use crate::core::protocol::ProtocolExecution;
use crate::core::types::{ExecutionStatus, StepId, TaskSpec};
use crate::core::validation::check_task_paths;
use crate::core::version::SemVer;
use crate::io::completion::CompletionService;
use crate::io::config::ShipperConfig;
use crate::io::execution_log::{append_history, next_execution_id, write_execution};
use crate::io::init::{ShipperPaths, ensure_layout};
use crate::io::learning_store::LearningStore;
use crate::io::lock::ProjectLock;
use crate::io::publish::Publisher;
use crate::io::snapshot::SnapshotStore;
use crate::io::todo_store::{TodoItem, TodoStore};
use crate::io::version_source::VersionSource;
use crate::io::workspace::{apply_tasks, list_project_files};
use crate::negotiator::{NegotiationContext, NegotiationOutcome, NegotiationRequest, Negotiator};

/// Project files listed to the completion service.
const MAX_CONTEXT_FILES: usize = 200;

/// Shared cancellation request, observed only between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// External systems the protocol drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub completion: &'a dyn CompletionService,
    pub versions: &'a dyn VersionSource,
    pub snapshots: &'a dyn SnapshotStore,
    pub publisher: &'a dyn Publisher,
}

pub struct ProtocolExecutor<'a> {
    paths: ShipperPaths,
    config: ShipperConfig,
    project: String,
    engine: ConstraintEngine,
    collaborators: Collaborators<'a>,
    cancel: CancelFlag,
}

/// Values handed from one step to the next.
#[derive(Default)]
struct RunState {
    current: Option<SemVer>,
    next: Option<SemVer>,
    context: Option<NegotiationContext>,
    tasks: Vec<TaskSpec>,
}

impl<'a> ProtocolExecutor<'a> {
    pub fn new(paths: ShipperPaths, config: ShipperConfig, collaborators: Collaborators<'a>) -> Self {
        let project = config.project_id(&paths.root);
        let engine = ConstraintEngine::new(config.limits());
        Self {
            paths,
            config,
            project,
            engine,
            collaborators,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn engine(&self) -> &ConstraintEngine {
        &self.engine
    }

    /// Run the protocol for `todo_id` and return the finished record.
    ///
    /// Errors are reserved for refusing to start (bad layout, unknown or done
    /// TODO, project busy) and for failing to persist the record.
    #[instrument(skip_all, fields(project = %self.project, todo = todo_id))]
    pub fn execute(&self, store: &mut LearningStore, todo_id: &str) -> Result<ProtocolExecution> {
        ensure_layout(&self.paths)?;
        let todos = TodoStore::new(&self.paths.todos_path);
        let todo = todos
            .get(todo_id)?
            .ok_or_else(|| anyhow!("unknown todo {todo_id}"))?;
        if todo.done {
            return Err(anyhow!("todo {todo_id} is already done"));
        }

        let execution_id = next_execution_id(&self.paths);
        let _lock = ProjectLock::acquire(&self.paths.lock_path, &execution_id)?;
        let mut execution =
            ProtocolExecution::new(&execution_id, &todo.id, &self.project, now());
        info!(execution = %execution_id, "protocol execution started");

        let mut state = RunState::default();
        for step in StepId::ALL {
            if self.cancel.is_cancelled() {
                warn!(next = %step, "execution cancelled");
                execution.abort(format!("cancelled before {step}"), &now())?;
                break;
            }
            if step == StepId::SnapshotBefore && !self.config.snapshot.enabled {
                execution.skip_step(step, "snapshots disabled", &now())?;
                continue;
            }

            execution.start_step(step, &now())?;
            match self.run_step(step, &todo, store, &mut execution, &mut state) {
                Ok(()) => execution.complete_step(step, &now())?,
                Err(err) => {
                    if let Some(fatal) = err.downcast_ref::<FatalViolation>() {
                        warn!(step = %step, "{fatal}");
                        execution.violations.push(fatal.violation.clone());
                        execution.abort(fatal.to_string(), &now())?;
                    } else {
                        warn!(step = %step, "step failed: {err:#}");
                        execution.fail_step(step, format!("{err:#}"), &now())?;
                    }
                    break;
                }
            }
        }
        if execution.status == ExecutionStatus::Running {
            execution.finish(&now())?;
        }
        if execution.rollback_required {
            warn!(
                snapshot = execution.snapshot_before_id.as_deref().unwrap_or("none"),
                "work tree changed before the execution stopped; rollback is manual"
            );
        }

        write_execution(&self.paths, &execution)?;
        append_history(
            &self.paths.history_path,
            self.config.history.capacity,
            execution.summary(),
        )?;
        info!(status = execution.status.as_str(), "protocol execution finished");
        Ok(execution)
    }

    fn run_step(
        &self,
        step: StepId,
        todo: &TodoItem,
        store: &mut LearningStore,
        execution: &mut ProtocolExecution,
        state: &mut RunState,
    ) -> Result<()> {
        match step {
            StepId::FetchRemoteVersion => {
                let raw = self.collaborators.versions.current_version(&self.project)?;
                let current: SemVer = raw
                    .trim()
                    .parse()
                    .map_err(|err| anyhow!("remote version `{}` rejected: {err}", raw.trim()))?;
                execution.current_version = Some(current.to_string());
                state.current = Some(current);
            }
            StepId::CalculateNextVersion => {
                let current = state
                    .current
                    .ok_or_else(|| anyhow!("current version missing"))?;
                let next = current.bump(self.config.version.bump)?;
                info!(%current, %next, "next version");
                execution.next_version = Some(next.to_string());
                state.next = Some(next);
            }
            StepId::SnapshotBefore => {
                let id = self.collaborators.snapshots.create_snapshot(
                    &self.project,
                    &format!("before-{}", execution.execution_id),
                )?;
                execution.snapshot_before_id = Some(id);
            }
            StepId::BuildContext => {
                let (project_files, total_files) =
                    list_project_files(&self.paths.root, MAX_CONTEXT_FILES)?;
                state.context = Some(NegotiationContext {
                    project_files,
                    total_files,
                    expected: todo.expect.clone(),
                    current_version: execution.current_version.clone(),
                });
            }
            StepId::CallCompletionService => {
                let context = state
                    .context
                    .as_ref()
                    .ok_or_else(|| anyhow!("negotiation context missing"))?;
                let constraints = execution.constraint_context();
                let negotiator =
                    Negotiator::new(&self.engine, self.config.negotiation.max_injected_solutions);
                let outcome = negotiator.negotiate_request(
                    store,
                    self.collaborators.completion,
                    &NegotiationRequest {
                        project: &self.project,
                        instruction: &todo.instruction,
                        context,
                        constraints: &constraints,
                        max_retries: self.config.negotiation.max_retries,
                        timeout: self.config.completion_timeout(),
                    },
                )?;
                execution.negotiation_attempts = outcome.attempts().len() as u32;
                execution
                    .violations
                    .extend(outcome.violations().into_iter().cloned());
                match outcome {
                    NegotiationOutcome::Accepted { tasks, .. } => state.tasks = tasks,
                    NegotiationOutcome::Exhausted { attempts } => {
                        let last = attempts
                            .iter()
                            .rev()
                            .find_map(|a| a.violation.as_ref())
                            .map_or_else(|| "no response".to_string(), ToString::to_string);
                        return Err(anyhow!(
                            "negotiation failed after {} attempt(s): {last}",
                            attempts.len()
                        ));
                    }
                }
            }
            StepId::ValidateResponse => {
                let violations =
                    check_task_paths(&state.tasks, &self.engine, &execution.constraint_context());
                if let Some(first) = violations.first() {
                    let message = format!("{} task path(s) rejected: {first}", violations.len());
                    execution.violations.extend(violations);
                    return Err(anyhow!(message));
                }
            }
            StepId::ExecuteTasks => {
                self.check(Action::ExecuteTasks, execution)?;
                let changes = apply_tasks(&self.paths.root, &state.tasks)?;
                info!(touched = changes.touched.len(), created = changes.created.len(), "tasks applied");
                execution.created_files = changes.created;
            }
            StepId::SnapshotAfter => {
                let id = self.collaborators.snapshots.create_snapshot(
                    &self.project,
                    &format!("after-{}", execution.execution_id),
                )?;
                execution.snapshot_after_id = Some(id);
            }
            StepId::Commit => {
                self.check(Action::Commit, execution)?;
                let message = format!("release: {} ({})", self.tag(state)?, todo.id);
                self.collaborators.publisher.commit(&self.project, &message)?;
            }
            StepId::Push => {
                self.check(Action::Push, execution)?;
                self.collaborators.publisher.push(&self.project)?;
            }
            StepId::CreateRelease => {
                self.check(Action::CreateRelease, execution)?;
                let version = self.next_version(state)?;
                let notes = release_notes(todo, &state.tasks);
                let release = self.collaborators.publisher.create_release(
                    &self.project,
                    &version,
                    &notes,
                )?;
                if !release.success {
                    return Err(anyhow!("release {version} was not created"));
                }
                execution.release_url = release.url;
            }
            StepId::VerifyRelease => {
                let version = self.next_version(state)?;
                if !self
                    .collaborators
                    .publisher
                    .verify_release(&self.project, &version)?
                {
                    return Err(anyhow!("release {version} not found on the remote"));
                }
            }
            StepId::MarkDone => {
                self.check(Action::MarkDone, execution)?;
                let version = self.next_version(state)?;
                TodoStore::new(&self.paths.todos_path).mark_done(&todo.id, &version)?;
            }
        }
        Ok(())
    }

    /// Gate a guarded action; fatal violations surface as [`FatalViolation`] errors.
    fn check(&self, action: Action<'_>, execution: &mut ProtocolExecution) -> Result<()> {
        let warnings = self
            .engine
            .check_before_action(&action, &execution.constraint_context())?;
        for violation in warnings {
            warn!(action = action.name(), "{violation}");
            execution.violations.push(violation);
        }
        Ok(())
    }

    fn next_version(&self, state: &RunState) -> Result<String> {
        state
            .next
            .map(|v| v.to_string())
            .ok_or_else(|| anyhow!("next version missing"))
    }

    fn tag(&self, state: &RunState) -> Result<String> {
        Ok(format!("{}{}", self.config.version.tag_prefix, self.next_version(state)?))
    }
}

fn release_notes(todo: &TodoItem, tasks: &[TaskSpec]) -> String {
    let mut notes = format!("{}\n\n", todo.instruction.trim());
    for task in tasks {
        notes.push_str(&format!(
            "- {} {}: {}\n",
            task.task_type(),
            task.filename(),
            task.description()
        ));
    }
    notes.push_str(&format!("\nTODO: {}\n", todo.id));
    notes
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
