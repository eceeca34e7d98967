//! End-to-end protocol runs against scripted collaborators.
//!
//! Each test builds a throwaway git project, queues completion responses and
//! checks the recorded step trace, the TODO list and what was published.

use std::fs;

use shipper::core::constraints::{Action, ConstraintContext, ConstraintEngine, ConstraintLimits};
use shipper::core::protocol::ProtocolExecution;
use shipper::core::types::{
    ExecutionStatus, ExpectedTask, StepId, StepStatus, TaskType, ViolationKind,
};
use shipper::io::completion::{CompletionError, CompletionRequest, CompletionService};
use shipper::io::execution_log::{load_execution, load_history};
use shipper::io::learning_store::LearningStore;
use shipper::io::lock::{ProjectBusy, ProjectLock};
use shipper::io::snapshot::SnapshotStore;
use shipper::protocol::{CancelFlag, Collaborators, ProtocolExecutor};
use shipper::test_support::{
    FakeSnapshotStore, FakeVersionSource, RecordingPublisher, ScriptedCompletion, TestProject,
    create_task, many_tasks_response, tasks_response,
};

fn one_task() -> String {
    tasks_response(&[create_task("1", "src/slug.rs", "pub fn slug() {}\n")])
}

struct Harness {
    project: TestProject,
    versions: FakeVersionSource,
    snapshots: FakeSnapshotStore,
    publisher: RecordingPublisher,
}

impl Harness {
    fn new() -> Self {
        Self {
            project: TestProject::new().expect("project"),
            versions: FakeVersionSource::new("3.0.61"),
            snapshots: FakeSnapshotStore::new(),
            publisher: RecordingPublisher::new(),
        }
    }

    fn run(&self, completion: &dyn CompletionService, todo_id: &str) -> ProtocolExecution {
        self.run_with(completion, &self.snapshots, todo_id, CancelFlag::new())
    }

    fn run_with(
        &self,
        completion: &dyn CompletionService,
        snapshots: &dyn SnapshotStore,
        todo_id: &str,
        cancel: CancelFlag,
    ) -> ProtocolExecution {
        let mut store = LearningStore::open(&self.project.paths().learning_dir).expect("store");
        let executor = ProtocolExecutor::new(
            self.project.paths().clone(),
            self.project.config().expect("config"),
            Collaborators {
                completion,
                versions: &self.versions,
                snapshots,
                publisher: &self.publisher,
            },
        )
        .with_cancel_flag(cancel);
        executor.execute(&mut store, todo_id).expect("execute")
    }

    fn learning(&self) -> LearningStore {
        LearningStore::open(&self.project.paths().learning_dir).expect("store")
    }
}

fn assert_skipped_after(execution: &ProtocolExecution, step: StepId) {
    let index = usize::from(step.number());
    for later in &execution.steps[index..] {
        assert_eq!(
            later.status,
            StepStatus::Skipped,
            "{} should be skipped",
            later.name
        );
        assert!(later.started_at.is_none(), "{} must not run", later.name);
    }
}

/// A clean run completes all 13 steps and releases 3.0.62.
#[test]
fn clean_run_completes_and_marks_todo_done() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([one_task()]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(execution.current_version.as_deref(), Some("3.0.61"));
    assert_eq!(execution.next_version.as_deref(), Some("3.0.62"));
    assert_eq!(execution.created_files, vec!["src/slug.rs"]);
    assert_eq!(execution.negotiation_attempts, 1);
    assert!(!execution.rollback_required);
    assert_eq!(
        fs::read_to_string(h.project.file("src/slug.rs")).expect("read"),
        "pub fn slug() {}\n"
    );

    assert_eq!(
        h.publisher.calls(),
        vec![
            format!("commit:release: v3.0.62 ({})", todo.id),
            "push".to_string(),
            "create_release:3.0.62".to_string(),
            "verify_release:3.0.62".to_string(),
        ]
    );
    let labels = h.snapshots.labels();
    assert_eq!(labels.len(), 2);
    assert!(labels[0].starts_with("before-exec-"));
    assert!(labels[1].starts_with("after-exec-"));

    let done = h.project.todos().get(&todo.id).expect("get").expect("todo");
    assert!(done.done);
    assert_eq!(done.released_version.as_deref(), Some("3.0.62"));

    let stored = load_execution(h.project.paths(), &execution.execution_id)
        .expect("load")
        .expect("record");
    assert_eq!(stored, execution);
    let history = load_history(&h.project.paths().history_path, 50).expect("history");
    assert_eq!(history.len(), 1);
    assert!(!h.project.paths().lock_path.exists());
}

/// Five tasks against a limit of three is never partially accepted.
#[test]
fn too_many_tasks_exhausts_retries_without_truncating() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new(vec![many_tasks_response(5); 10]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(completion.calls(), 4);
    assert_eq!(execution.negotiation_attempts, 4);
    let failed = execution.first_failure().expect("failure");
    assert_eq!(failed.name, StepId::CallCompletionService);
    assert!(failed.error.as_deref().unwrap_or("").contains("too_many_tasks"));
    assert_skipped_after(&execution, StepId::CallCompletionService);
    assert!(
        execution
            .violations
            .iter()
            .all(|v| v.kind == ViolationKind::TooManyTasks)
    );
    assert!(!h.project.file("src/file_1.rs").exists());
    assert!(h.publisher.calls().is_empty());

    let learning = h.learning();
    let learned = learning.get_similar_errors("demo", "too_many_tasks");
    assert_eq!(learned.len(), 1);
    assert_eq!(learned[0].occurrences, 4);
}

#[test]
fn too_many_tasks_then_valid_response_completes() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([many_tasks_response(5), one_task()]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.negotiation_attempts, 2);
    assert_eq!(execution.violations.len(), 1);
    assert_eq!(execution.created_files, vec!["src/slug.rs"]);
    assert!(!h.project.file("src/file_1.rs").exists());
}

/// An empty task list fails the run and leaves the TODO open.
#[test]
fn zero_tasks_fails_and_skips_the_rest() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([tasks_response(&[])]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.first_failure().map(|s| s.name),
        Some(StepId::CallCompletionService)
    );
    assert_skipped_after(&execution, StepId::CallCompletionService);
    assert_eq!(execution.step(StepId::MarkDone).status, StepStatus::Skipped);
    assert!(execution.violations.iter().all(|v| v.kind == ViolationKind::NoTasks));
    assert!(!h.project.todos().get(&todo.id).expect("get").expect("todo").done);
    assert!(h.publisher.calls().is_empty());
}

/// Without a completed pre-mutation snapshot nothing is mutated or published.
#[test]
fn missing_snapshot_aborts_before_any_mutation() {
    let h = Harness::new();
    h.project
        .update_config(|cfg| cfg.snapshot.enabled = false)
        .expect("config");
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([one_task()]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Aborted);
    assert_eq!(execution.step(StepId::SnapshotBefore).status, StepStatus::Skipped);
    assert_eq!(execution.step(StepId::ValidateResponse).status, StepStatus::Success);
    assert_eq!(execution.step(StepId::ExecuteTasks).status, StepStatus::Failed);
    assert_skipped_after(&execution, StepId::ExecuteTasks);
    let fatal = execution
        .violations
        .iter()
        .find(|v| v.kind == ViolationKind::FatalConstraintViolation)
        .expect("fatal violation");
    assert_eq!(fatal.constraint_id, "process.snapshot_before_mutation");
    assert!(!execution.rollback_required);
    assert!(!h.project.file("src/slug.rs").exists());
    assert!(h.publisher.calls().is_empty());
    assert!(h.snapshots.labels().is_empty());
}

#[test]
fn push_without_snapshot_is_fatal() {
    let engine = ConstraintEngine::new(ConstraintLimits::default());
    let context = ConstraintContext {
        steps: vec![
            (StepId::SnapshotBefore, StepStatus::Skipped),
            (StepId::Commit, StepStatus::Success),
        ],
        ..ConstraintContext::for_project("demo")
    };
    let err = engine
        .check_before_action(&Action::Push, &context)
        .expect_err("fatal");
    assert_eq!(err.violation.kind, ViolationKind::FatalConstraintViolation);
}

#[test]
fn failed_snapshot_fails_the_run_before_negotiation() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([one_task()]);
    let snapshots = FakeSnapshotStore::failing();

    let execution = h.run_with(&completion, &snapshots, &todo.id, CancelFlag::new());

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.first_failure().map(|s| s.name),
        Some(StepId::SnapshotBefore)
    );
    assert_eq!(completion.calls(), 0);
}

#[test]
fn unparsable_remote_version_fails_first_step() {
    let mut h = Harness::new();
    h.versions = FakeVersionSource::new("latest");
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([one_task()]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(
        execution.first_failure().map(|s| s.name),
        Some(StepId::FetchRemoteVersion)
    );
    assert_skipped_after(&execution, StepId::FetchRemoteVersion);
    assert_eq!(completion.calls(), 0);
}

#[test]
fn version_at_component_limit_fails_calculation() {
    let mut h = Harness::new();
    h.versions = FakeVersionSource::new("0.0.18446744073709551615");
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([one_task()]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let failed = execution.first_failure().expect("failure");
    assert_eq!(failed.name, StepId::CalculateNextVersion);
    assert!(failed.error.as_deref().unwrap_or("").contains("overflows"));
    assert_eq!(execution.next_version, None);
    assert_skipped_after(&execution, StepId::CalculateNextVersion);
    assert_eq!(completion.calls(), 0);
}

#[test]
fn expected_task_mismatch_names_the_diverging_index() {
    let h = Harness::new();
    let expect = vec![ExpectedTask {
        id: None,
        task_type: Some(TaskType::CreateFile),
        filename: Some("src/title.rs".to_string()),
    }];
    let todo = h.project.add_todo("Add a title helper", expect).expect("todo");
    let completion = ScriptedCompletion::new(vec![one_task(); 4]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let violation = execution.violations.first().expect("violation");
    assert_eq!(violation.kind, ViolationKind::TaskMismatch);
    assert!(violation.message.contains("index 0"));
    assert!(completion.prompts()[0].contains("create_file on `src/title.rs`"));
}

/// Protected destinations are rejected during negotiation and learned.
#[test]
fn protected_paths_are_retried_then_fail_negotiation() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let hijack = tasks_response(&[create_task(
        "1",
        ".shipper/config.toml",
        "project = \"hijacked\"\n",
    )]);
    let completion = ScriptedCompletion::new(vec![hijack; 4]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(completion.calls(), 4);
    assert_eq!(
        execution.first_failure().map(|s| s.name),
        Some(StepId::CallCompletionService)
    );
    assert!(execution.violations.iter().all(|v| {
        v.kind == ViolationKind::ConstraintViolation && v.constraint_id == "fs.protected_paths"
    }));
    assert_eq!(h.project.config().expect("config").project, "demo");

    let learning = h.learning();
    let learned = learning.get_similar_errors("demo", "constraint_violation");
    assert_eq!(learned.len(), 1);
    assert!(learned[0].has_solution());
    assert!(
        completion.prompts()[1]
            .contains("- Only touch project-relative paths outside protected directories.")
    );
}

#[test]
fn unverified_release_fails_and_requires_rollback() {
    let mut h = Harness::new();
    h.publisher = RecordingPublisher::unverified();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let completion = ScriptedCompletion::new([one_task()]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.first_failure().map(|s| s.name),
        Some(StepId::VerifyRelease)
    );
    assert_eq!(execution.step(StepId::MarkDone).status, StepStatus::Skipped);
    assert!(execution.rollback_required);
    assert_eq!(execution.snapshot_before_id.as_deref(), Some("snap-1"));
    assert!(!h.project.todos().get(&todo.id).expect("get").expect("todo").done);
}

#[test]
fn completion_timeout_consumes_retries() {
    let h = Harness::new();
    h.project
        .update_config(|cfg| cfg.negotiation.max_retries = 1)
        .expect("config");
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let timeout = || Err(CompletionError::TimedOut(std::time::Duration::from_secs(300)));
    let completion = ScriptedCompletion::with_results([timeout(), timeout(), Ok(one_task())]);

    let execution = h.run(&completion, &todo.id);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(completion.calls(), 2);
    assert!(execution.violations.iter().all(|v| v.kind == ViolationKind::Timeout));
}

/// A solution learned in one run is injected into the first prompt of the next.
#[test]
fn learned_solution_reaches_the_next_execution() {
    let h = Harness::new();
    let first = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let second = h.project.add_todo("Add a title helper", Vec::new()).expect("todo");

    let completion = ScriptedCompletion::new([many_tasks_response(5), one_task()]);
    assert_eq!(h.run(&completion, &first.id).status, ExecutionStatus::Completed);

    let next = ScriptedCompletion::new([tasks_response(&[create_task(
        "1",
        "src/title.rs",
        "pub fn title() {}\n",
    )])]);
    let execution = h.run(&next, &second.id);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.next_version.as_deref(), Some("3.0.62"));
    let prompt = &next.prompts()[0];
    assert!(prompt.contains("<learned_solutions>"));
    assert!(prompt.contains("return at most 3 tasks"));
}

/// Cancels the run from inside the completion call.
struct CancellingCompletion {
    cancel: CancelFlag,
    response: String,
}

impl CompletionService for CancellingCompletion {
    fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
        self.cancel.cancel();
        Ok(self.response.clone())
    }
}

#[test]
fn cancel_before_mutation_aborts_cleanly() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let cancel = CancelFlag::new();
    let completion = CancellingCompletion {
        cancel: cancel.clone(),
        response: one_task(),
    };

    let execution = h.run_with(&completion, &h.snapshots, &todo.id, cancel);

    assert_eq!(execution.status, ExecutionStatus::Aborted);
    assert_eq!(
        execution.step(StepId::CallCompletionService).status,
        StepStatus::Success
    );
    assert_skipped_after(&execution, StepId::CallCompletionService);
    assert!(!execution.rollback_required);
    assert!(!h.project.file("src/slug.rs").exists());
}

/// Cancels the run once the post-mutation snapshot is taken.
struct CancellingSnapshots {
    inner: FakeSnapshotStore,
    cancel: CancelFlag,
}

impl SnapshotStore for CancellingSnapshots {
    fn create_snapshot(&self, project: &str, label: &str) -> anyhow::Result<String> {
        if label.starts_with("after-") {
            self.cancel.cancel();
        }
        self.inner.create_snapshot(project, label)
    }

    fn rollback(&self, project: &str, snapshot_id: &str) -> anyhow::Result<bool> {
        self.inner.rollback(project, snapshot_id)
    }
}

#[test]
fn cancel_after_mutation_requires_manual_rollback() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let cancel = CancelFlag::new();
    let snapshots = CancellingSnapshots {
        inner: FakeSnapshotStore::new(),
        cancel: cancel.clone(),
    };
    let completion = ScriptedCompletion::new([one_task()]);

    let execution = h.run_with(&completion, &snapshots, &todo.id, cancel);

    assert_eq!(execution.status, ExecutionStatus::Aborted);
    assert_eq!(execution.step(StepId::SnapshotAfter).status, StepStatus::Success);
    assert_skipped_after(&execution, StepId::SnapshotAfter);
    assert!(execution.rollback_required);
    assert!(h.project.file("src/slug.rs").exists());
    assert!(h.publisher.calls().is_empty());
    assert!(snapshots.inner.rollbacks().is_empty());
}

#[test]
fn busy_project_refuses_second_execution() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    let _held = ProjectLock::acquire(&h.project.paths().lock_path, "exec-other").expect("lock");

    let mut store = h.learning();
    let completion = ScriptedCompletion::new([one_task()]);
    let executor = ProtocolExecutor::new(
        h.project.paths().clone(),
        h.project.config().expect("config"),
        Collaborators {
            completion: &completion,
            versions: &h.versions,
            snapshots: &h.snapshots,
            publisher: &h.publisher,
        },
    );
    let err = executor
        .execute(&mut store, &todo.id)
        .expect_err("busy");
    assert!(err.downcast_ref::<ProjectBusy>().is_some());
    assert_eq!(completion.calls(), 0);
    assert_eq!(h.versions.calls(), 0);
}

#[test]
fn done_or_unknown_todo_is_refused() {
    let h = Harness::new();
    let todo = h.project.add_todo("Add a slug helper", Vec::new()).expect("todo");
    h.project.todos().mark_done(&todo.id, "1.0.0").expect("done");

    let mut store = h.learning();
    let completion = ScriptedCompletion::new([one_task()]);
    let executor = ProtocolExecutor::new(
        h.project.paths().clone(),
        h.project.config().expect("config"),
        Collaborators {
            completion: &completion,
            versions: &h.versions,
            snapshots: &h.snapshots,
            publisher: &h.publisher,
        },
    );
    assert!(executor.execute(&mut store, &todo.id).is_err());
    assert!(executor.execute(&mut store, "todo-99").is_err());
}
