//! Git-backed version source, publisher and snapshots against a local bare remote.

use std::fs;

use shipper::core::types::{ExecutionStatus, StepId};
use shipper::io::git::Git;
use shipper::io::learning_store::LearningStore;
use shipper::io::publish::{GitPublisher, Publisher};
use shipper::io::snapshot::{FsSnapshotStore, SnapshotStore};
use shipper::io::version_source::{GitTagVersionSource, VersionSource};
use shipper::protocol::{Collaborators, ProtocolExecutor};
use shipper::test_support::{ScriptedCompletion, TestProject, create_task, tasks_response};

fn publisher(project: &TestProject) -> GitPublisher {
    GitPublisher::new(
        Git::new(project.root()),
        "origin",
        "v",
        "{remote}/releases/tag/{tag}",
    )
}

fn versions(project: &TestProject) -> GitTagVersionSource {
    GitTagVersionSource::new(Git::new(project.root()), "origin", "v")
}

fn push_tag(project: &TestProject, tag: &str) {
    project.git(&["tag", tag]).expect("tag");
    project.git(&["push", "-q", "origin", tag]).expect("push tag");
}

#[test]
fn version_source_reads_highest_prefixed_remote_tag() {
    let project = TestProject::new().expect("project");
    project.add_bare_remote().expect("remote");
    let source = versions(&project);
    assert_eq!(source.current_version("demo").expect("version"), "0.0.0");

    push_tag(&project, "v3.0.9");
    push_tag(&project, "v3.0.61");
    push_tag(&project, "nightly");
    assert_eq!(source.current_version("demo").expect("version"), "3.0.61");
}

#[test]
fn version_source_falls_back_to_local_tags_without_remote() {
    let project = TestProject::new().expect("project");
    project.git(&["tag", "v1.4.2"]).expect("tag");
    assert_eq!(
        versions(&project).current_version("demo").expect("version"),
        "1.4.2"
    );
}

#[test]
fn publisher_commits_pushes_and_tags() {
    let project = TestProject::new().expect("project");
    let remote = project.add_bare_remote().expect("remote");
    let publisher = publisher(&project);

    fs::write(project.file("NOTES.md"), "notes\n").expect("write");
    publisher
        .commit("demo", "release: v1.0.1 (todo-1)")
        .expect("commit");
    publisher.push("demo").expect("push");
    assert_eq!(
        project.git(&["log", "-1", "--format=%s"]).expect("log"),
        "release: v1.0.1 (todo-1)"
    );

    assert!(!publisher.verify_release("demo", "1.0.1").expect("verify"));
    let release = publisher
        .create_release("demo", "1.0.1", "notes")
        .expect("release");
    assert!(release.success);
    let expected_url = format!(
        "{}/releases/tag/v1.0.1",
        remote.to_string_lossy().trim_end_matches(".git")
    );
    assert_eq!(release.url.as_deref(), Some(expected_url.as_str()));
    assert!(publisher.verify_release("demo", "1.0.1").expect("verify"));

    let remote_head = Git::new(&remote);
    assert!(
        remote_head
            .local_tags()
            .expect("remote tags")
            .contains(&"v1.0.1".to_string())
    );
}

#[test]
fn commit_without_changes_is_an_error() {
    let project = TestProject::new().expect("project");
    let err = publisher(&project)
        .commit("demo", "release: v0.0.1 (todo-1)")
        .expect_err("nothing to commit");
    assert!(format!("{err:#}").contains("nothing to commit"));
}

/// A full run with the real collaborators releases the next patch version.
#[test]
fn full_run_releases_to_bare_remote() {
    let project = TestProject::new().expect("project");
    project.add_bare_remote().expect("remote");
    project.git(&["push", "-q", "origin", "main"]).expect("push main");
    push_tag(&project, "v3.0.61");
    let todo = project
        .add_todo("Add a slug helper", Vec::new())
        .expect("todo");

    let completion = ScriptedCompletion::new([tasks_response(&[create_task(
        "1",
        "src/slug.rs",
        "pub fn slug() {}\n",
    )])]);
    let versions = versions(&project);
    let snapshots = FsSnapshotStore::new(project.root(), &project.paths().snapshots_dir);
    let publisher = publisher(&project);
    let mut store = LearningStore::open(&project.paths().learning_dir).expect("store");
    let executor = ProtocolExecutor::new(
        project.paths().clone(),
        project.config().expect("config"),
        Collaborators {
            completion: &completion,
            versions: &versions,
            snapshots: &snapshots,
            publisher: &publisher,
        },
    );

    let execution = executor.execute(&mut store, &todo.id).expect("execute");

    assert_eq!(execution.status, ExecutionStatus::Completed, "{execution:#?}");
    assert_eq!(execution.next_version.as_deref(), Some("3.0.62"));
    assert_eq!(
        project.git(&["log", "-1", "--format=%s"]).expect("log"),
        format!("release: v3.0.62 ({})", todo.id)
    );
    assert_eq!(versions.current_version("demo").expect("version"), "3.0.62");
    assert!(
        execution
            .release_url
            .as_deref()
            .is_some_and(|url| url.ends_with("/releases/tag/v3.0.62"))
    );

    // The pre-mutation snapshot undoes the generated file.
    let before = execution.snapshot_before_id.clone().expect("snapshot id");
    assert!(snapshots.rollback("demo", &before).expect("rollback"));
    assert!(!project.file("src/slug.rs").exists());
    assert_eq!(execution.step(StepId::MarkDone).error, None);
}
