//! `shipper`: negotiate TODOs into validated changes and release them.
//!
//! State lives in `.shipper/` under the project root. `shipper run` drives the
//! 13-step protocol and prints the step trace; the exit code reflects the
//! execution status (see `exit_codes`).

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use shipper::core::constraints::{ConstraintContext, ConstraintEngine};
use shipper::core::protocol::render_trace;
use shipper::core::types::{ExpectedTask, ViolationKind};
use shipper::exit_codes;
use shipper::io::completion::CommandCompletion;
use shipper::io::config::{ShipperConfig, load_config};
use shipper::io::execution_log::load_history;
use shipper::io::git::Git;
use shipper::io::init::{InitOptions, ShipperPaths, ensure_layout, init_project};
use shipper::io::learning_store::LearningStore;
use shipper::io::lock::ProjectBusy;
use shipper::io::publish::GitPublisher;
use shipper::io::snapshot::{FsSnapshotStore, SnapshotStore};
use shipper::io::todo_store::TodoStore;
use shipper::io::version_source::GitTagVersionSource;
use shipper::logging;
use shipper::protocol::{Collaborators, ProtocolExecutor};

#[derive(Parser)]
#[command(
    name = "shipper",
    version,
    about = "Negotiate TODOs into validated changes and release them"
)]
struct Cli {
    /// Project root containing `.shipper/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the `.shipper/` layout.
    Init {
        /// Rewrite config.toml and .gitignore.
        #[arg(short, long)]
        force: bool,
    },
    /// Manage the TODO list.
    Todo {
        #[command(subcommand)]
        command: TodoCommand,
    },
    /// Run the release protocol for one TODO.
    Run { todo_id: String },
    /// Print the constraint text injected into prompts.
    Constraints,
    /// List learned errors for this project.
    Learned {
        /// Only errors of this kind (e.g. `too_many_tasks`).
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Mark a learned error as fixed.
    Resolve { signature: String },
    /// Restore the work tree from a snapshot.
    Rollback { snapshot_id: String },
    /// Print recent executions.
    History,
}

#[derive(Subcommand)]
enum TodoCommand {
    /// Append a TODO and print its id.
    Add {
        instruction: String,
        /// Expected task as `<type>:<filename>`; repeat in task order.
        #[arg(long, value_parser = parse_expect)]
        expect: Vec<ExpectedTask>,
    },
    /// List TODOs.
    List,
}

fn parse_expect(raw: &str) -> Result<ExpectedTask, String> {
    ExpectedTask::parse(raw)
        .ok_or_else(|| format!("expected `<type>:<filename>`, got `{raw}`"))
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<ProjectBusy>().is_some() {
                exit_codes::BUSY
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Todo {
            command: TodoCommand::Add {
                instruction,
                expect,
            },
        } => cmd_todo_add(&root, &instruction, expect),
        Command::Todo {
            command: TodoCommand::List,
        } => cmd_todo_list(&root),
        Command::Run { todo_id } => cmd_run(&root, &todo_id),
        Command::Constraints => cmd_constraints(&root),
        Command::Learned { kind } => cmd_learned(&root, kind.as_deref()),
        Command::Resolve { signature } => cmd_resolve(&root, &signature),
        Command::Rollback { snapshot_id } => cmd_rollback(&root, &snapshot_id),
        Command::History => cmd_history(&root),
    }
}

/// Paths and config for an initialised project.
fn open_project(root: &Path) -> Result<(ShipperPaths, ShipperConfig)> {
    let paths = ShipperPaths::new(root);
    ensure_layout(&paths)?;
    let cfg = load_config(&paths.config_path)?;
    Ok((paths, cfg))
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialised {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_todo_add(root: &Path, instruction: &str, expect: Vec<ExpectedTask>) -> Result<i32> {
    let (paths, _) = open_project(root)?;
    let todo = TodoStore::new(&paths.todos_path).add(instruction, expect)?;
    println!("{}", todo.id);
    Ok(exit_codes::OK)
}

fn cmd_todo_list(root: &Path) -> Result<i32> {
    let (paths, _) = open_project(root)?;
    for todo in TodoStore::new(&paths.todos_path).list()? {
        let mark = if todo.done { "x" } else { " " };
        let version = todo
            .released_version
            .map(|v| format!(" (released {v})"))
            .unwrap_or_default();
        println!("[{mark}] {} {}{version}", todo.id, todo.instruction);
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, todo_id: &str) -> Result<i32> {
    let (paths, cfg) = open_project(root)?;
    let mut store = LearningStore::open(&paths.learning_dir)?;

    let completion = CommandCompletion::new(
        cfg.completion.command.clone(),
        root,
        cfg.completion.output_limit_bytes,
    );
    let versions = GitTagVersionSource::new(
        Git::new(root),
        cfg.publish.remote.clone(),
        cfg.version.tag_prefix.clone(),
    );
    let snapshots = FsSnapshotStore::new(root, &paths.snapshots_dir);
    let publisher = GitPublisher::new(
        Git::new(root),
        cfg.publish.remote.clone(),
        cfg.version.tag_prefix.clone(),
        cfg.publish.release_url_template.clone(),
    );

    let executor = ProtocolExecutor::new(
        paths,
        cfg,
        Collaborators {
            completion: &completion,
            versions: &versions,
            snapshots: &snapshots,
            publisher: &publisher,
        },
    );
    let execution = executor.execute(&mut store, todo_id)?;
    print!("{}", render_trace(&execution));
    if let Some(url) = &execution.release_url {
        println!("release: {url}");
    }
    Ok(exit_codes::for_status(execution.status))
}

fn cmd_constraints(root: &Path) -> Result<i32> {
    let (_, cfg) = open_project(root)?;
    let engine = ConstraintEngine::new(cfg.limits());
    print!(
        "{}",
        engine.build_system_prompt(&ConstraintContext::for_project(cfg.project_id(root)))
    );
    Ok(exit_codes::OK)
}

fn cmd_learned(root: &Path, kind: Option<&str>) -> Result<i32> {
    let (paths, cfg) = open_project(root)?;
    let project = cfg.project_id(root);
    let store = LearningStore::open(&paths.learning_dir)?;
    let errors = match kind {
        Some(kind) => {
            let kind = ViolationKind::parse(kind)
                .ok_or_else(|| anyhow!("unknown error type `{kind}`"))?;
            store.get_similar_errors(&project, kind.as_str())
        }
        None => store.errors(&project),
    };
    for error in errors {
        println!(
            "{} {:?} x{} {}",
            error.signature, error.status, error.occurrences, error.normalized_message
        );
        if let Some(solution) = &error.solution {
            println!("    solution: {solution}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_resolve(root: &Path, signature: &str) -> Result<i32> {
    let (paths, cfg) = open_project(root)?;
    let mut store = LearningStore::open(&paths.learning_dir)?;
    if !store.resolve_error_as_bugfix(&cfg.project_id(root), signature)? {
        return Err(anyhow!("no learned error with signature {signature}"));
    }
    println!("resolved {signature}");
    Ok(exit_codes::OK)
}

fn cmd_rollback(root: &Path, snapshot_id: &str) -> Result<i32> {
    let (paths, cfg) = open_project(root)?;
    let snapshots = FsSnapshotStore::new(root, &paths.snapshots_dir);
    if !snapshots.rollback(&cfg.project_id(root), snapshot_id)? {
        return Err(anyhow!("snapshot {snapshot_id} not found"));
    }
    println!("restored {snapshot_id}");
    Ok(exit_codes::OK)
}

fn cmd_history(root: &Path) -> Result<i32> {
    let (paths, cfg) = open_project(root)?;
    let history = load_history(&paths.history_path, cfg.history.capacity)?;
    for entry in history.iter() {
        let failed = entry
            .failed_step
            .map(|step| format!(" at {step}"))
            .unwrap_or_default();
        println!(
            "{} {} {} {}{failed} {}",
            entry.started_at,
            entry.execution_id,
            entry.todo_id,
            entry.status.as_str(),
            entry.next_version.as_deref().unwrap_or("-"),
        );
    }
    Ok(exit_codes::OK)
}
