//! Side-effecting collaborators: filesystem state, git, child processes.

pub mod atomic;
pub mod completion;
pub mod config;
pub mod execution_log;
pub mod git;
pub mod init;
pub mod learning_store;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod publish;
pub mod snapshot;
pub mod todo_store;
pub mod version_source;
pub mod workspace;
