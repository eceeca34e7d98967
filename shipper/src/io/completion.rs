//! Completion service boundary.
//!
//! The [`CompletionService`] trait decouples negotiation from the actual
//! backend (by default `codex exec -`). Tests use scripted services that
//! return predetermined responses without spawning processes.

use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Full prompt text: constraint rules, context and the instruction.
    pub prompt: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    TimedOut(Duration),
    #[error("completion failed: {0}")]
    Failed(String),
}

/// Abstraction over completion backends. Returns the raw response text.
pub trait CompletionService {
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

impl<F> CompletionService for F
where
    F: Fn(&CompletionRequest) -> Result<String, CompletionError>,
{
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        self(request)
    }
}

/// Completion backed by an external command: prompt on stdin, response on stdout.
#[derive(Debug, Clone)]
pub struct CommandCompletion {
    command: Vec<String>,
    workdir: std::path::PathBuf,
    output_limit_bytes: usize,
}

impl CommandCompletion {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<std::path::PathBuf>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            output_limit_bytes,
        }
    }
}

impl CompletionService for CommandCompletion {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CompletionError::Failed("empty completion command".to_string()))?;
        info!(program = %program, "starting completion command");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| CompletionError::Failed(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "completion timed out");
            return Err(CompletionError::TimedOut(request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "completion command failed");
            let stderr = output.stderr_text();
            return Err(CompletionError::Failed(format!(
                "{program} exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        let notice = output.truncation_notice("completion");
        if !notice.is_empty() {
            warn!("{notice}");
        }
        debug!(bytes = output.stdout.len(), "completion finished");
        Ok(output.stdout_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeout: Duration) -> CompletionRequest {
        CompletionRequest {
            prompt: "{\"tasks\": []}".to_string(),
            timeout,
        }
    }

    #[test]
    fn closures_are_completion_services() {
        let service = |req: &CompletionRequest| -> Result<String, CompletionError> {
            Ok(format!("echo: {}", req.prompt))
        };
        let out = service
            .complete(&request(Duration::from_secs(1)))
            .expect("complete");
        assert!(out.starts_with("echo: "));
    }

    #[cfg(unix)]
    #[test]
    fn command_completion_pipes_prompt_through() {
        let completion = CommandCompletion::new(vec!["cat".to_string()], ".", 4096);
        let out = completion
            .complete(&request(Duration::from_secs(5)))
            .expect("complete");
        assert_eq!(out, "{\"tasks\": []}");
    }

    #[cfg(unix)]
    #[test]
    fn command_completion_reports_timeout_and_failure() {
        let slow = CommandCompletion::new(
            vec!["sleep".to_string(), "5".to_string()],
            ".",
            4096,
        );
        assert_eq!(
            slow.complete(&request(Duration::from_millis(100))),
            Err(CompletionError::TimedOut(Duration::from_millis(100)))
        );

        let failing = CommandCompletion::new(vec!["false".to_string()], ".", 4096);
        assert!(matches!(
            failing.complete(&request(Duration::from_secs(5))),
            Err(CompletionError::Failed(_))
        ));
    }
}
