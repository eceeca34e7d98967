//! Bounded negotiation of an instruction into a validated task list.
//!
//! Each attempt renders a prompt, makes exactly one completion call and
//! validates the response. Every violation is learned before the next attempt
//! so its remediation can be injected. A negotiation with `max_retries = N`
//! makes at most `N + 1` completion calls.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::complexity::{classify_instruction, split_instruction};
use crate::core::constraints::{ConstraintContext, ConstraintEngine};
use crate::core::retry::{RetryAction, RetryState, remediation_for};
use crate::core::types::{
    Complexity, ConstraintViolation, ExpectedTask, TaskSpec, ViolationKind,
};
use crate::core::validation::validate_response;
use crate::io::completion::{CompletionError, CompletionRequest, CompletionService};
use crate::io::learning_store::{ErrorContext, LearningStore};
use crate::io::prompt::{PromptBuilder, PromptInputs, RetryPrompt};

/// Read-only project context shown to the completion service.
#[derive(Debug, Clone, Default)]
pub struct NegotiationContext {
    pub project_files: Vec<String>,
    pub total_files: usize,
    pub expected: Vec<ExpectedTask>,
    pub current_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NegotiationRequest<'a> {
    pub project: &'a str,
    pub instruction: &'a str,
    pub context: &'a NegotiationContext,
    pub constraints: &'a ConstraintContext,
    pub max_retries: u32,
    pub timeout: Duration,
}

/// One completion call and its validation result.
#[derive(Debug, Clone)]
pub struct NegotiationAttempt {
    pub retry_index: u32,
    pub instruction: String,
    pub prompt: String,
    /// `None` when the completion call itself failed.
    pub raw_response: Option<String>,
    /// `None` when the response was accepted.
    pub violation: Option<ConstraintViolation>,
    /// Signature the violation was learned under.
    pub signature: Option<String>,
}

#[derive(Debug, Clone)]
pub enum NegotiationOutcome {
    Accepted {
        tasks: Vec<TaskSpec>,
        attempts: Vec<NegotiationAttempt>,
    },
    Exhausted {
        attempts: Vec<NegotiationAttempt>,
    },
}

impl NegotiationOutcome {
    pub fn success(&self) -> bool {
        matches!(self, NegotiationOutcome::Accepted { .. })
    }

    pub fn attempts(&self) -> &[NegotiationAttempt] {
        match self {
            NegotiationOutcome::Accepted { attempts, .. }
            | NegotiationOutcome::Exhausted { attempts } => attempts,
        }
    }

    /// Every violation in attempt order.
    pub fn violations(&self) -> Vec<&ConstraintViolation> {
        self.attempts()
            .iter()
            .filter_map(|a| a.violation.as_ref())
            .collect()
    }

    pub fn last_violation(&self) -> Option<&ConstraintViolation> {
        self.violations().last().copied()
    }
}

pub struct Negotiator<'a> {
    engine: &'a ConstraintEngine,
    prompts: PromptBuilder,
    max_injected_solutions: usize,
}

impl<'a> Negotiator<'a> {
    pub fn new(engine: &'a ConstraintEngine, max_injected_solutions: usize) -> Self {
        Self {
            engine,
            prompts: PromptBuilder::default(),
            max_injected_solutions,
        }
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Negotiate `request.instruction` into tasks.
    ///
    /// Errors are reserved for local failures (prompt rendering, persisting
    /// what was learned); every completion-side problem ends up as a violation.
    #[instrument(skip_all, fields(project = request.project, max_retries = request.max_retries))]
    pub fn negotiate_request(
        &self,
        store: &mut LearningStore,
        completion: &dyn CompletionService,
        request: &NegotiationRequest<'_>,
    ) -> Result<NegotiationOutcome> {
        let complexity = classify_instruction(request.instruction);
        let mut steps = match complexity {
            Complexity::Complex => split_instruction(request.instruction),
            _ => Vec::new(),
        };
        if steps.len() < 2 {
            steps.clear();
        }
        let predicted: Vec<String> = store
            .predicted_solutions(request.project, complexity, self.max_injected_solutions)
            .into_iter()
            .filter_map(|e| e.solution.clone())
            .collect();
        info!(
            complexity = complexity.as_str(),
            sub_steps = steps.len(),
            predicted = predicted.len(),
            "negotiation started"
        );

        let limits = self.engine.limits();
        let mut retry = RetryState::new(request.max_retries);
        let mut retry_prompt: Option<RetryPrompt> = None;
        let mut retry_solution: Option<String> = None;
        let mut attempts = Vec::new();

        loop {
            let mut solutions = predicted.clone();
            if let Some(solution) = retry_solution.take() {
                if !solutions.contains(&solution) {
                    solutions.push(solution);
                }
            }
            let prompt = self.prompts.build(&PromptInputs {
                constraints: self.engine.build_system_prompt(request.constraints),
                project: request.project.to_string(),
                version: request.context.current_version.clone(),
                files: request.context.project_files.clone(),
                total_files: request.context.total_files,
                expected: request.context.expected.clone(),
                solutions,
                retry: retry_prompt.take(),
                instruction: request.instruction.to_string(),
                steps: steps.clone(),
            })?;

            let call = CompletionRequest {
                prompt: prompt.clone(),
                timeout: request.timeout,
            };
            debug!(attempt = retry.attempt, bytes = prompt.len(), "calling completion service");
            let (raw_response, result) = match completion.complete(&call) {
                Ok(raw) => {
                    let result = validate_response(
                        &raw,
                        &request.context.expected,
                        self.engine,
                        request.constraints,
                    );
                    (Some(raw), result)
                }
                Err(err) => (None, Err(completion_violation(&err))),
            };

            let violation = match result {
                Ok(tasks) => {
                    info!(attempt = retry.attempt, tasks = tasks.len(), "negotiation accepted");
                    attempts.push(NegotiationAttempt {
                        retry_index: retry.attempt,
                        instruction: request.instruction.to_string(),
                        prompt,
                        raw_response,
                        violation: None,
                        signature: None,
                    });
                    return Ok(NegotiationOutcome::Accepted { tasks, attempts });
                }
                Err(violation) => violation,
            };

            warn!(
                attempt = retry.attempt,
                kind = violation.kind.as_str(),
                "{}",
                violation.message
            );
            let signature = store.learn_from_error(
                request.project,
                violation.kind.as_str(),
                &violation.message,
                ErrorContext {
                    complexity: Some(complexity),
                    retry_index: retry.attempt,
                    detail: violation.context.clone(),
                },
                remediation_for(violation.kind, limits).as_deref(),
            )?;
            attempts.push(NegotiationAttempt {
                retry_index: retry.attempt,
                instruction: request.instruction.to_string(),
                prompt,
                raw_response,
                violation: Some(violation.clone()),
                signature: Some(signature.clone()),
            });

            let Some(action) = retry.advance(violation.clone(), complexity) else {
                warn!(calls = retry.calls(), "negotiation exhausted retries");
                return Ok(NegotiationOutcome::Exhausted { attempts });
            };
            debug!(action = action.as_str(), attempt = retry.attempt, "retrying");
            if action == RetryAction::Resplit {
                let split = split_instruction(request.instruction);
                if split.len() > 1 {
                    steps = split;
                }
            }
            retry_prompt = Some(RetryPrompt {
                attempt: retry.attempt + 1,
                guidance: action.guidance(&violation, limits),
            });
            retry_solution = store
                .get_error_context_for_retry(request.project, &signature)
                .map(str::to_string);
        }
    }
}

fn completion_violation(err: &CompletionError) -> ConstraintViolation {
    match err {
        CompletionError::TimedOut(timeout) => ConstraintViolation::new(
            "completion.timeout",
            ViolationKind::Timeout,
            err.to_string(),
            json!({ "timeout_secs": timeout.as_secs() }),
        ),
        CompletionError::Failed(_) => ConstraintViolation::new(
            "completion.failed",
            ViolationKind::CompletionFailed,
            err.to_string(),
            json!({}),
        ),
    }
}
