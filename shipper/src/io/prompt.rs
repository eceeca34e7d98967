//! Negotiation prompt rendering.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::ExpectedTask;

const NEGOTIATION_TEMPLATE: &str = include_str!("prompts/negotiation.md");

/// Default prompt size before the project listing is removed.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 32_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern should be valid")
});

/// Retry details for the second and later attempts.
#[derive(Debug, Clone, Serialize)]
pub struct RetryPrompt {
    pub attempt: u32,
    pub guidance: String,
}

/// Everything one negotiation prompt is rendered from.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub constraints: String,
    pub project: String,
    pub version: Option<String>,
    pub files: Vec<String>,
    pub total_files: usize,
    pub expected: Vec<ExpectedTask>,
    pub solutions: Vec<String>,
    pub retry: Option<RetryPrompt>,
    pub instruction: String,
    /// Ordered sub-instructions for a split instruction.
    pub steps: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExpectedContext<'a> {
    kind: Option<&'static str>,
    filename: Option<&'a str>,
}

#[derive(Debug)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders prompts within a byte budget. Only the project listing is
/// droppable; learned solutions always reach the completion service.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("negotiation", NEGOTIATION_TEMPLATE)
            .expect("negotiation template should be valid");
        Self { env, budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<String> {
        let expected: Vec<ExpectedContext<'_>> = input
            .expected
            .iter()
            .map(|task| ExpectedContext {
                kind: task.task_type.map(|t| t.as_str()),
                filename: task.filename.as_deref(),
            })
            .collect();
        let template = self.env.get_template("negotiation")?;
        let rendered = template.render(context! {
            constraints => input.constraints.trim(),
            project => input.project,
            version => input.version,
            files => input.files,
            omitted => input.total_files.saturating_sub(input.files.len()),
            expected => expected,
            solutions => input.solutions,
            retry => input.retry,
            instruction => input.instruction.trim(),
            steps => input.steps,
        })?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    while total(sections) > budget {
        let Some(idx) = sections.iter().position(|s| !s.required) else {
            break;
        };
        debug!(
            section = %sections[idx].key,
            bytes = sections[idx].content.len(),
            "dropped prompt section"
        );
        sections.remove(idx);
    }
    if total(sections) > budget {
        warn!(bytes = total(sections), budget, "prompt exceeds budget after dropping sections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskType;

    fn inputs() -> PromptInputs {
        PromptInputs {
            constraints: "- [output.json_only] Reply with JSON only.".to_string(),
            project: "site".to_string(),
            version: Some("3.0.61".to_string()),
            files: vec!["README.md".to_string(), "src/lib.rs".to_string()],
            total_files: 5,
            expected: vec![ExpectedTask {
                id: None,
                task_type: Some(TaskType::CreateFile),
                filename: Some("src/util.rs".to_string()),
            }],
            solutions: vec!["Return at most 3 tasks.".to_string()],
            retry: None,
            instruction: "Add a slug helper".to_string(),
            steps: Vec::new(),
        }
    }

    /// Sections render in a fixed order with the instruction last.
    #[test]
    fn sections_render_in_order() {
        let prompt = PromptBuilder::default().build(&inputs()).expect("render");
        let constraints = prompt.find("<constraints>").expect("constraints");
        let project = prompt.find("<project name=\"site\" version=\"3.0.61\">").expect("project");
        let expected = prompt.find("1. create_file on `src/util.rs`").expect("expected");
        let solutions = prompt.find("- Return at most 3 tasks.").expect("solutions");
        let instruction = prompt.find("<instruction>").expect("instruction");
        assert!(constraints < project);
        assert!(project < expected);
        assert!(expected < solutions);
        assert!(solutions < instruction);
        assert!(prompt.contains("... 3 more files not listed"));
        assert!(!prompt.contains("<retry"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn retry_guidance_and_sub_steps_render() {
        let mut input = inputs();
        input.retry = Some(RetryPrompt {
            attempt: 2,
            guidance: "Work through the numbered sub-steps below.".to_string(),
        });
        input.steps = vec!["Add the helper".to_string(), "Document it".to_string()];
        let prompt = PromptBuilder::default().build(&input).expect("render");
        let retry = prompt.find("<retry attempt=\"2\">").expect("retry");
        let steps = prompt.find("1. Add the helper\n2. Document it").expect("steps");
        assert!(retry < steps);
    }

    /// Over budget, the file listing goes first and required sections stay.
    #[test]
    fn budget_drops_project_listing_first() {
        let mut input = inputs();
        input.files = (0..200).map(|i| format!("src/generated/file_{i}.rs")).collect();
        input.total_files = 200;
        let prompt = PromptBuilder::new(1_000).build(&input).expect("render");
        assert!(!prompt.contains("<project"));
        assert!(prompt.contains("<learned_solutions>"));
        assert!(prompt.contains("<constraints>"));
        assert!(prompt.contains("Add a slug helper"));
    }

    #[test]
    fn learned_solutions_survive_an_oversized_instruction() {
        let mut input = inputs();
        input.instruction = "Rewrite the landing page copy. ".repeat(1_200);
        assert!(input.instruction.len() > DEFAULT_PROMPT_BUDGET_BYTES);
        let prompt = PromptBuilder::default().build(&input).expect("render");
        assert!(prompt.contains("- Return at most 3 tasks."));
        assert!(!prompt.contains("<project"));
        assert!(prompt.contains("<expected_tasks>"));
    }
}
