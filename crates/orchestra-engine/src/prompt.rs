//! Prompt construction for agent attempts.

use std::fmt::Write as _;

use orchestra_types::Result;

use crate::context::TaskContext;

/// Turns a task context into the prompt sent to the agent.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, context: &TaskContext) -> Result<String>;
}

/// Longest slice of a dependency's output carried into a dependent's prompt.
const MAX_DEPENDENCY_OUTPUT_CHARS: usize = 2_000;

/// Plain-text template: goal, task, dependency outputs, format expectations,
/// then any retry shortfall and human guidance.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptBuilder {
    preamble: Option<String>,
}

impl TemplatePromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text placed before everything else, e.g. house rules for the agent.
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn build(&self, context: &TaskContext) -> Result<String> {
        let task = &context.task;
        let mut prompt = String::new();

        if let Some(preamble) = &self.preamble {
            let _ = writeln!(prompt, "{preamble}\n");
        }
        if !context.project.goal.is_empty() {
            let _ = writeln!(prompt, "Project goal: {}\n", context.project.goal);
        }

        let _ = writeln!(prompt, "Task ({}): {}", task.id, task.title);
        if !task.description.is_empty() {
            let _ = writeln!(prompt, "{}", task.description);
        }

        if !context.dependency_outputs.is_empty() {
            prompt.push_str("\nOutputs of completed prerequisite tasks:\n");
            for dep in &context.dependency_outputs {
                let _ = writeln!(
                    prompt,
                    "- [{}] {}: {}",
                    dep.task_id,
                    dep.title,
                    truncate(&dep.output, MAX_DEPENDENCY_OUTPUT_CHARS)
                );
            }
        }

        if task.expected_format() == Some("json") {
            prompt.push_str("\nRespond with a single valid JSON document.\n");
        }
        let sections = task.required_sections();
        if !sections.is_empty() {
            let _ = writeln!(
                prompt,
                "\nYour response must include these sections: {}",
                sections.join(", ")
            );
        }

        if context.is_retry() {
            let _ = writeln!(
                prompt,
                "\nAttempt {} fell short of the quality bar:",
                context.attempt
            );
            for item in &context.shortfall {
                let _ = writeln!(prompt, "- {item}");
            }
            prompt.push_str("Address every point above in this attempt.\n");
        }

        if let Some(input) = &context.human_input {
            let _ = writeln!(prompt, "\nGuidance from a human reviewer:\n{input}");
        }

        Ok(prompt.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DependencyOutput;
    use orchestra_types::model::meta_keys;
    use orchestra_types::Project;

    fn context() -> TaskContext {
        let mut task = crate::graph::tests::task("api", &["schema"], 1);
        task.title = "Build the API".into();
        task.description = "Expose CRUD endpoints".into();
        TaskContext::new(task, Project::new("p", "Demo").with_goal("Ship the service"))
    }

    #[test]
    fn first_attempt_has_goal_and_task() {
        let prompt = TemplatePromptBuilder::new().build(&context()).unwrap();
        assert!(prompt.starts_with("Project goal: Ship the service"));
        assert!(prompt.contains("Task (api): Build the API"));
        assert!(prompt.contains("Expose CRUD endpoints"));
        assert!(!prompt.contains("fell short"));
    }

    #[test]
    fn dependency_outputs_are_included() {
        let mut ctx = context();
        ctx.dependency_outputs.push(DependencyOutput {
            task_id: "schema".into(),
            title: "Design schema".into(),
            output: "users(id, name)".into(),
        });
        let prompt = TemplatePromptBuilder::new().build(&ctx).unwrap();
        assert!(prompt.contains("- [schema] Design schema: users(id, name)"));
    }

    #[test]
    fn retry_prompt_carries_shortfall() {
        let mut ctx = context();
        ctx.attempt = 1;
        ctx.shortfall = vec!["missing section 'Tests'".into()];
        let prompt = TemplatePromptBuilder::new().build(&ctx).unwrap();
        assert!(prompt.contains("Attempt 1 fell short"));
        assert!(prompt.contains("- missing section 'Tests'"));
    }

    #[test]
    fn human_input_and_format_hints() {
        let mut ctx = context();
        ctx.task
            .metadata
            .insert(meta_keys::EXPECTED_FORMAT.into(), serde_json::json!("json"));
        ctx.task.metadata.insert(
            meta_keys::REQUIRED_SECTIONS.into(),
            serde_json::json!(["Summary", "Tests"]),
        );
        ctx.human_input = Some("Use snake_case keys".into());

        let prompt = TemplatePromptBuilder::new()
            .with_preamble("Be concise.")
            .build(&ctx)
            .unwrap();
        assert!(prompt.starts_with("Be concise."));
        assert!(prompt.contains("single valid JSON document"));
        assert!(prompt.contains("sections: Summary, Tests"));
        assert!(prompt.ends_with("Use snake_case keys"));
    }

    #[test]
    fn long_outputs_truncated() {
        let long = "x".repeat(MAX_DEPENDENCY_OUTPUT_CHARS + 10);
        let cut = truncate(&long, MAX_DEPENDENCY_OUTPUT_CHARS);
        assert!(cut.ends_with("[truncated]"));
        assert_eq!(truncate("short", 10), "short");
    }
}
