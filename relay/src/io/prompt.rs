//! Prompt builder for task and chat invocations.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const CHAT_TEMPLATE: &str = include_str!("prompts/chat.md");

/// Droppable task sections, least critical first.
const TASK_DROP_ORDER: &[&str] = &["plan", "completed", "spec"];
/// Droppable chat sections, least critical first.
const CHAT_DROP_ORDER: &[&str] = &["plan", "continuation"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("chat", CHAT_TEMPLATE)
            .expect("chat template should be valid");
        Self { env }
    }

    fn render_task(&self, input: &TaskPromptInputs) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template.render(context! {
            task => &input.task,
            spec_ref => input.spec_ref.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            scope => &input.scope,
            completed => &input.completed,
            plan_overview => (!input.plan_overview.trim().is_empty()).then(|| input.plan_overview.trim()),
            report_file => &input.report_file,
        })?;
        Ok(rendered)
    }

    fn render_chat(&self, input: &ChatPromptInputs) -> Result<String> {
        let template = self.env.get_template("chat")?;
        let rendered = template.render(context! {
            drafting => input.drafting,
            plan_summary => input.plan_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            continuation => input.continuation.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            continuation_path => &input.continuation_path,
            messages => &input.messages,
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
///
/// Empty droppable sections are skipped.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|next| next.start())
            .unwrap_or(rendered.len());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in `drop_order` until under `budget`, then truncate
/// the longest remaining section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in drop_order {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(longest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let before_len = longest.content.len();
    let allowed = before_len.saturating_sub(total - budget);
    truncate_at_char_boundary(&mut longest.content, allowed.saturating_sub(12));
    longest.content.push_str("\n[truncated]");
    debug!(
        section = longest.key,
        before_len,
        after_len = longest.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

/// Task identity shown in the prompt header.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHeader {
    pub id: u32,
    /// 1-based position in the run.
    pub position: usize,
    pub total: usize,
    pub description: String,
}

/// A finished dependency listed for context.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedDep {
    pub id: u32,
    pub description: String,
}

/// Inputs for a dispatched task prompt.
#[derive(Debug, Clone)]
pub struct TaskPromptInputs {
    pub task: TaskHeader,
    pub spec_ref: Option<String>,
    pub scope: Vec<String>,
    pub completed: Vec<CompletedDep>,
    /// Bounded summary of the whole plan.
    pub plan_overview: String,
    /// Report file the agent writes, relative to the project.
    pub report_file: String,
}

/// One operator message as shown to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct ChatLine {
    pub timestamp: String,
    pub text: String,
}

/// Inputs for a conversational prompt.
#[derive(Debug, Clone)]
pub struct ChatPromptInputs {
    pub messages: Vec<ChatLine>,
    pub drafting: bool,
    pub plan_summary: Option<String>,
    /// Tail of the continuation log.
    pub continuation: Option<String>,
    pub continuation_path: String,
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_task(&self, input: &TaskPromptInputs) -> Result<String> {
        let rendered = PromptEngine::new().render_task(input)?;
        Ok(self.fit(&rendered, TASK_DROP_ORDER))
    }

    pub fn build_chat(&self, input: &ChatPromptInputs) -> Result<String> {
        let rendered = PromptEngine::new().render_chat(input)?;
        Ok(self.fit(&rendered, CHAT_DROP_ORDER))
    }

    fn fit(&self, rendered: &str, drop_order: &[&str]) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes, drop_order);
        render_sections(&sections)
    }
}
