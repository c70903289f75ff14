//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{DispatchRun, ExecutionPlan, RECORD_VERSION};

static MODEL_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/@-]{0,127}$").expect("model id regex is valid")
});

/// True if `model` is safe to pass to a backend CLI.
pub fn is_valid_model_id(model: &str) -> bool {
    MODEL_ID_RE.is_match(model)
}

/// Check plan invariants:
/// - `version` matches the supported record version
/// - No duplicate task ids
/// - Every dependency references an existing, lower-numbered task (so the graph is a DAG)
/// - `difficulty` within `1..=5`
/// - Explicit model ids use the safe character class
pub fn validate_plan(plan: &ExecutionPlan) -> Vec<String> {
    let mut errors = Vec::new();
    check_version(plan.version, &mut errors);
    let edges: Vec<(u32, &[u32])> = plan
        .tasks
        .iter()
        .map(|task| (task.id, task.deps.as_slice()))
        .collect();
    check_graph(&edges, &mut errors);

    for task in &plan.tasks {
        if !(1..=5).contains(&task.difficulty) {
            errors.push(format!(
                "task {}: difficulty {} outside 1..=5",
                task.id, task.difficulty
            ));
        }
        if let Some(model) = &task.model
            && !is_valid_model_id(model)
        {
            errors.push(format!("task {}: invalid model id '{}'", task.id, model));
        }
    }
    if let Some(model) = &plan.default_model
        && !is_valid_model_id(model)
    {
        errors.push(format!("plan: invalid default model id '{model}'"));
    }
    errors
}

/// Check dispatch run invariants (same graph rules, concrete model ids).
pub fn validate_dispatch(run: &DispatchRun) -> Vec<String> {
    let mut errors = Vec::new();
    check_version(run.version, &mut errors);
    let edges: Vec<(u32, &[u32])> = run
        .tasks
        .iter()
        .map(|task| (task.id, task.deps.as_slice()))
        .collect();
    check_graph(&edges, &mut errors);
    for task in &run.tasks {
        if !is_valid_model_id(&task.model) {
            errors.push(format!("task {}: invalid model id '{}'", task.id, task.model));
        }
    }
    errors
}

fn check_version(version: u32, errors: &mut Vec<String>) {
    if version != RECORD_VERSION {
        errors.push(format!(
            "unsupported record version {version} (expected {RECORD_VERSION})"
        ));
    }
}

fn check_graph(edges: &[(u32, &[u32])], errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for (id, _) in edges {
        if !seen.insert(*id) {
            errors.push(format!("duplicate task id {id}"));
        }
    }
    for (id, deps) in edges {
        for dep in *deps {
            if dep == id {
                errors.push(format!("task {id}: depends on itself"));
            } else if !seen.contains(dep) {
                errors.push(format!("task {id}: unknown dependency {dep}"));
            } else if dep > id {
                errors.push(format!(
                    "task {id}: dependency {dep} must reference a lower-numbered task"
                ));
            }
        }
    }
}
