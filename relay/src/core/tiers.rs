//! Tier defaults: resolving platform/model for tasks that do not name one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{BackendKind, ExecutionPlan, Tier};

/// Platform and model assigned to a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAssignment {
    pub platform: BackendKind,
    pub model: String,
}

impl TierAssignment {
    fn new(platform: BackendKind, model: &str) -> Self {
        Self {
            platform,
            model: model.to_string(),
        }
    }
}

/// Assignments for each tier under one active backend, plus that backend's
/// routine and fallback models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRow {
    /// Everyday model; invocations already on it never fall back.
    pub routine: String,
    /// Model used for the single retry after an attempt with no output.
    pub fallback: String,
    pub mid: TierAssignment,
    pub top: TierAssignment,
}

impl TierRow {
    pub fn get(&self, tier: Tier) -> &TierAssignment {
        match tier {
            Tier::Mid => &self.mid,
            Tier::Top => &self.top,
        }
    }
}

/// Tier lookup table keyed by the active backend id.
pub type TierTable = BTreeMap<String, TierRow>;

/// Built-in tier table used when the config does not override it.
pub fn default_tier_table() -> TierTable {
    let mut table = TierTable::new();
    table.insert(
        BackendKind::Claude.as_str().to_string(),
        TierRow {
            routine: "sonnet".to_string(),
            fallback: "haiku".to_string(),
            mid: TierAssignment::new(BackendKind::Claude, "sonnet"),
            top: TierAssignment::new(BackendKind::Claude, "opus"),
        },
    );
    table.insert(
        BackendKind::Codex.as_str().to_string(),
        TierRow {
            routine: "gpt-5-codex".to_string(),
            fallback: "gpt-5-mini".to_string(),
            mid: TierAssignment::new(BackendKind::Codex, "gpt-5-codex"),
            top: TierAssignment::new(BackendKind::Codex, "gpt-5"),
        },
    );
    table.insert(
        BackendKind::Gemini.as_str().to_string(),
        TierRow {
            routine: "gemini-2.5-flash".to_string(),
            fallback: "gemini-2.5-flash-lite".to_string(),
            mid: TierAssignment::new(BackendKind::Gemini, "gemini-2.5-flash"),
            top: TierAssignment::new(BackendKind::Gemini, "gemini-2.5-pro"),
        },
    );
    table
}

/// Routine and fallback model for invocations on `platform`.
pub fn fallback_models(table: &TierTable, platform: BackendKind) -> Option<(&str, &str)> {
    table
        .get(platform.as_str())
        .map(|row| (row.routine.as_str(), row.fallback.as_str()))
}

/// Fill missing `platform`/`model` on every task.
///
/// Plan-level defaults (set while selecting a model) win over the tier table;
/// explicit per-task values are never touched. Tasks stay unresolved only when
/// the table has no row for `active`.
pub fn apply_tier_defaults(plan: &mut ExecutionPlan, active: BackendKind, table: &TierTable) {
    let row = table.get(active.as_str());
    let default_platform = plan.default_platform;
    let default_model = plan.default_model.clone();
    for task in &mut plan.tasks {
        let assignment = row.map(|row| row.get(task.tier));
        if task.platform.is_none() {
            task.platform = default_platform.or(assignment.map(|a| a.platform));
        }
        if task.model.is_none() {
            task.model = default_model
                .clone()
                .or_else(|| assignment.map(|a| a.model.clone()));
        }
    }
}
