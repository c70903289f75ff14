//! Plan load/save helpers with schema + invariant validation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::fsutil::{remove_if_exists, write_json_atomic};
use super::schema::{PLAN_SCHEMA, load_record};
use crate::core::invariants::validate_plan;
use crate::core::types::ExecutionPlan;

/// The single active plan (`state/plan.json`).
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the plan. `None` if no plan exists.
    pub fn load(&self) -> Result<Option<ExecutionPlan>> {
        let Some(plan) = load_plan_file(&self.path)? else {
            return Ok(None);
        };
        debug!(status = plan.status.as_str(), tasks = plan.tasks.len(), "plan loaded");
        Ok(Some(plan))
    }

    /// Load the plan, failing if none exists.
    pub fn require(&self) -> Result<ExecutionPlan> {
        self.load()?
            .ok_or_else(|| anyhow!("no plan at {}", self.path.display()))
    }

    /// Validate invariants, then replace the plan atomically.
    pub fn save(&self, plan: &ExecutionPlan) -> Result<()> {
        check_plan(plan)?;
        write_json_atomic(&self.path, plan)
            .with_context(|| format!("write plan {}", self.path.display()))
    }

    /// Remove the plan; idempotent.
    pub fn clear(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }
}

/// Read a plan from any file (the planning step's hand-off).
pub fn load_plan_file(path: &Path) -> Result<Option<ExecutionPlan>> {
    let Some(plan) = load_record::<ExecutionPlan>(path, PLAN_SCHEMA, "plan")? else {
        return Ok(None);
    };
    check_plan(&plan).with_context(|| format!("plan {}", path.display()))?;
    Ok(Some(plan))
}

fn check_plan(plan: &ExecutionPlan) -> Result<()> {
    let errors = validate_plan(plan);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("plan invariants failed: {}", errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PlanStatus, TaskStatus};
    use crate::test_support::{plan_with, task};
    use std::fs;

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(temp.path().join("plan.json"));
        let mut plan = plan_with(vec![task(1, &[]), task(2, &[1])]);
        plan.tasks[0].status = Some(TaskStatus::Done);

        store.save(&plan).expect("save");
        assert_eq!(store.load().expect("load"), Some(plan));
    }

    #[test]
    fn missing_plan_loads_as_none_and_clear_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(temp.path().join("plan.json"));
        assert_eq!(store.load().expect("load"), None);
        assert!(store.require().is_err());
        assert!(!store.clear().expect("clear"));
        store.save(&plan_with(vec![task(1, &[])])).expect("save");
        assert!(store.clear().expect("clear"));
        assert!(!store.path().exists());
    }

    #[test]
    fn save_rejects_forward_dependencies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(temp.path().join("plan.json"));
        let plan = plan_with(vec![task(1, &[2]), task(2, &[])]);
        let err = store.save(&plan).unwrap_err();
        assert!(err.to_string().contains("plan invariants failed"));
        assert!(!store.path().exists());
    }

    #[test]
    fn load_rejects_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(
            &path,
            r#"{"version":1,"status":"approved","tasks":[{"id":1,"description":"x","difficulty":9}]}"#,
        )
        .expect("write");
        assert!(PlanStore::new(&path).load().is_err());
    }

    #[test]
    fn hand_written_plan_without_statuses_loads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("incoming.json");
        fs::write(
            &path,
            r#"{"version":1,"status":"pending_review","tasks":[
                {"id":1,"description":"scaffold","difficulty":2},
                {"id":2,"description":"wire up","difficulty":4,"tier":"top","deps":[1]}
            ]}"#,
        )
        .expect("write");
        let plan = load_plan_file(&path).expect("load").expect("present");
        assert_eq!(plan.status, PlanStatus::PendingReview);
        assert_eq!(plan.tasks[1].deps, vec![1]);
    }
}
