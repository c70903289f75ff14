//! Dispatch run load/save helpers with schema + invariant validation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::fsutil::{remove_if_exists, write_json_atomic};
use super::schema::{DISPATCH_SCHEMA, load_record};
use crate::core::invariants::validate_dispatch;
use crate::core::types::DispatchRun;

/// The single global dispatch run (`state/dispatch.json`).
#[derive(Debug, Clone)]
pub struct DispatchStore {
    path: PathBuf,
}

impl DispatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<DispatchRun>> {
        let Some(run) = load_record::<DispatchRun>(&self.path, DISPATCH_SCHEMA, "dispatch")? else {
            return Ok(None);
        };
        check_dispatch(&run).with_context(|| format!("dispatch {}", self.path.display()))?;
        Ok(Some(run))
    }

    pub fn save(&self, run: &DispatchRun) -> Result<()> {
        check_dispatch(run)?;
        write_json_atomic(&self.path, run)
            .with_context(|| format!("write dispatch {}", self.path.display()))
    }

    pub fn clear(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }
}

fn check_dispatch(run: &DispatchRun) -> Result<()> {
    let errors = validate_dispatch(run);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("dispatch invariants failed: {}", errors.join("; ")))
}
