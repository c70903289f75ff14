//! Relay configuration stored under `<home>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::classifier::DEFAULT_CODE_EXTENSIONS;
use crate::core::failure::DEFAULT_RATE_LIMIT_MARKERS;
use crate::core::invariants::is_valid_model_id;
use crate::core::tiers::{TierTable, default_tier_table, fallback_models};
use crate::core::types::{BackendKind, ExecutionMode};
use crate::io::fsutil::write_atomic;

pub const ENV_PROJECT_DIR: &str = "RELAY_PROJECT_DIR";
pub const ENV_BACKEND: &str = "RELAY_BACKEND";
pub const ENV_MODEL: &str = "RELAY_MODEL";

/// Relay configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults. Scalar fields come
/// before tables so the file serializes in a valid TOML order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Repository the agent works in.
    pub project_dir: PathBuf,

    /// Active backend; selects the tier table row and the chat backend.
    pub backend: BackendKind,

    /// Model for conversational invocations (falls back to the active
    /// backend's routine model).
    pub default_model: Option<String>,

    /// Execution mode used when approval does not choose one.
    pub mode: ExecutionMode,

    /// Sleep between idle poll ticks.
    pub poll_interval_ms: u64,

    /// Re-check interval while waiting for a continue signal.
    pub continue_poll_interval_ms: u64,

    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub draft_guard: DraftGuardConfig,
    pub tiers: TierTable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Case-insensitive stderr markers for quota/rate-limit failures.
    pub rate_limit_markers: Vec<String>,
    /// Completion report the agent writes, relative to the project dir.
    pub report_file: String,
    /// Reports shorter than this fall back to the output tail.
    pub report_min_bytes: usize,
    pub report_tail_bytes: usize,
    /// Byte budget for rendered prompts before droppable sections go.
    pub prompt_budget_bytes: usize,
    /// Extra CLI flags passed to every backend invocation.
    pub extra_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Branch new sessions are cut from.
    pub trunk_branch: String,
    /// Name of the active session branch.
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DraftGuardConfig {
    /// Extensions reverted while a plan is being drafted.
    pub code_extensions: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            backend: BackendKind::Claude,
            default_model: None,
            mode: ExecutionMode::Step,
            poll_interval_ms: 2_000,
            continue_poll_interval_ms: 1_000,
            agent: AgentConfig::default(),
            session: SessionConfig::default(),
            draft_guard: DraftGuardConfig::default(),
            tiers: default_tier_table(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            output_limit_bytes: 200_000,
            rate_limit_markers: DEFAULT_RATE_LIMIT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
            report_file: "RELAY_REPORT.md".to_string(),
            report_min_bytes: 40,
            report_tail_bytes: 3_000,
            prompt_budget_bytes: 40_000,
            extra_flags: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            trunk_branch: "main".to_string(),
            branch: "relay/session".to_string(),
        }
    }
}

impl Default for DraftGuardConfig {
    fn default() -> Self {
        Self {
            code_extensions: DEFAULT_CODE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.continue_poll_interval_ms == 0 {
            return Err(anyhow!("continue_poll_interval_ms must be > 0"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.agent.rate_limit_markers.is_empty() {
            return Err(anyhow!("agent.rate_limit_markers must be a non-empty array"));
        }
        let report = Path::new(&self.agent.report_file);
        if self.agent.report_file.trim().is_empty() || report.is_absolute() {
            return Err(anyhow!(
                "agent.report_file must be a relative path inside the project"
            ));
        }
        if let Some(model) = &self.default_model {
            check_model("default_model", model)?;
        }
        if self.session.trunk_branch.trim().is_empty() || self.session.branch.trim().is_empty() {
            return Err(anyhow!("session.trunk_branch and session.branch must be set"));
        }
        if self.session.trunk_branch == self.session.branch {
            return Err(anyhow!("session.branch must differ from session.trunk_branch"));
        }
        for (backend, row) in &self.tiers {
            backend
                .parse::<BackendKind>()
                .with_context(|| format!("tiers.{backend}"))?;
            check_model(&format!("tiers.{backend}.routine"), &row.routine)?;
            check_model(&format!("tiers.{backend}.fallback"), &row.fallback)?;
            check_model(&format!("tiers.{backend}.mid.model"), &row.mid.model)?;
            check_model(&format!("tiers.{backend}.top.model"), &row.top.model)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Re-check interval while a step-through run waits for the operator.
    pub fn continue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.continue_poll_interval_ms)
    }

    /// Model used for conversational invocations.
    pub fn chat_model(&self) -> Result<&str> {
        if let Some(model) = self.default_model.as_deref() {
            return Ok(model);
        }
        fallback_models(&self.tiers, self.backend)
            .map(|(routine, _)| routine)
            .ok_or_else(|| {
                anyhow!(
                    "no chat model for backend {}: set default_model or tiers.{}",
                    self.backend,
                    self.backend
                )
            })
    }

    /// Apply `RELAY_PROJECT_DIR`, `RELAY_BACKEND`, `RELAY_MODEL` overrides.
    pub fn apply_env_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) -> Result<()> {
        if let Some(dir) = lookup(ENV_PROJECT_DIR).filter(|v| !v.trim().is_empty()) {
            self.project_dir = PathBuf::from(dir);
        }
        if let Some(backend) = lookup(ENV_BACKEND).filter(|v| !v.trim().is_empty()) {
            self.backend = backend.parse().context(ENV_BACKEND)?;
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.trim().is_empty()) {
            check_model(ENV_MODEL, &model)?;
            self.default_model = Some(model);
        }
        Ok(())
    }
}

fn check_model(field: &str, model: &str) -> Result<()> {
    if !is_valid_model_id(model) {
        return Err(anyhow!("{field}: invalid model id '{model}'"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RelayConfig::default()`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RelayConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RelayConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config and apply process environment overrides.
pub fn load_config_with_env(path: &Path) -> Result<RelayConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RelayConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RelayConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RelayConfig {
            default_model: Some("opus".to_string()),
            mode: ExecutionMode::Auto,
            ..RelayConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "backend = \"codex\"\n[agent]\ntimeout_secs = 90\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend, BackendKind::Codex);
        assert_eq!(cfg.agent.timeout_secs, 90);
        assert_eq!(cfg.agent.report_file, "RELAY_REPORT.md");
        assert_eq!(cfg.chat_model().expect("chat model"), "gpt-5-codex");
    }

    #[test]
    fn rejects_unsafe_model_ids() {
        let mut cfg = RelayConfig::default();
        if let Some(row) = cfg.tiers.get_mut("claude") {
            row.fallback = "haiku && curl evil".to_string();
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_project_backend_and_model() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PROJECT_DIR, "/work/app"),
            (ENV_BACKEND, "gemini"),
            (ENV_MODEL, "gemini-2.5-pro"),
        ]);
        let mut cfg = RelayConfig::default();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(cfg.project_dir, PathBuf::from("/work/app"));
        assert_eq!(cfg.backend, BackendKind::Gemini);
        assert_eq!(cfg.chat_model().expect("chat model"), "gemini-2.5-pro");

        let mut bad = RelayConfig::default();
        let err = bad
            .apply_env_overrides(|key| (key == ENV_MODEL).then(|| "a b".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("invalid model id"));
    }
}
