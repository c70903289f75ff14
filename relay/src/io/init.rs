//! State home layout and `relay init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{RelayConfig, write_config};
use super::fsutil::write_atomic;
use super::queue::MessageQueue;

pub const ENV_HOME: &str = "RELAY_HOME";
pub const DEFAULT_HOME_DIR: &str = ".relay";

/// All canonical paths within a relay state home.
#[derive(Debug, Clone)]
pub struct RelayPaths {
    pub home: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub inbox_path: PathBuf,
    pub outbox_path: PathBuf,
    pub plan_path: PathBuf,
    pub dispatch_path: PathBuf,
    pub continue_path: PathBuf,
    pub drafting_path: PathBuf,
    pub lock_path: PathBuf,
    pub pid_path: PathBuf,
    pub session_path: PathBuf,
    pub continuation_path: PathBuf,
}

impl RelayPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let state_dir = home.join("state");
        Self {
            home: home.clone(),
            state_dir: state_dir.clone(),
            runs_dir: home.join("runs"),
            gitignore_path: home.join(".gitignore"),
            config_path: home.join("config.toml"),
            inbox_path: state_dir.join("inbox.json"),
            outbox_path: state_dir.join("outbox.json"),
            plan_path: state_dir.join("plan.json"),
            dispatch_path: state_dir.join("dispatch.json"),
            continue_path: state_dir.join("continue.json"),
            drafting_path: state_dir.join("drafting.json"),
            lock_path: state_dir.join("relay.lock"),
            pid_path: state_dir.join("agent.pid"),
            session_path: state_dir.join("session.json"),
            continuation_path: state_dir.join("continuation.md"),
        }
    }

    /// Resolve the home from `RELAY_HOME`, falling back to `./.relay`.
    pub fn from_env(cwd: &Path) -> Self {
        match std::env::var(ENV_HOME) {
            Ok(home) if !home.trim().is_empty() => Self::new(cwd.join(home)),
            _ => Self::new(cwd.join(DEFAULT_HOME_DIR)),
        }
    }

    pub fn inbox(&self) -> MessageQueue {
        MessageQueue::new(self.inbox_path.clone())
    }

    pub fn outbox(&self) -> MessageQueue {
        MessageQueue::new(self.outbox_path.clone())
    }
}

/// Options for `init_relay`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing relay-owned files.
    pub force: bool,
}

/// Create the state home with a default config and empty queues.
///
/// Fails if the home already holds a config unless `options.force` is set.
pub fn init_relay(home: &Path, options: &InitOptions) -> Result<RelayPaths> {
    let paths = RelayPaths::new(home);
    if paths.home.exists() && !paths.home.is_dir() {
        return Err(anyhow!(
            "relay init: {} exists but is not a directory",
            paths.home.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "relay init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.runs_dir)?;
    write_atomic(&paths.gitignore_path, RELAY_GITIGNORE)?;
    write_config(&paths.config_path, &RelayConfig::default())?;
    paths.inbox().reset()?;
    paths.outbox().reset()?;
    write_atomic(&paths.continuation_path, CONTINUATION_PLACEHOLDER)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

pub const CONTINUATION_PLACEHOLDER: &str = "# Continuation log\n\n";
const RELAY_GITIGNORE: &str = "state/\nruns/\n";

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies init creates the state directory, config, and empty queues.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join(".relay");

        let paths = init_relay(&home, &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.runs_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert!(paths.inbox_path.is_file());
        assert!(paths.outbox_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            RELAY_GITIGNORE
        );
        assert!(paths.inbox().load().expect("load inbox").is_empty());
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_relay(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_relay(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    /// Re-init with force restores defaults over a customized config.
    #[test]
    fn init_with_force_rewrites_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_relay(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "backend = \"codex\"\n").expect("write custom");

        init_relay(temp.path(), &InitOptions { force: true }).expect("re-init");

        let cfg = crate::io::config::load_config(&paths.config_path).expect("load");
        assert_eq!(cfg, RelayConfig::default());
    }
}
