//! File-based signals: the continue signal and the plan-drafting marker.
//!
//! Both are presence-only files in the state directory; the frontend (or the
//! CLI) creates them and relay consumes them.

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use notify::{Event as NotifyEvent, RecursiveMode, Watcher};
use serde_json::json;
use tracing::{debug, info, warn};

use super::dispatch_store::DispatchStore;
use super::fsutil::{remove_if_exists, write_json_atomic};
use super::init::RelayPaths;
use crate::core::types::PlanStatus;

/// Ask a paused step-through run to proceed.
pub fn request_continue(paths: &RelayPaths) -> Result<()> {
    write_marker(&paths.continue_path)
}

/// Remove the continue signal; returns whether it was present.
pub fn consume_continue(paths: &RelayPaths) -> Result<bool> {
    remove_if_exists(&paths.continue_path)
}

pub fn set_drafting(paths: &RelayPaths) -> Result<()> {
    write_marker(&paths.drafting_path)
}

pub fn clear_drafting(paths: &RelayPaths) -> Result<bool> {
    remove_if_exists(&paths.drafting_path)
}

pub fn is_drafting(paths: &RelayPaths) -> bool {
    paths.drafting_path.is_file()
}

fn write_marker(path: &Path) -> Result<()> {
    write_json_atomic(path, &json!({ "created_at": Utc::now().to_rfc3339() }))
}

/// Why the continue-wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The operator asked to continue (signal consumed).
    Continue,
    Stopped,
    Completed,
    /// The dispatch run was deleted or became unreadable.
    Removed,
}

/// Block until a continue signal appears or the dispatch run ends.
///
/// There is no overall timeout. A filesystem watcher on the state directory
/// wakes the wait early; `recheck` bounds the latency when events are missed.
pub fn wait_for_continue(paths: &RelayPaths, recheck: Duration) -> Result<WaitOutcome> {
    let (tx, rx) = mpsc::channel::<()>();
    let watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    });
    let _watcher = match watcher {
        Ok(mut watcher) => match watcher.watch(&paths.state_dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(err) => {
                warn!(err = %err, "state watcher unavailable, polling");
                None
            }
        },
        Err(err) => {
            warn!(err = %err, "state watcher unavailable, polling");
            None
        }
    };

    let store = DispatchStore::new(&paths.dispatch_path);
    info!("waiting for continue signal");
    loop {
        if let Some(outcome) = check_wait(paths, &store)? {
            debug!(?outcome, "continue wait finished");
            return Ok(outcome);
        }
        match rx.recv_timeout(recheck) {
            Ok(()) => {
                while rx.try_recv().is_ok() {}
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(recheck),
        }
    }
}

fn check_wait(paths: &RelayPaths, store: &DispatchStore) -> Result<Option<WaitOutcome>> {
    let run = match store.load() {
        Ok(Some(run)) => run,
        Ok(None) => return Ok(Some(WaitOutcome::Removed)),
        Err(err) => {
            warn!(err = %err, "dispatch run unreadable during wait");
            return Ok(Some(WaitOutcome::Removed));
        }
    };
    match run.status {
        PlanStatus::Stopped => return Ok(Some(WaitOutcome::Stopped)),
        PlanStatus::Completed => return Ok(Some(WaitOutcome::Completed)),
        _ => {}
    }
    if consume_continue(paths)? {
        return Ok(Some(WaitOutcome::Continue));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dispatch_run, dispatch_task};
    use std::thread;

    fn setup() -> (tempfile::TempDir, RelayPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(temp.path().join(".relay"));
        std::fs::create_dir_all(&paths.state_dir).expect("mkdir");
        DispatchStore::new(&paths.dispatch_path)
            .save(&dispatch_run(vec![dispatch_task(1, &[])]))
            .expect("save run");
        (temp, paths)
    }

    #[test]
    fn drafting_marker_round_trip() {
        let (_temp, paths) = setup();
        assert!(!is_drafting(&paths));
        set_drafting(&paths).expect("set");
        assert!(is_drafting(&paths));
        assert!(clear_drafting(&paths).expect("clear"));
        assert!(!is_drafting(&paths));
    }

    #[test]
    fn pending_signal_is_consumed_immediately() {
        let (_temp, paths) = setup();
        request_continue(&paths).expect("signal");
        let outcome = wait_for_continue(&paths, Duration::from_millis(20)).expect("wait");
        assert_eq!(outcome, WaitOutcome::Continue);
        assert!(!paths.continue_path.exists());
    }

    /// A signal written while the wait blocks wakes it.
    #[test]
    fn wait_wakes_on_later_signal() {
        let (_temp, paths) = setup();
        let writer_paths = paths.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            request_continue(&writer_paths).expect("signal");
        });
        let outcome = wait_for_continue(&paths, Duration::from_millis(50)).expect("wait");
        writer.join().expect("join");
        assert_eq!(outcome, WaitOutcome::Continue);
    }

    #[test]
    fn wait_ends_when_run_is_stopped_or_removed() {
        let (_temp, paths) = setup();
        let store = DispatchStore::new(&paths.dispatch_path);
        let mut run = store.load().expect("load").expect("present");
        run.status = PlanStatus::Stopped;
        store.save(&run).expect("save");
        assert_eq!(
            wait_for_continue(&paths, Duration::from_millis(20)).expect("wait"),
            WaitOutcome::Stopped
        );

        store.clear().expect("clear");
        assert_eq!(
            wait_for_continue(&paths, Duration::from_millis(20)).expect("wait"),
            WaitOutcome::Removed
        );
    }
}
