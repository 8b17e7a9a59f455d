use anyhow::{anyhow, Result};
use blindlab_core::{atomic_write_json_pretty, ensure_dir};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operator cancellation shared by the orchestrator and dispatch workers.
///
/// Besides in-process [`CancelToken::cancel`], a token bound to a control file
/// trips once a `stop` action is written there (see [`request_stop`]).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    control_path: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_file(path: &Path) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            control_path: Some(path.to_path_buf()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.control_path {
            if stop_requested(path) {
                self.cancel();
                return true;
            }
        }
        false
    }
}

pub fn write_control_action(path: &Path, action: &str, requested_by: &str) -> Result<()> {
    let payload = json!({
        "schema_version": "run_control_v1",
        "action": action,
        "requested_at": Utc::now().to_rfc3339(),
        "requested_by": requested_by,
    });
    atomic_write_json_pretty(path, &payload)
}

/// Resets the control file to `continue` at the start of a run so a stale stop
/// from an earlier invocation does not cancel it.
pub fn reset_control(path: &Path) -> Result<()> {
    write_control_action(path, "continue", "run_loop")
}

pub fn request_stop(path: &Path) -> Result<()> {
    write_control_action(path, "stop", "blindlab_stop")
}

fn stop_requested(path: &Path) -> bool {
    let Ok(bytes) = fs::read(path) else {
        return false;
    };
    serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(|a| a == "stop"))
        .unwrap_or(false)
}

#[derive(Debug)]
pub struct RunOperationLock {
    path: PathBuf,
}

impl Drop for RunOperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Single-writer lock on a run directory, held for the duration of any
/// command that mutates batch artifacts.
pub fn acquire_run_operation_lock(lock_path: &Path) -> Result<RunOperationLock> {
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(RunOperationLock {
                path: lock_path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "operation_in_progress: run directory is locked by another invocation ({})",
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "blindlab_control_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn control_file_stop_trips_token() {
        let root = temp_root("stop");
        let path = root.join("run_control.json");
        let token = CancelToken::with_control_file(&path);
        assert!(!token.is_cancelled());
        reset_control(&path).expect("reset");
        assert!(!token.is_cancelled());
        request_stop(&path).expect("stop");
        assert!(token.is_cancelled());
        // Latched even after the file is reset.
        reset_control(&path).expect("reset");
        assert!(token.is_cancelled());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn clones_share_cancellation() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn run_operation_lock_is_exclusive() {
        let root = temp_root("lock");
        let lock_path = root.join("runtime").join("operation.lock");
        let lock1 = acquire_run_operation_lock(&lock_path).expect("first lock must succeed");
        let err = acquire_run_operation_lock(&lock_path).expect_err("second lock must fail");
        assert!(
            err.to_string().contains("operation_in_progress"),
            "unexpected lock error: {}",
            err
        );
        drop(lock1);
        let lock2 = acquire_run_operation_lock(&lock_path).expect("lock should be re-acquirable");
        drop(lock2);
        let _ = fs::remove_dir_all(root);
    }
}
