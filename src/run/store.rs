//! On-disk layout of runs.
//!
//! ```text
//! <state_dir>/<run_id>/
//!   run.json          run record, rewritten on every status change
//!   workflow.json     workflow frozen at start
//!   .lock             held by the coordinating process
//!   abort.request     written by `abort` from another process
//!   artifacts/  plans/  logs/  checkpoints/
//! ```

use super::Run;
use crate::errors::EngineError;
use crate::util::write_atomic;
use crate::workflow::WorkflowDef;
use anyhow::Context;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RUN_FILE: &str = "run.json";
const WORKFLOW_FILE: &str = "workflow.json";
const LOCK_FILE: &str = ".lock";
const ABORT_FILE: &str = "abort.request";
const SUBDIRS: [&str; 4] = ["artifacts", "plans", "logs", "checkpoints"];

/// Exclusive coordinator lock on one run. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    state_dir: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(run_id)
    }

    /// Lay out a new run directory and persist its record and workflow.
    pub fn create(&self, run: &Run, workflow: &WorkflowDef) -> Result<PathBuf, EngineError> {
        let run_dir = self.run_dir(&run.run_id);
        for sub in SUBDIRS {
            let dir = run_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        }
        let json = serde_json::to_vec_pretty(workflow).context("Failed to serialize workflow")?;
        let path = run_dir.join(WORKFLOW_FILE);
        write_atomic(&path, &json).map_err(|e| EngineError::io(&path, e))?;
        self.save_run(run)?;
        Ok(run_dir)
    }

    pub fn save_run(&self, run: &Run) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(run).context("Failed to serialize run")?;
        let path = self.run_dir(&run.run_id).join(RUN_FILE);
        write_atomic(&path, &json).map_err(|e| EngineError::io(&path, e))
    }

    pub fn load_run(&self, run_id: &str) -> Result<Run, EngineError> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(EngineError::io(&path, e)),
        };
        let run = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(run)
    }

    pub fn load_workflow(&self, run_id: &str) -> Result<WorkflowDef, EngineError> {
        let path = self.run_dir(run_id).join(WORKFLOW_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
        WorkflowDef::parse_json(&content)
    }

    /// Take the coordinator lock, failing fast when another process holds it.
    pub fn lock(&self, run_id: &str) -> Result<RunLock, EngineError> {
        let path = self.run_dir(run_id).join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| EngineError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| EngineError::RunLocked {
                run_id: run_id.to_string(),
            })?;
        Ok(RunLock { file, path })
    }

    /// Whether some coordinator currently holds the lock.
    pub fn is_locked(&self, run_id: &str) -> bool {
        let path = self.run_dir(run_id).join(LOCK_FILE);
        let Ok(file) = File::open(&path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn request_abort(&self, run_id: &str, reason: &str) -> Result<(), EngineError> {
        let path = self.run_dir(run_id).join(ABORT_FILE);
        write_atomic(&path, reason.as_bytes()).map_err(|e| EngineError::io(&path, e))
    }

    /// Pending abort request, if any.
    pub fn abort_request(&self, run_id: &str) -> Option<String> {
        std::fs::read_to_string(self.run_dir(run_id).join(ABORT_FILE))
            .ok()
            .map(|reason| reason.trim().to_string())
    }

    pub fn clear_abort(&self, run_id: &str) {
        let path = self.run_dir(run_id).join(ABORT_FILE);
        if path.exists()
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %e, "Failed to remove abort request");
        }
    }

    /// Every run under the state directory, oldest first. Unreadable entries
    /// are skipped.
    pub fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::io(&self.state_dir, e)),
        };
        let mut runs = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().join(RUN_FILE).exists() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            match self.load_run(&run_id) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable run"),
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;

    fn workflow() -> WorkflowDef {
        WorkflowDef::parse_yaml("id: wf\nsteps:\n  - { id: a, kind: skill-invoke, skill: emit }\n")
            .unwrap()
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let run = Run::new("wf");
        let run_dir = store.create(&run, &workflow()).unwrap();
        for sub in SUBDIRS {
            assert!(run_dir.join(sub).is_dir());
        }
        assert_eq!(store.load_run(&run.run_id).unwrap(), run);
        assert_eq!(store.load_workflow(&run.run_id).unwrap().id, "wf");
    }

    #[test]
    fn test_missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert!(matches!(
            store.load_run("nope").unwrap_err(),
            EngineError::RunNotFound { .. }
        ));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let run = Run::new("wf");
        store.create(&run, &workflow()).unwrap();

        assert!(!store.is_locked(&run.run_id));
        let lock = store.lock(&run.run_id).unwrap();
        assert!(store.is_locked(&run.run_id));
        assert!(matches!(
            store.lock(&run.run_id).unwrap_err(),
            EngineError::RunLocked { .. }
        ));
        drop(lock);
        assert!(store.lock(&run.run_id).is_ok());
    }

    #[test]
    fn test_abort_request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let run = Run::new("wf");
        store.create(&run, &workflow()).unwrap();
        assert!(store.abort_request(&run.run_id).is_none());
        store.request_abort(&run.run_id, "operator").unwrap();
        assert_eq!(store.abort_request(&run.run_id).as_deref(), Some("operator"));
        store.clear_abort(&run.run_id);
        assert!(store.abort_request(&run.run_id).is_none());
    }

    #[test]
    fn test_list_runs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let first = Run::new("wf");
        store.create(&first, &workflow()).unwrap();
        let mut second = Run::new("wf");
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        second.transition(RunStatus::Running).unwrap();
        store.create(&second, &workflow()).unwrap();
        std::fs::create_dir_all(dir.path().join("stray")).unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, first.run_id);
        assert_eq!(runs[1].status, RunStatus::Running);
    }
}
