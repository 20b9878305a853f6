//! Checkpoints: durable snapshots a run can resume from.
//!
//! One file per checkpoint under `<run_dir>/checkpoints/`, numbered by a
//! monotonically increasing sequence. Each file wraps the snapshot with a
//! SHA-256 of its canonical JSON; a file whose hash does not match (torn
//! write, manual edit) is reported as corrupt and never loaded silently.

use crate::artifact::{Artifact, ArtifactRegistry};
use crate::errors::EngineError;
use crate::run::{Run, RunStatus};
use crate::scheduler::StepProgress;
use crate::util::{sha256_hex, write_atomic};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PREFIX: &str = "checkpoint-";

/// The snapshot itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub run: Run,
    #[serde(flatten)]
    pub progress: StepProgress,
    /// Every registered artifact version, in registration order.
    pub artifact_index: Vec<Artifact>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn completed_steps(&self) -> impl Iterator<Item = &str> {
        self.progress.completed_steps.iter().map(String::as_str)
    }
}

/// File envelope: the body plus its hash.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    body: serde_json::Value,
    integrity_hash: String,
}

fn body_hash(body: &serde_json::Value) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(body).context("Failed to encode checkpoint body")?;
    Ok(sha256_hex(&bytes))
}

/// Result of reading one checkpoint file.
#[derive(Debug)]
pub enum CheckpointLoad {
    Valid(Box<Checkpoint>),
    Corrupt { path: PathBuf, reason: String },
}

/// State rebuilt from a checkpoint.
#[derive(Debug)]
pub struct Restored {
    pub run: Run,
    pub progress: StepProgress,
    pub registry: ArtifactRegistry,
    pub sequence: u64,
}

/// Checkpoints of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    run_id: String,
}

impl CheckpointStore {
    pub fn new(run_dir: &Path, run_id: impl Into<String>) -> Self {
        Self {
            dir: run_dir.join("checkpoints"),
            run_id: run_id.into(),
        }
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}{:06}.json", PREFIX, sequence))
    }

    /// Existing checkpoint files, oldest first.
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>, EngineError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::io(&self.dir, e)),
        };
        let mut found: Vec<(u64, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let sequence = name
                    .strip_prefix(PREFIX)?
                    .strip_suffix(".json")?
                    .parse()
                    .ok()?;
                Some((sequence, entry.path()))
            })
            .collect();
        found.sort_by_key(|(sequence, _)| *sequence);
        Ok(found)
    }

    pub fn latest_sequence(&self) -> Result<Option<u64>, EngineError> {
        Ok(self.list()?.last().map(|(sequence, _)| *sequence))
    }

    /// Write a new checkpoint; returns its sequence number.
    pub fn save(
        &self,
        run: &Run,
        progress: &StepProgress,
        registry: &ArtifactRegistry,
    ) -> Result<u64, EngineError> {
        let sequence = self.latest_sequence()?.map_or(1, |s| s + 1);
        let checkpoint = Checkpoint {
            sequence,
            run: run.clone(),
            progress: progress.clone(),
            artifact_index: registry.index().to_vec(),
            saved_at: Utc::now(),
        };
        let body = serde_json::to_value(&checkpoint).context("Failed to encode checkpoint")?;
        let file = CheckpointFile {
            integrity_hash: body_hash(&body)?,
            body,
        };
        let json = serde_json::to_vec_pretty(&file).context("Failed to encode checkpoint")?;
        let path = self.path_for(sequence);
        write_atomic(&path, &json).map_err(|e| EngineError::io(&path, e))?;
        debug!(run_id = %self.run_id, sequence, "Checkpoint saved");
        Ok(sequence)
    }

    /// Read and verify one checkpoint file.
    pub fn load_file(&self, path: &Path) -> Result<CheckpointLoad, EngineError> {
        let corrupt = |reason: String| {
            Ok(CheckpointLoad::Corrupt {
                path: path.to_path_buf(),
                reason,
            })
        };
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let file: CheckpointFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => return corrupt(format!("unparseable: {}", e)),
        };
        if body_hash(&file.body)? != file.integrity_hash {
            return corrupt("integrity hash mismatch".to_string());
        }
        match serde_json::from_value::<Checkpoint>(file.body) {
            Ok(checkpoint) if checkpoint.run.run_id == self.run_id => {
                Ok(CheckpointLoad::Valid(Box::new(checkpoint)))
            }
            Ok(checkpoint) => corrupt(format!("belongs to run {}", checkpoint.run.run_id)),
            Err(e) => corrupt(format!("unreadable body: {}", e)),
        }
    }

    /// The newest checkpoint, verified. Corruption is reported, not skipped.
    pub fn load(&self) -> Result<CheckpointLoad, EngineError> {
        let (_, path) = self
            .list()?
            .pop()
            .ok_or_else(|| EngineError::NoCheckpoint {
                run_id: self.run_id.clone(),
            })?;
        self.load_file(&path)
    }

    /// Newest checkpoint that verifies, walking back past corrupt ones.
    /// `Ok(None)` when the run never checkpointed.
    pub fn load_latest_valid(&self) -> Result<Option<Checkpoint>, EngineError> {
        let files = self.list()?;
        let Some((_, newest)) = files.last().cloned() else {
            return Ok(None);
        };
        for (_, path) in files.iter().rev() {
            match self.load_file(path)? {
                CheckpointLoad::Valid(checkpoint) => return Ok(Some(*checkpoint)),
                CheckpointLoad::Corrupt { path, reason } => {
                    warn!(
                        run_id = %self.run_id,
                        path = %path.display(),
                        reason = %reason,
                        "Skipping corrupt checkpoint"
                    );
                }
            }
        }
        Err(EngineError::CheckpointCorrupt {
            run_id: self.run_id.clone(),
            path: newest,
        })
    }
}

/// Rebuild run state from a checkpoint: the registry is repopulated from the
/// artifact index and the run is marked running again at its last step.
pub fn resume_from(checkpoint: Checkpoint) -> Restored {
    let mut registry = ArtifactRegistry::new(checkpoint.run.run_id.clone());
    for artifact in checkpoint.artifact_index {
        registry.republish(artifact);
    }
    let mut run = checkpoint.run;
    run.status = RunStatus::Running;
    run.touch();
    info!(
        run_id = %run.run_id,
        sequence = checkpoint.sequence,
        completed = checkpoint.progress.completed_steps.len(),
        current_step = ?run.current_step,
        "Restored from checkpoint"
    );
    Restored {
        run,
        progress: checkpoint.progress,
        registry,
        sequence: checkpoint.sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactMeta;

    fn state(dir: &Path) -> (Run, StepProgress, ArtifactRegistry) {
        let mut run = Run::new("wf");
        run.transition(RunStatus::Running).unwrap();
        run.current_step = Some("0.2".into());
        let mut registry = ArtifactRegistry::new(run.run_id.clone());
        let path = dir.join("plan.md");
        std::fs::write(&path, "plan").unwrap();
        registry
            .register(ArtifactMeta {
                name: "plan".into(),
                producing_step: "0.1".into(),
                path,
                schema_ref: None,
            })
            .unwrap();
        registry.validate("plan").unwrap();
        let mut progress = StepProgress::default();
        progress.mark_completed("0.1");
        progress.next_attempt("0.1");
        progress.rating_rounds.insert("0.2".into(), 1);
        (run, progress, registry)
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let (run, progress, registry) = state(dir.path());
        let store = CheckpointStore::new(dir.path(), &run.run_id);

        assert_eq!(store.save(&run, &progress, &registry).unwrap(), 1);
        assert_eq!(store.save(&run, &progress, &registry).unwrap(), 2);

        match store.load().unwrap() {
            CheckpointLoad::Valid(checkpoint) => {
                assert_eq!(checkpoint.sequence, 2);
                assert_eq!(checkpoint.run, run);
                assert_eq!(checkpoint.progress, progress);
                assert_eq!(checkpoint.artifact_index.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_file_layout_has_flat_progress_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (run, progress, registry) = state(dir.path());
        let store = CheckpointStore::new(dir.path(), &run.run_id);
        store.save(&run, &progress, &registry).unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("checkpoints/checkpoint-000001.json")).unwrap(),
        )
        .unwrap();
        assert!(raw["integrity_hash"].is_string());
        assert_eq!(raw["body"]["completed_steps"][0], "0.1");
        assert_eq!(raw["body"]["artifact_index"][0]["name"], "plan");
    }

    #[test]
    fn test_tampered_checkpoint_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (run, progress, registry) = state(dir.path());
        let store = CheckpointStore::new(dir.path(), &run.run_id);
        store.save(&run, &progress, &registry).unwrap();

        let path = dir.path().join("checkpoints/checkpoint-000001.json");
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"0.1\"", "\"0.9\"");
        std::fs::write(&path, tampered).unwrap();

        match store.load().unwrap() {
            CheckpointLoad::Corrupt { reason, .. } => assert!(reason.contains("hash")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            store.load_latest_valid().unwrap_err(),
            EngineError::CheckpointCorrupt { .. }
        ));
    }

    #[test]
    fn test_truncated_newest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let (run, mut progress, registry) = state(dir.path());
        let store = CheckpointStore::new(dir.path(), &run.run_id);
        store.save(&run, &progress, &registry).unwrap();
        progress.mark_completed("0.2");
        store.save(&run, &progress, &registry).unwrap();

        let path = dir.path().join("checkpoints/checkpoint-000002.json");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &content[..content.len() / 2]).unwrap();

        assert!(matches!(store.load().unwrap(), CheckpointLoad::Corrupt { .. }));
        let checkpoint = store.load_latest_valid().unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 1);
        assert!(!checkpoint.progress.is_completed("0.2"));
    }

    #[test]
    fn test_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "r");
        assert!(matches!(
            store.load().unwrap_err(),
            EngineError::NoCheckpoint { .. }
        ));
        assert!(store.load_latest_valid().unwrap().is_none());
    }

    #[test]
    fn test_resume_restores_registry_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let (mut run, progress, registry) = state(dir.path());
        run.transition(RunStatus::Gated).unwrap();
        let store = CheckpointStore::new(dir.path(), &run.run_id);
        store.save(&run, &progress, &registry).unwrap();

        let checkpoint = store.load_latest_valid().unwrap().unwrap();
        let restored = resume_from(checkpoint);
        assert_eq!(restored.run.status, RunStatus::Running);
        assert_eq!(restored.run.current_step.as_deref(), Some("0.2"));
        assert!(restored.registry.resolve("plan").artifact().unwrap().passed());
        assert_eq!(restored.progress.rounds("0.2"), 1);
    }
}
