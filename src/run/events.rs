//! Progress events published while a run executes.

use super::RunStatus;
use crate::errors::ErrorTag;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StatusChanged {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        artifacts: Vec<String>,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        attempt: u32,
        tag: ErrorTag,
        message: String,
        will_retry: bool,
    },
    /// One gate round finished, pass or fail.
    GateRated {
        run_id: String,
        step_id: String,
        plan_artifact: String,
        overall_score: f64,
        minimum_score: f64,
        passed: bool,
        round: u32,
    },
    CheckpointSaved {
        run_id: String,
        sequence: u64,
    },
    /// Execution stopped to relieve memory pressure; resume continues it.
    Paused {
        run_id: String,
    },
    Finished {
        run_id: String,
        status: RunStatus,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::StatusChanged { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::GateRated { run_id, .. }
            | RunEvent::CheckpointSaved { run_id, .. }
            | RunEvent::Paused { run_id }
            | RunEvent::Finished { run_id, .. } => run_id,
        }
    }
}
