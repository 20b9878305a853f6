//! Runs: lifecycle state, persistence and coordination.

pub mod driver;
pub mod events;
pub mod manager;
pub mod store;

pub use driver::{DriveOutcome, RunDriver};
pub use events::RunEvent;
pub use manager::{RunHandle, RunManager};
pub use store::{RunLock, RunStore};

use crate::artifact::Artifact;
use crate::errors::{EngineError, ErrorTag, StepError};
use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Metadata keys written by the engine.
pub mod meta {
    pub const INPUTS: &str = "inputs";
    pub const ERROR: &str = "error";
    pub const LAST_ERROR: &str = "last_error";
    pub const AWAITING_GATE: &str = "awaiting_gate";
    pub const APPROVAL: &str = "approval";
    pub const ABORT_REASON: &str = "abort_reason";
    pub const PAUSED: &str = "paused";
    pub const LAST_RATING: &str = "last_rating";
    pub const RESUME_COUNT: &str = "resume_count";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Gated,
    WaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Created => write!(f, "created"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Gated => write!(f, "gated"),
            RunStatus::WaitingApproval => write!(f, "waiting_approval"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

impl RunStatus {
    /// Completed and aborted runs never move again.
    ///
    /// `Failed` is final for the attempt that produced it but not for the
    /// run: it can escalate to `WaitingApproval`, and an explicit resume
    /// moves it back to `Running` from its last valid checkpoint. Only the
    /// status moves; the recorded error is kept under `last_error`. A run
    /// failed by a `reject` decision is refused by the manager.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Running | Failed | Aborted)
                | (Running, Gated | Completed | Failed | Aborted)
                | (Gated, Running | Failed | Aborted)
                | (Failed, WaitingApproval | Running | Aborted)
                | (WaitingApproval, Running | Failed | Aborted)
        )
    }
}

/// The error recorded on a run when a step fails it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub tag: ErrorTag,
    pub step_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl RunError {
    pub fn from_step(step_id: &str, error: &StepError) -> Self {
        Self {
            tag: error.tag(),
            step_id: step_id.to_string(),
            message: error.to_string(),
            feedback: error.feedback(),
        }
    }
}

/// A run record, persisted as `run.json` and inside every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Run {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Created,
            current_step: None,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Move to `next`, rejecting moves the lifecycle does not allow.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.status, to = %next, "Run status changed");
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, error: RunError) {
        if let Ok(value) = serde_json::to_value(&error) {
            self.metadata.insert(meta::ERROR.to_string(), value);
        }
        self.touch();
    }

    pub fn error(&self) -> Option<RunError> {
        self.metadata
            .get(meta::ERROR)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
        self.touch();
    }

    /// Inputs recorded at start.
    pub fn inputs(&self) -> BTreeMap<String, String> {
        self.metadata
            .get(meta::INPUTS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Snapshot returned by `status` queries.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run: Run,
    pub completed_steps: Vec<String>,
    pub pending_steps: Vec<String>,
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_sequence: Option<u64>,
    /// Whether a coordinator currently holds the run lock.
    pub active: bool,
}

/// Operator answer for a run waiting on approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Accept the last plan despite the score and continue.
    Approve,
    /// Reset the rating rounds and plan again.
    Replan,
    /// Fail the run.
    Reject,
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalDecision::Approve => write!(f, "approve"),
            ApprovalDecision::Replan => write!(f, "replan"),
            ApprovalDecision::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for ApprovalDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(ApprovalDecision::Approve),
            "replan" => Ok(ApprovalDecision::Replan),
            "reject" => Ok(ApprovalDecision::Reject),
            _ => bail!(
                "Invalid decision '{}'. Valid values: approve, replan, reject",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_created() {
        let run = Run::new("wf");
        assert_eq!(run.status, RunStatus::Created);
        assert!(uuid::Uuid::parse_str(&run.run_id).is_ok());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut run = Run::new("wf");
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Gated).unwrap();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();
        run.transition(RunStatus::WaitingApproval).unwrap();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Completed).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_moves() {
        let mut run = Run::new("wf");
        run.transition(RunStatus::Aborted).unwrap();
        let err = run.transition(RunStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: RunStatus::Aborted,
                to: RunStatus::Running
            }
        ));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Created.can_transition_to(RunStatus::WaitingApproval));
    }

    #[test]
    fn test_failed_run_resumes_only_through_running() {
        assert!(!RunStatus::Failed.is_terminal());
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Gated));
    }

    #[test]
    fn test_record_error_round_trips() {
        let mut run = Run::new("wf");
        run.record_error(RunError::from_step(
            "gate",
            &StepError::AllProvidersFailed { failures: vec![] },
        ));
        let error = run.error().unwrap();
        assert_eq!(error.tag, ErrorTag::AllProvidersFailed);
        assert_eq!(error.step_id, "gate");
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
    }

    #[test]
    fn test_approval_decision_from_str() {
        assert_eq!("Approve".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Approve);
        assert!("maybe".parse::<ApprovalDecision>().is_err());
    }
}
