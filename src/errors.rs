//! Typed error hierarchy for the conductor engine.
//!
//! Two top-level enums cover the two layers of the engine:
//! - `StepError`: failures of a single step attempt (worker, skill, gate, admission)
//! - `EngineError`: run-level failures surfaced by the run manager
//!
//! Both map onto the `ErrorTag` taxonomy that is written into a failed run's
//! `metadata.error` record.

use crate::artifact::FieldViolation;
use crate::gate::{ProviderFailure, RatingResult};
use crate::pressure::PressureLevel;
use crate::run::RunStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Taxonomy tag recorded with every surfaced failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    SchemaValidationError,
    DependencyNotFound,
    AllProvidersFailed,
    QualityBelowThreshold,
    ResourceExhausted,
    CheckpointCorrupt,
    StepTimeout,
    StepProcessError,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorTag::SchemaValidationError => "schema_validation_error",
            ErrorTag::DependencyNotFound => "dependency_not_found",
            ErrorTag::AllProvidersFailed => "all_providers_failed",
            ErrorTag::QualityBelowThreshold => "quality_below_threshold",
            ErrorTag::ResourceExhausted => "resource_exhausted",
            ErrorTag::CheckpointCorrupt => "checkpoint_corrupt",
            ErrorTag::StepTimeout => "step_timeout",
            ErrorTag::StepProcessError => "step_process_error",
            ErrorTag::Cancelled => "cancelled",
            ErrorTag::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Errors from a single step attempt.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Artifact '{artifact}' failed schema validation ({} violation(s))", .violations.len())]
    SchemaValidation {
        artifact: String,
        violations: Vec<FieldViolation>,
    },

    #[error("Declared artifact '{artifact}' was not written to {}", .path.display())]
    MissingArtifact { artifact: String, path: PathBuf },

    #[error("All {} rating provider(s) failed", .failures.len())]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    #[error(
        "Plan scored {:.2}, below the minimum of {:.2}",
        .result.overall_score,
        .result.minimum_score
    )]
    QualityBelowThreshold { result: Box<RatingResult> },

    #[error(
        "Not enough memory to spawn a worker: {available_bytes} bytes free, {required_bytes} required (pressure {level})"
    )]
    ResourceExhausted {
        required_bytes: u64,
        available_bytes: u64,
        level: PressureLevel,
    },

    #[error("Step timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("Worker exited with {}: {stderr}", exit_code_label(.exit_code))]
    Process {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Step was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl StepError {
    /// The taxonomy tag for this error.
    pub fn tag(&self) -> ErrorTag {
        match self {
            StepError::SchemaValidation { .. } | StepError::MissingArtifact { .. } => {
                ErrorTag::SchemaValidationError
            }
            StepError::AllProvidersFailed { .. } => ErrorTag::AllProvidersFailed,
            StepError::QualityBelowThreshold { .. } => ErrorTag::QualityBelowThreshold,
            StepError::ResourceExhausted { .. } => ErrorTag::ResourceExhausted,
            StepError::Timeout { .. } => ErrorTag::StepTimeout,
            StepError::Process { .. } => ErrorTag::StepProcessError,
            StepError::Cancelled => ErrorTag::Cancelled,
            StepError::Other(_) => ErrorTag::Internal,
        }
    }

    /// Whether the step's retry policy may re-run the step after this error.
    ///
    /// Infrastructure failures (`AllProvidersFailed`, `ResourceExhausted`) and
    /// quality failures never go through the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::SchemaValidation { .. }
                | StepError::MissingArtifact { .. }
                | StepError::Timeout { .. }
                | StepError::Process { .. }
        )
    }

    /// Aggregated provider feedback for quality failures.
    pub fn feedback(&self) -> Option<String> {
        match self {
            StepError::QualityBelowThreshold { result } => Some(result.aggregated_feedback()),
            _ => None,
        }
    }
}

/// Errors from the run manager and its persistence layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Run cannot move from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Run {run_id} is already being coordinated by another process")]
    RunLocked { run_id: String },

    #[error("Checkpoint for run {run_id} is corrupt: {}", .path.display())]
    CheckpointCorrupt { run_id: String, path: PathBuf },

    #[error("Run {run_id} has no checkpoint to resume from")]
    NoCheckpoint { run_id: String },

    #[error("Step {step_id} failed: {source}")]
    Step {
        step_id: String,
        #[source]
        source: StepError,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// The taxonomy tag for this error.
    pub fn tag(&self) -> ErrorTag {
        match self {
            EngineError::CheckpointCorrupt { .. } | EngineError::NoCheckpoint { .. } => {
                ErrorTag::CheckpointCorrupt
            }
            EngineError::Step { source, .. } => source.tag(),
            _ => ErrorTag::Internal,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}
