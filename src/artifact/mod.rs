//! Artifacts: named, schema-validated step outputs.
//!
//! Every run owns one [`ArtifactRegistry`]. Steps report what they wrote as
//! [`ArtifactMeta`]; the run registers and validates each output before the
//! step counts as complete, and the scheduler consults the registry before
//! dispatching anything downstream.

pub mod cache;
pub mod registry;
pub mod schema;

pub use cache::ContentCache;
pub use registry::{
    Artifact, ArtifactMeta, ArtifactRegistry, Resolved, ValidationStatus, artifact_key, parse_key,
};
pub use schema::{FieldViolation, ValidationResult, validate_content};
