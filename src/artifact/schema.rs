//! JSON Schema validation of artifact content.

use anyhow::{Context, Result, anyhow};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One schema violation, addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// JSON pointer of the offending value; `/` for the document root.
    pub path: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of checking one artifact against its schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub violations: Vec<FieldViolation>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Parse artifact content as JSON, or YAML for `.yaml`/`.yml` files.
///
/// Content that fails to parse yields a single root violation rather than an
/// error, so a malformed artifact is reported like any other schema failure.
pub fn parse_document(content: &str, artifact_path: &Path) -> Result<serde_json::Value, FieldViolation> {
    let is_yaml = matches!(
        artifact_path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(content)
            .map_err(|e| FieldViolation::new("/", format!("not valid YAML: {}", e)))
    } else {
        serde_json::from_str(content)
            .map_err(|e| FieldViolation::new("/", format!("not valid JSON: {}", e)))
    }
}

/// Validate `content` (read from `artifact_path`) against the schema file.
///
/// Errors only when the schema itself cannot be loaded or compiled.
pub fn validate_content(
    content: &str,
    artifact_path: &Path,
    schema_path: &Path,
) -> Result<ValidationResult> {
    let raw = std::fs::read_to_string(schema_path)
        .with_context(|| format!("Failed to read schema {}", schema_path.display()))?;
    let schema: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Schema {} is not valid JSON", schema_path.display()))?;
    let compiled = JSONSchema::compile(&schema)
        .map_err(|e| anyhow!("Schema {} does not compile: {}", schema_path.display(), e))?;

    let instance = match parse_document(content, artifact_path) {
        Ok(value) => value,
        Err(violation) => {
            return Ok(ValidationResult {
                violations: vec![violation],
            });
        }
    };

    let violations = match compiled.validate(&instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|err| {
                let pointer = err.instance_path.to_string();
                let path = if pointer.is_empty() { "/".to_string() } else { pointer };
                FieldViolation::new(path, err.to_string())
            })
            .collect(),
    };
    Ok(ValidationResult { violations })
}
