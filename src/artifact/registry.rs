//! Per-run artifact registry.
//!
//! The registry is an append-only log of artifact versions. Registering a
//! name that already exists adds a new version (`plan@v2`); earlier entries
//! are never touched, so a rating recorded against `plan` stays attached to
//! the content it rated.

use super::cache::ContentCache;
use super::schema::{self, FieldViolation};
use crate::errors::StepError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static VERSIONED_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>.+)@v(?P<version>\d+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Pass,
    Fail,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStatus::Pending => write!(f, "pending"),
            ValidationStatus::Pass => write!(f, "pass"),
            ValidationStatus::Fail => write!(f, "fail"),
        }
    }
}

/// What a step reports about an output it wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub producing_step: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_ref: Option<PathBuf>,
}

/// One registered artifact version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub version: u32,
    pub producing_step: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_ref: Option<PathBuf>,
    pub validation_status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Registry key: the bare name for the first version, `name@vN` after.
    pub fn key(&self) -> String {
        artifact_key(&self.name, self.version)
    }

    pub fn passed(&self) -> bool {
        self.validation_status == ValidationStatus::Pass
    }
}

pub fn artifact_key(name: &str, version: u32) -> String {
    if version <= 1 {
        name.to_string()
    } else {
        format!("{}@v{}", name, version)
    }
}

/// Split a registry key into name and version.
pub fn parse_key(key: &str) -> (&str, u32) {
    match VERSIONED_KEY.captures(key) {
        Some(caps) => {
            let name = caps.name("name").map_or(key, |m| m.as_str());
            let version = caps
                .name("version")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(1);
            (name, version)
        }
        None => (key, 1),
    }
}

/// Outcome of a lookup. A missing artifact is a scheduling state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<'a> {
    Found(&'a Artifact),
    NotFound,
}

impl<'a> Resolved<'a> {
    pub fn artifact(self) -> Option<&'a Artifact> {
        match self {
            Resolved::Found(artifact) => Some(artifact),
            Resolved::NotFound => None,
        }
    }
}

/// Artifact registry owned by exactly one run.
#[derive(Debug)]
pub struct ArtifactRegistry {
    run_id: String,
    entries: Vec<Artifact>,
    /// name -> index of the latest version in `entries`
    latest: HashMap<String, usize>,
    content: Arc<ContentCache>,
}

impl ArtifactRegistry {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
            latest: HashMap::new(),
            content: Arc::new(ContentCache::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Shared content cache, registered with the pressure monitor by the run.
    pub fn content_cache(&self) -> Arc<ContentCache> {
        self.content.clone()
    }

    /// Record a new artifact (or a new version of an existing name) as pending.
    pub fn register(&mut self, meta: ArtifactMeta) -> Result<&Artifact, StepError> {
        let version = match self.latest.get(&meta.name).map(|&i| &self.entries[i]) {
            Some(prev) if prev.validation_status == ValidationStatus::Pending => {
                return Err(StepError::Other(anyhow::anyhow!(
                    "Artifact '{}' is still pending validation; cannot register a new version",
                    prev.key()
                )));
            }
            Some(prev) => prev.version + 1,
            None => 1,
        };

        let artifact = Artifact {
            name: meta.name,
            version,
            producing_step: meta.producing_step,
            path: meta.path,
            schema_ref: meta.schema_ref,
            validation_status: ValidationStatus::Pending,
            violations: Vec::new(),
            created_at: Utc::now(),
        };
        debug!(run_id = %self.run_id, artifact = %artifact.key(), "Registered artifact");
        self.latest.insert(artifact.name.clone(), self.entries.len());
        self.entries.push(artifact);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Re-insert a previously registered artifact as-is (resume path).
    pub fn republish(&mut self, artifact: Artifact) {
        let is_newer = self
            .latest
            .get(&artifact.name)
            .is_none_or(|&i| self.entries[i].version < artifact.version);
        if is_newer {
            self.latest
                .insert(artifact.name.clone(), self.entries.len());
        }
        self.entries.push(artifact);
    }

    /// Latest version of `name`.
    pub fn resolve(&self, name: &str) -> Resolved<'_> {
        match self.latest.get(name) {
            Some(&i) => Resolved::Found(&self.entries[i]),
            None => Resolved::NotFound,
        }
    }

    /// Exact lookup by key (`plan` or `plan@v2`).
    pub fn get(&self, key: &str) -> Option<&Artifact> {
        let (name, version) = parse_key(key);
        self.entries
            .iter()
            .find(|a| a.name == name && a.version == version)
    }

    /// Validate a pending artifact: the file must exist and, when a schema is
    /// declared, satisfy it. Moves the artifact to `pass` or `fail`.
    pub fn validate(&mut self, key: &str) -> Result<&Artifact, StepError> {
        let (name, version) = parse_key(key);
        let index = self
            .entries
            .iter()
            .position(|a| a.name == name && a.version == version)
            .ok_or_else(|| {
                StepError::Other(anyhow::anyhow!("Artifact '{}' is not registered", key))
            })?;

        let (path, schema_ref) = {
            let entry = &self.entries[index];
            (entry.path.clone(), entry.schema_ref.clone())
        };

        let content: Arc<str> = match std::fs::read_to_string(&path) {
            Ok(content) => content.into(),
            Err(_) => {
                self.entries[index].validation_status = ValidationStatus::Fail;
                return Err(StepError::MissingArtifact {
                    artifact: key.to_string(),
                    path,
                });
            }
        };
        self.content.insert(&path, content.clone());

        let violations = match &schema_ref {
            Some(schema_path) => match schema::validate_content(&content, &path, schema_path) {
                Ok(result) => result.violations,
                Err(e) => {
                    self.entries[index].validation_status = ValidationStatus::Fail;
                    return Err(StepError::Other(e));
                }
            },
            None => Vec::new(),
        };

        let entry = &mut self.entries[index];
        if violations.is_empty() {
            entry.validation_status = ValidationStatus::Pass;
            entry.violations.clear();
            debug!(run_id = %self.run_id, artifact = %key, "Artifact validated");
            Ok(&self.entries[index])
        } else {
            warn!(
                run_id = %self.run_id,
                artifact = %key,
                violations = violations.len(),
                "Artifact failed schema validation"
            );
            entry.validation_status = ValidationStatus::Fail;
            entry.violations = violations.clone();
            Err(StepError::SchemaValidation {
                artifact: key.to_string(),
                violations,
            })
        }
    }

    /// Mark a pending artifact as passed without reading it. Used for
    /// operator-approved gate records.
    pub fn mark_passed(&mut self, key: &str) -> Option<&Artifact> {
        let (name, version) = parse_key(key);
        let entry = self
            .entries
            .iter_mut()
            .find(|a| a.name == name && a.version == version)?;
        entry.validation_status = ValidationStatus::Pass;
        Some(entry)
    }

    /// Content of the latest passing version of `name`, read through the cache.
    pub fn read_content(&self, name: &str) -> Result<Arc<str>, StepError> {
        let artifact = self.resolve(name).artifact().ok_or_else(|| {
            StepError::Other(anyhow::anyhow!("Artifact '{}' is not registered", name))
        })?;
        self.content
            .read(&artifact.path)
            .map_err(|_| StepError::MissingArtifact {
                artifact: artifact.key(),
                path: artifact.path.clone(),
            })
    }

    /// Every registered version, in registration order.
    pub fn index(&self) -> &[Artifact] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn meta(name: &str, path: &Path) -> ArtifactMeta {
        ArtifactMeta {
            name: name.to_string(),
            producing_step: "1".to_string(),
            path: path.to_path_buf(),
            schema_ref: None,
        }
    }

    #[test]
    fn test_register_resolve_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.md");
        std::fs::write(&path, "# plan").unwrap();

        let mut registry = ArtifactRegistry::new("run-1");
        assert_eq!(registry.resolve("plan"), Resolved::NotFound);

        let artifact = registry.register(meta("plan", &path)).unwrap();
        assert_eq!(artifact.validation_status, ValidationStatus::Pending);
        assert_eq!(artifact.key(), "plan");

        let artifact = registry.validate("plan").unwrap();
        assert!(artifact.passed());
        assert_eq!(&*registry.read_content("plan").unwrap(), "# plan");
    }

    #[test]
    fn test_missing_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ArtifactRegistry::new("run-1");
        registry
            .register(meta("plan", &dir.path().join("absent.md")))
            .unwrap();
        let err = registry.validate("plan").unwrap_err();
        assert!(matches!(err, StepError::MissingArtifact { .. }));
        assert_eq!(
            registry.resolve("plan").artifact().unwrap().validation_status,
            ValidationStatus::Fail
        );
    }

    #[test]
    fn test_schema_failure_lists_fields() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("s.json");
        std::fs::write(&schema, r#"{"type":"object","required":["goal"]}"#).unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"other": 1}"#).unwrap();

        let mut registry = ArtifactRegistry::new("run-1");
        let mut m = meta("plan", &path);
        m.schema_ref = Some(schema);
        registry.register(m).unwrap();

        match registry.validate("plan").unwrap_err() {
            StepError::SchemaValidation {
                artifact,
                violations,
            } => {
                assert_eq!(artifact, "plan");
                assert_eq!(violations.len(), 1);
                assert!(violations[0].message.contains("goal"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let stored = registry.get("plan").unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Fail);
        assert_eq!(stored.violations.len(), 1);
    }

    #[test]
    fn test_new_versions_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.md");
        std::fs::write(&path, "v1").unwrap();

        let mut registry = ArtifactRegistry::new("run-1");
        registry.register(meta("plan", &path)).unwrap();
        registry.validate("plan").unwrap();

        std::fs::write(&path, "v2").unwrap();
        let second = registry.register(meta("plan", &path)).unwrap();
        assert_eq!(second.key(), "plan@v2");
        registry.validate("plan@v2").unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("plan").artifact().unwrap().version, 2);
        assert_eq!(registry.get("plan").unwrap().version, 1);
        assert!(registry.get("plan").unwrap().passed());
        // Validation refreshed the cached content.
        assert_eq!(&*registry.read_content("plan").unwrap(), "v2");
    }

    #[test]
    fn test_register_while_pending_is_rejected() {
        let mut registry = ArtifactRegistry::new("run-1");
        registry.register(meta("plan", Path::new("/x"))).unwrap();
        assert!(registry.register(meta("plan", Path::new("/x"))).is_err());
    }

    #[test]
    fn test_republish_restores_latest() {
        let mut source = ArtifactRegistry::new("run-1");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, "x").unwrap();
        source.register(meta("a", &path)).unwrap();
        source.validate("a").unwrap();
        source.register(meta("a", &path)).unwrap();
        source.validate("a@v2").unwrap();

        let mut fresh = ArtifactRegistry::new("run-1");
        for artifact in source.index().iter().rev().cloned() {
            fresh.republish(artifact);
        }
        assert_eq!(fresh.resolve("a").artifact().unwrap().version, 2);
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("plan"), ("plan", 1));
        assert_eq!(parse_key("plan@v3"), ("plan", 3));
        assert_eq!(parse_key("odd@name"), ("odd@name", 1));
    }
}
