//! Workflow document model, loading and validation.

use super::graph::StepGraph;
use crate::errors::EngineError;
use crate::gate::Rubric;
use crate::scheduler::RetryPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static DOTTED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*$").unwrap());
static PLAIN_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

/// Highest security-trigger override accepted on a workflow.
pub const MAX_SECURITY_OVERRIDE: u8 = 3;

/// Risk class of a workflow; sets the base of the gate threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    TimeCritical,
    #[default]
    Standard,
    Critical,
    Security,
}

impl std::fmt::Display for RiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskClass::TimeCritical => write!(f, "time_critical"),
            RiskClass::Standard => write!(f, "standard"),
            RiskClass::Critical => write!(f, "critical"),
            RiskClass::Security => write!(f, "security"),
        }
    }
}

/// Declared task complexity; nudges the gate threshold by one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// A declared output of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    /// Where the step writes the artifact. Relative paths are resolved
    /// against the run directory; default `artifacts/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// JSON Schema the artifact content must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
}

impl OutputSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            schema: None,
        }
    }

    /// Absolute location of this output inside `run_dir`.
    pub fn resolve_path(&self, run_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => run_dir.join(path),
            None => run_dir.join("artifacts").join(&self.name),
        }
    }
}

/// Spawn an external agent worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpawnStep {
    /// Opaque persona id handed to the worker.
    pub agent: String,
    /// Task description; supports `{{input.KEY}}` and `{{feedback}}`.
    pub task: String,
}

/// Run an in-process skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillInvokeStep {
    pub skill: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Rate a plan artifact through the quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateStep {
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default = "default_rubric_ref")]
    pub rubric_ref: String,
    /// Per-provider timeout; falls back to `gate.default_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Explicit threshold; otherwise derived from the workflow's risk profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_score: Option<f64>,
    /// Dependency step whose artifact is rated; defaults to the first dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

fn default_rubric_ref() -> String {
    crate::gate::DEFAULT_RUBRIC.to_string()
}

/// The three step kinds, dispatched statically by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    AgentSpawn(AgentSpawnStep),
    SkillInvoke(SkillInvokeStep),
    Gate(GateStep),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::AgentSpawn(_) => "agent-spawn",
            StepKind::SkillInvoke(_) => "skill-invoke",
            StepKind::Gate(_) => "gate",
        }
    }
}

/// One node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputSpec>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepDef {
    /// Declared outputs, or a single output named after the step.
    pub fn outputs(&self) -> Vec<OutputSpec> {
        if self.outputs.is_empty() {
            vec![OutputSpec::named(&self.id)]
        } else {
            self.outputs.clone()
        }
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs().into_iter().map(|o| o.name).collect()
    }

    pub fn is_gate(&self) -> bool {
        matches!(self.kind, StepKind::Gate(_))
    }

    pub fn as_gate(&self) -> Option<&GateStep> {
        match &self.kind {
            StepKind::Gate(gate) => Some(gate),
            _ => None,
        }
    }

    /// For gate steps, the dependency whose artifact gets rated.
    pub fn plan_step(&self) -> Option<&str> {
        let gate = self.as_gate()?;
        gate.plan
            .as_deref()
            .or_else(|| self.dependencies.first().map(String::as_str))
    }
}

/// A complete workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub id: String,
    #[serde(default)]
    pub risk_class: RiskClass,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub security_override: u8,
    /// Rating rounds before escalation; falls back to `gate.max_rating_rounds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rating_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rubrics: Vec<Rubric>,
    pub steps: Vec<StepDef>,
}

impl WorkflowDef {
    /// Load a workflow from a `.json`, `.yaml` or `.yml` file.
    ///
    /// Relative schema paths are made absolute against the file's directory,
    /// so the frozen copy in the run directory stays usable on resume.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let mut def = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::parse_json(&content)?,
            Some("yaml") | Some("yml") => Self::parse_yaml(&content)?,
            _ => Self::parse_json(&content).or_else(|_| Self::parse_yaml(&content))?,
        };
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = base.canonicalize().unwrap_or(base);
        for step in &mut def.steps {
            for output in &mut step.outputs {
                if let Some(schema) = &output.schema
                    && schema.is_relative()
                {
                    output.schema = Some(base.join(schema));
                }
            }
        }
        Ok(def)
    }

    pub fn parse_json(content: &str) -> Result<Self, EngineError> {
        serde_json::from_str(content)
            .map_err(|e| EngineError::InvalidWorkflow(format!("JSON parse error: {}", e)))
    }

    pub fn parse_yaml(content: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(content)
            .map_err(|e| EngineError::InvalidWorkflow(format!("YAML parse error: {}", e)))
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Rubric by id: inline definitions win over built-ins.
    pub fn rubric(&self, id: &str) -> Option<Rubric> {
        self.rubrics
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .or_else(|| Rubric::builtin(id))
    }

    /// Validate the whole document and build its graph.
    ///
    /// Every problem is collected before failing, so one `workflow check`
    /// reports all of them.
    pub fn validate(
        &self,
        known_skills: &BTreeSet<String>,
        known_providers: &BTreeSet<String>,
    ) -> Result<StepGraph, EngineError> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("workflow id is empty".to_string());
        }
        if self.steps.is_empty() {
            problems.push("workflow has no steps".to_string());
        }
        if self.security_override > MAX_SECURITY_OVERRIDE {
            problems.push(format!(
                "security_override {} is above the maximum of {}",
                self.security_override, MAX_SECURITY_OVERRIDE
            ));
        }

        let mut ids = HashSet::new();
        let mut output_names = HashSet::new();
        for step in &self.steps {
            if !DOTTED_ID.is_match(&step.id) && !PLAIN_ID.is_match(&step.id) {
                problems.push(format!(
                    "step id '{}' must be dotted ordinal (e.g. 0.1) or an identifier",
                    step.id
                ));
            }
            if !ids.insert(step.id.as_str()) {
                problems.push(format!("duplicate step id '{}'", step.id));
            }
            for output in step.outputs() {
                if !output_names.insert(output.name.clone()) {
                    problems.push(format!(
                        "output '{}' of step '{}' is declared by another step",
                        output.name, step.id
                    ));
                }
            }
            if step.retry_policy.max_attempts == 0 {
                problems.push(format!("step '{}' has retry_policy.max_attempts 0", step.id));
            }
            self.validate_kind(step, known_skills, known_providers, &mut problems);
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    problems.push(format!("step '{}' depends on unknown step '{}'", step.id, dep));
                }
            }
        }

        if !problems.is_empty() {
            return Err(EngineError::InvalidWorkflow(problems.join("; ")));
        }

        StepGraph::build(&self.steps).map_err(|e| EngineError::InvalidWorkflow(e.to_string()))
    }

    fn validate_kind(
        &self,
        step: &StepDef,
        known_skills: &BTreeSet<String>,
        known_providers: &BTreeSet<String>,
        problems: &mut Vec<String>,
    ) {
        match &step.kind {
            StepKind::AgentSpawn(agent) => {
                if agent.agent.trim().is_empty() {
                    problems.push(format!("agent-spawn step '{}' has no agent", step.id));
                }
                if agent.task.trim().is_empty() {
                    problems.push(format!("agent-spawn step '{}' has no task", step.id));
                }
            }
            StepKind::SkillInvoke(skill) => {
                if !known_skills.contains(&skill.skill) {
                    problems.push(format!(
                        "step '{}' invokes unknown skill '{}'",
                        step.id, skill.skill
                    ));
                }
            }
            StepKind::Gate(gate) => {
                if step.dependencies.is_empty() {
                    problems.push(format!("gate step '{}' has no plan dependency", step.id));
                }
                if gate.providers.is_empty() {
                    problems.push(format!("gate step '{}' lists no providers", step.id));
                }
                for provider in &gate.providers {
                    if !known_providers.contains(provider) {
                        problems.push(format!(
                            "gate step '{}' uses unknown provider '{}'",
                            step.id, provider
                        ));
                    }
                }
                if let Some(plan) = &gate.plan
                    && !step.dependencies.contains(plan)
                {
                    problems.push(format!(
                        "gate step '{}' rates '{}', which is not one of its dependencies",
                        step.id, plan
                    ));
                }
                if self.rubric(&gate.rubric_ref).is_none() {
                    problems.push(format!(
                        "gate step '{}' references unknown rubric '{}'",
                        step.id, gate.rubric_ref
                    ));
                }
                if let Some(min) = gate.minimum_score
                    && !(0.0..=10.0).contains(&min)
                {
                    problems.push(format!(
                        "gate step '{}' minimum_score {} is outside 0-10",
                        step.id, min
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Backoff;

    fn skills() -> BTreeSet<String> {
        ["emit", "merge"].iter().map(|s| s.to_string()).collect()
    }

    fn providers() -> BTreeSet<String> {
        ["a", "b"].iter().map(|s| s.to_string()).collect()
    }

    const PLAN_GATE_BUILD: &str = r#"
id: feature
risk_class: critical
complexity: high
steps:
  - id: plan
    kind: agent-spawn
    agent: planner
    task: "Plan {{input.goal}}"
    outputs:
      - name: plan
        path: plans/plan.md
  - id: gate
    kind: gate
    dependencies: [plan]
    providers: [a, b]
    minimum_score: 7
    timeout_seconds: 30
  - id: build
    kind: skill-invoke
    skill: emit
    dependencies: [gate]
    params:
      text: done
    retry_policy:
      max_attempts: 3
      backoff: exponential
"#;

    #[test]
    fn test_parse_yaml_workflow() {
        let def = WorkflowDef::parse_yaml(PLAN_GATE_BUILD).unwrap();
        assert_eq!(def.id, "feature");
        assert_eq!(def.risk_class, RiskClass::Critical);
        assert_eq!(def.complexity, Complexity::High);
        assert_eq!(def.steps.len(), 3);

        let gate = def.step("gate").unwrap().as_gate().unwrap();
        assert_eq!(gate.minimum_score, Some(7.0));
        assert_eq!(gate.rubric_ref, "plan-default");
        assert_eq!(def.step("gate").unwrap().plan_step(), Some("plan"));

        let build = def.step("build").unwrap();
        assert_eq!(build.retry_policy.max_attempts, 3);
        assert_eq!(build.retry_policy.backoff, Backoff::Exponential);
        assert_eq!(build.output_names(), vec!["build".to_string()]);
    }

    #[test]
    fn test_parse_json_workflow() {
        let def = WorkflowDef::parse_json(
            r#"{"id":"wf","steps":[{"id":"0.1","kind":"skill-invoke","skill":"emit"}]}"#,
        )
        .unwrap();
        assert!(matches!(def.steps[0].kind, StepKind::SkillInvoke(_)));
        assert_eq!(def.steps[0].retry_policy.max_attempts, 1);
    }

    #[test]
    fn test_validate_accepts_good_workflow() {
        let def = WorkflowDef::parse_yaml(PLAN_GATE_BUILD).unwrap();
        let graph = def.validate(&skills(), &providers()).unwrap();
        assert_eq!(graph.waves().len(), 3);
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let def = WorkflowDef::parse_yaml(
            r#"
id: broken
security_override: 5
steps:
  - { id: "1", kind: skill-invoke, skill: teleport }
  - { id: "1", kind: skill-invoke, skill: emit, dependencies: [missing] }
  - { id: gate, kind: gate, providers: [nobody] }
"#,
        )
        .unwrap();
        let err = def.validate(&skills(), &providers()).unwrap_err().to_string();
        assert!(err.contains("security_override 5"));
        assert!(err.contains("unknown skill 'teleport'"));
        assert!(err.contains("duplicate step id '1'"));
        assert!(err.contains("unknown step 'missing'"));
        assert!(err.contains("no plan dependency"));
        assert!(err.contains("unknown provider 'nobody'"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let def = WorkflowDef::parse_yaml(
            r#"
id: loop
steps:
  - { id: a, kind: skill-invoke, skill: emit, dependencies: [b] }
  - { id: b, kind: skill-invoke, skill: emit, dependencies: [a] }
"#,
        )
        .unwrap();
        let err = def.validate(&skills(), &providers()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(msg) if msg.contains("Cycle")));
    }

    #[test]
    fn test_validate_rejects_duplicate_outputs() {
        let def = WorkflowDef::parse_yaml(
            r#"
id: dup
steps:
  - { id: a, kind: skill-invoke, skill: emit, outputs: [{ name: report }] }
  - { id: b, kind: skill-invoke, skill: emit, outputs: [{ name: report }] }
"#,
        )
        .unwrap();
        let err = def.validate(&skills(), &providers()).unwrap_err().to_string();
        assert!(err.contains("output 'report'"));
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let err = WorkflowDef::parse_yaml(
            r#"
id: wf
steps:
  - { id: a, kind: agent-spawn, agent: planner }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[test]
    fn test_rejects_malformed_step_id() {
        let def = WorkflowDef::parse_yaml(
            r#"
id: wf
steps:
  - { id: "1..2", kind: skill-invoke, skill: emit }
"#,
        )
        .unwrap();
        let err = def.validate(&skills(), &providers()).unwrap_err().to_string();
        assert!(err.contains("dotted ordinal"));
    }

    #[test]
    fn test_load_resolves_schema_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(
            &path,
            r#"
id: wf
steps:
  - id: a
    kind: skill-invoke
    skill: emit
    outputs:
      - { name: out, path: out.json, schema: schemas/out.json }
"#,
        )
        .unwrap();
        let def = WorkflowDef::load(&path).unwrap();
        let schema = def.steps[0].outputs[0].schema.clone().unwrap();
        assert!(schema.is_absolute());
        assert!(schema.ends_with("schemas/out.json"));
    }

    #[test]
    fn test_output_default_path() {
        let spec = OutputSpec::named("plan");
        assert_eq!(
            spec.resolve_path(Path::new("/runs/r1")),
            PathBuf::from("/runs/r1/artifacts/plan")
        );
    }
}
