//! Step scheduling: eligibility, batching and execution of single steps.
//!
//! The scheduler is stateless with respect to the run: progress lives in
//! [`StepProgress`] and artifacts in the run's registry, both owned by the
//! run driver and passed in on every call.

pub mod retry;
pub mod skills;
pub mod step;
pub mod worker;

pub use retry::{Backoff, RetryPolicy};
pub use skills::{EmitSkill, MergeSkill, Skill, SkillInvocation, SkillRegistry};
pub use step::{StepContext, StepOutput, StepServices, execute, render_template};
pub use worker::WorkerLauncher;

use crate::artifact::{Artifact, ArtifactRegistry, Resolved, ValidationStatus};
use crate::workflow::{StepDef, StepGraph, StepKind, WorkflowDef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Mutable per-run scheduling state. Persisted in every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Steps whose outputs all validated `pass`.
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,
    /// Attempts started per step.
    #[serde(default)]
    pub attempt_counts: BTreeMap<String, u32>,
    /// Rating rounds performed per gate step.
    #[serde(default)]
    pub rating_rounds: BTreeMap<String, u32>,
    /// Gate feedback waiting to be handed to a re-planning step.
    #[serde(default)]
    pub pending_feedback: BTreeMap<String, String>,
}

impl StepProgress {
    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id)
    }

    pub fn mark_completed(&mut self, step_id: &str) {
        self.completed_steps.insert(step_id.to_string());
    }

    pub fn attempts(&self, step_id: &str) -> u32 {
        self.attempt_counts.get(step_id).copied().unwrap_or(0)
    }

    /// Count a new attempt and return its 1-based number.
    pub fn next_attempt(&mut self, step_id: &str) -> u32 {
        let count = self.attempt_counts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn rounds(&self, gate_id: &str) -> u32 {
        self.rating_rounds.get(gate_id).copied().unwrap_or(0)
    }

    pub fn feedback_for(&self, step_id: &str) -> Option<&str> {
        self.pending_feedback.get(step_id).map(String::as_str)
    }
}

/// Why a step cannot run yet. These are scheduling states, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyGap {
    /// The dependency has not completed (or was reopened for re-planning).
    StepIncomplete { step: String },
    /// No artifact with this name is registered.
    NotFound { artifact: String },
    /// The latest version has not validated `pass`.
    NotPassed {
        artifact: String,
        status: ValidationStatus,
    },
}

impl std::fmt::Display for DependencyGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyGap::StepIncomplete { step } => write!(f, "step {} incomplete", step),
            DependencyGap::NotFound { artifact } => write!(f, "artifact {} not found", artifact),
            DependencyGap::NotPassed { artifact, status } => {
                write!(f, "artifact {} is {}", artifact, status)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Ready,
    Blocked(Vec<DependencyGap>),
    Completed,
}

/// Decides which steps may run next.
#[derive(Debug, Clone)]
pub struct StepScheduler {
    workflow: Arc<WorkflowDef>,
    graph: StepGraph,
    max_concurrent_workers: usize,
}

impl StepScheduler {
    pub fn new(workflow: Arc<WorkflowDef>, graph: StepGraph, max_concurrent_workers: usize) -> Self {
        Self {
            workflow,
            graph,
            max_concurrent_workers: max_concurrent_workers.max(1),
        }
    }

    pub fn workflow(&self) -> &WorkflowDef {
        &self.workflow
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Eligibility of one step: every dependency step has completed and
    /// every artifact it declares resolves to a `pass` version.
    pub fn eligibility(
        &self,
        step: &StepDef,
        progress: &StepProgress,
        registry: &ArtifactRegistry,
    ) -> Eligibility {
        if progress.is_completed(&step.id) {
            return Eligibility::Completed;
        }
        let mut gaps = Vec::new();
        for dep_id in &step.dependencies {
            if !progress.is_completed(dep_id) {
                gaps.push(DependencyGap::StepIncomplete {
                    step: dep_id.clone(),
                });
            }
            let Some(dep) = self.workflow.step(dep_id) else {
                gaps.push(DependencyGap::NotFound {
                    artifact: dep_id.clone(),
                });
                continue;
            };
            for name in dep.output_names() {
                match registry.resolve(&name) {
                    Resolved::NotFound => gaps.push(DependencyGap::NotFound { artifact: name }),
                    Resolved::Found(artifact) if !artifact.passed() => {
                        gaps.push(DependencyGap::NotPassed {
                            artifact: artifact.key(),
                            status: artifact.validation_status,
                        })
                    }
                    Resolved::Found(_) => {}
                }
            }
        }
        if gaps.is_empty() {
            Eligibility::Ready
        } else {
            Eligibility::Blocked(gaps)
        }
    }

    /// The next eligible step in definition order, or `None` when nothing can
    /// run (the run is complete or everything left is blocked).
    pub fn next(&self, progress: &StepProgress, registry: &ArtifactRegistry) -> Option<&StepDef> {
        self.workflow
            .steps
            .iter()
            .find(|s| self.eligibility(s, progress, registry) == Eligibility::Ready)
    }

    /// Steps to dispatch now, given what is already in flight.
    ///
    /// With nothing in flight, the first eligible step is taken together with
    /// every other eligible step of its `parallel_group`. While a group is
    /// in flight, only further members of that group join it. Agent-spawn
    /// steps are capped at `max_concurrent_workers` in total.
    pub fn ready_batch(
        &self,
        progress: &StepProgress,
        registry: &ArtifactRegistry,
        in_flight: &BTreeSet<String>,
    ) -> Vec<&StepDef> {
        let candidates: Vec<&StepDef> = self
            .workflow
            .steps
            .iter()
            .filter(|s| !in_flight.contains(&s.id))
            .filter(|s| self.eligibility(s, progress, registry) == Eligibility::Ready)
            .collect();

        let group: Option<&str> = if in_flight.is_empty() {
            match candidates.first() {
                None => return Vec::new(),
                Some(first) => match &first.parallel_group {
                    None => return vec![*first],
                    Some(group) => Some(group.as_str()),
                },
            }
        } else {
            let groups: BTreeSet<Option<&str>> = in_flight
                .iter()
                .filter_map(|id| self.workflow.step(id))
                .map(|s| s.parallel_group.as_deref())
                .collect();
            match groups.into_iter().collect::<Vec<_>>().as_slice() {
                [Some(group)] => Some(*group),
                _ => return Vec::new(),
            }
        };

        let mut workers = in_flight
            .iter()
            .filter_map(|id| self.workflow.step(id))
            .filter(|s| matches!(s.kind, StepKind::AgentSpawn(_)))
            .count();
        let mut batch = Vec::new();
        for step in candidates
            .into_iter()
            .filter(|s| s.parallel_group.as_deref() == group)
        {
            if matches!(step.kind, StepKind::AgentSpawn(_)) {
                if workers >= self.max_concurrent_workers {
                    continue;
                }
                workers += 1;
            }
            batch.push(step);
        }
        batch
    }

    /// Every step completed.
    pub fn is_complete(&self, progress: &StepProgress) -> bool {
        self.workflow
            .steps
            .iter()
            .all(|s| progress.is_completed(&s.id))
    }

    /// Steps not yet completed, in definition order.
    pub fn pending_steps(&self, progress: &StepProgress) -> Vec<String> {
        self.workflow
            .steps
            .iter()
            .filter(|s| !progress.is_completed(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Latest registered version of every artifact `step` depends on.
    pub fn dependency_artifacts(&self, step: &StepDef, registry: &ArtifactRegistry) -> Vec<Artifact> {
        step.dependencies
            .iter()
            .filter_map(|dep| self.workflow.step(dep))
            .flat_map(|dep| dep.output_names())
            .filter_map(|name| registry.resolve(&name).artifact().cloned())
            .collect()
    }

    /// Send the plan step back for another round: the plan and its gate are
    /// no longer complete, and the gate's feedback waits for the plan step.
    pub fn reopen_for_replan(
        &self,
        progress: &mut StepProgress,
        gate_id: &str,
        feedback: String,
    ) -> Option<String> {
        let plan_id = self.workflow.step(gate_id)?.plan_step()?.to_string();
        progress.completed_steps.remove(&plan_id);
        progress.completed_steps.remove(gate_id);
        progress.attempt_counts.remove(&plan_id);
        progress.attempt_counts.remove(gate_id);
        progress.pending_feedback.insert(plan_id.clone(), feedback);
        Some(plan_id)
    }
}
