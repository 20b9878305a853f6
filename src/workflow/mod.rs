//! Workflow definitions: the read-only step graph a run executes.

pub mod definition;
pub mod graph;

pub use definition::{
    AgentSpawnStep, Complexity, GateStep, MAX_SECURITY_OVERRIDE, OutputSpec, RiskClass,
    SkillInvokeStep, StepDef, StepKind, WorkflowDef,
};
pub use graph::{StepGraph, StepIndex};
