//! In-process skills for `skill-invoke` steps.
//!
//! A skill receives the step's parameters and context and writes every
//! declared output file. Registration is explicit: the engine starts with
//! the built-ins and embedders add their own through [`SkillRegistry::register`].

use super::step::{StepContext, render_template};
use crate::artifact::ContentCache;
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a skill may look at.
pub struct SkillInvocation<'a> {
    pub ctx: &'a StepContext,
    pub params: &'a BTreeMap<String, Value>,
    /// Resolved output paths, in declaration order.
    pub outputs: &'a [PathBuf],
    pub content: &'a ContentCache,
}

impl SkillInvocation<'_> {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Write `contents` to every declared output.
    pub fn write_outputs(&self, contents: &str) -> Result<()> {
        for path in self.outputs {
            crate::util::write_atomic(path, contents.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

pub trait Skill: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, invocation: &SkillInvocation<'_>) -> Result<()>;
}

/// `emit`: write a rendered `text` template, or a literal `json` value.
pub struct EmitSkill;

impl Skill for EmitSkill {
    fn name(&self) -> &str {
        "emit"
    }

    fn run(&self, invocation: &SkillInvocation<'_>) -> Result<()> {
        if let Some(text) = invocation.param_str("text") {
            return invocation.write_outputs(&render_template(text, invocation.ctx));
        }
        if let Some(json) = invocation.params.get("json") {
            let rendered =
                serde_json::to_string_pretty(json).context("Failed to serialize json param")?;
            return invocation.write_outputs(&rendered);
        }
        bail!("emit needs a 'text' or 'json' parameter")
    }
}

/// `merge`: concatenate every dependency artifact under a heading per artifact.
pub struct MergeSkill;

impl Skill for MergeSkill {
    fn name(&self) -> &str {
        "merge"
    }

    fn run(&self, invocation: &SkillInvocation<'_>) -> Result<()> {
        let mut merged = String::new();
        if let Some(header) = invocation.param_str("header") {
            merged.push_str(&render_template(header, invocation.ctx));
            merged.push_str("\n\n");
        }
        for artifact in &invocation.ctx.dependencies {
            let content = invocation
                .content
                .read(&artifact.path)
                .with_context(|| format!("Failed to read artifact {}", artifact.key()))?;
            merged.push_str(&format!("## {}\n\n{}\n\n", artifact.key(), content.trim_end()));
        }
        invocation.write_outputs(merged.trim_end())
    }
}

#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Arc<dyn Skill>>,
}

impl std::fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("skills", &self.names())
            .finish()
    }
}

impl SkillRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(EmitSkill));
        registry.register(Arc::new(MergeSkill));
        registry
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.skills.keys().cloned().collect()
    }
}
