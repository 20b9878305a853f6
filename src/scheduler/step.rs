//! Execution of a single step attempt.
//!
//! [`execute`] is what the run driver spawns for every dispatched step. It
//! owns everything it needs ([`StepContext`] plus shared [`StepServices`]),
//! so attempts run concurrently while the driver keeps sole ownership of the
//! registry and progress.

use super::skills::{SkillInvocation, SkillRegistry};
use super::worker::{WorkerLauncher, WorkerRequest};
use crate::artifact::{Artifact, ArtifactMeta, ContentCache};
use crate::errors::StepError;
use crate::gate::{PlanQualityGate, ProviderRegistry, RatingRequest, RatingResult, minimum_score};
use crate::pressure::PressureMonitor;
use crate::workflow::{AgentSpawnStep, GateStep, SkillInvokeStep, StepDef, StepKind, WorkflowDef};
use anyhow::anyhow;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").unwrap());

/// Per-attempt inputs, owned so the attempt can run on its own task.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub step: StepDef,
    pub attempt: u32,
    /// Wait before starting (retry backoff).
    pub delay: Duration,
    pub timeout: Duration,
    pub inputs: Arc<BTreeMap<String, String>>,
    /// Gate feedback for a re-planning attempt.
    pub feedback: Option<String>,
    /// Latest versions of every artifact the step depends on.
    pub dependencies: Vec<Artifact>,
    /// For gate steps, the round this attempt rates.
    pub rating_round: u32,
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Declared outputs with their resolved paths.
    pub fn output_paths(&self) -> Vec<(String, PathBuf, Option<PathBuf>)> {
        self.step
            .outputs()
            .into_iter()
            .map(|o| {
                let path = o.resolve_path(&self.run_dir);
                (o.name, path, o.schema)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn for_test(run_dir: &Path, step: StepDef) -> Self {
        Self {
            run_id: "run-test".into(),
            run_dir: run_dir.to_path_buf(),
            step,
            attempt: 1,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(30),
            inputs: Arc::new(BTreeMap::new()),
            feedback: None,
            dependencies: Vec::new(),
            rating_round: 1,
            cancel: CancellationToken::new(),
        }
    }
}

/// Run-wide collaborators shared by every attempt.
pub struct StepServices {
    pub workflow: Arc<WorkflowDef>,
    pub launcher: WorkerLauncher,
    pub skills: SkillRegistry,
    pub gate: PlanQualityGate,
    pub providers: ProviderRegistry,
    pub monitor: Arc<PressureMonitor>,
    pub min_free_bytes: u64,
    pub content: Arc<ContentCache>,
    pub default_gate_timeout: Duration,
}

/// What a successful attempt produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub artifacts: Vec<ArtifactMeta>,
    pub rating: Option<RatingResult>,
}

/// Substitute `{{input.KEY}}`, `{{feedback}}`, `{{run_id}}`, `{{step_id}}`
/// and `{{attempt}}`. Unknown placeholders render empty.
pub fn render_template(template: &str, ctx: &StepContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match key {
                "feedback" => ctx.feedback.clone().unwrap_or_default(),
                "run_id" => ctx.run_id.clone(),
                "step_id" => ctx.step.id.clone(),
                "attempt" => ctx.attempt.to_string(),
                _ => key
                    .strip_prefix("input.")
                    .and_then(|k| ctx.inputs.get(k))
                    .cloned()
                    .unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Execute one attempt of `ctx.step`.
pub async fn execute(ctx: StepContext, services: Arc<StepServices>) -> Result<StepOutput, StepError> {
    if !ctx.delay.is_zero() {
        debug!(step_id = %ctx.step.id, delay_ms = ctx.delay.as_millis() as u64, "Waiting before retry");
        tokio::select! {
            _ = tokio::time::sleep(ctx.delay) => {}
            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
        }
    }
    // A gate already dispatched is allowed to finish its provider calls.
    if ctx.cancel.is_cancelled() && !ctx.step.is_gate() {
        return Err(StepError::Cancelled);
    }

    match &ctx.step.kind {
        StepKind::AgentSpawn(agent) => {
            admit(&services)?;
            run_agent(&ctx, &services, agent).await
        }
        StepKind::SkillInvoke(skill) => run_skill(&ctx, &services, skill),
        StepKind::Gate(gate) => run_gate(&ctx, &services, gate).await,
    }
}

/// Worker admission: one cleanup-and-retry before refusing.
fn admit(services: &StepServices) -> Result<(), StepError> {
    let monitor = &services.monitor;
    if monitor.can_spawn(services.min_free_bytes) {
        return Ok(());
    }
    warn!("Spawn denied under memory pressure; cleaning up and retrying once");
    monitor.cleanup();
    if monitor.can_spawn(services.min_free_bytes) {
        return Ok(());
    }
    let sample = monitor.last_sample();
    Err(StepError::ResourceExhausted {
        required_bytes: services.min_free_bytes,
        available_bytes: sample.map(|s| monitor.free_bytes(&s)).unwrap_or(0),
        level: monitor.level(),
    })
}

/// Every declared output must exist after the step body ran.
fn collect_outputs(ctx: &StepContext) -> Result<Vec<ArtifactMeta>, StepError> {
    ctx.output_paths()
        .into_iter()
        .map(|(name, path, schema_ref)| {
            if !path.exists() {
                return Err(StepError::MissingArtifact {
                    artifact: name,
                    path,
                });
            }
            Ok(ArtifactMeta {
                name,
                producing_step: ctx.step.id.clone(),
                path,
                schema_ref,
            })
        })
        .collect()
}

fn task_text(ctx: &StepContext, agent: &AgentSpawnStep) -> String {
    let mut task = format!(
        "# Step {} ({})\n\n{}\n",
        ctx.step.id,
        agent.agent,
        render_template(&agent.task, ctx)
    );
    if !ctx.dependencies.is_empty() {
        task.push_str("\n## Inputs\n\n");
        for artifact in &ctx.dependencies {
            task.push_str(&format!("- {}: {}\n", artifact.key(), artifact.path.display()));
        }
    }
    task.push_str("\n## Outputs\n\n");
    for (name, path, _) in ctx.output_paths() {
        task.push_str(&format!("- {}: {}\n", name, path.display()));
    }
    if let Some(feedback) = &ctx.feedback {
        task.push_str(&format!("\n## Reviewer feedback\n\n{}\n", feedback));
    }
    task
}

async fn run_agent(
    ctx: &StepContext,
    services: &StepServices,
    agent: &AgentSpawnStep,
) -> Result<StepOutput, StepError> {
    let task = task_text(ctx, agent);
    let outputs: Vec<PathBuf> = ctx.output_paths().into_iter().map(|(_, p, _)| p).collect();
    services
        .launcher
        .launch(WorkerRequest {
            run_id: &ctx.run_id,
            step_id: &ctx.step.id,
            attempt: ctx.attempt,
            agent: &agent.agent,
            task: &task,
            outputs: &outputs,
            run_dir: &ctx.run_dir,
            timeout: ctx.timeout,
            cancel: &ctx.cancel,
        })
        .await?;
    Ok(StepOutput {
        artifacts: collect_outputs(ctx)?,
        rating: None,
    })
}

fn run_skill(
    ctx: &StepContext,
    services: &StepServices,
    step: &SkillInvokeStep,
) -> Result<StepOutput, StepError> {
    let skill = services
        .skills
        .get(&step.skill)
        .ok_or_else(|| anyhow!("Unknown skill '{}'", step.skill))?;
    let outputs: Vec<PathBuf> = ctx.output_paths().into_iter().map(|(_, p, _)| p).collect();
    skill.run(&SkillInvocation {
        ctx,
        params: &step.params,
        outputs: &outputs,
        content: &services.content,
    })?;
    debug!(step_id = %ctx.step.id, skill = %step.skill, "Skill finished");
    Ok(StepOutput {
        artifacts: collect_outputs(ctx)?,
        rating: None,
    })
}

/// First free record path for this round. A round re-run after a crash gets
/// a suffixed file instead of overwriting the earlier record.
fn next_record_path(run_dir: &Path, plan_artifact: &str, round: u32) -> PathBuf {
    let base = RatingResult::record_path(run_dir, plan_artifact, round);
    if !base.exists() {
        return base;
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut n = 2;
    loop {
        let candidate = base.with_file_name(format!("{}-{}.json", stem, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

async fn run_gate(
    ctx: &StepContext,
    services: &StepServices,
    gate: &GateStep,
) -> Result<StepOutput, StepError> {
    let workflow = &services.workflow;
    let plan_step = ctx
        .step
        .plan_step()
        .and_then(|id| workflow.step(id))
        .ok_or_else(|| anyhow!("Gate '{}' has no plan step", ctx.step.id))?;
    let plan_output = plan_step
        .output_names()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Plan step '{}' declares no output", plan_step.id))?;
    let plan = ctx
        .dependencies
        .iter()
        .find(|a| a.name == plan_output)
        .ok_or_else(|| anyhow!("Plan artifact '{}' is not available", plan_output))?;
    let content = services
        .content
        .read(&plan.path)
        .map_err(|_| StepError::MissingArtifact {
            artifact: plan.key(),
            path: plan.path.clone(),
        })?;

    let rubric = workflow
        .rubric(&gate.rubric_ref)
        .ok_or_else(|| anyhow!("Unknown rubric '{}'", gate.rubric_ref))?;
    let providers = gate
        .providers
        .iter()
        .map(|name| {
            services
                .providers
                .get(name)
                .ok_or_else(|| anyhow!("Unknown rating provider '{}'", name))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let minimum = gate.minimum_score.unwrap_or_else(|| {
        minimum_score(
            workflow.risk_class,
            workflow.complexity,
            workflow.security_override,
        )
    });
    let timeout = gate
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(services.default_gate_timeout);

    let plan_key = plan.key();
    let result = services
        .gate
        .rate(RatingRequest {
            plan_artifact: &plan_key,
            content: &content,
            rubric: &rubric,
            providers,
            minimum_score: minimum,
            per_provider_timeout: timeout,
            attempt: ctx.rating_round,
        })
        .await?;

    let record = next_record_path(&ctx.run_dir, &plan_key, ctx.rating_round);
    result.write_record(&record)?;
    info!(
        step_id = %ctx.step.id,
        plan = %plan_key,
        round = ctx.rating_round,
        record = %record.display(),
        "Rating recorded"
    );

    if !result.passed {
        return Err(StepError::QualityBelowThreshold {
            result: Box::new(result),
        });
    }

    let output = ctx
        .step
        .output_names()
        .into_iter()
        .next()
        .unwrap_or_else(|| ctx.step.id.clone());
    Ok(StepOutput {
        artifacts: vec![ArtifactMeta {
            name: output,
            producing_step: ctx.step.id.clone(),
            path: record,
            schema_ref: None,
        }],
        rating: Some(result),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ValidationStatus;
    use crate::gate::{ProviderRating, RatingProvider, Rubric};
    use crate::pressure::StaticProbe;
    use async_trait::async_trait;
    use chrono::Utc;

    const MB: u64 = 1024 * 1024;

    struct Fixed(&'static str, f64);

    #[async_trait]
    impl RatingProvider for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn rate(&self, _content: &str, _rubric: &Rubric) -> anyhow::Result<ProviderRating> {
            Ok(ProviderRating::scored(self.1, format!("{} feedback", self.0)))
        }
    }

    fn services(workflow: &WorkflowDef, probe: Arc<StaticProbe>, providers: &[(&'static str, f64)]) -> Arc<StepServices> {
        let mut registry = ProviderRegistry::new();
        for (name, score) in providers {
            registry.insert(Arc::new(Fixed(name, *score)));
        }
        Arc::new(StepServices {
            workflow: Arc::new(workflow.clone()),
            launcher: WorkerLauncher::new("sh", vec!["-c".into(), "cat > \"$CONDUCTOR_OUTPUT\"".into()], Duration::from_millis(100)),
            skills: SkillRegistry::with_builtins(),
            gate: PlanQualityGate::new(),
            providers: registry,
            monitor: Arc::new(PressureMonitor::new(1000 * MB, Box::new(probe))),
            min_free_bytes: 100 * MB,
            content: Arc::new(ContentCache::new()),
            default_gate_timeout: Duration::from_secs(5),
        })
    }

    const WORKFLOW: &str = r#"
id: wf
steps:
  - id: plan
    kind: skill-invoke
    skill: emit
    params: { text: "plan for {{input.goal}}" }
  - { id: gate, kind: gate, providers: [a, b], dependencies: [plan], minimum_score: 7 }
  - { id: build, kind: agent-spawn, agent: dev, task: "build {{input.goal}}", dependencies: [gate] }
"#;

    fn plan_artifact(dir: &Path) -> Artifact {
        let path = dir.join("artifacts/plan");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "the plan").unwrap();
        Artifact {
            name: "plan".into(),
            version: 1,
            producing_step: "plan".into(),
            path,
            schema_ref: None,
            validation_status: ValidationStatus::Pass,
            violations: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_template() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let mut ctx = StepContext::for_test(dir.path(), workflow.step("plan").unwrap().clone());
        ctx.inputs = Arc::new(BTreeMap::from([("goal".to_string(), "search".to_string())]));
        ctx.attempt = 2;
        assert_eq!(
            render_template("{{ input.goal }} #{{attempt}} {{input.none}}{{feedback}}", &ctx),
            "search #2 "
        );
    }

    #[tokio::test]
    async fn test_skill_step_reports_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let mut ctx = StepContext::for_test(dir.path(), workflow.step("plan").unwrap().clone());
        ctx.inputs = Arc::new(BTreeMap::from([("goal".to_string(), "search".to_string())]));
        let services = services(&workflow, Arc::new(StaticProbe::new(0)), &[]);

        let output = execute(ctx, services).await.unwrap();
        assert_eq!(output.artifacts.len(), 1);
        let meta = &output.artifacts[0];
        assert_eq!(meta.name, "plan");
        assert_eq!(std::fs::read_to_string(&meta.path).unwrap(), "plan for search");
    }

    #[tokio::test]
    async fn test_gate_pass_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let mut ctx = StepContext::for_test(dir.path(), workflow.step("gate").unwrap().clone());
        ctx.dependencies = vec![plan_artifact(dir.path())];
        let services = services(&workflow, Arc::new(StaticProbe::new(0)), &[("a", 8.0), ("b", 6.0)]);

        let output = execute(ctx, services).await.unwrap();
        let rating = output.rating.unwrap();
        assert_eq!(rating.overall_score, 7.0);
        assert!(rating.passed);
        assert!(dir.path().join("plans/plan-rating-r1.json").exists());
        assert_eq!(output.artifacts[0].name, "gate");
    }

    #[tokio::test]
    async fn test_gate_below_threshold_still_records() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let mut ctx = StepContext::for_test(dir.path(), workflow.step("gate").unwrap().clone());
        ctx.dependencies = vec![plan_artifact(dir.path())];
        let services = services(&workflow, Arc::new(StaticProbe::new(0)), &[("a", 5.0), ("b", 6.0)]);

        let err = execute(ctx.clone(), services.clone()).await.unwrap_err();
        match &err {
            StepError::QualityBelowThreshold { result } => assert_eq!(result.overall_score, 5.5),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.feedback().unwrap().contains("a feedback"));

        // Same round again (crash replay) keeps the first record.
        let _ = execute(ctx, services).await;
        assert!(dir.path().join("plans/plan-rating-r1.json").exists());
        assert!(dir.path().join("plans/plan-rating-r1-2.json").exists());
    }

    #[tokio::test]
    async fn test_agent_spawn_refused_under_critical_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let probe = Arc::new(StaticProbe::new(880 * MB));
        let services = services(&workflow, probe, &[]);
        services.monitor.sample();
        let before = services.monitor.cleanup_count();

        let ctx = StepContext::for_test(dir.path(), workflow.step("build").unwrap().clone());
        let err = execute(ctx, services.clone()).await.unwrap_err();
        assert!(matches!(err, StepError::ResourceExhausted { .. }));
        assert_eq!(services.monitor.cleanup_count(), before + 1);
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_agent_spawn_admitted_after_cleanup_frees_memory() {
        struct Release(Arc<StaticProbe>);
        impl crate::pressure::Purgeable for Release {
            fn name(&self) -> &str {
                "release"
            }
            fn purge(&self) -> usize {
                self.0.set(100 * MB);
                1
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let probe = Arc::new(StaticProbe::new(880 * MB));
        let services = services(&workflow, probe.clone(), &[]);
        services.monitor.sample();
        let release: Arc<dyn crate::pressure::Purgeable> = Arc::new(Release(probe));
        services.monitor.register_purgeable(release.clone());

        let ctx = StepContext::for_test(dir.path(), workflow.step("build").unwrap().clone());
        let output = execute(ctx, services).await.unwrap();
        assert_eq!(output.artifacts[0].name, "build");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowDef::parse_yaml(WORKFLOW).unwrap();
        let ctx = StepContext::for_test(dir.path(), workflow.step("plan").unwrap().clone());
        ctx.cancel.cancel();
        let services = services(&workflow, Arc::new(StaticProbe::new(0)), &[]);
        assert!(matches!(
            execute(ctx, services).await.unwrap_err(),
            StepError::Cancelled
        ));
    }
}
