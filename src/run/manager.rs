//! Run manager: the public entry point for starting and steering runs.

use super::driver::{DriveOutcome, DriverParts, RunDriver};
use super::events::RunEvent;
use super::store::{RunLock, RunStore};
use super::{ApprovalDecision, Run, RunState, RunStatus, meta};
use crate::artifact::{ArtifactMeta, ArtifactRegistry};
use crate::checkpoint::{CheckpointStore, Restored, resume_from};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::gate::{PlanQualityGate, ProviderRegistry};
use crate::pressure::PressureMonitor;
use crate::scheduler::{SkillRegistry, StepProgress, StepScheduler, StepServices, WorkerLauncher};
use crate::workflow::{StepGraph, WorkflowDef};
use anyhow::{Context, anyhow};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A run being driven in this process.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<DriveOutcome, EngineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Ask the driver to abort; in-flight workers get SIGTERM.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait for the driver to stop.
    pub async fn wait(self) -> Result<DriveOutcome, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Other(anyhow!("run task failed: {}", e)))?
    }
}

pub struct RunManager {
    config: Arc<EngineConfig>,
    store: RunStore,
    providers: ProviderRegistry,
    skills: SkillRegistry,
    monitor: Arc<PressureMonitor>,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl RunManager {
    /// Manager over the configured state directory, with providers from the
    /// configuration and the built-in skills.
    pub fn new(config: EngineConfig) -> Self {
        let monitor = Arc::new(PressureMonitor::procfs(config.pressure.ceiling_bytes()));
        Self {
            store: RunStore::new(config.engine.state_dir.clone()),
            providers: ProviderRegistry::from_config(&config.gate.providers),
            skills: SkillRegistry::with_builtins(),
            monitor,
            events: None,
            config: Arc::new(config),
        }
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_skills(mut self, skills: SkillRegistry) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PressureMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn monitor(&self) -> Arc<PressureMonitor> {
        self.monitor.clone()
    }

    /// Check a workflow against the registered skills and providers.
    pub fn validate_workflow(&self, workflow: &WorkflowDef) -> Result<StepGraph, EngineError> {
        workflow.validate(&self.skills.names(), &self.providers.names())
    }

    /// Validate `workflow`, create its run and start driving it.
    pub async fn start_run(
        &self,
        workflow: WorkflowDef,
        inputs: BTreeMap<String, String>,
    ) -> Result<RunHandle, EngineError> {
        let graph = self.validate_workflow(&workflow)?;
        let mut run = Run::new(workflow.id.clone());
        run.set_meta(
            meta::INPUTS,
            serde_json::to_value(&inputs).context("Failed to encode inputs")?,
        );
        self.store.create(&run, &workflow)?;
        let lock = self.store.lock(&run.run_id)?;
        info!(run_id = %run.run_id, workflow = %workflow.id, "Run created");

        let registry = ArtifactRegistry::new(run.run_id.clone());
        Ok(self.launch(run, workflow, graph, registry, StepProgress::default(), lock))
    }

    /// Continue an interrupted or failed run from its latest valid checkpoint.
    ///
    /// Completed, aborted and rejected runs cannot resume; runs waiting on approval go
    /// through [`RunManager::resolve_approval`].
    pub async fn resume_run(&self, run_id: &str) -> Result<RunHandle, EngineError> {
        let record = self.store.load_run(run_id)?;
        let rejected = record.status == RunStatus::Failed
            && record.meta_str(meta::APPROVAL) == Some("reject");
        if record.status.is_terminal() || record.status == RunStatus::WaitingApproval || rejected {
            return Err(EngineError::InvalidTransition {
                from: record.status,
                to: RunStatus::Running,
            });
        }
        let lock = self.store.lock(run_id)?;
        let workflow = self.store.load_workflow(run_id)?;
        let graph = self.validate_workflow(&workflow)?;
        let Restored {
            mut run,
            mut progress,
            registry,
            ..
        } = self.restore(&record)?;

        run.metadata = record.metadata;
        if let Some(error) = run.error() {
            // The failing step gets a fresh retry budget.
            progress.attempt_counts.remove(&error.step_id);
            if let Some(value) = run.metadata.remove(meta::ERROR) {
                run.metadata.insert(meta::LAST_ERROR.to_string(), value);
            }
        }
        run.metadata.remove(meta::PAUSED);
        let resumes = run
            .metadata
            .get(meta::RESUME_COUNT)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        run.set_meta(meta::RESUME_COUNT, resumes + 1);
        self.store.clear_abort(run_id);
        self.store.save_run(&run)?;

        info!(
            run_id,
            from = %record.status,
            completed = progress.completed_steps.len(),
            "Resuming run"
        );
        Ok(self.launch(run, workflow, graph, registry, progress, lock))
    }

    /// Snapshot of a run: record, step progress and artifacts.
    pub fn get_status(&self, run_id: &str) -> Result<RunState, EngineError> {
        let run = self.store.load_run(run_id)?;
        let workflow = self.store.load_workflow(run_id)?;
        let checkpoints = CheckpointStore::new(&self.store.run_dir(run_id), run_id);
        let checkpoint = checkpoints.load_latest_valid().ok().flatten();

        let progress = checkpoint
            .as_ref()
            .map(|c| c.progress.clone())
            .unwrap_or_default();
        let completed_steps = workflow
            .steps
            .iter()
            .filter(|s| progress.is_completed(&s.id))
            .map(|s| s.id.clone())
            .collect();
        let pending_steps = workflow
            .steps
            .iter()
            .filter(|s| !progress.is_completed(&s.id))
            .map(|s| s.id.clone())
            .collect();

        Ok(RunState {
            active: self.store.is_locked(run_id),
            checkpoint_sequence: checkpoint.as_ref().map(|c| c.sequence),
            artifacts: checkpoint.map(|c| c.artifact_index).unwrap_or_default(),
            completed_steps,
            pending_steps,
            run,
        })
    }

    /// Abort a run. A coordinator in another process picks the request up
    /// within a poll interval; an idle run is aborted on the spot.
    pub fn abort_run(&self, run_id: &str, reason: &str) -> Result<Run, EngineError> {
        let mut run = self.store.load_run(run_id)?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: run.status,
                to: RunStatus::Aborted,
            });
        }
        self.store.request_abort(run_id, reason)?;

        match self.store.lock(run_id) {
            Ok(_lock) => {
                run.set_meta(meta::ABORT_REASON, reason);
                run.transition(RunStatus::Aborted)?;
                self.store.save_run(&run)?;
                self.store.clear_abort(run_id);
                info!(run_id, reason, "Run aborted");
                Ok(run)
            }
            Err(EngineError::RunLocked { .. }) => {
                info!(run_id, reason, "Abort requested from active coordinator");
                Ok(run)
            }
            Err(e) => Err(e),
        }
    }

    /// Answer a run waiting on approval. `Reject` fails the run; `Approve`
    /// and `Replan` continue it and return the new handle.
    pub async fn resolve_approval(
        &self,
        run_id: &str,
        decision: ApprovalDecision,
    ) -> Result<Option<RunHandle>, EngineError> {
        let record = self.store.load_run(run_id)?;
        if record.status != RunStatus::WaitingApproval {
            let to = match decision {
                ApprovalDecision::Reject => RunStatus::Failed,
                _ => RunStatus::Running,
            };
            return Err(EngineError::InvalidTransition {
                from: record.status,
                to,
            });
        }
        let lock = self.store.lock(run_id)?;

        if decision == ApprovalDecision::Reject {
            let mut run = record;
            run.set_meta(meta::APPROVAL, decision.to_string());
            run.transition(RunStatus::Failed)?;
            self.store.save_run(&run)?;
            info!(run_id, "Approval rejected; run failed");
            return Ok(None);
        }

        let workflow = self.store.load_workflow(run_id)?;
        let graph = self.validate_workflow(&workflow)?;
        let gate_id = record
            .meta_str(meta::AWAITING_GATE)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Run {} is not waiting on a gate", run_id))?;
        let Restored {
            mut run,
            mut progress,
            mut registry,
            ..
        } = self.restore(&record)?;
        run.metadata = record.metadata;
        let scheduler = StepScheduler::new(
            Arc::new(workflow.clone()),
            graph.clone(),
            self.config.engine.max_concurrent_workers,
        );

        match decision {
            ApprovalDecision::Approve => {
                self.approve_gate(&run, &workflow, &gate_id, &mut progress, &mut registry)?;
            }
            ApprovalDecision::Replan => {
                let feedback = run.error().and_then(|e| e.feedback).unwrap_or_default();
                progress.rating_rounds.remove(&gate_id);
                scheduler.reopen_for_replan(&mut progress, &gate_id, feedback);
            }
            ApprovalDecision::Reject => {}
        }

        run.metadata.remove(meta::ERROR);
        run.metadata.remove(meta::AWAITING_GATE);
        run.set_meta(meta::APPROVAL, decision.to_string());
        self.store.save_run(&run)?;
        CheckpointStore::new(&self.store.run_dir(run_id), run_id).save(&run, &progress, &registry)?;
        info!(run_id, gate = %gate_id, %decision, "Approval resolved");

        Ok(Some(self.launch(run, workflow, graph, registry, progress, lock)))
    }

    /// Complete an escalated gate on the operator's word: an approval record
    /// stands in for the passing rating.
    fn approve_gate(
        &self,
        run: &Run,
        workflow: &WorkflowDef,
        gate_id: &str,
        progress: &mut StepProgress,
        registry: &mut ArtifactRegistry,
    ) -> Result<(), EngineError> {
        let gate = workflow
            .step(gate_id)
            .ok_or_else(|| anyhow!("Unknown gate step '{}'", gate_id))?;
        let plan_step = gate.plan_step().unwrap_or_default().to_string();
        let plan_key = workflow
            .step(&plan_step)
            .and_then(|s| s.output_names().into_iter().next())
            .and_then(|name| registry.resolve(&name).artifact().map(|a| a.key()))
            .unwrap_or_else(|| plan_step.clone());

        let record = json!({
            "decision": ApprovalDecision::Approve,
            "plan_artifact": plan_key,
            "gate": gate_id,
            "approved_at": Utc::now(),
            "last_rating": run.metadata.get(meta::LAST_RATING),
        });
        let path = self
            .store
            .run_dir(&run.run_id)
            .join("plans")
            .join(format!("{}-approval.json", plan_key.replace('@', "-")));
        let bytes = serde_json::to_vec_pretty(&record).context("Failed to encode approval")?;
        crate::util::write_atomic(&path, &bytes).map_err(|e| EngineError::io(&path, e))?;

        let output = gate
            .output_names()
            .into_iter()
            .next()
            .unwrap_or_else(|| gate_id.to_string());
        let key = registry
            .register(ArtifactMeta {
                name: output,
                producing_step: gate_id.to_string(),
                path,
                schema_ref: None,
            })
            .map_err(|source| EngineError::Step {
                step_id: gate_id.to_string(),
                source,
            })?
            .key();
        registry.mark_passed(&key);
        progress.mark_completed(gate_id);
        progress.pending_feedback.remove(&plan_step);
        Ok(())
    }

    fn restore(&self, record: &Run) -> Result<Restored, EngineError> {
        let checkpoints = CheckpointStore::new(&self.store.run_dir(&record.run_id), &record.run_id);
        match checkpoints.load_latest_valid()? {
            Some(checkpoint) => Ok(resume_from(checkpoint)),
            None => {
                // Interrupted before the first step finished.
                let mut run = record.clone();
                run.status = RunStatus::Running;
                Ok(Restored {
                    registry: ArtifactRegistry::new(run.run_id.clone()),
                    progress: StepProgress::default(),
                    sequence: 0,
                    run,
                })
            }
        }
    }

    fn launch(
        &self,
        run: Run,
        workflow: WorkflowDef,
        graph: StepGraph,
        registry: ArtifactRegistry,
        progress: StepProgress,
        lock: RunLock,
    ) -> RunHandle {
        let workflow = Arc::new(workflow);
        let config = &self.config;
        let services = Arc::new(StepServices {
            workflow: workflow.clone(),
            launcher: WorkerLauncher::new(
                config.worker.command.clone(),
                config.worker.args.clone(),
                config.abort_grace(),
            ),
            skills: self.skills.clone(),
            gate: PlanQualityGate::new(),
            providers: self.providers.clone(),
            monitor: self.monitor.clone(),
            min_free_bytes: config.pressure.min_free_bytes(),
            content: registry.content_cache(),
            default_gate_timeout: Duration::from_secs(config.gate.default_timeout_secs),
        });
        let scheduler = StepScheduler::new(
            workflow.clone(),
            graph,
            config.engine.max_concurrent_workers,
        );
        let cancel = CancellationToken::new();
        let run_id = run.run_id.clone();
        let driver = RunDriver::new(DriverParts {
            run,
            workflow,
            scheduler,
            registry,
            progress,
            services,
            store: self.store.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
            events: self.events.clone(),
            lock,
        });
        RunHandle {
            run_id,
            cancel,
            task: tokio::spawn(driver.drive()),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        self.store.list_runs()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.store.state_dir().to_path_buf()
    }
}
