//! The coordinator loop of one run.
//!
//! The driver is the only owner of the run record, its artifact registry and
//! its scheduling progress. Step attempts run on a `JoinSet`; the loop
//! dispatches whatever the scheduler allows, then waits for the next attempt
//! to finish, an abort request, or a memory-pressure transition.

use super::events::RunEvent;
use super::store::{RunLock, RunStore};
use super::{Run, RunError, RunStatus, meta};
use crate::artifact::ArtifactRegistry;
use crate::checkpoint::CheckpointStore;
use crate::config::{EngineConfig, EscalationPolicy, PressurePolicy};
use crate::errors::{EngineError, ErrorTag, StepError};
use crate::pressure::{PressureEvent, PressureLevel, Purgeable};
use crate::scheduler::{StepContext, StepOutput, StepProgress, StepScheduler, StepServices, execute};
use crate::workflow::WorkflowDef;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often the loop wakes up to look for abort requests.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

type Attempt = (String, u32, Result<StepOutput, StepError>);

/// How a drive ended.
#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub run: Run,
    /// Stopped under memory pressure with a checkpoint; resume continues it.
    pub paused: bool,
}

/// Why the loop stopped dispatching.
#[derive(Debug, Clone, PartialEq)]
enum Stop {
    Abort(String),
    Fail,
    Escalate,
    Pause,
}

enum Disposition {
    Continue,
    Retry(Duration),
    Stop(Stop),
}

/// Everything a driver needs, assembled by the run manager.
pub struct DriverParts {
    pub run: Run,
    pub workflow: Arc<WorkflowDef>,
    pub scheduler: StepScheduler,
    pub registry: ArtifactRegistry,
    pub progress: StepProgress,
    pub services: Arc<StepServices>,
    pub store: RunStore,
    pub config: Arc<EngineConfig>,
    pub cancel: CancellationToken,
    pub events: Option<mpsc::Sender<RunEvent>>,
    pub lock: RunLock,
}

pub struct RunDriver {
    run: Run,
    workflow: Arc<WorkflowDef>,
    scheduler: StepScheduler,
    registry: ArtifactRegistry,
    progress: StepProgress,
    inputs: Arc<BTreeMap<String, String>>,
    services: Arc<StepServices>,
    store: RunStore,
    checkpoints: CheckpointStore,
    run_dir: PathBuf,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<RunEvent>>,
    /// Gate steps currently dispatched; the run stays `Gated` while any remain.
    gates_in_flight: BTreeSet<String>,
    _lock: RunLock,
}

impl RunDriver {
    pub fn new(parts: DriverParts) -> Self {
        let run_dir = parts.store.run_dir(&parts.run.run_id);
        let checkpoints = CheckpointStore::new(&run_dir, parts.run.run_id.clone());
        Self {
            inputs: Arc::new(parts.run.inputs()),
            run: parts.run,
            workflow: parts.workflow,
            scheduler: parts.scheduler,
            registry: parts.registry,
            progress: parts.progress,
            services: parts.services,
            store: parts.store,
            checkpoints,
            run_dir,
            config: parts.config,
            cancel: parts.cancel,
            events: parts.events,
            gates_in_flight: BTreeSet::new(),
            _lock: parts.lock,
        }
    }

    /// Execute the run until it completes, fails, escalates, aborts or pauses.
    pub async fn drive(mut self) -> Result<DriveOutcome, EngineError> {
        let content: Arc<dyn Purgeable> = self.services.content.clone();
        let ratings: Arc<dyn Purgeable> = self.services.gate.cache();
        self.services.monitor.register_purgeable(content);
        self.services.monitor.register_purgeable(ratings);

        // Subscribe before the first sample so no transition is missed.
        let pressure = self.services.monitor.subscribe();
        let sampler_cancel = CancellationToken::new();
        let sampler = self.services.monitor.spawn_sampler(
            Duration::from_secs(self.config.pressure.sample_interval_secs),
            sampler_cancel.clone(),
        );
        let result = self.drive_loop(pressure).await;
        sampler_cancel.cancel();
        let _ = sampler.await;

        if let Err(e) = &result {
            error!(run_id = %self.run.run_id, error = %e, "Run coordinator failed");
        }
        result
    }

    async fn drive_loop(
        &mut self,
        mut pressure: broadcast::Receiver<PressureEvent>,
    ) -> Result<DriveOutcome, EngineError> {
        info!(
            run_id = %self.run.run_id,
            workflow = %self.workflow.id,
            steps = self.workflow.steps.len(),
            "Driving run"
        );
        self.set_status(RunStatus::Running).await?;

        let step_cancel = self.cancel.child_token();
        let mut tasks: JoinSet<Attempt> = JoinSet::new();
        let mut task_steps: HashMap<Id, String> = HashMap::new();
        let mut in_flight: BTreeSet<String> = BTreeSet::new();
        let mut stop: Option<Stop> = None;
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if stop.is_none()
                && let Some(reason) = self.abort_reason()
            {
                info!(run_id = %self.run.run_id, reason = %reason, "Abort requested");
                stop = Some(Stop::Abort(reason));
                step_cancel.cancel();
            }

            if stop.is_none() {
                let batch: Vec<String> = self
                    .scheduler
                    .ready_batch(&self.progress, &self.registry, &in_flight)
                    .into_iter()
                    .map(|s| s.id.clone())
                    .collect();
                for step_id in batch {
                    let id = self
                        .dispatch(&mut tasks, &step_id, Duration::ZERO, &step_cancel)
                        .await?;
                    task_steps.insert(id, step_id.clone());
                    in_flight.insert(step_id);
                }
            }

            if in_flight.is_empty() {
                return self.finish(stop).await;
            }

            tokio::select! {
                Some(joined) = tasks.join_next_with_id() => {
                    let (step_id, attempt, result) = match joined {
                        Ok((id, finished)) => {
                            task_steps.remove(&id);
                            finished
                        }
                        Err(e) => {
                            let step_id = task_steps.remove(&e.id()).unwrap_or_default();
                            let attempts = self.progress.attempts(&step_id);
                            (step_id, attempts, Err(StepError::Other(anyhow::anyhow!("step task failed: {}", e))))
                        }
                    };
                    in_flight.remove(&step_id);
                    self.gates_in_flight.remove(&step_id);

                    match self.on_finished(&step_id, attempt, result, stop.is_some()).await? {
                        Disposition::Continue => {}
                        Disposition::Retry(delay) => {
                            let id = self.dispatch(&mut tasks, &step_id, delay, &step_cancel).await?;
                            task_steps.insert(id, step_id.clone());
                            in_flight.insert(step_id);
                        }
                        Disposition::Stop(next) => {
                            if stop.is_none() {
                                stop = Some(next);
                                step_cancel.cancel();
                            }
                        }
                    }
                }
                _ = poll.tick() => {}
                event = pressure.recv() => {
                    if let Ok(event) = event
                        && event.current == PressureLevel::Critical
                        && self.config.pressure.policy == PressurePolicy::CheckpointAndExit
                        && stop.is_none()
                    {
                        warn!(run_id = %self.run.run_id, "Critical memory pressure; checkpointing and pausing");
                        stop = Some(Stop::Pause);
                        step_cancel.cancel();
                    }
                }
            }
        }
    }

    fn abort_reason(&self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some("cancelled".to_string());
        }
        self.store
            .abort_request(&self.run.run_id)
            .map(|reason| if reason.is_empty() { "abort requested".to_string() } else { reason })
    }

    /// Start one attempt of `step_id`.
    async fn dispatch(
        &mut self,
        tasks: &mut JoinSet<Attempt>,
        step_id: &str,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<Id, EngineError> {
        let step = self
            .workflow
            .step(step_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown step '{}'", step_id))?;
        let attempt = self.progress.next_attempt(step_id);
        let ctx = StepContext {
            run_id: self.run.run_id.clone(),
            run_dir: self.run_dir.clone(),
            timeout: step
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.config.default_step_timeout()),
            dependencies: self.scheduler.dependency_artifacts(&step, &self.registry),
            feedback: self.progress.feedback_for(step_id).map(str::to_string),
            rating_round: self.progress.rounds(step_id) + 1,
            inputs: self.inputs.clone(),
            attempt,
            delay,
            cancel: cancel.clone(),
            step,
        };

        if ctx.step.is_gate() {
            self.gates_in_flight.insert(step_id.to_string());
            if self.run.status == RunStatus::Running {
                self.set_status(RunStatus::Gated).await?;
            }
        }
        self.run.current_step = Some(step_id.to_string());
        info!(
            run_id = %self.run.run_id,
            step_id,
            kind = ctx.step.kind.label(),
            attempt,
            "Step dispatched"
        );
        self.emit(RunEvent::StepStarted {
            run_id: self.run.run_id.clone(),
            step_id: step_id.to_string(),
            attempt,
        })
        .await;

        let services = self.services.clone();
        let handle = tasks.spawn(async move {
            let step_id = ctx.step.id.clone();
            let attempt = ctx.attempt;
            (step_id, attempt, execute(ctx, services).await)
        });
        Ok(handle.id())
    }

    async fn on_finished(
        &mut self,
        step_id: &str,
        attempt: u32,
        result: Result<StepOutput, StepError>,
        stopping: bool,
    ) -> Result<Disposition, EngineError> {
        let output = match result {
            Ok(output) => output,
            Err(e) => return self.on_error(step_id, attempt, e, stopping).await,
        };

        let mut keys = Vec::new();
        for meta in output.artifacts {
            let key = match self.registry.register(meta) {
                Ok(artifact) => artifact.key(),
                Err(e) => return self.on_error(step_id, attempt, e, stopping).await,
            };
            if let Err(e) = self.registry.validate(&key) {
                return self.on_error(step_id, attempt, e, stopping).await;
            }
            keys.push(key);
        }

        if let Some(rating) = &output.rating {
            self.progress
                .rating_rounds
                .insert(step_id.to_string(), rating.attempt);
            self.note_rating(step_id, rating).await;
        }
        self.progress.mark_completed(step_id);
        self.progress.pending_feedback.remove(step_id);
        self.leave_gated().await?;
        info!(run_id = %self.run.run_id, step_id, artifacts = ?keys, "Step completed");
        self.emit(RunEvent::StepCompleted {
            run_id: self.run.run_id.clone(),
            step_id: step_id.to_string(),
            artifacts: keys,
        })
        .await;
        self.store.save_run(&self.run)?;
        self.checkpoint().await?;
        Ok(Disposition::Continue)
    }

    async fn on_error(
        &mut self,
        step_id: &str,
        attempt: u32,
        error: StepError,
        stopping: bool,
    ) -> Result<Disposition, EngineError> {
        if stopping && matches!(error, StepError::Cancelled) {
            return Ok(Disposition::Continue);
        }

        if let StepError::QualityBelowThreshold { result } = &error {
            let round = result.attempt;
            self.progress
                .rating_rounds
                .insert(step_id.to_string(), round);
            self.note_rating(step_id, result).await;
            if stopping {
                return Ok(Disposition::Continue);
            }

            let max_rounds = self
                .workflow
                .max_rating_rounds
                .unwrap_or(self.config.gate.max_rating_rounds);
            if round < max_rounds {
                let feedback = result.aggregated_feedback();
                let plan = self
                    .scheduler
                    .reopen_for_replan(&mut self.progress, step_id, feedback);
                info!(
                    run_id = %self.run.run_id,
                    gate = step_id,
                    plan = ?plan,
                    round,
                    max_rounds,
                    "Plan below threshold; re-planning with feedback"
                );
                self.leave_gated().await?;
                self.store.save_run(&self.run)?;
                self.checkpoint().await?;
                return Ok(Disposition::Continue);
            }

            warn!(
                run_id = %self.run.run_id,
                gate = step_id,
                round,
                "Rating rounds exhausted"
            );
            self.run.record_error(RunError::from_step(step_id, &error));
            self.run.set_meta(meta::AWAITING_GATE, step_id);
            return Ok(Disposition::Stop(Stop::Escalate));
        }

        let policy = self
            .workflow
            .step(step_id)
            .map(|s| s.retry_policy.clone())
            .unwrap_or_default();
        let will_retry = !stopping && error.is_retryable() && policy.allows_retry(attempt);
        warn!(
            run_id = %self.run.run_id,
            step_id,
            attempt,
            tag = %error.tag(),
            error = %error,
            will_retry,
            "Step attempt failed"
        );
        self.emit(RunEvent::StepFailed {
            run_id: self.run.run_id.clone(),
            step_id: step_id.to_string(),
            attempt,
            tag: error.tag(),
            message: error.to_string(),
            will_retry,
        })
        .await;

        if will_retry {
            return Ok(Disposition::Retry(policy.delay_for(attempt)));
        }
        if stopping {
            return Ok(Disposition::Continue);
        }
        self.run.record_error(RunError::from_step(step_id, &error));
        Ok(Disposition::Stop(Stop::Fail))
    }

    async fn note_rating(&mut self, step_id: &str, rating: &crate::gate::RatingResult) {
        self.run.set_meta(
            meta::LAST_RATING,
            json!({
                "gate": step_id,
                "plan_artifact": rating.plan_artifact,
                "round": rating.attempt,
                "overall_score": format!("{:.2}", rating.overall_score),
                "minimum_score": format!("{:.2}", rating.minimum_score),
                "passed": rating.passed,
            }),
        );
        self.emit(RunEvent::GateRated {
            run_id: self.run.run_id.clone(),
            step_id: step_id.to_string(),
            plan_artifact: rating.plan_artifact.clone(),
            overall_score: rating.overall_score,
            minimum_score: rating.minimum_score,
            passed: rating.passed,
            round: rating.attempt,
        })
        .await;
    }

    async fn finish(&mut self, stop: Option<Stop>) -> Result<DriveOutcome, EngineError> {
        if self.run.status == RunStatus::Gated {
            self.set_status(RunStatus::Running).await?;
        }
        let mut paused = false;
        match stop {
            None if self.scheduler.is_complete(&self.progress) => {
                self.set_status(RunStatus::Completed).await?;
            }
            None => {
                let pending = self.scheduler.pending_steps(&self.progress);
                let blocked = pending.first().cloned().unwrap_or_default();
                error!(run_id = %self.run.run_id, pending = ?pending, "No step can make progress");
                self.run.record_error(RunError {
                    tag: ErrorTag::Internal,
                    step_id: blocked,
                    message: format!("no eligible step; pending: {}", pending.join(", ")),
                    feedback: None,
                });
                self.set_status(RunStatus::Failed).await?;
            }
            Some(Stop::Abort(reason)) => {
                self.run.set_meta(meta::ABORT_REASON, reason);
                self.set_status(RunStatus::Aborted).await?;
                self.store.clear_abort(&self.run.run_id);
            }
            Some(Stop::Fail) => {
                self.set_status(RunStatus::Failed).await?;
            }
            Some(Stop::Escalate) => {
                self.set_status(RunStatus::Failed).await?;
                if self.config.gate.escalation == EscalationPolicy::HumanReview {
                    self.set_status(RunStatus::WaitingApproval).await?;
                }
            }
            Some(Stop::Pause) => {
                self.run.set_meta(meta::PAUSED, "memory_pressure");
                paused = true;
                self.emit(RunEvent::Paused {
                    run_id: self.run.run_id.clone(),
                })
                .await;
            }
        }

        self.store.save_run(&self.run)?;
        self.checkpoint().await?;
        info!(run_id = %self.run.run_id, status = %self.run.status, paused, "Run stopped");
        self.emit(RunEvent::Finished {
            run_id: self.run.run_id.clone(),
            status: self.run.status,
        })
        .await;
        Ok(DriveOutcome {
            run: self.run.clone(),
            paused,
        })
    }

    /// Back to `Running` once no gate is being rated.
    async fn leave_gated(&mut self) -> Result<(), EngineError> {
        if self.run.status == RunStatus::Gated && self.gates_in_flight.is_empty() {
            self.set_status(RunStatus::Running).await?;
        }
        Ok(())
    }

    async fn set_status(&mut self, next: RunStatus) -> Result<(), EngineError> {
        let from = self.run.status;
        if from == next {
            return Ok(());
        }
        self.run.transition(next)?;
        self.store.save_run(&self.run)?;
        self.emit(RunEvent::StatusChanged {
            run_id: self.run.run_id.clone(),
            from,
            to: next,
        })
        .await;
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<(), EngineError> {
        let sequence = self
            .checkpoints
            .save(&self.run, &self.progress, &self.registry)?;
        self.emit(RunEvent::CheckpointSaved {
            run_id: self.run.run_id.clone(),
            sequence,
        })
        .await;
        Ok(())
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.events {
            tx.send(event).await.ok();
        }
    }
}
