//! Run lifecycle commands: `conductor run ...`.

use anyhow::{Context, Result, bail};
use conductor::config::EngineConfig;
use conductor::run::{
    DriveOutcome, RunEvent, RunHandle, RunManager, RunState, RunStatus,
};
use conductor::workflow::WorkflowDef;
use console::style;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::mpsc;

use super::super::RunCommands;

/// Run ended in `waiting_approval`.
pub const EXIT_WAITING_APPROVAL: u8 = 3;
/// Run paused under memory pressure with a checkpoint saved; resume it.
pub const EXIT_PAUSED: u8 = 75;

pub async fn cmd_run(config: EngineConfig, command: RunCommands) -> Result<ExitCode> {
    match command {
        RunCommands::Start { workflow, inputs } => start(config, &workflow, &inputs).await,
        RunCommands::Resume { run } => {
            let (manager, rx) = manager_with_events(config);
            let handle = manager.resume_run(run.get()).await?;
            println!(
                "{} Resuming run {}",
                style("▶").cyan(),
                style(handle.run_id()).bold()
            );
            follow(manager, handle, rx).await
        }
        RunCommands::Status { run, json } => {
            let manager = RunManager::new(config);
            let state = manager.get_status(run.get())?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&state).context("Failed to encode run state")?
                );
            } else {
                print_state(&state);
            }
            Ok(ExitCode::SUCCESS)
        }
        RunCommands::Abort { run, reason } => {
            let manager = RunManager::new(config);
            let record = manager.abort_run(run.get(), &reason)?;
            if record.status == RunStatus::Aborted {
                println!("{} Run {} aborted", style("■").red(), style(&record.run_id).bold());
            } else {
                println!(
                    "{} Abort requested; the coordinating process will stop run {}",
                    style("■").yellow(),
                    style(&record.run_id).bold()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        RunCommands::Approve { run, decision } => {
            let (manager, rx) = manager_with_events(config);
            match manager.resolve_approval(run.get(), decision).await? {
                Some(handle) => {
                    println!(
                        "{} Decision '{}' recorded, continuing run {}",
                        style("✓").green(),
                        decision,
                        style(handle.run_id()).bold()
                    );
                    follow(manager, handle, rx).await
                }
                None => {
                    println!("{} Run {} rejected", style("✗").red(), style(run.get()).bold());
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
        RunCommands::List => {
            let manager = RunManager::new(config);
            list(&manager)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn start(config: EngineConfig, workflow: &Path, inputs: &[String]) -> Result<ExitCode> {
    let workflow = WorkflowDef::load(workflow)?;
    let inputs = parse_inputs(inputs)?;
    let (manager, rx) = manager_with_events(config);
    let handle = manager.start_run(workflow, inputs).await?;
    println!(
        "{} Run {} started",
        style("▶").cyan(),
        style(handle.run_id()).bold()
    );
    follow(manager, handle, rx).await
}

fn manager_with_events(config: EngineConfig) -> (RunManager, mpsc::Receiver<RunEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (RunManager::new(config).with_event_channel(tx), rx)
}

/// Print events until the run stops, then map its outcome to an exit code.
async fn follow(
    manager: RunManager,
    handle: RunHandle,
    mut rx: mpsc::Receiver<RunEvent>,
) -> Result<ExitCode> {
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let outcome = handle.wait().await;
    // Dropping the manager closes the channel so the printer drains and exits.
    drop(manager);
    printer.await.ok();

    let outcome = outcome?;
    print_outcome(&outcome);
    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &DriveOutcome) -> ExitCode {
    if outcome.paused {
        return ExitCode::from(EXIT_PAUSED);
    }
    match outcome.run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::WaitingApproval => ExitCode::from(EXIT_WAITING_APPROVAL),
        _ => ExitCode::FAILURE,
    }
}

fn parse_inputs(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut inputs = BTreeMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid input '{}'. Expected KEY=VALUE", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid input '{}'. Key is empty", pair);
        }
        inputs.insert(key.to_string(), value.to_string());
    }
    Ok(inputs)
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::StepStarted {
            step_id, attempt, ..
        } => {
            if *attempt > 1 {
                println!("  {} {} (attempt {})", style("▸").cyan(), step_id, attempt);
            } else {
                println!("  {} {}", style("▸").cyan(), step_id);
            }
        }
        RunEvent::StepCompleted {
            step_id, artifacts, ..
        } => {
            println!(
                "  {} {} {}",
                style("✓").green(),
                step_id,
                style(format!("[{}]", artifacts.join(", "))).dim()
            );
        }
        RunEvent::StepFailed {
            step_id,
            attempt,
            tag,
            message,
            will_retry,
            ..
        } => {
            let suffix = if *will_retry { ", retrying" } else { "" };
            println!(
                "  {} {} attempt {} failed ({}{}): {}",
                style("✗").red(),
                step_id,
                attempt,
                tag,
                suffix,
                message
            );
        }
        RunEvent::GateRated {
            step_id,
            plan_artifact,
            overall_score,
            minimum_score,
            passed,
            round,
            ..
        } => {
            let verdict = if *passed {
                style("pass").green()
            } else {
                style("below threshold").yellow()
            };
            println!(
                "  {} {} rated {} round {}: {:.2} / {:.2} {}",
                style("◆").magenta(),
                step_id,
                plan_artifact,
                round,
                overall_score,
                minimum_score,
                verdict
            );
        }
        RunEvent::StatusChanged { from, to, .. } => {
            println!("  {}", style(format!("status {} → {}", from, to)).dim());
        }
        RunEvent::Paused { .. } => {
            println!("  {} paused under memory pressure", style("‖").yellow());
        }
        RunEvent::CheckpointSaved { .. } | RunEvent::Finished { .. } => {}
    }
}

fn print_outcome(outcome: &DriveOutcome) {
    let run = &outcome.run;
    println!();
    if outcome.paused {
        println!(
            "{} Run {} paused with a checkpoint saved. Resume with: conductor run resume {}",
            style("‖").yellow().bold(),
            style(&run.run_id).bold(),
            run.run_id
        );
        return;
    }
    match run.status {
        RunStatus::Completed => {
            println!("{} Run {} completed", style("✓").green().bold(), style(&run.run_id).bold());
        }
        RunStatus::WaitingApproval => {
            println!(
                "{} Run {} is waiting for approval. Answer with: conductor run approve {} --decision <approve|replan|reject>",
                style("?").yellow().bold(),
                style(&run.run_id).bold(),
                run.run_id
            );
        }
        status => {
            println!("{} Run {} {}", style("✗").red().bold(), style(&run.run_id).bold(), status);
            if let Some(error) = run.error() {
                println!("  {} at step {}: {}", error.tag, error.step_id, error.message);
            }
        }
    }
}

fn print_state(state: &RunState) {
    let run = &state.run;
    println!();
    println!("Run {}", style(&run.run_id).bold());
    println!("  workflow:  {}", run.workflow_id);
    println!("  status:    {}", style_status(run.status));
    if let Some(step) = &run.current_step {
        println!("  current:   {}", step);
    }
    println!("  created:   {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  updated:   {}", run.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if state.active {
        println!("  {}", style("coordinated by a live process").dim());
    }
    if let Some(sequence) = state.checkpoint_sequence {
        println!("  checkpoint: #{}", sequence);
    }
    println!();
    println!("Completed steps ({}):", state.completed_steps.len());
    for step in &state.completed_steps {
        println!("  {} {}", style("✓").green(), step);
    }
    if !state.pending_steps.is_empty() {
        println!("Pending steps ({}):", state.pending_steps.len());
        for step in &state.pending_steps {
            println!("  {} {}", style("·").dim(), step);
        }
    }
    if !state.artifacts.is_empty() {
        println!("Artifacts:");
        for artifact in &state.artifacts {
            println!(
                "  {} {} ({})",
                artifact.key(),
                style(artifact.path.display()).dim(),
                artifact.validation_status
            );
        }
    }
    if let Some(error) = run.error() {
        println!();
        println!("{} {} at step {}", style("Error:").red().bold(), error.tag, error.step_id);
        println!("  {}", error.message);
    }
    println!();
}

fn list(manager: &RunManager) -> Result<()> {
    let runs = manager.list_runs()?;
    if runs.is_empty() {
        println!("No runs in {}", manager.state_dir().display());
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<20} {:<18} {}",
            run.run_id,
            run.workflow_id,
            style_status(run.status),
            style(run.updated_at.format("%Y-%m-%d %H:%M:%S")).dim()
        );
    }
    Ok(())
}

fn style_status(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Completed => style(text).green(),
        RunStatus::Failed | RunStatus::Aborted => style(text).red(),
        RunStatus::WaitingApproval | RunStatus::Gated => style(text).yellow(),
        RunStatus::Created | RunStatus::Running => style(text).cyan(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inputs() {
        let inputs = parse_inputs(&["goal=ship it".into(), "empty=".into()]).unwrap();
        assert_eq!(inputs["goal"], "ship it");
        assert_eq!(inputs["empty"], "");
        assert!(parse_inputs(&["novalue".into()]).is_err());
        assert!(parse_inputs(&["=x".into()]).is_err());
    }
}
