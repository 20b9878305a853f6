//! Workflow inspection: `conductor workflow check`.

use anyhow::Result;
use conductor::config::EngineConfig;
use conductor::run::RunManager;
use conductor::workflow::{StepKind, WorkflowDef};
use console::style;
use std::process::ExitCode;

use super::super::WorkflowCommands;

pub fn cmd_workflow(config: &EngineConfig, command: WorkflowCommands) -> Result<ExitCode> {
    match command {
        WorkflowCommands::Check { file } => {
            let workflow = WorkflowDef::load(&file)?;
            let manager = RunManager::new(config.clone());
            let graph = match manager.validate_workflow(&workflow) {
                Ok(graph) => graph,
                Err(e) => {
                    println!("{} {}", style("✗").red().bold(), e);
                    return Ok(ExitCode::FAILURE);
                }
            };

            println!(
                "{} Workflow '{}' is valid ({} steps, risk class {})",
                style("✓").green().bold(),
                workflow.id,
                graph.len(),
                workflow.risk_class
            );
            for (i, wave) in graph.waves().iter().enumerate() {
                let steps: Vec<String> = wave
                    .iter()
                    .map(|id| match workflow.step(id).map(|s| &s.kind) {
                        Some(StepKind::Gate(_)) => format!("{} (gate)", id),
                        _ => id.clone(),
                    })
                    .collect();
                println!("  wave {}: {}", i + 1, steps.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
