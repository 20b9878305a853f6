//! Configuration view and validation commands: `conductor config`.

use anyhow::{Context, Result};
use conductor::config::EngineConfig;
use console::style;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    explicit_path: Option<&Path>,
    effective: &EngineConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = explicit_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| EngineConfig::default_path(project_dir));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Run 'conductor config init' to create one.");
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(effective).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = effective.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid.", style("✓").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            EngineConfig::default().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] state_dir, max_concurrent_workers, timeouts");
            println!("  - [worker] command and args for agent-spawn steps");
            println!("  - [pressure] memory ceiling and pressure policy");
            println!("  - [[gate.providers]] rating providers for gate steps");
            println!();
        }
    }

    Ok(())
}
