use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use conductor::config::{CliOverrides, EngineConfig, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Run orchestration engine for multi-step agent workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to conductor.toml (defaults to .conductor/conductor.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding run state. Overrides the config file and CONDUCTOR_STATE_DIR.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start, resume and steer runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Inspect workflow definitions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Manage conductor.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// A run id given either positionally or with `--run-id`.
#[derive(Args, Clone, Debug)]
pub struct RunIdArg {
    #[arg(value_name = "RUN_ID", required_unless_present = "run_id", conflicts_with = "run_id")]
    id: Option<String>,

    #[arg(long = "run-id", value_name = "RUN_ID")]
    run_id: Option<String>,
}

impl RunIdArg {
    pub fn get(&self) -> &str {
        self.run_id
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Subcommand, Clone)]
pub enum RunCommands {
    /// Start a new run of a workflow file
    Start {
        /// Workflow definition (.yaml, .yml or .json)
        workflow: PathBuf,
        /// Workflow input as key=value; repeatable
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// Resume an interrupted, paused or failed run from its last checkpoint
    Resume {
        #[command(flatten)]
        run: RunIdArg,
    },
    /// Show the state of a run
    Status {
        #[command(flatten)]
        run: RunIdArg,
        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Abort a run
    Abort {
        #[command(flatten)]
        run: RunIdArg,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
    /// Answer a run waiting on approval: approve, replan or reject
    Approve {
        #[command(flatten)]
        run: RunIdArg,
        #[arg(long)]
        decision: conductor::run::ApprovalDecision,
    },
    /// List all runs in the state directory
    List,
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// Validate a workflow file and print its execution waves
    Check { file: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let overrides = CliOverrides {
        state_dir: cli.state_dir.clone(),
        log_format: cli.log_format,
        verbose: cli.verbose,
    };
    let config = EngineConfig::resolve(&project_dir, cli.config.as_deref(), &overrides)?;
    let _log_guard = conductor::logging::init(&config.logging, &config.engine.state_dir)?;

    match &cli.command {
        Commands::Run { command } => cmd::cmd_run(config, command.clone()).await,
        Commands::Workflow { command } => cmd::cmd_workflow(&config, command.clone()),
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), &config, command.clone())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
