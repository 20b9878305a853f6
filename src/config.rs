//! Layered engine configuration.
//!
//! Configuration is read from `.conductor/conductor.toml`, then overridden by
//! `CONDUCTOR_*` environment variables, then by CLI flags.
//!
//! ```toml
//! [engine]
//! state_dir = ".conductor/runs"
//! max_concurrent_workers = 3
//! default_step_timeout_secs = 1800
//! abort_grace_secs = 10
//!
//! [worker]
//! command = "claude"
//! args = ["--print"]
//!
//! [pressure]
//! ceiling_mb = 8192
//! sample_interval_secs = 10
//! min_free_mb = 800
//! policy = "continue_after_cleanup"
//!
//! [gate]
//! max_rating_rounds = 3
//! default_timeout_secs = 120
//! escalation = "human_review"
//!
//! [[gate.providers]]
//! name = "reviewer"
//! kind = "command"
//! command = "./rate.sh"
//!
//! [[gate.providers]]
//! name = "remote"
//! kind = "http"
//! url = "http://localhost:8700/rate"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project-local configuration directory.
pub const CONDUCTOR_DIR: &str = ".conductor";
/// Name of the configuration file inside [`CONDUCTOR_DIR`].
pub const CONFIG_FILE: &str = "conductor.toml";

/// What the engine does when memory pressure turns critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressurePolicy {
    /// Purge caches, keep scheduling; admission control decides per spawn.
    #[default]
    ContinueAfterCleanup,
    /// Drain in-flight steps, save a checkpoint and pause the run.
    CheckpointAndExit,
}

impl std::fmt::Display for PressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressurePolicy::ContinueAfterCleanup => write!(f, "continue_after_cleanup"),
            PressurePolicy::CheckpointAndExit => write!(f, "checkpoint_and_exit"),
        }
    }
}

impl std::str::FromStr for PressurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "continue_after_cleanup" => Ok(PressurePolicy::ContinueAfterCleanup),
            "checkpoint_and_exit" => Ok(PressurePolicy::CheckpointAndExit),
            _ => anyhow::bail!(
                "Invalid pressure policy '{}'. Valid values: continue_after_cleanup, checkpoint_and_exit",
                s
            ),
        }
    }
}

/// What happens after the last allowed rating round fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    /// Park the run in `waiting_approval` for an operator decision.
    #[default]
    HumanReview,
    /// Leave the run `failed`.
    Terminate,
}

impl std::fmt::Display for EscalationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationPolicy::HumanReview => write!(f, "human_review"),
            EscalationPolicy::Terminate => write!(f, "terminate"),
        }
    }
}

impl std::str::FromStr for EscalationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "human_review" => Ok(EscalationPolicy::HumanReview),
            "terminate" => Ok(EscalationPolicy::Terminate),
            _ => anyhow::bail!(
                "Invalid escalation policy '{}'. Valid values: human_review, terminate",
                s
            ),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Directory holding one sub-directory per run. Relative paths are
    /// resolved against the project directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Upper bound on concurrently running worker subprocesses.
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    /// Timeout for steps that do not declare `timeout_secs`.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Time a worker gets between SIGTERM and a forced kill.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(CONDUCTOR_DIR).join("runs")
}

fn default_max_concurrent_workers() -> usize {
    3
}

fn default_step_timeout_secs() -> u64 {
    1800
}

fn default_abort_grace_secs() -> u64 {
    10
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_concurrent_workers: default_max_concurrent_workers(),
            default_step_timeout_secs: default_step_timeout_secs(),
            abort_grace_secs: default_abort_grace_secs(),
        }
    }
}

/// `[worker]` section: the command used for agent-spawn steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_worker_command() -> String {
    "claude".to_string()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
        }
    }
}

/// `[pressure]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureSection {
    /// Resident-memory ceiling the pressure ratio is computed against.
    #[serde(default = "default_ceiling_mb")]
    pub ceiling_mb: u64,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Free headroom (below the ceiling) required to spawn a worker.
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,
    #[serde(default)]
    pub policy: PressurePolicy,
}

fn default_ceiling_mb() -> u64 {
    8192
}

fn default_sample_interval_secs() -> u64 {
    10
}

fn default_min_free_mb() -> u64 {
    800
}

impl Default for PressureSection {
    fn default() -> Self {
        Self {
            ceiling_mb: default_ceiling_mb(),
            sample_interval_secs: default_sample_interval_secs(),
            min_free_mb: default_min_free_mb(),
            policy: PressurePolicy::default(),
        }
    }
}

impl PressureSection {
    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_mb.saturating_mul(1024 * 1024)
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_mb.saturating_mul(1024 * 1024)
    }
}

/// Transport of a rating provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local subprocess; request JSON on stdin, rating JSON on stdout.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Remote endpoint; request JSON POSTed, rating JSON in the response.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

/// One `[[gate.providers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// `[gate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSection {
    /// Rating rounds allowed before escalation, unless the workflow overrides it.
    #[serde(default = "default_max_rating_rounds")]
    pub max_rating_rounds: u32,
    /// Per-provider timeout for gates that do not declare `timeout_seconds`.
    #[serde(default = "default_gate_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub escalation: EscalationPolicy,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_max_rating_rounds() -> u32 {
    3
}

fn default_gate_timeout_secs() -> u64 {
    120
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            max_rating_rounds: default_max_rating_rounds(),
            default_timeout_secs: default_gate_timeout_secs(),
            escalation: EscalationPolicy::default(),
            providers: Vec::new(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Optional daily-rolling log file, relative to the state directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Overrides supplied on the command line; the last configuration layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub state_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub verbose: bool,
}

/// The complete `conductor.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub pressure: PressureSection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Default config file location for a project.
    pub fn default_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONDUCTOR_DIR).join(CONFIG_FILE)
    }

    /// Load the file at `path` (or the project default) if it exists.
    pub fn load_or_default(project_dir: &Path, path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Self::default_path(project_dir);
                if default.exists() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Resolve every layer: file, then environment, then CLI.
    pub fn resolve(
        project_dir: &Path,
        path: Option<&Path>,
        cli: &CliOverrides,
    ) -> Result<Self> {
        let mut config = Self::load_or_default(project_dir, path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        config.engine.state_dir = config.state_dir(project_dir);
        Ok(config)
    }

    /// Apply `CONDUCTOR_*` environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CONDUCTOR_STATE_DIR") {
            self.engine.state_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = lookup("CONDUCTOR_WORKER_CMD") {
            self.worker.command = cmd;
        }
        if let Some(n) = lookup("CONDUCTOR_MAX_WORKERS") {
            self.engine.max_concurrent_workers = n
                .parse()
                .with_context(|| format!("CONDUCTOR_MAX_WORKERS is not a number: {}", n))?;
        }
        if let Some(mb) = lookup("CONDUCTOR_MEMORY_CEILING_MB") {
            self.pressure.ceiling_mb = mb
                .parse()
                .with_context(|| format!("CONDUCTOR_MEMORY_CEILING_MB is not a number: {}", mb))?;
        }
        if let Some(policy) = lookup("CONDUCTOR_PRESSURE_POLICY") {
            self.pressure.policy = policy.parse()?;
        }
        if let Some(level) = lookup("CONDUCTOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(dir) = &cli.state_dir {
            self.engine.state_dir = dir.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// State directory, resolved against the project directory when relative.
    pub fn state_dir(&self, project_dir: &Path) -> PathBuf {
        if self.engine.state_dir.is_absolute() {
            self.engine.state_dir.clone()
        } else {
            project_dir.join(&self.engine.state_dir)
        }
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.default_step_timeout_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.engine.abort_grace_secs)
    }

    pub fn provider_names(&self) -> HashSet<String> {
        self.gate.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Check the configuration for suspicious values. Returns warnings, not errors.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_concurrent_workers == 0 {
            warnings.push("engine.max_concurrent_workers is 0; no agent step can ever run".into());
        }
        if self.engine.default_step_timeout_secs == 0 {
            warnings.push("engine.default_step_timeout_secs is 0; every step will time out".into());
        }
        if self.worker.command.trim().is_empty() {
            warnings.push("worker.command is empty".into());
        }
        if self.pressure.ceiling_mb == 0 {
            warnings.push("pressure.ceiling_mb is 0; pressure will always be critical".into());
        } else if self.pressure.min_free_mb >= self.pressure.ceiling_mb {
            warnings.push(format!(
                "pressure.min_free_mb ({}) is not below pressure.ceiling_mb ({}); no worker can be admitted",
                self.pressure.min_free_mb, self.pressure.ceiling_mb
            ));
        }
        if self.pressure.sample_interval_secs == 0 {
            warnings.push("pressure.sample_interval_secs is 0; using 1s".into());
        }
        if self.gate.max_rating_rounds == 0 {
            warnings.push("gate.max_rating_rounds is 0; gates escalate without rating".into());
        }

        let mut seen = HashSet::new();
        for provider in &self.gate.providers {
            if !seen.insert(provider.name.as_str()) {
                warnings.push(format!("gate provider '{}' is defined twice", provider.name));
            }
            match &provider.kind {
                ProviderKind::Command { command, .. } if command.trim().is_empty() => {
                    warnings.push(format!("gate provider '{}' has an empty command", provider.name));
                }
                ProviderKind::Http { url, .. }
                    if !(url.starts_with("http://") || url.starts_with("https://")) =>
                {
                    warnings.push(format!(
                        "gate provider '{}' url '{}' is not http(s)",
                        provider.name, url
                    ));
                }
                _ => {}
            }
        }

        if self.logging.level.parse::<tracing::Level>().is_err() {
            warnings.push(format!(
                "logging.level '{}' is not one of trace, debug, info, warn, error",
                self.logging.level
            ));
        }

        warnings
    }
}
