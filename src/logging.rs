//! tracing subscriber setup.

use crate::config::{LogFormat, LoggingSection};
use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Console output goes
/// to stderr so command output on stdout stays machine-readable. When
/// `logging.file` is set, a daily-rolling JSON log is also written under
/// `state_dir`; the returned guard must be held until exit to flush it.
pub fn init(settings: &LoggingSection, state_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .with_context(|| format!("Invalid log level '{}'", settings.level))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match settings.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let mut guard = None;
    if let Some(file) = &settings.file {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            state_dir.join(file)
        };
        let dir = path.parent().unwrap_or(state_dir).to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "conductor.log".to_string());
        let appender = tracing_appender::rolling::daily(&dir, prefix);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
