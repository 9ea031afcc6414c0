use anyhow::{Context, Result};
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking log writers flushing until dropped.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Route everything to `debug.log`, warnings and errors also to
/// `error.log`, and mirror to stdout when `display_output` is set.
pub fn init(log_dir: &Path, display_output: bool) -> Result<LogGuards> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let (debug_writer, debug_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "debug.log"));
    let (error_writer, error_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "error.log"));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let debug_layer = fmt::layer().with_ansi(false).with_writer(debug_writer);
    let error_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(error_writer)
        .with_filter(LevelFilter::from_level(Level::WARN));
    let stdout_layer = display_output.then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(debug_layer)
        .with(error_layer)
        .with(stdout_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LogGuards {
        _guards: vec![debug_guard, error_guard],
    })
}
