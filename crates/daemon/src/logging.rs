//! Logging setup
//!
//! `EnvFilter` from `RUST_LOG` (fallback: settings filter, then `quell=info`),
//! pretty or JSON console output, optional daily rolling files, and the
//! OpenTelemetry layer when built with the `telemetry` feature.

use crate::settings::{LogFormat, LoggingSettings};
use crate::telemetry;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const DEFAULT_FILTER: &str = "quell=info";
const LOG_FILE_PREFIX: &str = "quell.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the non-blocking file writer flushing until dropped
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// `QUELL_LOG_FORMAT` overrides the configured format
pub fn resolve_format(configured: LogFormat) -> LogFormat {
    match std::env::var("QUELL_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok("pretty") => LogFormat::Pretty,
        _ => configured,
    }
}

pub fn init(settings: &LoggingSettings) -> Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.filter.as_deref().unwrap_or(DEFAULT_FILTER)))
        .context("Invalid log filter")?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    match resolve_format(settings.format) {
        // Production: JSON structured logging
        LogFormat::Json => layers.push(fmt::layer().json().boxed()),
        // Development: pretty formatting with colors
        LogFormat::Pretty => layers.push(fmt::layer().pretty().boxed()),
    }

    let file_guard = match settings.directory.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create log directory {}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().json().with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    let telemetry_status = match telemetry::layer() {
        Ok(Some(layer)) => {
            layers.push(layer);
            "enabled"
        }
        Ok(None) => "disabled",
        Err(e) => {
            eprintln!("OpenTelemetry setup failed, continuing without it: {:#}", e);
            "failed"
        }
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Logging already initialized")?;

    tracing::debug!(telemetry = telemetry_status, "Logging initialized");
    Ok(LoggingGuard { _file: file_guard })
}
