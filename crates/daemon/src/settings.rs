//! Daemon settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file (`QUELL_CONFIG`, else `./quell.toml`), then `QUELL__`-prefixed
//! environment variables with `__` as the nesting separator.
//!
//! ```text
//! QUELL__STORE__URL=sqlite:///var/lib/quell/quell.db
//! QUELL__MEMORY_OPTIMIZATION__THRESHOLD=70
//! QUELL__QUEUES__EMAILS__CONCURRENCY=4
//! ```

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use quell_core::config::{EngineConfig, OptimizerConfig};
use quell_core::domain::{MemoryThresholds, QueueSettings};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_STORE_URL: &str = "sqlite://~/.quell/quell.db";
const ENV_PREFIX: &str = "QUELL";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuellSettings {
    pub store: StoreSettings,
    pub engine: EngineConfig,
    /// Queues created at startup, keyed by name
    pub queues: BTreeMap<String, QueueSettings>,
    pub metrics: MetricsSettings,
    pub memory_optimization: MemoryOptimizationSettings,
    pub maintenance: MaintenanceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_STORE_URL.to_string(),
            max_connections: 10,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreSettings {
    /// Database file path for file-backed SQLite URLs
    pub fn file_path(&self) -> Option<&str> {
        self.url
            .strip_prefix("sqlite://")
            .filter(|path| !path.is_empty() && !path.starts_with(':'))
            .map(|path| path.split('?').next().unwrap_or(path))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
        }
    }
}

impl MetricsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1_000))
    }
}

/// `memory_optimization` block: controller settings plus tier thresholds
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryOptimizationSettings {
    #[serde(flatten)]
    pub controller: OptimizerConfig,
    pub thresholds: MemoryThresholds,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Queue holding the built-in maintenance jobs
    pub queue: String,
    /// How often a `compact` job is enqueued (0 disables)
    pub compaction_interval_ms: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            queue: "maintenance".to_string(),
            compaction_interval_ms: 15 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// Directive used when `RUST_LOG` is unset (default `quell=info`)
    pub filter: Option<String>,
    /// Daily rolling log files are written here when set
    pub directory: Option<String>,
}

impl QuellSettings {
    /// Load from `QUELL_CONFIG` (or `./quell.toml`) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("QUELL_CONFIG").ok();
        Self::build(path.as_deref(), Environment::with_prefix(ENV_PREFIX))
    }

    fn build(path: Option<&str>, env: Environment) -> Result<Self> {
        let file = match path {
            Some(path) => File::with_name(&shellexpand::tilde(path)).required(true),
            None => File::with_name("quell").required(false),
        };

        let settings: QuellSettings = Config::builder()
            .add_source(file)
            .add_source(
                env.prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")?;

        Ok(settings.resolved())
    }

    /// Expand `~` in paths and name queues after their map keys
    fn resolved(mut self) -> Self {
        if let Some(path) = self.store.url.strip_prefix("sqlite://") {
            self.store.url = format!("sqlite://{}", shellexpand::tilde(path));
        }
        if let Some(dir) = self.logging.directory.as_mut() {
            *dir = shellexpand::tilde(dir.as_str()).into_owned();
        }
        for (name, queue) in self.queues.iter_mut() {
            if queue.name.is_empty() {
                queue.name = name.clone();
            }
        }
        self
    }

    /// Startup queue settings, in name order
    pub fn queue_settings(&self) -> Vec<QueueSettings> {
        self.queues.values().cloned().collect()
    }
}
