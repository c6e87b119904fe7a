// Runtime configuration objects
//
// Owned values passed into components at construction. Nothing here is global;
// the daemon deserializes these from its settings file/environment.

use crate::domain::QueueSettings;
use serde::{Deserialize, Serialize};

/// Queue engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for every store key
    pub key_prefix: String,
    pub default_concurrency: usize,
    pub stalled_interval_ms: u64,
    pub max_stalled_count: u32,
    /// Trailing window for throughput / error-rate stats (ms)
    pub metrics_window_ms: i64,
    /// Finished jobs kept per archive after an aggressive compaction
    pub compaction_floor: usize,
    pub store_retry: StoreRetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "quell".to_string(),
            default_concurrency: 1,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            metrics_window_ms: 60_000,
            compaction_floor: 50,
            store_retry: StoreRetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Queue settings seeded with the engine-wide defaults
    pub fn queue_settings(&self, name: impl Into<String>) -> QueueSettings {
        QueueSettings {
            concurrency: self.default_concurrency,
            stalled_interval_ms: self.stalled_interval_ms,
            max_stalled_count: self.max_stalled_count,
            ..QueueSettings::new(name)
        }
    }
}

/// Local retry of transient store failures (independent of job backoff)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            max_delay_ms: 500,
        }
    }
}

/// Backpressure / optimization controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(alias = "enabled")]
    pub monitoring_enabled: bool,
    #[serde(alias = "auto_optimization")]
    pub auto_optimization_enabled: bool,
    #[serde(alias = "interval_ms")]
    pub monitoring_interval_ms: u64,
    /// Heap usage (percent of `max_heap_size_mb`) above which a warning is raised
    #[serde(alias = "threshold")]
    pub optimization_threshold: f64,
    pub max_heap_size_mb: f64,
    pub max_rss_size_mb: f64,
    /// Memory sample retention (minutes)
    pub history_window_minutes: u64,
    /// Optimization records kept
    pub history_limit: usize,
    /// Idle connections left after an aggressive pool shrink
    pub pool_target_idle: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            monitoring_enabled: true,
            auto_optimization_enabled: true,
            monitoring_interval_ms: 30_000,
            optimization_threshold: 80.0,
            max_heap_size_mb: 1024.0,
            max_rss_size_mb: 2048.0,
            history_window_minutes: 30,
            history_limit: 50,
            pool_target_idle: 1,
        }
    }
}

impl OptimizerConfig {
    /// Invalid-but-accepted settings, as operator-facing issue lines
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !(0.0..=100.0).contains(&self.optimization_threshold) {
            issues.push(format!(
                "Optimization threshold {} is outside 0-100%",
                self.optimization_threshold
            ));
        }
        if self.monitoring_interval_ms == 0 {
            issues.push("Monitoring interval must be greater than zero".to_string());
        }
        if self.max_heap_size_mb <= 0.0 {
            issues.push(format!(
                "Max heap size {}MB must be positive",
                self.max_heap_size_mb
            ));
        }
        if self.max_rss_size_mb <= 0.0 {
            issues.push(format!(
                "Max RSS size {}MB must be positive",
                self.max_rss_size_mb
            ));
        }
        issues
    }

    pub fn apply(&mut self, patch: &OptimizerConfigPatch) {
        if let Some(v) = patch.monitoring_enabled {
            self.monitoring_enabled = v;
        }
        if let Some(v) = patch.auto_optimization_enabled {
            self.auto_optimization_enabled = v;
        }
        if let Some(v) = patch.monitoring_interval_ms {
            self.monitoring_interval_ms = v;
        }
        if let Some(v) = patch.optimization_threshold {
            self.optimization_threshold = v;
        }
        if let Some(v) = patch.max_heap_size_mb {
            self.max_heap_size_mb = v;
        }
        if let Some(v) = patch.max_rss_size_mb {
            self.max_rss_size_mb = v;
        }
    }
}

/// Partial update for `OptimizationController::update_config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerConfigPatch {
    pub monitoring_enabled: Option<bool>,
    pub auto_optimization_enabled: Option<bool>,
    pub monitoring_interval_ms: Option<u64>,
    pub optimization_threshold: Option<f64>,
    pub max_heap_size_mb: Option<f64>,
    pub max_rss_size_mb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_optimizer_config_has_no_issues() {
        assert!(OptimizerConfig::default().issues().is_empty());
    }

    #[test]
    fn test_invalid_values_are_flagged_not_rejected() {
        let mut config = OptimizerConfig::default();
        config.apply(&OptimizerConfigPatch {
            optimization_threshold: Some(-10.0),
            monitoring_interval_ms: Some(0),
            ..Default::default()
        });

        assert_eq!(config.optimization_threshold, -10.0);
        assert_eq!(config.issues().len(), 2);
    }

    #[test]
    fn test_aliases_match_config_block_names() {
        let config: OptimizerConfig = serde_json::from_value(serde_json::json!({
            "enabled": false,
            "auto_optimization": false,
            "threshold": 70.0,
            "interval_ms": 5000
        }))
        .unwrap();

        assert!(!config.monitoring_enabled);
        assert!(!config.auto_optimization_enabled);
        assert_eq!(config.optimization_threshold, 70.0);
        assert_eq!(config.monitoring_interval_ms, 5000);
        assert_eq!(config.history_limit, 50);
    }

    #[test]
    fn test_queue_settings_seeded_from_engine() {
        let config = EngineConfig {
            default_concurrency: 4,
            stalled_interval_ms: 5_000,
            ..Default::default()
        };
        let settings = config.queue_settings("chat");
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.stalled_interval_ms, 5_000);
        assert_eq!(settings.name, "chat");
    }
}
