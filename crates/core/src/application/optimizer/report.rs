// Controller report and health types

use crate::application::monitor::{MemoryStatus, MonitorHealth};
use crate::application::queue::QueueStats;
use crate::config::OptimizerConfig;
use crate::domain::{MemorySample, OptimizationRecord};
use serde::Serialize;

/// Error rate above which a queue gets its own recommendation
const ERROR_RATE_WARNING: f64 = 0.2;
/// Waiting jobs above which a queue's backlog is called out
const BACKLOG_WARNING: usize = 1_000;

/// Pull-side metrics report
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub current: Option<MemorySample>,
    pub service_stats: Vec<QueueStats>,
    pub recommendations: Vec<String>,
    pub health_status: ControllerHealth,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub details: HealthDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub auto_optimization: bool,
    pub optimization_in_progress: bool,
    pub optimizations: usize,
    pub last_optimization: Option<i64>,
    pub config: OptimizerConfig,
    pub monitor: MonitorHealth,
}

/// Operator-facing issue lines. Empty means healthy.
pub(super) fn health_issues(
    config: &OptimizerConfig,
    monitor: &MonitorHealth,
    last: Option<&OptimizationRecord>,
) -> Vec<String> {
    let mut issues = Vec::new();
    if !config.monitoring_enabled {
        issues.push("Memory monitoring is disabled".to_string());
    }
    if !config.auto_optimization_enabled
        && matches!(monitor.status, MemoryStatus::Warning | MemoryStatus::Critical)
    {
        issues.push("Auto-optimization is disabled while memory thresholds are exceeded".to_string());
    }
    if let Some(record) = last.filter(|r| !r.success) {
        issues.push(format!(
            "Last optimization pass failed: {}",
            record.errors.join("; ")
        ));
    }
    issues.extend(config.issues());
    issues
}

pub(super) fn recommendations(
    config: &OptimizerConfig,
    current: Option<&MemorySample>,
    stats: &[QueueStats],
    last: Option<&OptimizationRecord>,
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(sample) = current {
        let heap_pct = sample.heap_percent_of(config.max_heap_size_mb);
        if heap_pct > config.optimization_threshold {
            out.push(format!(
                "Heap usage is {:.1}% of the {}MB ceiling; lower concurrency on busy queues",
                heap_pct, config.max_heap_size_mb
            ));
        }
        if config.max_rss_size_mb > 0.0
            && sample.rss_mb / config.max_rss_size_mb * 100.0 > config.optimization_threshold
        {
            out.push(format!(
                "RSS {:.1}MB is close to the {}MB ceiling; consider marking low-priority queues sheddable",
                sample.rss_mb, config.max_rss_size_mb
            ));
        }
        if sample.pool_idle > config.pool_target_idle.saturating_mul(4).max(4) {
            out.push(format!(
                "{} idle store connections; a smaller pool would free memory",
                sample.pool_idle
            ));
        }
    }

    for queue in stats {
        if queue.error_rate > ERROR_RATE_WARNING {
            out.push(format!(
                "Queue '{}' error rate is {:.0}%; inspect its failed jobs",
                queue.name,
                queue.error_rate * 100.0
            ));
        }
        if queue.waiting > BACKLOG_WARNING {
            out.push(format!(
                "Queue '{}' has a backlog of {} waiting jobs",
                queue.name, queue.waiting
            ));
        }
    }

    if last.is_some_and(|r| !r.success) {
        out.push("Last optimization pass reported errors; check the logs".to_string());
    }
    if !config.auto_optimization_enabled {
        out.push("Enable auto-optimization to react to threshold breaches".to_string());
    }
    out
}
