// Memory Governance Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};

/// One point-in-time reading of process memory plus collaborator counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Epoch ms
    pub timestamp: i64,
    pub heap_used_mb: f64,
    pub heap_total_mb: f64,
    pub rss_mb: f64,
    pub external_mb: f64,
    /// Jobs currently executing across all queues
    pub active_jobs: usize,
    /// Store connections checked out
    pub pool_active: u32,
    /// Store connections idle in the pool
    pub pool_idle: u32,
}

impl MemorySample {
    /// Heap usage as a percentage of `ceiling_mb` (0 when the ceiling is unusable)
    pub fn heap_percent_of(&self, ceiling_mb: f64) -> f64 {
        if ceiling_mb <= 0.0 {
            return 0.0;
        }
        self.heap_used_mb / ceiling_mb * 100.0
    }
}

/// Threshold tier, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Warning,
    Critical,
}

impl std::fmt::Display for ThresholdLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdLevel::Warning => write!(f, "warning"),
            ThresholdLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Warning/critical limits (MB) for heap-used and RSS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryThresholds {
    pub heap_used_warning_mb: f64,
    pub heap_used_critical_mb: f64,
    pub rss_warning_mb: f64,
    pub rss_critical_mb: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            heap_used_warning_mb: 512.0,
            heap_used_critical_mb: 1024.0,
            rss_warning_mb: 1024.0,
            rss_critical_mb: 2048.0,
        }
    }
}

impl MemoryThresholds {
    pub fn new(
        heap_used_warning_mb: f64,
        heap_used_critical_mb: f64,
        rss_warning_mb: f64,
        rss_critical_mb: f64,
    ) -> Result<Self> {
        let thresholds = Self {
            heap_used_warning_mb,
            heap_used_critical_mb,
            rss_warning_mb,
            rss_critical_mb,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// `warning <= critical` per dimension, all limits positive and finite
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("heap_used", self.heap_used_warning_mb, self.heap_used_critical_mb),
            ("rss", self.rss_warning_mb, self.rss_critical_mb),
        ];
        for (dim, warning, critical) in dims {
            if !warning.is_finite() || !critical.is_finite() || warning <= 0.0 || critical <= 0.0 {
                return Err(DomainError::InvalidThresholds(format!(
                    "{} limits must be positive (warning={}, critical={})",
                    dim, warning, critical
                )));
            }
            if warning > critical {
                return Err(DomainError::InvalidThresholds(format!(
                    "{} warning {}MB exceeds critical {}MB",
                    dim, warning, critical
                )));
            }
        }
        Ok(())
    }

    /// Classify a sample: highest tier crossed plus one alert line per crossing
    pub fn classify(&self, sample: &MemorySample) -> (Option<ThresholdLevel>, Vec<String>) {
        let mut level = None;
        let mut alerts = Vec::new();

        let dims = [
            (
                "heap_used",
                sample.heap_used_mb,
                self.heap_used_warning_mb,
                self.heap_used_critical_mb,
            ),
            ("rss", sample.rss_mb, self.rss_warning_mb, self.rss_critical_mb),
        ];

        for (dim, value, warning, critical) in dims {
            let crossed = if value >= critical {
                Some((ThresholdLevel::Critical, critical))
            } else if value >= warning {
                Some((ThresholdLevel::Warning, warning))
            } else {
                None
            };

            if let Some((tier, limit)) = crossed {
                alerts.push(format!(
                    "{} {:.1}MB exceeds {} threshold {:.1}MB",
                    dim, value, tier, limit
                ));
                level = level.max(Some(tier));
            }
        }

        (level, alerts)
    }
}

/// Why an optimization pass ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationReason {
    Preventive,
    Manual,
    Emergency,
}

impl std::fmt::Display for OptimizationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizationReason::Preventive => write!(f, "preventive"),
            OptimizationReason::Manual => write!(f, "manual"),
            OptimizationReason::Emergency => write!(f, "emergency"),
        }
    }
}

/// Action set width of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMethod {
    Standard,
    Aggressive,
}

/// Outcome of one optimization pass (immutable once appended to history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub timestamp: i64,
    pub before: MemorySample,
    pub after: MemorySample,
    pub reason: OptimizationReason,
    pub method: OptimizationMethod,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub freed_memory_mb: f64,
    pub duration_ms: i64,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(heap: f64, rss: f64) -> MemorySample {
        MemorySample {
            timestamp: 0,
            heap_used_mb: heap,
            heap_total_mb: heap * 2.0,
            rss_mb: rss,
            external_mb: 0.0,
            active_jobs: 0,
            pool_active: 0,
            pool_idle: 0,
        }
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        assert!(MemoryThresholds::new(200.0, 100.0, 10.0, 20.0).is_err());
        assert!(MemoryThresholds::new(100.0, 200.0, 30.0, 20.0).is_err());
        assert!(MemoryThresholds::new(-1.0, 200.0, 10.0, 20.0).is_err());
        assert!(MemoryThresholds::new(100.0, 100.0, 10.0, 20.0).is_ok());
    }

    #[test]
    fn test_classify_picks_highest_tier() {
        let t = MemoryThresholds::new(100.0, 200.0, 300.0, 400.0).unwrap();

        let (level, alerts) = t.classify(&sample(50.0, 50.0));
        assert_eq!(level, None);
        assert!(alerts.is_empty());

        let (level, alerts) = t.classify(&sample(150.0, 50.0));
        assert_eq!(level, Some(ThresholdLevel::Warning));
        assert_eq!(alerts.len(), 1);

        let (level, alerts) = t.classify(&sample(150.0, 450.0));
        assert_eq!(level, Some(ThresholdLevel::Critical));
        assert_eq!(alerts.len(), 2);
        assert!(alerts[1].contains("critical"));
    }

    #[test]
    fn test_heap_percent() {
        let s = sample(256.0, 0.0);
        assert_eq!(s.heap_percent_of(512.0), 50.0);
        assert_eq!(s.heap_percent_of(0.0), 0.0);
    }
}
