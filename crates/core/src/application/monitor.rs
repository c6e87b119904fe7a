// Memory Monitor
//
// Samples process memory on its own interval, independent of queue state,
// keeps a time-bounded history and broadcasts edge-triggered threshold signals.

use crate::application::constants::{EVENT_CHANNEL_CAPACITY, MAX_SAMPLE_HISTORY};
use crate::application::locks::{lock, read, write};
use crate::application::shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::{MemorySample, MemoryThresholds, ThresholdLevel};
use crate::error::Result;
use crate::port::{ConnectionPool, MemoryProbe, TimeProvider, UsageSource};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Signals broadcast by the monitor
#[derive(Debug, Clone)]
pub enum MonitorSignal {
    /// Every sample, with its classification
    Sampled {
        sample: MemorySample,
        level: Option<ThresholdLevel>,
    },
    /// Upward tier edge (none->warning, none->critical, warning->critical)
    ThresholdExceeded {
        level: ThresholdLevel,
        alerts: Vec<String>,
        sample: MemorySample,
    },
    /// Tier fell back to none
    Recovered { sample: MemorySample },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Healthy,
    Warning,
    Critical,
    /// No sample taken yet
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorCounters {
    pub samples_taken: u64,
    pub warning_signals: u64,
    pub critical_signals: u64,
}

/// Synchronous monitor snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MonitorHealth {
    pub status: MemoryStatus,
    /// Whether the sampling task is running
    pub monitoring: bool,
    pub memory_usage: Option<MemorySample>,
    pub thresholds: MemoryThresholds,
    pub counters: MonitorCounters,
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<MemorySample>,
    tier: Option<ThresholdLevel>,
    counters: MonitorCounters,
    capacity: Option<usize>,
}

struct MonitorTask {
    shutdown: ShutdownSender,
    handle: JoinHandle<()>,
    interval: Duration,
}

pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    time_provider: Arc<dyn TimeProvider>,
    usage: Option<Arc<dyn UsageSource>>,
    pool: Option<Arc<dyn ConnectionPool>>,
    history_window: Duration,
    thresholds: RwLock<MemoryThresholds>,
    state: Mutex<MonitorState>,
    signals: broadcast::Sender<MonitorSignal>,
    task: Mutex<Option<MonitorTask>>,
}

impl MemoryMonitor {
    /// Create a stopped monitor
    ///
    /// # Example
    /// ```text
    /// let monitor = Arc::new(
    ///     MemoryMonitor::new(probe, clock, MemoryThresholds::default())
    ///         .with_usage(Arc::new(engine.clone()))
    ///         .with_history_window(Duration::from_secs(30 * 60)),
    /// );
    /// monitor.start(Duration::from_secs(30));
    /// ```
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        time_provider: Arc<dyn TimeProvider>,
        thresholds: MemoryThresholds,
    ) -> Self {
        let (signals, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            probe,
            time_provider,
            usage: None,
            pool: None,
            history_window: Duration::from_secs(30 * 60),
            thresholds: RwLock::new(thresholds),
            state: Mutex::new(MonitorState::default()),
            signals,
            task: Mutex::new(None),
        }
    }

    /// Source of the active-job count folded into samples
    pub fn with_usage(mut self, usage: Arc<dyn UsageSource>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Store pool whose active/idle counts are folded into samples
    pub fn with_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_history_window(mut self, window: Duration) -> Self {
        self.history_window = window;
        self
    }

    /// Start sampling every `interval`. No-op if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut task = lock(&self.task);
        if task.is_some() {
            return false;
        }

        let interval = interval.max(Duration::from_millis(1));
        let capacity = capacity_for(self.history_window, interval);
        lock(&self.state).capacity = Some(capacity);

        let (shutdown, token) = shutdown_channel();
        let handle = tokio::spawn(Arc::clone(self).run(interval, token));
        *task = Some(MonitorTask {
            shutdown,
            handle,
            interval,
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            history_capacity = capacity,
            "Memory monitor started"
        );
        true
    }

    /// Stop sampling and wait for the task to exit. No-op if not running.
    pub async fn stop(&self) -> bool {
        let task = lock(&self.task).take();
        let Some(task) = task else {
            return false;
        };
        task.shutdown.shutdown();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Memory monitor task ended abnormally");
        }
        info!("Memory monitor stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).is_some()
    }

    /// Sampling interval of the running task
    pub fn interval(&self) -> Option<Duration> {
        lock(&self.task).as_ref().map(|t| t.interval)
    }

    async fn run(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.wait() => break,
            }
        }
        debug!("Memory monitor loop exited");
    }

    /// Read memory without recording or signalling
    pub async fn snapshot(&self) -> MemorySample {
        let memory = self.probe.read().await;
        let active_jobs = self.usage.as_ref().map(|u| u.active_jobs()).unwrap_or(0);
        let pool = self
            .pool
            .as_ref()
            .map(|p| p.stats())
            .or_else(|| self.usage.as_ref().and_then(|u| u.pool_stats()))
            .unwrap_or_default();

        MemorySample {
            timestamp: self.time_provider.now_millis(),
            heap_used_mb: memory.heap_used_mb,
            heap_total_mb: memory.heap_total_mb,
            rss_mb: memory.rss_mb,
            external_mb: memory.external_mb,
            active_jobs,
            pool_active: pool.active,
            pool_idle: pool.idle,
        }
    }

    /// Take one sample: record it, classify it and broadcast signals
    pub async fn tick(&self) -> MemorySample {
        let sample = self.snapshot().await;
        let (level, alerts) = read(&self.thresholds).classify(&sample);
        let window_ms = i64::try_from(self.history_window.as_millis()).unwrap_or(i64::MAX);

        let (exceeded, recovered) = {
            let mut state = lock(&self.state);
            state.history.push_back(sample.clone());
            let cutoff = sample.timestamp.saturating_sub(window_ms);
            let capacity = state.capacity.unwrap_or(MAX_SAMPLE_HISTORY);
            while state.history.len() > capacity
                || state.history.front().is_some_and(|s| s.timestamp < cutoff)
            {
                state.history.pop_front();
            }
            state.counters.samples_taken += 1;

            let previous = state.tier;
            state.tier = level;
            let exceeded = match (previous, level) {
                (None, Some(tier)) => Some(tier),
                (Some(ThresholdLevel::Warning), Some(ThresholdLevel::Critical)) => {
                    Some(ThresholdLevel::Critical)
                }
                _ => None,
            };
            match exceeded {
                Some(ThresholdLevel::Warning) => state.counters.warning_signals += 1,
                Some(ThresholdLevel::Critical) => state.counters.critical_signals += 1,
                None => {}
            }
            (exceeded, previous.is_some() && level.is_none())
        };

        if let Some(level) = exceeded {
            warn!(
                level = %level,
                heap_used_mb = sample.heap_used_mb,
                rss_mb = sample.rss_mb,
                alerts = ?alerts,
                "Memory threshold exceeded"
            );
            let _ = self.signals.send(MonitorSignal::ThresholdExceeded {
                level,
                alerts,
                sample: sample.clone(),
            });
        } else if recovered {
            info!(
                heap_used_mb = sample.heap_used_mb,
                rss_mb = sample.rss_mb,
                "Memory back under thresholds"
            );
            let _ = self.signals.send(MonitorSignal::Recovered {
                sample: sample.clone(),
            });
        }

        let _ = self.signals.send(MonitorSignal::Sampled {
            sample: sample.clone(),
            level,
        });
        sample
    }

    /// Latest sample
    pub fn current_stats(&self) -> Option<MemorySample> {
        lock(&self.state).history.back().cloned()
    }

    /// Tier of the latest sample
    pub fn current_level(&self) -> Option<ThresholdLevel> {
        lock(&self.state).tier
    }

    /// Samples taken within `window` of now, oldest first.
    ///
    /// The iterator walks a snapshot; clone it to iterate again.
    pub fn history(&self, window: Duration) -> std::vec::IntoIter<MemorySample> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.time_provider.now_millis().saturating_sub(window_ms);
        lock(&self.state)
            .history
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn thresholds(&self) -> MemoryThresholds {
        read(&self.thresholds).clone()
    }

    /// Replace thresholds (validated). Applies from the next sample.
    pub fn update_thresholds(&self, thresholds: MemoryThresholds) -> Result<()> {
        thresholds.validate()?;
        info!(
            heap_used_warning_mb = thresholds.heap_used_warning_mb,
            heap_used_critical_mb = thresholds.heap_used_critical_mb,
            rss_warning_mb = thresholds.rss_warning_mb,
            rss_critical_mb = thresholds.rss_critical_mb,
            "Memory thresholds updated"
        );
        *write(&self.thresholds) = thresholds;
        Ok(())
    }

    pub fn counters(&self) -> MonitorCounters {
        lock(&self.state).counters
    }

    pub fn health_check(&self) -> MonitorHealth {
        let (memory_usage, tier, counters) = {
            let state = lock(&self.state);
            (state.history.back().cloned(), state.tier, state.counters)
        };
        let status = match (&memory_usage, tier) {
            (None, _) => MemoryStatus::Unknown,
            (Some(_), None) => MemoryStatus::Healthy,
            (Some(_), Some(ThresholdLevel::Warning)) => MemoryStatus::Warning,
            (Some(_), Some(ThresholdLevel::Critical)) => MemoryStatus::Critical,
        };

        MonitorHealth {
            status,
            monitoring: self.is_running(),
            memory_usage,
            thresholds: self.thresholds(),
            counters,
        }
    }

    /// Clear history, counters and tier state. Thresholds are kept.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.history.clear();
        state.tier = None;
        state.counters = MonitorCounters::default();
        debug!("Memory monitor reset");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorSignal> {
        self.signals.subscribe()
    }
}

fn capacity_for(window: Duration, interval: Duration) -> usize {
    let per_window = window.as_millis() / interval.as_millis().max(1);
    usize::try_from(per_window)
        .unwrap_or(MAX_SAMPLE_HISTORY)
        .clamp(1, MAX_SAMPLE_HISTORY)
}
