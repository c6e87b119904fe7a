// Backpressure / Optimization Controller
//
// Consumes monitor signals, decides when to run optimization passes and
// executes them. One pass runs at a time; concurrent requests share it.

mod report;


pub use report::{ControllerHealth, HealthDetails, OptimizationReport};

use crate::application::constants::EVENT_CHANNEL_CAPACITY;
use crate::application::locks::{lock, read, write};
use crate::application::monitor::{MemoryMonitor, MonitorSignal};
use crate::application::queue::QueueEngine;
use crate::application::shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::config::{OptimizerConfig, OptimizerConfigPatch};
use crate::domain::{
    MemorySample, OptimizationMethod, OptimizationReason, OptimizationRecord, ThresholdLevel,
};
use crate::port::{ConnectionPool, TimeProvider};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const ACTION_RECLAIM: &str = "reclaim_engine_memory";
pub const ACTION_SHRINK_POOL: &str = "shrink_connection_pool";
pub const ACTION_PAUSE_SHEDDABLE: &str = "pause_sheddable_queues";

/// Options for a single pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationOptions {
    /// Run the aggressive action set even for non-emergency passes
    pub aggressive: bool,
}

/// Events published by the controller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    OptimizationCompleted {
        reason: OptimizationReason,
        record: OptimizationRecord,
    },
    MemoryAlert {
        level: ThresholdLevel,
        alerts: Vec<String>,
        sample: MemorySample,
    },
    Warning {
        level: ThresholdLevel,
        message: String,
        heap_used_mb: f64,
    },
}

type SharedPass = Shared<BoxFuture<'static, OptimizationRecord>>;

struct ConsumerTask {
    shutdown: ShutdownSender,
    handle: JoinHandle<()>,
}

pub struct OptimizationController {
    engine: QueueEngine,
    monitor: Arc<MemoryMonitor>,
    pool: Option<Arc<dyn ConnectionPool>>,
    time_provider: Arc<dyn TimeProvider>,
    config: RwLock<OptimizerConfig>,
    in_flight: Mutex<Option<SharedPass>>,
    history: Mutex<VecDeque<OptimizationRecord>>,
    /// Queues paused by emergency passes, resumed on recovery
    shed: Mutex<Vec<String>>,
    events: broadcast::Sender<ControllerEvent>,
    consumer: Mutex<Option<ConsumerTask>>,
}

impl OptimizationController {
    /// Create a stopped controller
    ///
    /// # Arguments
    ///
    /// * `engine` - Queue engine to compact and shed
    /// * `monitor` - Memory monitor whose signals drive automatic passes
    /// * `time_provider` - Clock for record timestamps
    /// * `config` - Initial config (accepted as-is; problems show up in `health_check`)
    pub fn new(
        engine: QueueEngine,
        monitor: Arc<MemoryMonitor>,
        time_provider: Arc<dyn TimeProvider>,
        config: OptimizerConfig,
    ) -> Self {
        for issue in config.issues() {
            warn!(issue = %issue, "Optimizer config accepted with issue");
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            monitor,
            pool: None,
            time_provider,
            config: RwLock::new(config),
            in_flight: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            shed: Mutex::new(Vec::new()),
            events,
            consumer: Mutex::new(None),
        }
    }

    /// Store pool shrunk by aggressive passes
    pub fn with_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    /// Start the signal consumer and, when enabled, the monitor
    pub fn start(self: &Arc<Self>) -> bool {
        let mut consumer = lock(&self.consumer);
        if consumer.is_some() {
            return false;
        }

        // Subscribe before the monitor starts so the first sample is seen
        let signals = self.monitor.subscribe();
        let (shutdown, token) = shutdown_channel();
        let handle = tokio::spawn(Arc::clone(self).consume(signals, token));
        *consumer = Some(ConsumerTask { shutdown, handle });
        drop(consumer);

        let config = self.get_config();
        if config.monitoring_enabled && config.monitoring_interval_ms > 0 {
            self.monitor
                .start(Duration::from_millis(config.monitoring_interval_ms));
        } else {
            warn!("Memory monitoring is disabled");
        }

        info!(
            monitoring = config.monitoring_enabled,
            auto_optimization = config.auto_optimization_enabled,
            interval_ms = config.monitoring_interval_ms,
            "Optimization controller started"
        );
        true
    }

    /// Stop the monitor and consumer, then wait for any pass in flight
    pub async fn stop(&self) -> bool {
        let consumer = lock(&self.consumer).take();
        let Some(consumer) = consumer else {
            return false;
        };

        self.monitor.stop().await;
        consumer.shutdown.shutdown();
        if let Err(e) = consumer.handle.await {
            warn!(error = %e, "Controller consumer ended abnormally");
        }

        let pass = lock(&self.in_flight).clone();
        if let Some(pass) = pass {
            pass.await;
        }
        info!("Optimization controller stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.consumer).is_some()
    }

    pub fn is_optimizing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Run an optimization pass, or join the one already running
    pub async fn perform_optimization(
        self: &Arc<Self>,
        reason: OptimizationReason,
        options: OptimizationOptions,
    ) -> OptimizationRecord {
        self.begin_pass(reason, options).await
    }

    /// Install (or join) the in-flight pass. The pass is driven by its own task
    /// so it completes even if every caller stops waiting.
    fn begin_pass(
        self: &Arc<Self>,
        reason: OptimizationReason,
        options: OptimizationOptions,
    ) -> SharedPass {
        let mut slot = lock(&self.in_flight);
        if let Some(pass) = slot.as_ref() {
            debug!(reason = %reason, "Joining optimization pass in flight");
            return pass.clone();
        }

        let this = Arc::clone(self);
        let pass = async move {
            let record = this.run_pass(reason, options).await;
            *lock(&this.in_flight) = None;
            this.publish(record.clone());
            record
        }
        .boxed()
        .shared();

        *slot = Some(pass.clone());
        tokio::spawn(pass.clone());
        pass
    }

    async fn run_pass(
        &self,
        reason: OptimizationReason,
        options: OptimizationOptions,
    ) -> OptimizationRecord {
        let started = Instant::now();
        let timestamp = self.time_provider.now_millis();
        let method = if options.aggressive || reason == OptimizationReason::Emergency {
            OptimizationMethod::Aggressive
        } else {
            OptimizationMethod::Standard
        };
        let aggressive = method == OptimizationMethod::Aggressive;
        info!(reason = %reason, method = ?method, "Optimization pass started");

        let before = self.monitor.snapshot().await;
        let mut actions = Vec::new();
        let mut errors = Vec::new();

        match self.engine.compact(aggressive).await {
            Ok(report) => {
                debug!(
                    queues = report.queues,
                    archived_removed = report.archived_removed,
                    "Engine memory reclaimed"
                );
                actions.push(ACTION_RECLAIM.to_string());
            }
            Err(e) => errors.push(format!("{}: {}", ACTION_RECLAIM, e)),
        }

        if aggressive {
            if let Some(pool) = &self.pool {
                let target_idle = read(&self.config).pool_target_idle;
                match pool.shrink(target_idle).await {
                    Ok(closed) => {
                        debug!(closed = closed, target_idle = target_idle, "Store pool shrunk");
                        actions.push(ACTION_SHRINK_POOL.to_string());
                    }
                    Err(e) => errors.push(format!("{}: {}", ACTION_SHRINK_POOL, e)),
                }
            }
        }

        if reason == OptimizationReason::Emergency {
            let paused = self.engine.pause_sheddable();
            if !paused.is_empty() {
                warn!(queues = ?paused, "Sheddable queues paused");
            }
            lock(&self.shed).extend(paused);
            actions.push(ACTION_PAUSE_SHEDDABLE.to_string());
        }

        let after = self.monitor.snapshot().await;
        let success = errors.is_empty();
        OptimizationRecord {
            timestamp,
            freed_memory_mb: (before.heap_used_mb - after.heap_used_mb).max(0.0),
            before,
            after,
            reason,
            method,
            actions,
            errors,
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            success,
        }
    }

    fn publish(&self, record: OptimizationRecord) {
        if record.success {
            info!(
                reason = %record.reason,
                method = ?record.method,
                actions = ?record.actions,
                freed_memory_mb = record.freed_memory_mb,
                duration_ms = record.duration_ms,
                "Optimization pass completed"
            );
        } else {
            error!(
                reason = %record.reason,
                errors = ?record.errors,
                duration_ms = record.duration_ms,
                "Optimization pass failed"
            );
        }

        {
            let limit = read(&self.config).history_limit.max(1);
            let mut history = lock(&self.history);
            history.push_back(record.clone());
            while history.len() > limit {
                history.pop_front();
            }
        }

        let _ = self.events.send(ControllerEvent::OptimizationCompleted {
            reason: record.reason,
            record,
        });
    }

    async fn consume(
        self: Arc<Self>,
        mut signals: broadcast::Receiver<MonitorSignal>,
        mut shutdown: ShutdownToken,
    ) {
        loop {
            tokio::select! {
                received = signals.recv() => match received {
                    Ok(signal) => self.handle_signal(signal).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Controller lagged behind monitor signals");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!("Controller consumer exited");
    }

    async fn handle_signal(self: &Arc<Self>, signal: MonitorSignal) {
        match signal {
            MonitorSignal::Sampled { sample, level } => {
                if level.is_some() {
                    return;
                }
                let config = self.get_config();
                let heap_percent = sample.heap_percent_of(config.max_heap_size_mb);
                if heap_percent > config.optimization_threshold {
                    self.emit_warning(
                        ThresholdLevel::Warning,
                        format!(
                            "Heap usage {:.1}% exceeds optimization threshold {}%",
                            heap_percent, config.optimization_threshold
                        ),
                        sample.heap_used_mb,
                    );
                }
            }
            MonitorSignal::ThresholdExceeded {
                level,
                alerts,
                sample,
            } => {
                let heap_used_mb = sample.heap_used_mb;
                let _ = self.events.send(ControllerEvent::MemoryAlert {
                    level,
                    alerts,
                    sample,
                });

                if !self.get_config().auto_optimization_enabled {
                    self.emit_warning(
                        level,
                        format!(
                            "Memory {} threshold exceeded but auto-optimization is disabled",
                            level
                        ),
                        heap_used_mb,
                    );
                    return;
                }

                match level {
                    ThresholdLevel::Warning => {
                        if self.is_optimizing() {
                            debug!("Preventive pass skipped, one is already running");
                        } else {
                            let _ = self.begin_pass(
                                OptimizationReason::Preventive,
                                OptimizationOptions::default(),
                            );
                        }
                    }
                    ThresholdLevel::Critical => self.run_emergency_pass().await,
                }
            }
            MonitorSignal::Recovered { sample } => {
                let names = std::mem::take(&mut *lock(&self.shed));
                if !names.is_empty() {
                    info!(
                        queues = ?names,
                        heap_used_mb = sample.heap_used_mb,
                        "Memory recovered, resuming shed queues"
                    );
                    self.engine.resume_shed(&names);
                }
            }
        }
    }

    /// Critical signals fire once per edge, so a joined non-emergency pass
    /// is followed by an emergency pass of our own.
    async fn run_emergency_pass(self: &Arc<Self>) {
        loop {
            let record = self
                .begin_pass(
                    OptimizationReason::Emergency,
                    OptimizationOptions { aggressive: true },
                )
                .await;
            if record.reason == OptimizationReason::Emergency {
                return;
            }
            debug!(joined = %record.reason, "Joined pass was not an emergency pass, running one");
        }
    }

    fn emit_warning(&self, level: ThresholdLevel, message: String, heap_used_mb: f64) {
        warn!(level = %level, heap_used_mb = heap_used_mb, "{}", message);
        let _ = self.events.send(ControllerEvent::Warning {
            level,
            message,
            heap_used_mb,
        });
    }

    /// Memory, queue statistics, recommendations and health in one snapshot
    pub async fn get_report(&self) -> OptimizationReport {
        let current = self.monitor.current_stats();
        let service_stats = match self.engine.all_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Queue stats unavailable for report");
                Vec::new()
            }
        };
        let config = self.get_config();
        let last = self.last_record();
        let recommendations = report::recommendations(
            &config,
            current.as_ref(),
            &service_stats,
            last.as_ref(),
        );

        OptimizationReport {
            current,
            service_stats,
            recommendations,
            health_status: self.health_check(),
            timestamp: self.time_provider.now_millis(),
        }
    }

    pub fn health_check(&self) -> ControllerHealth {
        let config = self.get_config();
        let monitor = self.monitor.health_check();
        let (optimizations, last) = {
            let history = lock(&self.history);
            (history.len(), history.back().cloned())
        };
        let issues = report::health_issues(&config, &monitor, last.as_ref());

        ControllerHealth {
            healthy: issues.is_empty(),
            issues,
            details: HealthDetails {
                auto_optimization: config.auto_optimization_enabled,
                optimization_in_progress: self.is_optimizing(),
                optimizations,
                last_optimization: last.map(|r| r.timestamp),
                config,
                monitor,
            },
        }
    }

    /// Apply a partial update. Any values are accepted; invalid ones are
    /// reported by `health_check`. A changed interval restarts the monitor.
    pub async fn update_config(&self, patch: OptimizerConfigPatch) -> OptimizerConfig {
        let (previous, current) = {
            let mut config = write(&self.config);
            let previous = config.clone();
            config.apply(&patch);
            (previous, config.clone())
        };
        for issue in current.issues() {
            warn!(issue = %issue, "Optimizer config accepted with issue");
        }
        info!(
            monitoring = current.monitoring_enabled,
            auto_optimization = current.auto_optimization_enabled,
            interval_ms = current.monitoring_interval_ms,
            threshold = current.optimization_threshold,
            "Optimizer config updated"
        );

        if self.is_running() {
            if !current.monitoring_enabled {
                self.monitor.stop().await;
            } else if current.monitoring_interval_ms > 0
                && (!self.monitor.is_running()
                    || current.monitoring_interval_ms != previous.monitoring_interval_ms)
            {
                self.monitor.stop().await;
                self.monitor
                    .start(Duration::from_millis(current.monitoring_interval_ms));
            }
        }
        current
    }

    pub fn get_config(&self) -> OptimizerConfig {
        read(&self.config).clone()
    }

    /// Past passes, oldest first
    pub fn get_optimization_history(&self) -> Vec<OptimizationRecord> {
        lock(&self.history).iter().cloned().collect()
    }

    fn last_record(&self) -> Option<OptimizationRecord> {
        lock(&self.history).back().cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }
}
