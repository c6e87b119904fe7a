//! Log-based metrics feed
//!
//! Pulls `get_report()` on an interval and logs it as JSON, and logs every
//! controller event as it arrives.

use quell_core::application::{ControllerEvent, OptimizationController, OptimizationReport, ShutdownToken};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub async fn run_metrics_feed(
    controller: Arc<OptimizationController>,
    interval: Duration,
    mut shutdown: ShutdownToken,
) {
    let mut events = controller.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, "Metrics feed started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = controller.get_report().await;
                log_report(&report);
            }
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Metrics feed lagged behind controller events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.wait() => break,
        }
    }
    debug!("Metrics feed stopped");
}

fn log_report(report: &OptimizationReport) {
    for stats in &report.service_stats {
        info!(
            target: "quell::metrics",
            queue = %stats.name,
            status = %stats.status,
            waiting = stats.waiting,
            active = stats.active,
            delayed = stats.delayed,
            completed_total = stats.completed_total,
            failed_total = stats.failed_total,
            throughput_per_minute = stats.throughput_per_minute,
            error_rate = stats.error_rate,
            "Queue stats"
        );
    }
    match serde_json::to_string(report) {
        Ok(json) => info!(target: "quell::metrics", report = %json, "Metrics report"),
        Err(e) => warn!(error = %e, "Failed to serialize metrics report"),
    }
}

fn log_event(event: &ControllerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "quell::metrics", event = %json, "Controller event"),
        Err(e) => warn!(error = %e, "Failed to serialize controller event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quell_core::application::{shutdown_channel, MemoryMonitor, QueueEngine};
    use quell_core::config::{EngineConfig, OptimizerConfig};
    use quell_core::domain::{MemoryThresholds, OptimizationReason};
    use quell_core::port::id_provider::mocks::SequenceIdProvider;
    use quell_core::port::memory_probe::mocks::MockMemoryProbe;
    use quell_core::port::queue_store::mocks::InMemoryQueueStore;
    use quell_core::port::time_provider::SystemTimeProvider;

    #[tokio::test]
    async fn test_feed_runs_until_shutdown() {
        let clock = Arc::new(SystemTimeProvider);
        let engine = QueueEngine::new(
            EngineConfig::default(),
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(SequenceIdProvider::new("job")),
            clock.clone(),
        );
        let monitor = Arc::new(MemoryMonitor::new(
            Arc::new(MockMemoryProbe::new(10.0, 20.0)),
            clock.clone(),
            MemoryThresholds::default(),
        ));
        let controller = Arc::new(OptimizationController::new(
            engine,
            monitor,
            clock,
            OptimizerConfig::default(),
        ));
        let (shutdown, token) = shutdown_channel();

        let handle = tokio::spawn(run_metrics_feed(
            controller.clone(),
            Duration::from_millis(10),
            token,
        ));
        controller
            .perform_optimization(OptimizationReason::Manual, Default::default())
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = ControllerEvent::Warning {
            level: quell_core::domain::ThresholdLevel::Warning,
            message: "high".to_string(),
            heap_used_mb: 1.5,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "warning");
        assert_eq!(json["level"], "warning");
    }
}
