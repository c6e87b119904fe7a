//! Built-in maintenance jobs
//!
//! `maintenance/compact` runs a manual optimization pass through the
//! controller; a background schedule enqueues one periodically.

use quell_core::application::{OptimizationController, OptimizationOptions, QueueEngine, ShutdownToken};
use quell_core::domain::{JobOptions, OptimizationReason, Priority};
use quell_core::port::{processor_fn, JobError, JobProcessor};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const COMPACT_JOB: &str = "compact";

/// Processor for `compact` jobs. Payload: `{"aggressive": bool}` (optional).
pub fn compact_processor(controller: Arc<OptimizationController>) -> Arc<dyn JobProcessor> {
    processor_fn(move |job, _ctx| {
        let controller = Arc::clone(&controller);
        async move {
            let aggressive = job
                .payload
                .as_value()
                .get("aggressive")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let record = controller
                .perform_optimization(
                    OptimizationReason::Manual,
                    OptimizationOptions { aggressive },
                )
                .await;
            if !record.success {
                return Err(JobError::Processor(record.errors.join("; ")));
            }
            Ok(Some(json!({
                "actions": record.actions,
                "freed_memory_mb": record.freed_memory_mb,
                "duration_ms": record.duration_ms,
            })))
        }
    })
}

/// Enqueue a low-priority `compact` job every `interval` until shutdown
pub async fn run_compaction_schedule(
    engine: QueueEngine,
    queue: String,
    interval: Duration,
    mut shutdown: ShutdownToken,
) {
    info!(queue = %queue, interval_ms = interval.as_millis() as u64, "Compaction schedule started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let options = JobOptions::default().with_priority(Priority::LOW);
                match engine.enqueue(&queue, COMPACT_JOB, json!({ "aggressive": false }), options).await {
                    Ok(job_id) => debug!(job_id = %job_id, queue = %queue, "Compaction job enqueued"),
                    Err(e) => warn!(queue = %queue, error = %e, "Failed to enqueue compaction job"),
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    debug!("Compaction schedule stopped");
}
