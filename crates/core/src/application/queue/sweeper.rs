// Stalled-job sweeper
//
// Every `stalled_interval` the sweep counts consecutive stale heartbeats per
// active job. A job over `max_stalled_count` has its execution aborted and fails
// with `JobError::Stalled`, following the normal retry/dead-letter path.

use super::index::StalledJob;
use super::state::QueueRuntime;
use super::EngineInner;
use crate::application::shutdown::ShutdownToken;
use crate::port::JobError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

pub(crate) async fn run_sweeper(
    inner: Arc<EngineInner>,
    runtime: Arc<QueueRuntime>,
    mut shutdown: ShutdownToken,
) {
    let period = Duration::from_millis(runtime.settings.stalled_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    debug!(queue = %runtime.name(), interval_ms = runtime.settings.stalled_interval_ms, "Stalled sweeper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.sweep_stalled(&runtime).await;
            }
            _ = shutdown.wait() => break,
        }
    }
    debug!(queue = %runtime.name(), "Stalled sweeper stopped");
}

impl EngineInner {
    /// One sweep over the queue's active jobs. Returns how many were failed as stalled.
    pub(super) async fn sweep_stalled(&self, runtime: &QueueRuntime) -> usize {
        let now = self.now();
        let settings = &runtime.settings;
        let interval_ms = i64::try_from(settings.stalled_interval_ms).unwrap_or(i64::MAX);

        let (stale, evicted) = runtime.with_state(|s| {
            s.index
                .sweep_stalled(now, interval_ms, settings.max_stalled_count)
        });

        for (job_id, count) in &stale {
            warn!(
                job_id = %job_id,
                queue = %runtime.name(),
                stalled_count = count,
                max_stalled_count = settings.max_stalled_count,
                "Job heartbeat is stale"
            );
        }

        let failed = evicted.len();
        for StalledJob { job, stalled_count } in evicted {
            let duration_ms = job.processed_at.map(|at| now - at).unwrap_or(0);
            runtime.with_state(|s| s.metrics.record(now, duration_ms, false));

            error!(
                job_id = %job.id,
                queue = %runtime.name(),
                stalled_count = stalled_count,
                "Stalled job aborted"
            );
            let err = JobError::Stalled {
                count: stalled_count,
                limit: settings.max_stalled_count,
            };
            if let Some(job) = self.fail_job(runtime, job, err).await {
                runtime.reinsert(job, self.now());
            }
        }

        if failed > 0 {
            runtime.released.notify_waiters();
        }
        failed
    }
}
