// Queue restore on startup
//
// Reloads a queue's persisted job records into the in-memory index. Jobs that
// were active when the previous process died go back to waiting without being
// charged an attempt.

use super::state::QueueRuntime;
use super::EngineInner;
use crate::domain::Job;
use crate::error::Result;
use serde::Serialize;
use tracing::{info, warn};

/// Outcome of reloading a queue's persisted jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Waiting/delayed jobs put back in the index (includes `requeued`)
    pub restored: usize,
    /// Jobs found active and requeued
    pub requeued: usize,
    /// Unreadable records left untouched
    pub skipped: usize,
}

impl EngineInner {
    pub(super) async fn restore(&self, runtime: &QueueRuntime) -> Result<RestoreReport> {
        let records = self
            .store_retry
            .run("hvals", || self.store.hvals(&runtime.keys.jobs))
            .await?;

        let mut report = RestoreReport::default();
        let mut live: Vec<Job> = Vec::new();

        for record in records {
            let mut job: Job = match serde_json::from_str(&record) {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue = %runtime.name(), error = %e, "Skipping corrupt job record");
                    report.skipped += 1;
                    continue;
                }
            };
            if job.is_finished() {
                continue;
            }

            if job.processed_at.is_some() {
                job.requeue_orphaned();
                warn!(
                    job_id = %job.id,
                    queue = %runtime.name(),
                    attempts_made = job.attempts_made,
                    "Requeued job orphaned by previous process"
                );
                self.save_job(runtime, &job).await?;
                report.requeued += 1;
            }
            live.push(job);
        }

        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        report.restored = live.len();

        let now = self.now();
        runtime.with_state(|s| {
            for job in live {
                s.index.insert(job, now);
            }
        });

        if report.restored > 0 || report.skipped > 0 {
            info!(
                queue = %runtime.name(),
                restored = report.restored,
                requeued = report.requeued,
                skipped = report.skipped,
                "Restored persisted jobs"
            );
        }
        Ok(report)
    }
}
