// Worker loop and job settlement

use super::index::Claim;
use super::state::{Dispatch, QueueRuntime};
use super::EngineInner;
use crate::application::backoff::compute_delay;
use crate::application::constants::IDLE_POLL_INTERVAL;
use crate::application::panic_guard::PanicGuardResult;
use crate::application::shutdown::ShutdownToken;
use crate::domain::{Job, JobId};
use crate::error::Result;
use crate::port::{JobContext, JobError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
enum Archive {
    Completed,
    Failed,
}

/// One worker of a queue's fixed-size pool: runs one job at a time until shutdown
pub(crate) async fn run_worker(
    inner: Arc<EngineInner>,
    runtime: Arc<QueueRuntime>,
    worker_id: usize,
    mut shutdown: ShutdownToken,
) {
    debug!(queue = %runtime.name(), worker_id = worker_id, "Worker started");
    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let wakeup = runtime.wakeup.notified();
        let now = inner.now();
        let idle_for = match runtime.dispatch(now) {
            Dispatch::Job(claim) => {
                inner.execute(&runtime, claim).await;
                continue;
            }
            Dispatch::Idle(Some(due)) => {
                let until_due = u64::try_from(due.saturating_sub(now)).unwrap_or(0).max(1);
                Duration::from_millis(until_due).min(IDLE_POLL_INTERVAL)
            }
            Dispatch::Idle(None) | Dispatch::Halted => IDLE_POLL_INTERVAL,
        };

        tokio::select! {
            _ = wakeup => {},
            _ = sleep(idle_for) => {},
            _ = shutdown.wait() => break,
        }
    }
    debug!(queue = %runtime.name(), worker_id = worker_id, "Worker stopped");
}

impl EngineInner {
    /// Run one claimed job in its own task and settle the outcome
    async fn execute(&self, runtime: &Arc<QueueRuntime>, claim: Claim) {
        let Claim {
            job,
            lease,
            heartbeat,
        } = claim;
        let attempt = job.attempts_made + 1;

        // Record the dispatch so a crash leaves the job recognisably orphaned
        if let Err(e) = self.save_job(runtime, &job).await {
            warn!(job_id = %job.id, queue = %runtime.name(), error = %e, "Failed to persist dispatch");
        }

        debug!(
            job_id = %job.id,
            queue = %runtime.name(),
            job_name = %job.name,
            attempt = attempt,
            "Processing job"
        );

        let started = Instant::now();
        let outcome = match self.registry.get(runtime.name(), job.name.as_str()) {
            None => Err(JobError::MissingProcessor {
                queue: runtime.name().to_string(),
                name: job.name.to_string(),
            }),
            Some(processor) => {
                let ctx = JobContext::new(attempt, heartbeat, Arc::clone(&self.time_provider));
                let job_for_exec = job.clone();
                let handle =
                    tokio::spawn(async move { processor.process(&job_for_exec, ctx).await });
                let abort = handle.abort_handle();
                runtime.with_state(|s| s.index.set_abort(&job.id, lease, abort));

                match PanicGuardResult::from(handle.await) {
                    PanicGuardResult::Success(result) => result,
                    PanicGuardResult::Panicked(msg) => Err(JobError::Panicked(msg)),
                    PanicGuardResult::Cancelled => {
                        debug!(job_id = %job.id, queue = %runtime.name(), "Execution aborted");
                        return;
                    }
                }
            }
        };
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        self.settle(runtime, job.id, lease, outcome, duration_ms).await;
    }

    async fn settle(
        &self,
        runtime: &Arc<QueueRuntime>,
        job_id: JobId,
        lease: u64,
        outcome: std::result::Result<Option<Value>, JobError>,
        duration_ms: i64,
    ) {
        let Some(job) = runtime.with_state(|s| s.index.begin_settle(&job_id, lease)) else {
            debug!(job_id = %job_id, queue = %runtime.name(), "Stale completion ignored");
            return;
        };

        let ok = outcome.is_ok();
        let retry = match outcome {
            Ok(value) => {
                self.complete_job(runtime, job, value, duration_ms).await;
                None
            }
            Err(err) => self.fail_job(runtime, job, err).await,
        };

        runtime.release(&job_id, lease, self.now(), duration_ms, ok);
        if let Some(job) = retry {
            runtime.reinsert(job, self.now());
        }
    }

    async fn complete_job(
        &self,
        runtime: &QueueRuntime,
        mut job: Job,
        value: Option<Value>,
        duration_ms: i64,
    ) {
        if let Err(e) = job.complete(self.now(), value) {
            error!(job_id = %job.id, queue = %runtime.name(), error = %e, "Cannot complete job");
            return;
        }
        info!(
            job_id = %job.id,
            queue = %runtime.name(),
            attempts = job.attempts_made,
            duration_ms = duration_ms,
            "Job completed"
        );
        if let Err(e) = self.archive(runtime, &job, Archive::Completed).await {
            error!(job_id = %job.id, queue = %runtime.name(), error = %e, "Failed to archive completed job");
        }
    }

    /// Count a failed attempt. Returns the job when it should be retried.
    pub(super) async fn fail_job(
        &self,
        runtime: &QueueRuntime,
        mut job: Job,
        err: JobError,
    ) -> Option<Job> {
        let now = self.now();
        let reason = err.to_string();

        if job.record_failure(reason.clone()) {
            let policy = job
                .backoff
                .clone()
                .unwrap_or_else(|| runtime.settings.backoff_policy());
            let delay_ms = compute_delay(&policy, job.attempts_made, &reason);
            job.schedule_retry(now, i64::try_from(delay_ms).unwrap_or(i64::MAX));

            warn!(
                job_id = %job.id,
                queue = %runtime.name(),
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                delay_ms = delay_ms,
                error = %err,
                "Job failed, retry scheduled"
            );
            if let Err(e) = self.save_job(runtime, &job).await {
                error!(job_id = %job.id, queue = %runtime.name(), error = %e, "Failed to persist retry");
            }
            return Some(job);
        }

        job.fail(now);
        error!(
            job_id = %job.id,
            queue = %runtime.name(),
            attempts = job.attempts_made,
            error = %err,
            "Job failed permanently"
        );

        if let Some(dlq) = runtime.settings.dead_letter_queue.as_deref() {
            match self.dead_letter(runtime, &job, dlq).await {
                Ok(dead_id) => {
                    info!(
                        job_id = %job.id,
                        queue = %runtime.name(),
                        dead_letter_queue = %dlq,
                        dead_letter_job_id = %dead_id,
                        "Job moved to dead-letter queue"
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        queue = %runtime.name(),
                        dead_letter_queue = %dlq,
                        error = %e,
                        "Dead-letter enqueue failed, archiving as failed"
                    );
                }
            }
        }

        if let Err(e) = self.archive(runtime, &job, Archive::Failed).await {
            error!(job_id = %job.id, queue = %runtime.name(), error = %e, "Failed to archive failed job");
        }
        None
    }

    /// Re-enqueue an exhausted job on the dead-letter queue and drop it from the source
    async fn dead_letter(&self, source: &QueueRuntime, job: &Job, dlq: &str) -> Result<JobId> {
        let target = self.runtime(dlq)?;
        let now = self.now();

        let mut dead = Job::new(
            self.id_provider.generate_id(),
            now,
            dlq,
            job.name.clone(),
            job.payload.clone(),
        );
        dead.priority = job.priority;
        dead.max_attempts = target.settings.max_attempts;
        dead.metadata = job.metadata.clone();
        dead.metadata
            .insert("original_queue".to_string(), json!(job.queue));
        dead.metadata
            .insert("original_job_id".to_string(), json!(job.id));
        dead.metadata
            .insert("failure_reason".to_string(), json!(job.last_error));
        dead.metadata
            .insert("failed_at".to_string(), json!(job.failed_at));
        dead.metadata
            .insert("attempts_made".to_string(), json!(job.attempts_made));

        let dead_id = dead.id.clone();
        self.save_job(&target, &dead).await?;
        if let Err(e) = target.admit(dead, now) {
            self.forget_job(&target, &dead_id).await;
            return Err(e);
        }

        let keys = &source.keys;
        self.store_retry
            .run("hdel", || self.store.hdel(&keys.jobs, &job.id))
            .await?;
        self.store_retry
            .run("incr", || self.store.incr(&keys.failed_total, 1))
            .await?;
        self.store_retry
            .run("incr", || self.store.incr(&keys.dead_lettered, 1))
            .await?;
        Ok(dead_id)
    }

    /// Persist a finished job and append it to its archive list, applying retention
    async fn archive(&self, runtime: &QueueRuntime, job: &Job, kind: Archive) -> Result<()> {
        let keys = &runtime.keys;
        let (list, counter, keep) = match kind {
            Archive::Completed => (
                &keys.completed,
                &keys.completed_total,
                runtime.settings.remove_on_complete,
            ),
            Archive::Failed => (
                &keys.failed,
                &keys.failed_total,
                runtime.settings.remove_on_fail,
            ),
        };

        self.save_job(runtime, job).await?;
        let len = self
            .store_retry
            .run("push", || self.store.push(list, &job.id))
            .await?;
        if let Some(keep) = keep {
            if len > keep as u64 {
                self.trim_archive(runtime, list, keep).await?;
            }
        }
        self.store_retry
            .run("incr", || self.store.incr(counter, 1))
            .await?;
        Ok(())
    }
}
