// Job Queue Engine
//
// Named queues with priority ordering, delayed scheduling, retry with backoff,
// dead-lettering and stalled-job detection. Live jobs are indexed in memory and
// mirrored to the store; finished jobs are archived in the store only.

mod index;
mod keys;
mod recovery;
mod registry;
mod state;
mod stats;
mod sweeper;
mod worker;

#[cfg(test)]
mod tests;

pub use recovery::RestoreReport;
pub use stats::QueueStats;

use crate::application::constants::{DRAIN_POLL_INTERVAL, TASK_JOIN_TIMEOUT};
use crate::application::locks::{read, write};
use crate::application::store_retry::StoreRetryPolicy;
use crate::config::EngineConfig;
use crate::domain::{
    Job, JobId, JobName, JobOptions, JobPayload, QueueId, QueueSettings, QueueStatus,
};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, JobProcessor, QueueStore, TimeProvider, UsageSource};
use keys::QueueKeys;
use registry::ProcessorRegistry;
use serde::Serialize;
use serde_json::Value;
use state::QueueRuntime;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Predicate for `retry_failed_jobs`
pub type JobFilter = dyn Fn(&Job) -> bool + Send + Sync;

/// Result of a `compact` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub queues: usize,
    /// Archived job records dropped from the store (aggressive mode only)
    pub archived_removed: u64,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn QueueStore>,
    store_retry: StoreRetryPolicy,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    queues: RwLock<HashMap<QueueId, Arc<QueueRuntime>>>,
    registry: ProcessorRegistry,
}

/// Queue engine handle. Clones share the same queues and workers.
#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<EngineInner>,
}

impl QueueEngine {
    /// Create an engine with no queues
    ///
    /// # Arguments
    ///
    /// * `config` - Engine-wide defaults and store key prefix
    /// * `store` - Durable store for job records, archives and counters
    /// * `id_provider` - Job ID generator (injected for deterministic tests)
    /// * `time_provider` - Clock (injected for deterministic tests)
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn QueueStore>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let store_retry = StoreRetryPolicy::new(&config.store_retry);
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                store_retry,
                id_provider,
                time_provider,
                queues: RwLock::new(HashMap::new()),
                registry: ProcessorRegistry::default(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a queue and start its workers
    ///
    /// Persisted jobs of the queue are reloaded first; jobs that were active
    /// when the previous process died are requeued. A configured dead-letter
    /// queue that does not exist yet is created without workers.
    pub async fn create_queue(&self, settings: QueueSettings) -> Result<RestoreReport> {
        settings.validate()?;

        if let Some(dlq) = settings.dead_letter_queue.as_deref() {
            if !self.inner.has_queue(dlq) {
                let dlq_settings = QueueSettings {
                    concurrency: 0,
                    ..self.inner.config.queue_settings(dlq)
                };
                self.install_queue(dlq_settings).await?;
            }
        }

        self.install_queue(settings).await
    }

    async fn install_queue(&self, settings: QueueSettings) -> Result<RestoreReport> {
        let name = settings.name.clone();
        if self.inner.has_queue(&name) {
            return Err(AppError::InvalidState(format!(
                "Queue '{}' already exists",
                name
            )));
        }

        let keys = QueueKeys::new(&self.inner.config.key_prefix, &name);
        let runtime = Arc::new(QueueRuntime::new(
            settings,
            keys,
            self.inner.config.metrics_window_ms,
        ));
        let report = self.inner.restore(&runtime).await?;

        {
            let mut queues = write(&self.inner.queues);
            if queues.contains_key(&name) {
                return Err(AppError::InvalidState(format!(
                    "Queue '{}' already exists",
                    name
                )));
            }
            queues.insert(name.clone(), Arc::clone(&runtime));
        }

        let concurrency = runtime.settings.concurrency;
        for worker_id in 0..concurrency {
            let handle = tokio::spawn(worker::run_worker(
                Arc::clone(&self.inner),
                Arc::clone(&runtime),
                worker_id,
                runtime.token(),
            ));
            runtime.track(handle);
        }
        if concurrency > 0 {
            let handle = tokio::spawn(sweeper::run_sweeper(
                Arc::clone(&self.inner),
                Arc::clone(&runtime),
                runtime.token(),
            ));
            runtime.track(handle);
        }

        info!(
            queue = %name,
            concurrency = concurrency,
            restored = report.restored,
            requeued = report.requeued,
            "Queue created"
        );
        Ok(report)
    }

    /// Add a job to a queue
    ///
    /// Paused queues accept jobs; draining and stopped queues do not.
    ///
    /// # Example
    /// ```text
    /// let id = engine
    ///     .enqueue("chat", "reply", json!({"conversation": 42}),
    ///              JobOptions::default().with_priority(Priority::HIGH))
    ///     .await?;
    /// ```
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let runtime = self.inner.runtime(queue)?;

        if name.trim().is_empty() {
            return Err(AppError::Validation("Job name cannot be empty".to_string()));
        }
        if options.max_attempts == Some(0) {
            return Err(AppError::Validation(
                "Job must allow at least one attempt".to_string(),
            ));
        }
        let status = runtime.status();
        if !status.accepts_jobs() {
            return Err(AppError::InvalidQueue(format!(
                "Queue '{}' is {} and does not accept jobs",
                queue, status
            )));
        }

        let now = self.inner.now();
        let id = self.inner.id_provider.generate_id();
        let mut job = Job::new(
            id.clone(),
            now,
            queue,
            JobName::new(name),
            JobPayload::new(payload),
        );
        job.priority = options.priority;
        job.max_attempts = options
            .max_attempts
            .unwrap_or(runtime.settings.max_attempts);
        job.backoff = options.backoff;
        job.delay_ms = options.delay_ms.max(0);
        if job.delay_ms > 0 {
            job.scheduled_at = Some(now.saturating_add(job.delay_ms));
        }
        job.metadata = options.metadata;

        let priority = job.priority;
        let delay_ms = job.delay_ms;

        self.inner.save_job(&runtime, &job).await?;
        if let Err(e) = runtime.admit(job, now) {
            self.inner.forget_job(&runtime, &id).await;
            return Err(e);
        }

        debug!(
            job_id = %id,
            queue = %queue,
            job_name = %name,
            priority = %priority,
            delay_ms = delay_ms,
            "Job enqueued"
        );
        Ok(id)
    }

    /// Bind a processor to (queue, job name). A later registration replaces
    /// the earlier one.
    pub fn register_processor(
        &self,
        queue: &str,
        name: &str,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<()> {
        let runtime = self.inner.runtime(queue)?;
        if self.inner.registry.insert(queue, name, processor) {
            warn!(
                queue = %queue,
                job_name = %name,
                "Processor re-registered, replacing previous handler"
            );
        } else {
            debug!(queue = %queue, job_name = %name, "Processor registered");
        }
        runtime.wakeup.notify_waiters();
        Ok(())
    }

    /// Stop dispatching new jobs. No-op when already paused.
    pub fn pause(&self, queue: &str) -> Result<()> {
        let runtime = self.inner.runtime(queue)?;
        if runtime.transition(QueueStatus::Paused)? {
            info!(queue = %queue, "Queue paused");
        }
        Ok(())
    }

    /// Resume dispatching. No-op when already active.
    pub fn resume(&self, queue: &str) -> Result<()> {
        let runtime = self.inner.runtime(queue)?;
        if runtime.transition(QueueStatus::Active)? {
            info!(queue = %queue, "Queue resumed");
        }
        Ok(())
    }

    /// Refuse new jobs, wait for in-flight jobs, then stop the queue's workers.
    ///
    /// Waiting and delayed jobs stay persisted and are reloaded when the
    /// queue is created again.
    pub async fn drain(&self, queue: &str) -> Result<()> {
        let runtime = self.inner.runtime(queue)?;
        match runtime.status() {
            QueueStatus::Stopped => return Ok(()),
            QueueStatus::Draining => {}
            _ => {
                runtime.transition(QueueStatus::Draining)?;
            }
        }

        info!(queue = %queue, active = runtime.active_len(), "Draining queue");
        loop {
            let released = runtime.released.notified();
            if runtime.active_len() == 0 {
                break;
            }
            let _ = tokio::time::timeout(DRAIN_POLL_INTERVAL, released).await;
        }

        runtime.transition(QueueStatus::Stopped)?;
        join_tasks(queue, runtime.stop_tasks()).await;
        info!(queue = %queue, "Queue drained and stopped");
        Ok(())
    }

    pub fn queue_status(&self, queue: &str) -> Result<QueueStatus> {
        Ok(self.inner.runtime(queue)?.status())
    }

    /// Registered queue names, sorted
    pub fn queue_names(&self) -> Vec<String> {
        self.inner
            .all_runtimes()
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    pub async fn get_stats(&self, queue: &str) -> Result<QueueStats> {
        let runtime = self.inner.runtime(queue)?;
        self.inner.stats_for(&runtime).await
    }

    /// Stats for every queue, sorted by name
    pub async fn all_stats(&self) -> Result<Vec<QueueStats>> {
        let mut stats = Vec::new();
        for runtime in self.inner.all_runtimes() {
            stats.push(self.inner.stats_for(&runtime).await?);
        }
        Ok(stats)
    }

    /// Move archived failed jobs matching `filter` back to waiting with a
    /// fresh attempt budget. Returns how many were re-enqueued.
    pub async fn retry_failed_jobs(&self, queue: &str, filter: Option<&JobFilter>) -> Result<usize> {
        let runtime = self.inner.runtime(queue)?;
        let status = runtime.status();
        if !status.accepts_jobs() {
            return Err(AppError::InvalidQueue(format!(
                "Queue '{}' is {} and does not accept jobs",
                queue, status
            )));
        }

        let inner = &self.inner;
        let failed_key = &runtime.keys.failed;
        let len = inner
            .store_retry
            .run("len", || inner.store.len(failed_key))
            .await?;
        let ids = inner
            .store_retry
            .run("peek", || inner.store.peek(failed_key, 0, len))
            .await?;

        let mut retried = 0;
        for id in ids {
            if runtime.with_state(|s| s.index.contains(&id)) {
                // still settling
                continue;
            }
            let mut job = match inner.load_job(&runtime, &id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(queue = %queue, job_id = %id, "Dropping failed entry without a record");
                    inner
                        .store_retry
                        .run("remove", || inner.store.remove(failed_key, &id))
                        .await?;
                    continue;
                }
                Err(AppError::Serialization(e)) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "Skipping corrupt job record");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(filter) = filter {
                if !filter(&job) {
                    continue;
                }
            }

            inner
                .store_retry
                .run("remove", || inner.store.remove(failed_key, &id))
                .await?;
            job.reset_for_retry();
            inner.save_job(&runtime, &job).await?;
            runtime.admit(job, inner.now())?;
            retried += 1;
        }

        if retried > 0 {
            info!(queue = %queue, retried = retried, "Re-enqueued failed jobs");
        }
        Ok(retried)
    }

    /// Most recently completed jobs, newest first
    pub async fn get_completed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>> {
        let runtime = self.inner.runtime(queue)?;
        self.inner
            .archived(&runtime, &runtime.keys.completed, limit)
            .await
    }

    /// Most recently failed jobs, newest first
    pub async fn get_failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>> {
        let runtime = self.inner.runtime(queue)?;
        self.inner.archived(&runtime, &runtime.keys.failed, limit).await
    }

    /// Look up a live or archived job
    pub async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        let runtime = self.inner.runtime(queue)?;
        if let Some(job) = runtime.with_state(|s| s.index.get(id).cloned()) {
            return Ok(Some(job));
        }
        self.inner.load_job(&runtime, id).await
    }

    /// Release memory held by queue indexes and metrics windows.
    /// Aggressive mode also trims store archives to the compaction floor.
    pub async fn compact(&self, aggressive: bool) -> Result<CompactionReport> {
        let now = self.inner.now();
        let runtimes = self.inner.all_runtimes();
        let mut report = CompactionReport {
            queues: runtimes.len(),
            archived_removed: 0,
        };

        for runtime in &runtimes {
            runtime.with_state(|s| {
                s.index.shrink_to_fit();
                s.metrics.prune(now);
                s.metrics.shrink_to_fit();
            });
            if aggressive {
                let floor = self.inner.config.compaction_floor;
                for list in [&runtime.keys.completed, &runtime.keys.failed] {
                    report.archived_removed +=
                        self.inner.trim_archive(runtime, list, floor).await?;
                }
            }
        }

        debug!(
            aggressive = aggressive,
            queues = report.queues,
            archived_removed = report.archived_removed,
            "Engine compacted"
        );
        Ok(report)
    }

    /// Pause every active queue flagged `shed_under_pressure`; returns their names
    pub fn pause_sheddable(&self) -> Vec<String> {
        let mut paused = Vec::new();
        for runtime in self.inner.all_runtimes() {
            if !runtime.settings.shed_under_pressure {
                continue;
            }
            if let Ok(true) = runtime.transition(QueueStatus::Paused) {
                warn!(queue = %runtime.name(), "Queue paused to shed load");
                paused.push(runtime.name().to_string());
            }
        }
        paused
    }

    /// Resume queues previously paused by `pause_sheddable`
    pub fn resume_shed(&self, names: &[String]) {
        for name in names {
            let Ok(runtime) = self.inner.runtime(name) else {
                continue;
            };
            if runtime.status() == QueueStatus::Paused {
                if let Ok(true) = runtime.transition(QueueStatus::Active) {
                    info!(queue = %name, "Shed queue resumed");
                }
            }
        }
    }

    /// Stop every worker pool and sweeper
    ///
    /// Jobs still running after the join timeout are aborted; they remain
    /// active in the store and are requeued on the next start.
    pub async fn shutdown(&self) {
        let runtimes = self.inner.all_runtimes();
        for runtime in &runtimes {
            join_tasks(runtime.name(), runtime.stop_tasks()).await;
            let aborted = runtime.abort_active();
            if aborted > 0 {
                warn!(queue = %runtime.name(), aborted = aborted, "Aborted running jobs at shutdown");
            }
        }
        info!(queues = runtimes.len(), "Queue engine stopped");
    }
}

impl UsageSource for QueueEngine {
    fn active_jobs(&self) -> usize {
        self.inner
            .all_runtimes()
            .iter()
            .map(|r| r.active_len())
            .sum()
    }
}

async fn join_tasks(queue: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let abort = handle.abort_handle();
        match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                warn!(queue = %queue, error = %e, "Queue task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(queue = %queue, "Queue task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl EngineInner {
    fn now(&self) -> i64 {
        self.time_provider.now_millis()
    }

    fn runtime(&self, name: &str) -> Result<Arc<QueueRuntime>> {
        read(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::InvalidQueue(format!("Unknown queue '{}'", name)))
    }

    fn has_queue(&self, name: &str) -> bool {
        read(&self.queues).contains_key(name)
    }

    fn all_runtimes(&self) -> Vec<Arc<QueueRuntime>> {
        let mut runtimes: Vec<_> = read(&self.queues).values().cloned().collect();
        runtimes.sort_by(|a, b| a.name().cmp(b.name()));
        runtimes
    }

    async fn save_job(&self, runtime: &QueueRuntime, job: &Job) -> Result<()> {
        let record = serde_json::to_string(job)?;
        self.store_retry
            .run("hset", || {
                self.store.hset(&runtime.keys.jobs, &job.id, &record)
            })
            .await?;
        Ok(())
    }

    async fn load_job(&self, runtime: &QueueRuntime, id: &str) -> Result<Option<Job>> {
        let record = self
            .store_retry
            .run("hget", || self.store.hget(&runtime.keys.jobs, id))
            .await?;
        match record {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    /// Best-effort removal of a job record
    async fn forget_job(&self, runtime: &QueueRuntime, id: &str) {
        if let Err(e) = self
            .store_retry
            .run("hdel", || self.store.hdel(&runtime.keys.jobs, id))
            .await
        {
            warn!(queue = %runtime.name(), job_id = %id, error = %e, "Failed to remove job record");
        }
    }

    /// Drop the oldest archived ids (and their records) beyond `keep`
    async fn trim_archive(&self, runtime: &QueueRuntime, list: &str, keep: usize) -> Result<u64> {
        let len = self
            .store_retry
            .run("len", || self.store.len(list))
            .await?;
        let excess = len.saturating_sub(keep as u64);

        let mut removed = 0;
        for _ in 0..excess {
            let Some(id) = self.store_retry.run("pop", || self.store.pop(list)).await? else {
                break;
            };
            self.store_retry
                .run("hdel", || self.store.hdel(&runtime.keys.jobs, &id))
                .await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn archived(&self, runtime: &QueueRuntime, list: &str, limit: usize) -> Result<Vec<Job>> {
        let limit = limit as u64;
        let len = self
            .store_retry
            .run("len", || self.store.len(list))
            .await?;
        let start = len.saturating_sub(limit);
        let mut ids = self
            .store_retry
            .run("peek", || self.store.peek(list, start, limit))
            .await?;
        ids.reverse();

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_job(runtime, &id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(AppError::Serialization(e)) => {
                    warn!(queue = %runtime.name(), job_id = %id, error = %e, "Skipping corrupt job record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    async fn stats_for(&self, runtime: &QueueRuntime) -> Result<QueueStats> {
        let now = self.now();
        let (status, waiting, active, delayed, promoted) = runtime.with_state(|s| {
            let promoted = s.index.promote_due(now);
            (
                s.status,
                s.index.waiting_len(),
                s.index.active_len(),
                s.index.delayed_len(),
                promoted,
            )
        });
        if promoted > 0 {
            runtime.wakeup.notify_waiters();
        }
        let summary = runtime.summary(now);

        let keys = &runtime.keys;
        let completed = self
            .store_retry
            .run("len", || self.store.len(&keys.completed))
            .await?;
        let failed = self
            .store_retry
            .run("len", || self.store.len(&keys.failed))
            .await?;
        let completed_total = self
            .store_retry
            .run("counter", || self.store.counter(&keys.completed_total))
            .await?;
        let failed_total = self
            .store_retry
            .run("counter", || self.store.counter(&keys.failed_total))
            .await?;
        let dead_lettered = self
            .store_retry
            .run("counter", || self.store.counter(&keys.dead_lettered))
            .await?;

        Ok(QueueStats {
            name: runtime.name().to_string(),
            status,
            waiting,
            active,
            delayed,
            completed,
            failed,
            completed_total,
            failed_total,
            dead_lettered,
            concurrency: runtime.settings.concurrency,
            throughput_per_minute: summary.throughput_per_minute,
            avg_processing_ms: summary.avg_processing_ms,
            error_rate: summary.error_rate,
            timestamp: now,
        })
    }
}
