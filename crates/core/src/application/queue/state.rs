// Per-queue runtime state: status, job index, metrics and background tasks

use super::index::{Claim, QueueIndex};
use super::keys::QueueKeys;
use super::stats::{MetricsWindow, WindowSummary};
use crate::application::locks::lock;
use crate::application::shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::{Job, QueueSettings, QueueStatus};
use crate::error::{AppError, Result};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub(crate) struct QueueState {
    pub status: QueueStatus,
    pub index: QueueIndex,
    pub metrics: MetricsWindow,
}

/// What a worker found when asking for work
pub(crate) enum Dispatch {
    Job(Claim),
    /// Nothing runnable; earliest delayed due time if any
    Idle(Option<i64>),
    /// Queue is not dispatching (paused, draining, stopped)
    Halted,
}

pub(crate) struct QueueRuntime {
    pub settings: QueueSettings,
    pub keys: QueueKeys,
    state: Mutex<QueueState>,
    /// Work became available or the status changed
    pub wakeup: Notify,
    /// An active slot was released
    pub released: Notify,
    shutdown: ShutdownSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueRuntime {
    pub fn new(settings: QueueSettings, keys: QueueKeys, metrics_window_ms: i64) -> Self {
        let (shutdown, _) = shutdown_channel();
        Self {
            settings,
            keys,
            state: Mutex::new(QueueState {
                status: QueueStatus::Active,
                index: QueueIndex::default(),
                metrics: MetricsWindow::new(metrics_window_ms),
            }),
            wakeup: Notify::new(),
            released: Notify::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn status(&self) -> QueueStatus {
        lock(&self.state).status
    }

    /// Run `f` under the state lock (never held across an await)
    pub fn with_state<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Apply a status transition. `Ok(false)` when already in `next`.
    pub fn transition(&self, next: QueueStatus) -> Result<bool> {
        let changed = self.with_state(|state| -> Result<bool> {
            if state.status == next {
                return Ok(false);
            }
            state.status = state
                .status
                .transition(next)
                .map_err(|e| AppError::InvalidState(e.to_string()))?;
            Ok(true)
        })?;
        if changed {
            self.wakeup.notify_waiters();
        }
        Ok(changed)
    }

    /// Add a waiting/delayed job, refusing it unless the queue accepts jobs
    pub fn admit(&self, job: Job, now_millis: i64) -> Result<()> {
        self.with_state(|state| {
            if !state.status.accepts_jobs() {
                return Err(AppError::InvalidQueue(format!(
                    "Queue '{}' is {} and does not accept jobs",
                    self.settings.name, state.status
                )));
            }
            state.index.insert(job, now_millis);
            Ok(())
        })?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Re-insert a job regardless of status (retries of in-flight work)
    pub fn reinsert(&self, job: Job, now_millis: i64) {
        self.with_state(|state| state.index.insert(job, now_millis));
        self.wakeup.notify_one();
    }

    pub fn dispatch(&self, now_millis: i64) -> Dispatch {
        self.with_state(|state| {
            if !state.status.dispatches() {
                return Dispatch::Halted;
            }
            match state.index.claim_next(now_millis) {
                Some(claim) => Dispatch::Job(claim),
                None => Dispatch::Idle(state.index.next_due()),
            }
        })
    }

    /// Release an active job and record its execution in the metrics window
    pub fn release(
        &self,
        job_id: &str,
        lease: u64,
        finished_at: i64,
        duration_ms: i64,
        ok: bool,
    ) -> Option<Job> {
        let job = self.with_state(|state| {
            let job = state.index.release(job_id, lease)?;
            state.metrics.record(finished_at, duration_ms, ok);
            Some(job)
        });
        self.released.notify_waiters();
        job
    }

    pub fn abort_active(&self) -> usize {
        self.with_state(|state| state.index.abort_all())
    }

    pub fn active_len(&self) -> usize {
        self.with_state(|state| state.index.active_len())
    }

    pub fn summary(&self, now_millis: i64) -> WindowSummary {
        self.with_state(|state| state.metrics.summary(now_millis))
    }

    pub fn token(&self) -> ShutdownToken {
        self.shutdown.token()
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    /// Signal every background task of this queue and hand back their handles
    pub fn stop_tasks(&self) -> Vec<JoinHandle<()>> {
        self.shutdown.shutdown();
        self.wakeup.notify_waiters();
        std::mem::take(&mut *lock(&self.tasks))
    }
}
