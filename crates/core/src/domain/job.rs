// Job Domain Model

use crate::domain::backoff::BackoffPolicy;
use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job ID (UUID v4 unless an IdProvider says otherwise)
pub type JobId = String;

/// Queue identifier
pub type QueueId = String;

/// Default attempt budget when neither the job nor the queue sets one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Logical job name, routes a job to its processor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority tier (higher number = dequeued first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);
    pub const CRITICAL: Priority = Priority(20);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Priority::LOW => write!(f, "LOW"),
            Priority::NORMAL => write!(f, "NORMAL"),
            Priority::HIGH => write!(f, "HIGH"),
            Priority::CRITICAL => write!(f, "CRITICAL"),
            Priority(other) => write!(f, "{}", other),
        }
    }
}

/// Job status, derived from timestamps (never stored)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Delayed => write!(f, "delayed"),
        }
    }
}

/// Job Payload (JSON serializable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(Value);

impl JobPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Producer-side options for `enqueue`
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Priority,
    /// Delay before the job becomes eligible (ms)
    pub delay_ms: i64,
    /// None = queue default
    pub max_attempts: Option<u32>,
    /// None = queue default
    pub backoff: Option<BackoffPolicy>,
    pub metadata: Map<String, Value>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms.max(0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Job Entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueId,
    pub name: JobName,
    pub payload: JobPayload,
    pub priority: Priority,

    // Retry state
    pub attempts_made: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,

    /// Delay requested at enqueue time (ms)
    pub delay_ms: i64,

    // Timestamps (epoch ms)
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,

    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Job {
    /// Create a test job with deterministic ID and timestamp.
    ///
    /// Uses a simple counter for deterministic test IDs (test-1, test-2, ...).
    /// Timestamps start at 1000 and increment by 1000.
    ///
    /// **Note**: only for tests. Production code injects ID and time via providers.
    pub fn new_test(queue: impl Into<String>, name: JobName, payload: JobPayload) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let id = format!("test-{}", counter);
        let created_at = (counter * 1000) as i64;

        Self::new(id, created_at, queue, name, payload)
    }

    /// Create a new Job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `queue` - Queue name
    /// * `name` - Job name used for processor dispatch
    /// * `payload` - Job payload
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        queue: impl Into<String>,
        name: JobName,
        payload: JobPayload,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            name,
            payload,
            priority: Priority::NORMAL,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: None,
            delay_ms: 0,
            created_at,
            scheduled_at: None,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            return_value: None,
            metadata: Map::new(),
        }
    }

    /// Derive the status from which timestamps are set
    pub fn status(&self, now_millis: i64) -> JobStatus {
        if self.completed_at.is_some() {
            JobStatus::Completed
        } else if self.failed_at.is_some() {
            JobStatus::Failed
        } else if self.processed_at.is_some() {
            JobStatus::Active
        } else if self.scheduled_at.is_some_and(|at| at > now_millis) {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some() || self.failed_at.is_some()
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Transition to active with explicit timestamp
    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        if self.is_finished() || self.processed_at.is_some() {
            return Err(DomainError::InvalidStateTransition {
                from: self.status(now_millis).to_string(),
                to: JobStatus::Active.to_string(),
            });
        }
        if !self.attempts_left() {
            return Err(DomainError::AttemptsExhausted {
                job_id: self.id.clone(),
                attempts: self.attempts_made,
                max_attempts: self.max_attempts,
            });
        }
        self.processed_at = Some(now_millis);
        Ok(())
    }

    /// Transition to completed with explicit timestamp
    pub fn complete(&mut self, now_millis: i64, return_value: Option<Value>) -> Result<()> {
        if self.processed_at.is_none() || self.is_finished() {
            return Err(DomainError::InvalidStateTransition {
                from: self.status(now_millis).to_string(),
                to: JobStatus::Completed.to_string(),
            });
        }
        self.attempts_made += 1;
        self.completed_at = Some(now_millis);
        self.return_value = return_value;
        Ok(())
    }

    /// Count a failed attempt. Returns true while attempts remain.
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
        self.last_error = Some(error.into());
        self.processed_at = None;
        self.attempts_left()
    }

    /// Park the job in the delayed set until `now + delay_ms`
    pub fn schedule_retry(&mut self, now_millis: i64, delay_ms: i64) {
        self.processed_at = None;
        self.scheduled_at = Some(now_millis.saturating_add(delay_ms.max(0)));
    }

    /// Mark as failed with explicit timestamp (attempts exhausted)
    pub fn fail(&mut self, now_millis: i64) {
        self.processed_at = None;
        self.failed_at = Some(now_millis);
    }

    /// Operator retry: clear failure state and attempt count
    pub fn reset_for_retry(&mut self) {
        self.attempts_made = 0;
        self.failed_at = None;
        self.processed_at = None;
        self.scheduled_at = None;
        self.last_error = None;
    }

    /// Active job whose worker vanished: make it waiting again without charging an attempt
    pub fn requeue_orphaned(&mut self) {
        self.processed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new_test("reports", JobName::new("render"), JobPayload::new(json!({})))
    }

    #[test]
    fn test_status_derivation() {
        let mut job = job();
        assert_eq!(job.status(0), JobStatus::Waiting);

        job.schedule_retry(1_000, 500);
        assert_eq!(job.status(1_200), JobStatus::Delayed);
        assert_eq!(job.status(1_500), JobStatus::Waiting);

        job.start(1_500).unwrap();
        assert_eq!(job.status(1_500), JobStatus::Active);

        job.complete(1_600, None).unwrap();
        assert_eq!(job.status(1_600), JobStatus::Completed);
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let mut job = job();
        job.max_attempts = 2;

        job.start(1).unwrap();
        assert!(job.record_failure("boom"));
        job.start(2).unwrap();
        assert!(!job.record_failure("boom"));
        assert_eq!(job.attempts_made, 2);

        // Exhausted jobs cannot be dispatched again
        assert!(matches!(
            job.start(3),
            Err(DomainError::AttemptsExhausted { .. })
        ));

        assert!(!job.record_failure("boom"));
        assert_eq!(job.attempts_made, 2);
    }

    #[test]
    fn test_complete_requires_active() {
        let mut job = job();
        assert!(job.complete(10, None).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::CRITICAL > Priority::HIGH);
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
        assert_eq!(Priority::default(), Priority::NORMAL);
        assert_eq!(Priority::new(7).to_string(), "7");
    }

    #[test]
    fn test_reset_for_retry() {
        let mut job = job();
        job.start(1).unwrap();
        job.record_failure("boom");
        job.fail(2);
        assert_eq!(job.status(3), JobStatus::Failed);

        job.reset_for_retry();
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.status(3), JobStatus::Waiting);
    }

    #[test]
    fn test_serde_roundtrip_keeps_metadata() {
        let mut job = job();
        job.metadata.insert("original_queue".into(), json!("chat"));
        let raw = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.metadata["original_queue"], json!("chat"));
        assert_eq!(back.priority, job.priority);
    }
}
