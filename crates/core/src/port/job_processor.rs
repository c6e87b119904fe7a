// Job Processor Port
// Handlers bound to (queue, job name) pairs; executed by the queue engine's workers

use crate::domain::Job;
use crate::port::TimeProvider;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Job-level failures. Contained by the retry/dead-letter path, never escalated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Processor failed: {0}")]
    Processor(String),

    #[error("Job stalled {count} consecutive checks (limit {limit})")]
    Stalled { count: u32, limit: u32 },

    #[error("Processor panicked: {0}")]
    Panicked(String),

    #[error("No processor registered for '{queue}/{name}'")]
    MissingProcessor { queue: String, name: String },
}

impl JobError {
    /// Wrap any processor-side error
    pub fn processor(err: impl std::fmt::Display) -> Self {
        JobError::Processor(err.to_string())
    }
}

/// Per-execution context handed to processors
#[derive(Clone)]
pub struct JobContext {
    attempt: u32,
    heartbeat: Arc<AtomicI64>,
    time_provider: Arc<dyn TimeProvider>,
}

impl JobContext {
    pub fn new(
        attempt: u32,
        heartbeat: Arc<AtomicI64>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            attempt,
            heartbeat,
            time_provider,
        }
    }

    /// 1-based attempt number of this execution
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report progress; keeps the stalled-job sweep away from this job
    pub fn heartbeat(&self) {
        self.heartbeat
            .store(self.time_provider.now_millis(), Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.heartbeat.load(Ordering::SeqCst)
    }
}

/// Processor trait
///
/// Return `Ok(Some(value))` to store a return value on the completed job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job, ctx: JobContext) -> Result<Option<Value>, JobError>;
}

/// Adapter turning an async closure into a processor
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, JobError>> + Send,
{
    async fn process(&self, job: &Job, ctx: JobContext) -> Result<Option<Value>, JobError> {
        (self.f)(job.clone(), ctx).await
    }
}

/// Build a processor from an async closure
///
/// # Example
/// ```text
/// engine.register_processor("reports", "render", processor_fn(|job, _ctx| async move {
///     render(job.payload.as_value()).await.map_err(JobError::processor)?;
///     Ok(None)
/// }))?;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn JobProcessor>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, JobError>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Mock processor behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed
        Success,
        /// Always fail with message
        Fail(String),
        /// Fail the first N calls, then succeed
        FailTimes(usize, String),
        /// Panic with message (for panic isolation testing)
        Panic(String),
        /// Sleep for N ms, then succeed
        Sleep(u64),
        /// Never return
        Hang,
    }

    /// Mock processor recording the jobs it ran, in order
    pub struct MockProcessor {
        behavior: Mutex<MockBehavior>,
        calls: Mutex<Vec<String>>,
    }

    impl MockProcessor {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// Job IDs in execution order
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobProcessor for MockProcessor {
        async fn process(&self, job: &Job, _ctx: JobContext) -> Result<Option<Value>, JobError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(job.id.clone());
                calls.len()
            };

            let behavior = self.behavior.lock().unwrap().clone();

            match behavior {
                MockBehavior::Success => Ok(Some(Value::from(call_index))),
                MockBehavior::Fail(msg) => Err(JobError::Processor(msg)),
                MockBehavior::FailTimes(n, msg) => {
                    if call_index <= n {
                        Err(JobError::Processor(msg))
                    } else {
                        Ok(None)
                    }
                }
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
                MockBehavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(None)
                }
                MockBehavior::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(None)
                }
            }
        }
    }
}
