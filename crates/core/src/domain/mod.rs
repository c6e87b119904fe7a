// Domain Layer - Pure business logic and entities

pub mod backoff;
pub mod error;
pub mod job;
pub mod memory;
pub mod queue;

// Re-exports
pub use backoff::{BackoffPolicy, BackoffStrategy, CustomBackoffFn};
pub use error::DomainError;
pub use job::{Job, JobId, JobName, JobOptions, JobPayload, JobStatus, Priority};
pub use memory::{
    MemorySample, MemoryThresholds, OptimizationMethod, OptimizationReason, OptimizationRecord,
    ThresholdLevel,
};
pub use queue::{QueueId, QueueSettings, QueueStatus};
