// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod job_processor;
pub mod memory_probe;
pub mod queue_store;
pub mod time_provider;

// Re-exports
pub use id_provider::IdProvider;
pub use job_processor::{processor_fn, JobContext, JobError, JobProcessor};
pub use memory_probe::{MemoryProbe, ProcessMemory, UsageSource};
pub use queue_store::{ConnectionPool, PoolStats, QueueStore, StoreError, StoreResult};
pub use time_provider::TimeProvider;
