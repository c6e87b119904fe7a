// Application Layer - Queue engine, memory monitor and optimization controller

pub mod backoff;
pub mod constants;
mod locks;
pub mod monitor;
pub mod optimizer;
pub mod panic_guard;
pub mod queue;
pub mod shutdown;
pub mod store_retry;

// Re-exports
pub use backoff::compute_delay;
pub use monitor::{MemoryMonitor, MemoryStatus, MonitorCounters, MonitorHealth, MonitorSignal};
pub use optimizer::{
    ControllerEvent, ControllerHealth, HealthDetails, OptimizationController, OptimizationOptions,
    OptimizationReport,
};
pub use queue::{CompactionReport, JobFilter, QueueEngine, QueueStats, RestoreReport};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use store_retry::StoreRetryPolicy;
