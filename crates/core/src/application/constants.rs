// Engine constants (no magic values)
use std::time::Duration;

/// Fallback poll when a worker has nothing to do (covers missed wakeups)
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll while `drain` waits for in-flight jobs
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `shutdown` waits for each background task
pub const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Broadcast channel capacity for monitor signals and controller events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on retained memory samples regardless of window/interval
pub const MAX_SAMPLE_HISTORY: usize = 10_000;
