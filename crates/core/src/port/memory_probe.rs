// Process memory probe port
use crate::port::queue_store::PoolStats;
use async_trait::async_trait;

/// Raw process memory reading (MB)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessMemory {
    pub heap_used_mb: f64,
    pub heap_total_mb: f64,
    pub rss_mb: f64,
    pub external_mb: f64,
}

/// Memory probe port used by the Memory Monitor
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    /// Read current process memory
    async fn read(&self) -> ProcessMemory;
}

/// Collaborator counters folded into every memory sample
pub trait UsageSource: Send + Sync {
    /// Jobs currently executing
    fn active_jobs(&self) -> usize;

    /// Store connection pool usage, when known
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Mock probe: returns scripted readings first, then the current value
    pub struct MockMemoryProbe {
        current: Mutex<ProcessMemory>,
        script: Mutex<VecDeque<ProcessMemory>>,
    }

    impl MockMemoryProbe {
        pub fn new(heap_used_mb: f64, rss_mb: f64) -> Self {
            Self {
                current: Mutex::new(Self::reading(heap_used_mb, rss_mb)),
                script: Mutex::new(VecDeque::new()),
            }
        }

        pub fn set(&self, heap_used_mb: f64, rss_mb: f64) {
            *self.current.lock().unwrap() = Self::reading(heap_used_mb, rss_mb);
        }

        /// Queue readings (heap_used_mb, rss_mb) returned by the next reads
        pub fn script(&self, readings: &[(f64, f64)]) {
            let mut script = self.script.lock().unwrap();
            script.extend(readings.iter().map(|(h, r)| Self::reading(*h, *r)));
        }

        fn reading(heap_used_mb: f64, rss_mb: f64) -> ProcessMemory {
            ProcessMemory {
                heap_used_mb,
                heap_total_mb: heap_used_mb * 2.0,
                rss_mb,
                external_mb: 0.0,
            }
        }
    }

    #[async_trait]
    impl MemoryProbe for MockMemoryProbe {
        async fn read(&self) -> ProcessMemory {
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            *self.current.lock().unwrap()
        }
    }

    /// Fixed usage counters
    pub struct StaticUsage {
        pub active_jobs: usize,
        pub pool: Option<PoolStats>,
    }

    impl UsageSource for StaticUsage {
        fn active_jobs(&self) -> usize {
            self.active_jobs
        }

        fn pool_stats(&self) -> Option<PoolStats> {
            self.pool
        }
    }
}
