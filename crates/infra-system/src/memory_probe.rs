// Process memory probe implementation
// reason: sysinfo for cross-platform process statistics
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use quell_core::port::{MemoryProbe, ProcessMemory};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory probe for the current process using sysinfo
///
/// A native process has no managed heap, so resident memory stands in for
/// heap-used and virtual memory for heap-total. External memory is always 0.
pub struct SysinfoMemoryProbe {
    system: Arc<Mutex<System>>,
    pid: Option<Pid>,
}

impl SysinfoMemoryProbe {
    /// Create a probe bound to the current process
    ///
    /// # Example
    /// ```text
    /// let probe = Arc::new(SysinfoMemoryProbe::new());
    /// let monitor = MemoryMonitor::new(probe, clock, thresholds);
    /// ```
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot resolve current pid, memory readings will be zero");
                None
            }
        };
        Self {
            system: Arc::new(Mutex::new(System::new())),
            pid,
        }
    }

    fn read_blocking(system: &Mutex<System>, pid: Pid) -> Option<ProcessMemory> {
        let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
        if !sys.refresh_process(pid) {
            return None;
        }
        let process = sys.process(pid)?;
        let rss_mb = process.memory() as f64 / BYTES_PER_MB;
        let virtual_mb = process.virtual_memory() as f64 / BYTES_PER_MB;

        Some(ProcessMemory {
            heap_used_mb: rss_mb,
            heap_total_mb: virtual_mb.max(rss_mb),
            rss_mb,
            external_mb: 0.0,
        })
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryProbe for SysinfoMemoryProbe {
    async fn read(&self) -> ProcessMemory {
        let Some(pid) = self.pid else {
            return ProcessMemory::default();
        };

        // Process refresh reads /proc (or the platform equivalent)
        let system = Arc::clone(&self.system);
        let reading =
            tokio::task::spawn_blocking(move || Self::read_blocking(&system, pid)).await;

        match reading {
            Ok(Some(memory)) => {
                debug!(
                    rss_mb = memory.rss_mb,
                    virtual_mb = memory.heap_total_mb,
                    "Process memory collected"
                );
                memory
            }
            Ok(None) => {
                warn!(pid = %pid, "Process not visible to sysinfo");
                ProcessMemory::default()
            }
            Err(e) => {
                warn!(error = %e, "Memory probe task failed");
                ProcessMemory::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_current_process() {
        let probe = SysinfoMemoryProbe::new();
        let memory = probe.read().await;

        assert!(memory.rss_mb > 0.0);
        assert_eq!(memory.heap_used_mb, memory.rss_mb);
        assert!(memory.heap_total_mb >= memory.heap_used_mb);
        assert_eq!(memory.external_mb, 0.0);
    }
}
