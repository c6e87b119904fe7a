// Queue statistics and trailing metrics window

use crate::domain::QueueStatus;
use serde::Serialize;
use std::collections::VecDeque;

/// Point-in-time queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub status: QueueStatus,
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    /// Archived completed/failed jobs currently retained
    pub completed: u64,
    pub failed: u64,
    /// Lifetime totals from the store counters
    pub completed_total: i64,
    pub failed_total: i64,
    pub dead_lettered: i64,
    pub concurrency: usize,
    /// Successful completions per minute over the trailing window
    pub throughput_per_minute: f64,
    pub avg_processing_ms: f64,
    /// Failed executions / all executions over the trailing window (0.0..=1.0)
    pub error_rate: f64,
    /// Epoch ms
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy)]
struct Execution {
    finished_at: i64,
    duration_ms: i64,
    ok: bool,
}

/// Finished executions within a trailing window
#[derive(Debug)]
pub(crate) struct MetricsWindow {
    window_ms: i64,
    entries: VecDeque<Execution>,
}

/// Aggregates over the window
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowSummary {
    pub throughput_per_minute: f64,
    pub avg_processing_ms: f64,
    pub error_rate: f64,
}

impl MetricsWindow {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, finished_at: i64, duration_ms: i64, ok: bool) {
        self.entries.push_back(Execution {
            finished_at,
            duration_ms: duration_ms.max(0),
            ok,
        });
        self.prune(finished_at);
    }

    /// Drop entries older than the window
    pub fn prune(&mut self, now_millis: i64) {
        let cutoff = now_millis - self.window_ms;
        while self.entries.front().is_some_and(|e| e.finished_at < cutoff) {
            self.entries.pop_front();
        }
    }

    pub fn shrink_to_fit(&mut self) {
        self.entries.shrink_to_fit();
    }

    pub fn summary(&mut self, now_millis: i64) -> WindowSummary {
        self.prune(now_millis);
        let total = self.entries.len();
        if total == 0 {
            return WindowSummary {
                throughput_per_minute: 0.0,
                avg_processing_ms: 0.0,
                error_rate: 0.0,
            };
        }

        let succeeded = self.entries.iter().filter(|e| e.ok).count();
        let duration_sum: i64 = self.entries.iter().map(|e| e.duration_ms).sum();
        let window_minutes = self.window_ms as f64 / 60_000.0;

        WindowSummary {
            throughput_per_minute: succeeded as f64 / window_minutes,
            avg_processing_ms: duration_sum as f64 / total as f64,
            error_rate: (total - succeeded) as f64 / total as f64,
        }
    }
}
