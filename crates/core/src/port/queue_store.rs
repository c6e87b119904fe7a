// Queue Store Port (Resource Counter Store contract)
//
// Lists, counters and hashes keyed by string. Implementations must make each
// call atomic on its own; the engine never relies on multi-call transactions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transient: connection lost, pool exhausted, database busy
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Ordered lists, counters and hashes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append to the tail of a list, returns the new length
    async fn push(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Remove and return the head (oldest) element
    async fn pop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Read `count` elements starting at `start` (0 = head) without removing them
    async fn peek(&self, key: &str, start: u64, count: u64) -> StoreResult<Vec<String>>;

    /// Remove every occurrence of `value`, returns how many were removed
    async fn remove(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn len(&self, key: &str) -> StoreResult<u64>;

    /// Atomically add `by` to a counter (created at 0), returns the new value
    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// Current counter value (0 when absent)
    async fn counter(&self, key: &str) -> StoreResult<i64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Returns true if the field existed
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>>;
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active: u32,
    pub idle: u32,
    pub total: u32,
}

/// Handle on the store's connection pool
///
/// Only the optimization controller resizes the pool.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn stats(&self) -> PoolStats;

    /// Close idle connections until at most `target_idle` remain.
    /// Returns how many connections were closed.
    async fn shrink(&self, target_idle: u32) -> StoreResult<u32>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Data {
        lists: HashMap<String, VecDeque<String>>,
        counters: HashMap<String, i64>,
        hashes: HashMap<String, HashMap<String, String>>,
    }

    /// In-memory store with fault injection
    #[derive(Default)]
    pub struct InMemoryQueueStore {
        data: Mutex<Data>,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl InMemoryQueueStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` calls fail with `StoreError::Unavailable`
        pub fn fail_next(&self, n: u32) {
            self.failures_left.store(n, Ordering::SeqCst);
        }

        /// Total calls attempted (including injected failures)
        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn check(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let injected = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(StoreError::Unavailable("injected failure".to_string()));
            }
            Ok(())
        }

        fn with<T>(&self, f: impl FnOnce(&mut Data) -> T) -> StoreResult<T> {
            self.check()?;
            let mut data = self.data.lock().unwrap();
            Ok(f(&mut data))
        }
    }

    #[async_trait]
    impl QueueStore for InMemoryQueueStore {
        async fn push(&self, key: &str, value: &str) -> StoreResult<u64> {
            self.with(|d| {
                let list = d.lists.entry(key.to_string()).or_default();
                list.push_back(value.to_string());
                list.len() as u64
            })
        }

        async fn pop(&self, key: &str) -> StoreResult<Option<String>> {
            self.with(|d| d.lists.get_mut(key).and_then(|l| l.pop_front()))
        }

        async fn peek(&self, key: &str, start: u64, count: u64) -> StoreResult<Vec<String>> {
            self.with(|d| {
                d.lists
                    .get(key)
                    .map(|l| {
                        l.iter()
                            .skip(start as usize)
                            .take(count as usize)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            })
        }

        async fn remove(&self, key: &str, value: &str) -> StoreResult<u64> {
            self.with(|d| match d.lists.get_mut(key) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|v| v != value);
                    (before - list.len()) as u64
                }
                None => 0,
            })
        }

        async fn len(&self, key: &str) -> StoreResult<u64> {
            self.with(|d| d.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
        }

        async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
            self.with(|d| {
                let counter = d.counters.entry(key.to_string()).or_insert(0);
                *counter += by;
                *counter
            })
        }

        async fn counter(&self, key: &str) -> StoreResult<i64> {
            self.with(|d| d.counters.get(key).copied().unwrap_or(0))
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
            self.with(|d| {
                d.hashes
                    .entry(key.to_string())
                    .or_default()
                    .insert(field.to_string(), value.to_string());
            })
        }

        async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
            self.with(|d| d.hashes.get(key).and_then(|h| h.get(field).cloned()))
        }

        async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
            self.with(|d| {
                d.hashes
                    .get_mut(key)
                    .map(|h| h.remove(field).is_some())
                    .unwrap_or(false)
            })
        }

        async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
            self.with(|d| {
                d.hashes
                    .get(key)
                    .map(|h| h.values().cloned().collect())
                    .unwrap_or_default()
            })
        }
    }

    /// Simulated connection pool
    pub struct MockConnectionPool {
        active: AtomicU32,
        idle: AtomicU32,
        shrink_calls: AtomicU32,
    }

    impl MockConnectionPool {
        pub fn new(active: u32, idle: u32) -> Self {
            Self {
                active: AtomicU32::new(active),
                idle: AtomicU32::new(idle),
                shrink_calls: AtomicU32::new(0),
            }
        }

        pub fn shrink_calls(&self) -> u32 {
            self.shrink_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionPool for MockConnectionPool {
        fn stats(&self) -> PoolStats {
            let active = self.active.load(Ordering::SeqCst);
            let idle = self.idle.load(Ordering::SeqCst);
            PoolStats {
                active,
                idle,
                total: active + idle,
            }
        }

        async fn shrink(&self, target_idle: u32) -> StoreResult<u32> {
            self.shrink_calls.fetch_add(1, Ordering::SeqCst);
            let idle = self.idle.load(Ordering::SeqCst);
            let closed = idle.saturating_sub(target_idle);
            self.idle.store(idle - closed, Ordering::SeqCst);
            Ok(closed)
        }
    }
}
