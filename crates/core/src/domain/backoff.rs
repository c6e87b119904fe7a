// Backoff Policy Model
//
// The policy is plain data; the delay computation lives in application::backoff.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Caller-supplied delay function: (attempt, triggering error) -> delay in ms.
/// Returning None falls back to the policy's base delay.
pub type CustomBackoffFn = Arc<dyn Fn(u32, &str) -> Option<u64> + Send + Sync>;

/// Backoff strategy tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Custom,
}

/// Backoff policy: strategy plus parameters
#[derive(Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    /// Base delay (ms)
    pub delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub jitter: bool,
    /// Not persisted: a restored `custom` policy falls back to `delay_ms`
    #[serde(skip)]
    pub custom: Option<CustomBackoffFn>,
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self::with_strategy(BackoffStrategy::Fixed, delay_ms)
    }

    pub fn linear(delay_ms: u64) -> Self {
        Self::with_strategy(BackoffStrategy::Linear, delay_ms)
    }

    pub fn exponential(delay_ms: u64, multiplier: f64) -> Self {
        Self {
            multiplier: Some(multiplier),
            ..Self::with_strategy(BackoffStrategy::Exponential, delay_ms)
        }
    }

    pub fn custom<F>(fallback_delay_ms: u64, f: F) -> Self
    where
        F: Fn(u32, &str) -> Option<u64> + Send + Sync + 'static,
    {
        Self {
            custom: Some(Arc::new(f)),
            ..Self::with_strategy(BackoffStrategy::Custom, fallback_delay_ms)
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn with_strategy(strategy: BackoffStrategy, delay_ms: u64) -> Self {
        Self {
            strategy,
            delay_ms,
            max_delay_ms: None,
            multiplier: None,
            jitter: false,
            custom: None,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(1000, 2.0)
    }
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("strategy", &self.strategy)
            .field("delay_ms", &self.delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}
