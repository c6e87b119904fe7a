// Queue Domain Model

use crate::domain::backoff::BackoffPolicy;
use crate::domain::error::{DomainError, Result};
use crate::domain::job::DEFAULT_MAX_ATTEMPTS;
use serde::{Deserialize, Serialize};

pub use crate::domain::job::QueueId;

/// Queue lifecycle status
///
/// Allowed transitions: `active <-> paused`, `active -> draining -> stopped`.
/// Nothing leaves `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Active,
    Paused,
    Draining,
    Stopped,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Active => write!(f, "active"),
            QueueStatus::Paused => write!(f, "paused"),
            QueueStatus::Draining => write!(f, "draining"),
            QueueStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl QueueStatus {
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::Active, QueueStatus::Paused)
                | (QueueStatus::Paused, QueueStatus::Active)
                | (QueueStatus::Active, QueueStatus::Draining)
                | (QueueStatus::Draining, QueueStatus::Stopped)
        )
    }

    pub fn transition(self, next: QueueStatus) -> Result<QueueStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidStatusTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Whether producers may still add jobs
    pub fn accepts_jobs(self) -> bool {
        matches!(self, QueueStatus::Active | QueueStatus::Paused)
    }

    /// Whether workers may pick up new jobs
    pub fn dispatches(self) -> bool {
        self == QueueStatus::Active
    }
}

/// Per-queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: QueueId,
    /// Worker pool size (0 = inspection-only queue, e.g. a dead-letter queue)
    pub concurrency: usize,
    /// Default attempt budget for jobs that do not set one
    pub max_attempts: u32,
    /// Base retry delay (ms)
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Full policy override; when None an exponential policy is built from
    /// `retry_delay_ms` and `backoff_multiplier`
    pub backoff: Option<BackoffPolicy>,
    pub stalled_interval_ms: u64,
    pub max_stalled_count: u32,
    pub dead_letter_queue: Option<QueueId>,
    /// Keep at most N completed jobs in the archive (None = keep all)
    pub remove_on_complete: Option<usize>,
    /// Keep at most N failed jobs in the archive (None = keep all)
    pub remove_on_fail: Option<usize>,
    /// Low-priority work an emergency optimization pass may pause
    pub shed_under_pressure: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            concurrency: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            backoff: None,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            dead_letter_queue: None,
            remove_on_complete: None,
            remove_on_fail: None,
            shed_under_pressure: false,
        }
    }
}

impl QueueSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }

    pub fn with_stalled_check(mut self, interval_ms: u64, max_stalled_count: u32) -> Self {
        self.stalled_interval_ms = interval_ms;
        self.max_stalled_count = max_stalled_count;
        self
    }

    pub fn with_retention(mut self, on_complete: Option<usize>, on_fail: Option<usize>) -> Self {
        self.remove_on_complete = on_complete;
        self.remove_on_fail = on_fail;
        self
    }

    pub fn sheddable(mut self) -> Self {
        self.shed_under_pressure = true;
        self
    }

    /// Effective default backoff policy for the queue
    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff.clone().unwrap_or_else(|| {
            BackoffPolicy::exponential(self.retry_delay_ms, self.backoff_multiplier)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "Queue name cannot be empty".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::ValidationError(format!(
                "Queue '{}' must allow at least one attempt",
                self.name
            )));
        }
        if self.dead_letter_queue.as_deref() == Some(self.name.as_str()) {
            return Err(DomainError::ValidationError(format!(
                "Queue '{}' cannot be its own dead-letter queue",
                self.name
            )));
        }
        if self.stalled_interval_ms == 0 {
            return Err(DomainError::ValidationError(format!(
                "Queue '{}' stalled interval must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backoff::BackoffStrategy;

    #[test]
    fn test_status_transitions() {
        assert!(QueueStatus::Active.can_transition_to(QueueStatus::Paused));
        assert!(QueueStatus::Paused.can_transition_to(QueueStatus::Active));
        assert!(QueueStatus::Active.can_transition_to(QueueStatus::Draining));
        assert!(QueueStatus::Draining.can_transition_to(QueueStatus::Stopped));

        assert!(!QueueStatus::Paused.can_transition_to(QueueStatus::Draining));
        assert!(!QueueStatus::Stopped.can_transition_to(QueueStatus::Active));
        assert!(QueueStatus::Stopped.transition(QueueStatus::Paused).is_err());
    }

    #[test]
    fn test_default_backoff_from_settings() {
        let settings = QueueSettings::new("chat");
        let policy = settings.backoff_policy();
        assert_eq!(policy.strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.delay_ms, 1000);
        assert_eq!(policy.multiplier, Some(2.0));
    }

    #[test]
    fn test_validate() {
        assert!(QueueSettings::new("").validate().is_err());
        assert!(QueueSettings::new("a").with_dead_letter_queue("a").validate().is_err());
        assert!(QueueSettings::new("a").with_max_attempts(0).validate().is_err());
        assert!(QueueSettings::new("a").with_dead_letter_queue("a-dlq").validate().is_ok());
    }
}
