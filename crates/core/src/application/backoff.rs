// Backoff Policy Engine
//
// Pure delay computation shared by every queue. No internal state.
use crate::domain::{BackoffPolicy, BackoffStrategy};
use rand::Rng;

/// Jitter perturbation bound (±20%)
pub const JITTER_RATIO: f64 = 0.2;

/// Multiplier used when an exponential policy does not set one
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Compute the retry delay (ms) for the given attempt (1-based).
///
/// Formulas:
/// - fixed: `delay`
/// - linear: `delay * attempt`
/// - exponential: `delay * multiplier^(attempt-1)`
/// - custom: caller function, falling back to `delay`
///
/// The result is clamped to `max_delay_ms` before and after jitter.
///
/// # Example
/// ```text
/// let policy = BackoffPolicy::exponential(1000, 2.0).with_max_delay(10_000);
/// assert_eq!(compute_delay(&policy, 3, "timeout"), 4000);
/// ```
pub fn compute_delay(policy: &BackoffPolicy, attempt: u32, error: &str) -> u64 {
    let base = compute_base_delay(policy, attempt, error);
    if !policy.jitter {
        return base;
    }
    clamp(policy, apply_jitter(base, JITTER_RATIO))
}

/// Delay without jitter (deterministic)
pub fn compute_base_delay(policy: &BackoffPolicy, attempt: u32, error: &str) -> u64 {
    let attempt = attempt.max(1);
    let delay = policy.delay_ms as f64;

    let raw = match policy.strategy {
        BackoffStrategy::Fixed => delay,
        BackoffStrategy::Linear => delay * f64::from(attempt),
        BackoffStrategy::Exponential => {
            let multiplier = policy.multiplier.unwrap_or(DEFAULT_MULTIPLIER);
            delay * multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32)
        }
        BackoffStrategy::Custom => policy
            .custom
            .as_ref()
            .and_then(|f| f(attempt, error))
            .unwrap_or(policy.delay_ms) as f64,
    };

    // `as` saturates: NaN -> 0, +inf -> u64::MAX
    clamp(policy, raw.max(0.0) as u64)
}

/// Perturb `delay_ms` uniformly within ±`ratio`
pub fn apply_jitter(delay_ms: u64, ratio: f64) -> u64 {
    let ratio = ratio.abs().min(1.0);
    if ratio == 0.0 || delay_ms == 0 {
        return delay_ms;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-ratio..=ratio);
    (delay_ms as f64 * factor).max(0.0) as u64
}

fn clamp(policy: &BackoffPolicy, delay_ms: u64) -> u64 {
    match policy.max_delay_ms {
        Some(max) => delay_ms.min(max),
        None => delay_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed() {
        let policy = BackoffPolicy::fixed(500);
        assert_eq!(compute_delay(&policy, 1, ""), 500);
        assert_eq!(compute_delay(&policy, 7, ""), 500);
    }

    #[test]
    fn test_linear() {
        let policy = BackoffPolicy::linear(300);
        assert_eq!(compute_delay(&policy, 1, ""), 300);
        assert_eq!(compute_delay(&policy, 4, ""), 1200);
    }

    #[test]
    fn test_exponential_with_cap() {
        let policy = BackoffPolicy::exponential(1000, 2.0).with_max_delay(5000);
        assert_eq!(compute_delay(&policy, 1, ""), 1000);
        assert_eq!(compute_delay(&policy, 2, ""), 2000);
        assert_eq!(compute_delay(&policy, 3, ""), 4000);
        assert_eq!(compute_delay(&policy, 4, ""), 5000);
        assert_eq!(compute_delay(&policy, 60, ""), 5000);
    }

    #[test]
    fn test_exponential_is_monotonic() {
        for multiplier in [1.1, 1.5, 2.0, 3.0] {
            let policy = BackoffPolicy::exponential(100, multiplier).with_max_delay(60_000);
            let mut previous = 0;
            for attempt in 1..200 {
                let delay = compute_delay(&policy, attempt, "");
                assert!(
                    delay >= previous,
                    "multiplier {} attempt {}: {} < {}",
                    multiplier,
                    attempt,
                    delay,
                    previous
                );
                assert!(delay <= 60_000);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_exponential_without_cap_saturates() {
        let policy = BackoffPolicy::exponential(1000, 10.0);
        assert_eq!(compute_delay(&policy, 500, ""), u64::MAX);
    }

    #[test]
    fn test_custom_receives_attempt_and_error() {
        let policy = BackoffPolicy::custom(50, |attempt, error| {
            if error.contains("rate limit") {
                Some(u64::from(attempt) * 10_000)
            } else {
                None
            }
        });
        assert_eq!(compute_delay(&policy, 2, "rate limit hit"), 20_000);
        assert_eq!(compute_delay(&policy, 2, "other"), 50);
    }

    #[test]
    fn test_custom_without_function_falls_back() {
        let mut policy = BackoffPolicy::custom(75, |_, _| Some(1));
        policy.custom = None;
        assert_eq!(compute_delay(&policy, 3, ""), 75);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::fixed(1000).with_jitter(true);
        for _ in 0..500 {
            let delay = compute_delay(&policy, 1, "");
            assert!((800..=1200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_jitter_respects_max_delay() {
        let policy = BackoffPolicy::fixed(1000).with_max_delay(1000).with_jitter(true);
        for _ in 0..200 {
            assert!(compute_delay(&policy, 1, "") <= 1000);
        }
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = BackoffPolicy::linear(100);
        assert_eq!(compute_delay(&policy, 0, ""), 100);
    }
}
