//! Retry/DLQ policy: a pure backoff calculation plus the retry-vs-terminal
//! decision. Kept free of I/O so the formula can be unit tested directly,
//! in isolation from the outbox polling loop it's used from.

use std::time::Duration;

use crate::config::RetryConfig;

/// `delay = base * multiplier ^ (attempts - 1)`, `attempts` already
/// incremented for the attempt that just failed.
pub fn backoff_delay(config: &RetryConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let factor = config.backoff_multiplier.powi(exponent as i32);
    let delay_ms = (config.backoff_base_ms as f64) * factor;
    Duration::from_millis(delay_ms.round() as u64)
}

/// Outcome of `decide` for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Reschedule with this delay; `attempts < max_attempts`.
    Retry { delay: Duration },
    /// `attempts == max_attempts`; route to the dead-letter queue.
    DeadLetter,
}

/// Decide between rescheduling and terminal dead-lettering: dead-lettering
/// happens exactly when `attempts` reaches `max_attempts`.
pub fn decide(config: &RetryConfig, attempts: u32) -> RetryDecision {
    if attempts < config.max_attempts {
        RetryDecision::Retry {
            delay: backoff_delay(config, attempts),
        }
    } else {
        RetryDecision::DeadLetter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32, base_ms: u64, multiplier: f64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_base_ms: base_ms,
            backoff_multiplier: multiplier,
            handler_timeout_ms: 0,
        }
    }

    #[test]
    fn first_attempt_delay_equals_base() {
        let cfg = config(5, 500, 2.0);
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(500));
    }

    #[test]
    fn delay_grows_exponentially() {
        let cfg = config(5, 500, 2.0);
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&cfg, 4), Duration::from_millis(4000));
    }

    #[test]
    fn multiplier_of_one_is_constant_delay() {
        let cfg = config(5, 500, 1.0);
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(&cfg, 10), Duration::from_millis(500));
    }

    #[test]
    fn decide_retries_below_max_attempts() {
        let cfg = config(3, 10, 2.0);
        assert_eq!(
            decide(&cfg, 1),
            RetryDecision::Retry {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            decide(&cfg, 2),
            RetryDecision::Retry {
                delay: Duration::from_millis(20)
            }
        );
    }

    #[test]
    fn decide_dead_letters_at_max_attempts() {
        let cfg = config(3, 10, 2.0);
        assert_eq!(decide(&cfg, 3), RetryDecision::DeadLetter);
    }

    #[test]
    fn max_attempts_one_dead_letters_on_first_failure() {
        let cfg = config(1, 10, 2.0);
        assert_eq!(decide(&cfg, 1), RetryDecision::DeadLetter);
    }
}
