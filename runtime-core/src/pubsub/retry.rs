use crate::config::RetryPolicyConfig;
use crate::error::{Code, Error};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 100;
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(30);

/// How failed deliveries are retried: exponential backoff from
/// `min_backoff`, capped at `max_backoff`, for at most `max_retries`
/// attempts beyond the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Builds the policy from configuration, filling defaults for unset
    /// fields. Negative values are a configuration bug and fail
    /// construction.
    pub fn from_config(cfg: Option<&RetryPolicyConfig>) -> Result<Self, Error> {
        let Some(cfg) = cfg else {
            return Ok(Self::default());
        };
        if cfg.min_backoff < 0 || cfg.max_backoff < 0 || cfg.max_retries < 0 {
            return Err(Error::new(
                Code::InvalidArgument,
                "retry policy fields must not be negative",
            ));
        }
        let min_backoff = if cfg.min_backoff == 0 {
            DEFAULT_MIN_BACKOFF
        } else {
            Duration::from_nanos(cfg.min_backoff as u64)
        };
        let max_backoff = if cfg.max_backoff == 0 {
            DEFAULT_MAX_BACKOFF
        } else {
            Duration::from_nanos(cfg.max_backoff as u64)
        };
        let max_retries = if cfg.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            cfg.max_retries.min(u32::MAX as i64) as u32
        };
        Ok(RetryPolicy {
            max_retries,
            min_backoff: min_backoff.min(max_backoff),
            max_backoff,
        })
    }

    /// The delay before retry attempt `attempt` (1-based), or `None` once
    /// the retry budget is exhausted: `min(max, min * 2^(attempt-1))`.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let min = self.min_backoff.as_nanos();
        let max = self.max_backoff.as_nanos();
        let shift = attempt - 1;
        let delay = if shift >= 64 {
            max
        } else {
            min.checked_mul(1u128 << shift).map_or(max, |d| d.min(max))
        };
        Some(Duration::from_nanos(delay.min(u64::MAX as u128) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 100);
        assert_eq!(p.min_backoff, Duration::from_secs(10));
        assert_eq!(p.max_backoff, Duration::from_secs(600));
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let p = RetryPolicy {
            max_retries: 5,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(6),
        };
        assert_eq!(p.backoff(1), Some(Duration::from_secs(1)));
        assert_eq!(p.backoff(2), Some(Duration::from_secs(2)));
        assert_eq!(p.backoff(3), Some(Duration::from_secs(4)));
        assert_eq!(p.backoff(4), Some(Duration::from_secs(6)));
        assert_eq!(p.backoff(5), Some(Duration::from_secs(6)));
        // Attempts beyond max_retries are not retried.
        assert_eq!(p.backoff(6), None);
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let p = RetryPolicy {
            max_retries: u32::MAX,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        };
        assert_eq!(p.backoff(200), Some(Duration::from_secs(600)));
    }

    #[test]
    fn negative_config_fails_construction() {
        let cfg = RetryPolicyConfig {
            min_backoff: -1,
            max_backoff: 0,
            max_retries: 0,
        };
        let err = RetryPolicy::from_config(Some(&cfg)).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn config_zeroes_become_defaults() {
        let cfg = RetryPolicyConfig {
            min_backoff: 0,
            max_backoff: 0,
            max_retries: 7,
        };
        let p = RetryPolicy::from_config(Some(&cfg)).unwrap();
        assert_eq!(p.min_backoff, DEFAULT_MIN_BACKOFF);
        assert_eq!(p.max_backoff, DEFAULT_MAX_BACKOFF);
        assert_eq!(p.max_retries, 7);
    }
}
