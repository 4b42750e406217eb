use std::time::{Duration, Instant};

use libdevsync_core::SyncSettings;
use tracing::debug;

use crate::error::SyncError;

/// Exponential backoff for transient remote failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff (doubles each retry)
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a whole push or pull, retries included
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            timeout: Some(Duration::from_secs(settings.timeout_secs)),
        }
    }
}

impl RetryPolicy {
    /// No retries, no sleeping
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            timeout: None,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// When an operation starting now has to be finished
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Run `op` against this policy's own deadline
    pub fn run<T>(&self, what: &str, op: impl FnMut() -> Result<T, SyncError>) -> Result<T, SyncError> {
        self.run_until(self.deadline(), what, op)
    }

    /// Run `op`, retrying transient failures until retries run out or the
    /// next attempt would start past `deadline`. Other errors return at once.
    pub fn run_until<T>(
        &self,
        deadline: Option<Instant>,
        what: &str,
        mut op: impl FnMut() -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut attempt = 0;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            let delay = self.backoff(attempt + 1);
            let out_of_time = deadline.is_some_and(|d| Instant::now() + delay >= d);
            if attempt >= self.max_retries || out_of_time {
                if out_of_time {
                    debug!(operation = what, attempt, "deadline reached, not retrying");
                }
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            attempt += 1;
            debug!(operation = what, attempt, max = self.max_retries, ?delay, error = %err, "retrying");
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(backoff_ms),
            max_backoff: Duration::from_millis(backoff_ms * 2),
            timeout: None,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            timeout: None,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_transient_errors_retried_until_success() {
        let mut calls = 0;
        let result = policy(3, 1).run("fetch", || {
            calls += 1;
            if calls < 3 {
                Err(SyncError::Unreachable("offline".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhaustion_and_permanent_errors() {
        let policy = policy(2, 1);
        let mut calls = 0;
        let err = policy
            .run("fetch", || -> Result<(), SyncError> {
                calls += 1;
                Err(SyncError::Unreachable("offline".to_string()))
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));

        let mut calls = 0;
        let err = policy
            .run("append", || -> Result<(), SyncError> {
                calls += 1;
                Err(SyncError::Conflict("moved".to_string()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, SyncError::Conflict(_)));
    }

    #[test]
    fn test_deadline_stops_retries_early() {
        let policy = RetryPolicy {
            timeout: Some(Duration::from_millis(150)),
            ..policy(10, 100)
        };
        let started = Instant::now();
        let mut calls = 0;
        let err = policy
            .run("fetch", || -> Result<(), SyncError> {
                calls += 1;
                Err(SyncError::Unreachable("offline".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::RetriesExhausted { .. }));
        assert!(calls < 4, "made {} attempts", calls);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_shared_deadline_already_passed() {
        let mut calls = 0;
        let err = policy(5, 1)
            .run_until(Some(Instant::now()), "fetch", || -> Result<(), SyncError> {
                calls += 1;
                Err(SyncError::Unreachable("offline".to_string()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 1, .. }));
    }
}
