//! Bounded exponential backoff around a whole extraction attempt.
//!
//! The retried unit is the complete closure (schema lookup, cursor, chunks,
//! serialization, compression, hashing), not a single query, because a
//! server-side cursor cannot resume after its connection is gone.

use backon::{BlockingRetryable, ExponentialBuilder};
use log::warn;
use std::cell::Cell;
use std::time::Duration;

use crate::application::cancellation::CancellationSignal;
use crate::domain::errors::{ArchiveError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.multiplier.max(1.0))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Runs `attempt` until it succeeds, fails permanently, or attempts run out.
///
/// Backoff sleeps wake early on cancellation; the next attempt then returns
/// `Cancelled` without running.
pub fn retry_with_backoff<T, F>(
    policy: &RetryPolicy,
    cancel: &CancellationSignal,
    label: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let attempt_no = Cell::new(0u32);

    let run = || {
        cancel.check()?;
        attempt_no.set(attempt_no.get() + 1);
        attempt(attempt_no.get())
    };

    // backon wants an owned sleeper.
    let sleep_cancel = cancel.clone();
    let sleeper = move |delay: Duration| {
        sleep_cancel.sleep(delay);
    };

    let notify = |err: &ArchiveError, delay: Duration| {
        warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {:.1}s",
            label,
            attempt_no.get(),
            policy.max_attempts,
            err,
            delay.as_secs_f32()
        );
    };

    run.retry(policy.backoff())
        .sleep(sleeper)
        .when(|e: &ArchiveError| e.is_retryable())
        .notify(notify)
        .call()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_transient_errors_use_every_attempt() {
        let mut calls = 0;
        let res: Result<()> = retry_with_backoff(&fast_policy(3), &CancellationSignal::new(), "t", |_| {
            calls += 1;
            Err(ArchiveError::transient_db("connection reset"))
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_permanent_error_runs_once() {
        let mut calls = 0;
        let res: Result<()> = retry_with_backoff(&fast_policy(5), &CancellationSignal::new(), "t", |_| {
            calls += 1;
            Err(ArchiveError::permanent_db("permission denied for table"))
        });
        assert!(matches!(res, Err(ArchiveError::DatabaseError { retryable: false, .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let res = retry_with_backoff(&fast_policy(3), &CancellationSignal::new(), "t", |n| {
            if n < 2 {
                Err(ArchiveError::transient_storage("503 slow down"))
            } else {
                Ok(n)
            }
        });
        assert_eq!(res.unwrap(), 2);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let mut calls = 0;
        let res: Result<()> = retry_with_backoff(&fast_policy(3), &cancel, "t", |_| {
            calls += 1;
            Ok(())
        });
        assert!(matches!(res, Err(ArchiveError::Cancelled)));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_cancel_interrupts_backoff_sleep() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let mut calls = 0;
        let res: Result<()> = retry_with_backoff(&policy, &cancel, "t", |_| {
            calls += 1;
            Err(ArchiveError::transient_db("connection reset"))
        });
        handle.join().unwrap();

        assert!(matches!(res, Err(ArchiveError::Cancelled)));
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_integrity_error_is_not_retried() {
        let mut calls = 0;
        let res: Result<()> = retry_with_backoff(&fast_policy(4), &CancellationSignal::new(), "t", |_| {
            calls += 1;
            Err(ArchiveError::IntegrityError {
                key: "k".into(),
                expected: "a".into(),
                actual: "b".into(),
            })
        });
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
