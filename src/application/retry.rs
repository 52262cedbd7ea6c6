//! Retrying flaky dependency calls with capped exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::backoff::BackoffPolicy;

/// Error returned by [`retry_with_backoff`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: E,
    },
    /// The overall deadline elapsed before an attempt succeeded
    #[error("retry deadline of {:.1}s elapsed after {attempts} attempts", .deadline.as_secs_f64())]
    DeadlineElapsed {
        /// The deadline
        deadline: Duration,
        /// Attempts started
        attempts: u32,
        /// Error of the last completed attempt, if any
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts started.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::DeadlineElapsed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Call `op` until it succeeds, sleeping `policy` delays between attempts.
///
/// The whole sequence, including the sleeps and the attempt in flight, is
/// cancelled once `deadline` elapses.
///
/// # Errors
/// [`RetryError::Exhausted`] after `max_attempts` failures,
/// [`RetryError::DeadlineElapsed`] when the deadline cuts the sequence short.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    deadline: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 0u32;
    let mut last = None;

    let run = async {
        let mut delays = policy.delays();
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        debug!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed, backing off"
                        );
                        last = Some(e);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    };
    let outcome = tokio::time::timeout(deadline, run).await;

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(attempts, error = %e, "giving up after final attempt");
            Err(RetryError::Exhausted { attempts, last: e })
        }
        Err(_) => {
            warn!(
                attempts,
                deadline_secs = deadline.as_secs_f64(),
                "retry deadline elapsed"
            );
            Err(RetryError::DeadlineElapsed {
                deadline,
                attempts,
                last,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(
            max_attempts,
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(4),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = Instant::now();

        let value = retry_with_backoff(&policy(5), Duration::from_secs(60), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("lookup failed")
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let err = retry_with_backoff(&policy(3), Duration::from_secs(60), || async {
            Err::<(), _>("always down")
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Exhausted { attempts: 3, last: "always down" }));
        assert_eq!(err.to_string(), "gave up after 3 attempts: always down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_backoff() {
        // Delays 1, 2, 4, 4: the deadline lands during the third sleep
        let err = retry_with_backoff(&policy(5), Duration::from_secs(5), || async {
            Err::<(), _>("slow")
        })
        .await
        .unwrap_err();

        match err {
            RetryError::DeadlineElapsed { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, Some("slow"));
            }
            other => panic!("expected deadline, got {:?}", other),
        }
    }
}
