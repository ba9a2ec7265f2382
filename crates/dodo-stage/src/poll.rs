//! Bounded polling
//!
//! Every "wait until" in the stage subsystem (VM boot, IP assignment, SSH,
//! daemon readiness) goes through [`Poll::until`]: fixed interval, fixed
//! attempt ceiling, predicate errors propagate without further attempts.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Result of a single poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    /// Condition met
    Ready(T),
    /// Condition not met yet; the message describes what was observed
    Pending(String),
}

impl<T> Check<T> {
    pub fn pending(observed: impl Into<String>) -> Self {
        Check::Pending(observed.into())
    }
}

/// Polling gave up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("timed out waiting for {what} after {attempts} attempts (last observed: {last_observed})")]
pub struct PollTimeout {
    pub what: String,
    pub attempts: u32,
    pub last_observed: String,
}

/// Fixed-interval, bounded polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Poll {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Total time the loop may spend sleeping
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Poll `predicate` until it is ready
    ///
    /// Sleeps `interval` between attempts, never after the last one.
    pub async fn until<T, E, F, Fut>(&self, what: &str, mut predicate: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Check<T>, E>>,
        E: From<PollTimeout>,
    {
        let mut last_observed = String::from("nothing");

        for attempt in 1..=self.max_attempts {
            match predicate().await? {
                Check::Ready(value) => {
                    tracing::debug!(what, attempt, "Condition met");
                    return Ok(value);
                }
                Check::Pending(observed) => {
                    tracing::trace!(what, attempt, observed = %observed, "Condition not met yet");
                    last_observed = observed;
                }
            }

            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        Err(PollTimeout {
            what: what.to_string(),
            attempts: self.max_attempts,
            last_observed,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use std::cell::Cell;

    const FAST: Poll = Poll::new(Duration::from_millis(1), 5);

    #[tokio::test]
    async fn test_ready_on_third_call() {
        let calls = Cell::new(0u32);

        let value = FAST
            .until("third call", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n == 3 {
                        Ok::<_, StageError>(Check::Ready(n))
                    } else {
                        Ok(Check::pending(format!("call {}", n)))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempt_ceiling() {
        let calls = Cell::new(0u32);

        let err = FAST
            .until("never", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Ok::<Check<()>, StageError>(Check::pending(format!("state {}", n))) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.get(), 5);
        match err {
            StageError::Timeout(timeout) => {
                assert_eq!(timeout.attempts, 5);
                assert_eq!(timeout.what, "never");
                assert_eq!(timeout.last_observed, "state 5");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_predicate_error_is_not_retried() {
        let calls = Cell::new(0u32);

        let err = FAST
            .until("failing", || {
                calls.set(calls.get() + 1);
                async { Err::<Check<()>, _>(StageError::Remote("boom".to_string())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, StageError::Remote(msg) if msg == "boom"));
    }

    #[test]
    fn test_budget() {
        let poll = Poll::new(Duration::from_secs(1), 300);
        assert_eq!(poll.budget(), Duration::from_secs(299));
    }
}
