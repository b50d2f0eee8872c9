//! Bounded polling primitive shared by every manager.
//!
//! Callers describe each attempt with a [`Poll`] value and pass an explicit
//! [`WaitPolicy`], so retry cadence is configured at the call site rather
//! than through shared constants. Timeouts are enforced purely by attempt
//! counts; an in-flight probe is never cancelled.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::error::CpiError;

const SHORT_TIER_ATTEMPTS: u32 = 15;

/// Outcome of a single polling attempt.
#[derive(Debug)]
pub enum Poll<T, E> {
    /// The target state was reached.
    Ready(T),
    /// Not there yet; poll again.
    NotReady,
    /// A retryable error; poll again, and surface it if attempts run out.
    Retry(E),
    /// A fatal error; stop immediately.
    Failed(E),
}

/// Attempt budget and sleep schedule for a wait loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitPolicy {
    max_attempts: u32,
    short_interval: Duration,
    short_attempts: u32,
    long_interval: Duration,
}

impl WaitPolicy {
    /// Uniform interval between attempts.
    #[must_use]
    pub const fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            short_interval: interval,
            short_attempts: max_attempts,
            long_interval: interval,
        }
    }

    /// Short interval for the first `short_attempts`, then `long_interval`.
    #[must_use]
    pub const fn tiered(
        short_interval: Duration,
        short_attempts: u32,
        long_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            max_attempts,
            short_interval,
            short_attempts,
            long_interval,
        }
    }

    /// Same attempt budget and tiers with every sleep removed.
    #[must_use]
    pub const fn without_delays(self) -> Self {
        Self {
            short_interval: Duration::ZERO,
            long_interval: Duration::ZERO,
            ..self
        }
    }

    /// Splits a total budget evenly across `max_attempts`.
    #[must_use]
    pub fn from_budget(total: Duration, max_attempts: u32) -> Self {
        let interval = total.checked_div(max_attempts).unwrap_or(total);
        Self::fixed(interval, max_attempts)
    }

    /// Volume and instance state transitions: 15 quick polls, then every 5s,
    /// for roughly ten minutes.
    #[must_use]
    pub const fn resource() -> Self {
        Self::tiered(
            Duration::from_secs(1),
            SHORT_TIER_ATTEMPTS,
            Duration::from_secs(5),
            132,
        )
    }

    /// Attach and delete retries on busy volumes: 15 quick retries, then every
    /// 15s, for roughly ten minutes.
    #[must_use]
    pub const fn retry() -> Self {
        Self::tiered(
            Duration::from_secs(1),
            SHORT_TIER_ATTEMPTS,
            Duration::from_secs(15),
            55,
        )
    }

    /// Pool readiness: 300s spread over 30 attempts.
    #[must_use]
    pub const fn pool_readiness() -> Self {
        Self::fixed(Duration::from_secs(10), 30)
    }

    /// Total number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the 1-based `attempt` is still inside the short tier.
    #[must_use]
    pub const fn in_short_tier(&self, attempt: u32) -> bool {
        attempt <= self.short_attempts
    }

    /// Sleep that follows the 1-based `attempt`.
    #[must_use]
    pub const fn interval_for(&self, attempt: u32) -> Duration {
        if self.in_short_tier(attempt) {
            self.short_interval
        } else {
            self.long_interval
        }
    }
}

/// Policies used by the managers, one per kind of wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitPolicies {
    /// Volume state and attachment transitions.
    pub resource: WaitPolicy,
    /// Retries on busy volumes during attach and delete.
    pub retry: WaitPolicy,
    /// Pool-to-instance resolution after creation.
    pub pool_readiness: WaitPolicy,
    /// Instance running and terminated transitions.
    pub instance: WaitPolicy,
}

impl WaitPolicies {
    /// Uses the same policy for every wait; handy for tests with tiny budgets.
    #[must_use]
    pub const fn uniform(policy: WaitPolicy) -> Self {
        Self {
            resource: policy,
            retry: policy,
            pool_readiness: policy,
            instance: policy,
        }
    }
}

impl Default for WaitPolicies {
    fn default() -> Self {
        Self {
            resource: WaitPolicy::resource(),
            retry: WaitPolicy::retry(),
            pool_readiness: WaitPolicy::pool_readiness(),
            instance: WaitPolicy::resource(),
        }
    }
}

/// Reasons a wait loop gave up.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WaitError<E> {
    /// The budget ran out without reaching the target state.
    #[error("timed out after {attempts} attempts waiting for {resource} to be {desired}")]
    Timeout {
        /// Resource being waited on.
        resource: String,
        /// Desired state.
        desired: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The budget ran out while the probe kept raising a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last retryable error.
        last: E,
    },
    /// The probe raised a fatal error.
    #[error("{0}")]
    Failed(E),
}

impl From<WaitError<CpiError>> for CpiError {
    fn from(value: WaitError<CpiError>) -> Self {
        match value {
            WaitError::Timeout {
                resource, desired, ..
            } => Self::Timeout { resource, desired },
            WaitError::Exhausted { last, .. } | WaitError::Failed(last) => last,
        }
    }
}

/// Polls `probe` until it reports [`Poll::Ready`] or the policy is exhausted.
///
/// The probe receives the 1-based attempt number so callers can change how
/// they classify errors as the budget drains. Sleeps happen only between
/// attempts.
///
/// # Errors
///
/// Returns [`WaitError::Failed`] as soon as the probe fails fatally,
/// [`WaitError::Exhausted`] carrying the last retryable error when the budget
/// runs out after one, and [`WaitError::Timeout`] otherwise.
pub async fn wait_for<T, E, F, Fut>(
    policy: &WaitPolicy,
    resource: &str,
    desired: &str,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Poll<T, E>>,
{
    let mut last_retryable = None;
    for attempt in 1..=policy.max_attempts() {
        match probe(attempt).await {
            Poll::Ready(value) => return Ok(value),
            Poll::Failed(err) => return Err(WaitError::Failed(err)),
            Poll::NotReady => {
                debug!(resource, desired, attempt, "not ready yet");
            }
            Poll::Retry(err) => {
                debug!(resource, desired, attempt, "retryable failure");
                last_retryable = Some(err);
            }
        }
        if attempt < policy.max_attempts() {
            sleep(policy.interval_for(attempt)).await;
        }
    }

    let attempts = policy.max_attempts();
    match last_retryable {
        Some(last) => Err(WaitError::Exhausted { attempts, last }),
        None => Err(WaitError::Timeout {
            resource: resource.to_owned(),
            desired: desired.to_owned(),
            attempts,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const INSTANT: Duration = Duration::ZERO;

    #[tokio::test]
    async fn returns_value_on_the_last_permitted_attempt() {
        let policy = WaitPolicy::fixed(INSTANT, 30);
        let result: Result<u32, WaitError<String>> =
            wait_for(&policy, "sig-1", "ready", |attempt| async move {
                if attempt == 30 {
                    Poll::Ready(attempt)
                } else {
                    Poll::NotReady
                }
            })
            .await;
        assert_eq!(result, Ok(30));
    }

    #[tokio::test]
    async fn times_out_when_target_arrives_too_late() {
        let policy = WaitPolicy::fixed(INSTANT, 30);
        let result: Result<u32, WaitError<String>> =
            wait_for(&policy, "sig-1", "ready", |attempt| async move {
                if attempt == 31 {
                    Poll::Ready(attempt)
                } else {
                    Poll::NotReady
                }
            })
            .await;
        assert_eq!(
            result,
            Err(WaitError::Timeout {
                resource: String::from("sig-1"),
                desired: String::from("ready"),
                attempts: 30,
            })
        );
    }

    #[tokio::test]
    async fn fatal_failure_stops_immediately() {
        let calls = Cell::new(0_u32);
        let policy = WaitPolicy::fixed(INSTANT, 10);
        let result: Result<(), WaitError<&str>> = wait_for(&policy, "vol-1", "available", |_| {
            calls.set(calls.get() + 1);
            async { Poll::Failed("boom") }
        })
        .await;
        assert_eq!(result, Err(WaitError::Failed("boom")));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn surfaces_last_retryable_error_on_exhaustion() {
        let policy = WaitPolicy::fixed(INSTANT, 3);
        let result: Result<(), WaitError<String>> =
            wait_for(&policy, "vol-1", "deleted", |attempt| async move {
                Poll::Retry(format!("in use #{attempt}"))
            })
            .await;
        assert_eq!(
            result,
            Err(WaitError::Exhausted {
                attempts: 3,
                last: String::from("in use #3"),
            })
        );
    }

    #[test]
    fn tiered_policy_switches_interval_after_short_tier() {
        let policy = WaitPolicy::retry();
        assert_eq!(policy.interval_for(1), Duration::from_secs(1));
        assert_eq!(policy.interval_for(15), Duration::from_secs(1));
        assert_eq!(policy.interval_for(16), Duration::from_secs(15));
        assert!(policy.in_short_tier(15));
        assert!(!policy.in_short_tier(16));
    }

    #[test]
    fn removing_delays_keeps_tiers_and_budget() {
        let policy = WaitPolicy::retry().without_delays();
        assert_eq!(policy.max_attempts(), 55);
        assert!(policy.in_short_tier(15));
        assert!(!policy.in_short_tier(16));
        assert_eq!(policy.interval_for(16), Duration::ZERO);
    }

    #[test]
    fn budget_policy_spreads_total_over_attempts() {
        let policy = WaitPolicy::from_budget(Duration::from_secs(300), 30);
        assert_eq!(policy, WaitPolicy::pool_readiness());
    }

    #[test]
    fn timeout_converts_into_cpi_timeout() {
        let err: CpiError = WaitError::<CpiError>::Timeout {
            resource: String::from("vol-1"),
            desired: String::from("available"),
            attempts: 4,
        }
        .into();
        assert_eq!(
            err,
            CpiError::Timeout {
                resource: String::from("vol-1"),
                desired: String::from("available"),
            }
        );
    }
}
