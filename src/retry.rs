//! Backoff policies for cloud calls and bounded polling.
//!
//! Cloud APIs throttle and are eventually consistent, so every call made by a
//! task goes through [`retry`] with the policy matching the kind of call, and
//! every "wait until the resource is ready" loop goes through [`wait_until`].
//! Both observe the run's [`CancelToken`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::core::CancelToken;
use crate::error::{CloudError, TaskError};

/// Exponential backoff with proportional jitter.
///
/// `steps` is the total number of attempts. The delay before attempt `n + 1`
/// is `initial * factor^n`, capped at `cap`, plus up to `jitter` of itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap: Option<Duration>,
}

impl Backoff {
    pub const fn new(initial: Duration, factor: f64, jitter: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            jitter,
            steps,
            cap: None,
        }
    }

    /// Same number of attempts, no waiting in between.
    pub const fn immediate(steps: u32) -> Self {
        Self::new(Duration::ZERO, 1.0, 0.0, steps)
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Delay before the attempt following attempt `step`, without jitter.
    pub fn delay(&self, step: u32) -> Duration {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn jittered(&self, step: u32) -> Duration {
        let delay = self.delay(step);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(1.0 + extra)
    }
}

/// One backoff policy per kind of cloud interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicies {
    pub read: Backoff,
    pub write: Backoff,
    pub delete: Backoff,
    /// Used while waiting for resources to become ready.
    pub poll: Backoff,
}

impl Default for BackoffPolicies {
    fn default() -> Self {
        Self {
            read: Backoff::new(Duration::from_secs(1), 1.5, 0.1, 10),
            write: Backoff::new(Duration::from_secs(1), 2.0, 0.1, 5),
            delete: Backoff::new(Duration::from_secs(1), 5.0, 0.1, 4),
            poll: Backoff::new(Duration::from_secs(2), 1.2, 0.1, 30)
                .with_cap(Duration::from_secs(30)),
        }
    }
}

impl BackoffPolicies {
    /// The default attempt counts with every delay removed.
    pub fn immediate() -> Self {
        let defaults = Self::default();
        Self {
            read: Backoff::immediate(defaults.read.steps),
            write: Backoff::immediate(defaults.write.steps),
            delete: Backoff::immediate(defaults.delete.steps),
            poll: Backoff::immediate(defaults.poll.steps),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
pub fn retry<T>(
    policy: &Backoff,
    cancel: &CancelToken,
    what: &str,
    mut op: impl FnMut() -> Result<T, CloudError>,
) -> Result<T, TaskError> {
    let attempts = policy.steps.max(1);

    for attempt in 0..attempts {
        cancel.check()?;

        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.jittered(attempt);
                warn!(
                    operation = %what,
                    attempt = attempt + 1,
                    error = %err,
                    delay_ms = delay.as_millis(),
                    "Cloud call failed, retrying"
                );
                cancel.sleep(delay)?;
            }
            Err(err) => {
                if err.is_transient() {
                    error!(
                        operation = %what,
                        attempt = attempt + 1,
                        error = %err,
                        "Cloud call failed after max retries"
                    );
                }
                return Err(err.into());
            }
        }
    }

    Err(TaskError::Timeout(what.to_string()))
}

/// Polls `probe` until it returns `true`, with the delays of `policy`.
///
/// Errors from the probe end the wait immediately. Running out of attempts
/// yields [`TaskError::Timeout`].
pub fn wait_until(
    policy: &Backoff,
    cancel: &CancelToken,
    what: &str,
    mut probe: impl FnMut() -> Result<bool, TaskError>,
) -> Result<(), TaskError> {
    let attempts = policy.steps.max(1);

    for attempt in 0..attempts {
        cancel.check()?;

        if probe()? {
            return Ok(());
        }

        if attempt + 1 < attempts {
            tracing::debug!(waiting_for = %what, attempt = attempt + 1, "Not ready yet");
            cancel.sleep(policy.jittered(attempt))?;
        }
    }

    Err(TaskError::Timeout(what.to_string()))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::cloud::ResourceKind;

    #[test]
    fn delays_grow_and_cap() {
        let policy =
            Backoff::new(Duration::from_secs(1), 2.0, 0.0, 5).with_cap(Duration::from_secs(3));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(3));
        assert_eq!(policy.delay(10), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = Backoff::new(Duration::from_secs(1), 1.0, 0.1, 3);
        for _ in 0..100 {
            let delay = policy.jittered(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_millis(1100));
        }
    }

    #[test]
    fn default_policies() {
        let policies = BackoffPolicies::default();
        assert_eq!(policies.read.steps, 10);
        assert_eq!(policies.write.factor, 2.0);
        assert_eq!(policies.delete.factor, 5.0);
        assert_eq!(policies.delete.steps, 4);
    }

    #[test]
    fn retries_transient_errors() {
        let calls = Cell::new(0);
        let result = retry(&Backoff::immediate(5), &CancelToken::new(), "list", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(CloudError::Throttled("rate exceeded".into()))
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&Backoff::immediate(5), &CancelToken::new(), "get", || {
            calls.set(calls.get() + 1);
            Err(CloudError::not_found(ResourceKind::Network, "vpc-1"))
        });

        assert!(matches!(result, Err(TaskError::Cloud(CloudError::NotFound { .. }))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_steps() {
        let calls = Cell::new(0);
        let policy = Backoff::immediate(4);
        let result: Result<(), _> = retry(&policy, &CancelToken::new(), "create", || {
            calls.set(calls.get() + 1);
            Err(CloudError::Unavailable("try later".into()))
        });

        assert!(matches!(result, Err(TaskError::Cloud(CloudError::Unavailable(_)))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn wait_until_times_out() {
        let polls = Cell::new(0);
        let result = wait_until(&Backoff::immediate(3), &CancelToken::new(), "lb", || {
            polls.set(polls.get() + 1);
            Ok(false)
        });

        assert!(matches!(result, Err(TaskError::Timeout(what)) if what == "lb"));
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn wait_until_observes_cancellation() {
        let cancel = CancelToken::new();
        let policy = Backoff::new(Duration::from_secs(60), 1.0, 0.0, 3);
        let result = wait_until(&policy, &cancel, "lb", || {
            cancel.cancel();
            Ok(false)
        });


        assert!(matches!(result, Err(TaskError::Cancelled)));
    }
}
