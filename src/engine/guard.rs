//! Serializable execution of the identify unit of work.
//!
//! The guard runs a closure inside a fresh unit of work and commits it. When
//! the commit loses to a concurrent writer the whole closure is re-run on a
//! new snapshot, with exponential backoff, until it commits, the retry budget
//! runs out, or the request deadline passes.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ExecutionError, LinkError, LinkResult, ValidationError};
use crate::storage::{ContactStore, UnitOfWork};

/// Backoff schedule for conflicted units of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of re-runs after the first attempt (0 = no retries).
    pub max_retries: usize,
    /// Delay before the first retry; doubled on each further retry.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 16,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy that fails on the first conflict.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        // 2^31 times any sane base delay already exceeds max_delay.
        let shift = u32::try_from(attempt.min(31)).unwrap_or(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Checks the policy.
    ///
    /// # Errors
    /// `InvalidConfig` if `base_delay` exceeds `max_delay`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_delay > self.max_delay {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "retry base_delay ({:?}) must not exceed max_delay ({:?})",
                    self.base_delay, self.max_delay
                ),
            });
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs units of work against a store with conflict retry.
#[derive(Clone)]
pub struct ConsistencyGuard {
    store: Arc<dyn ContactStore>,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl ConsistencyGuard {
    /// Creates a guard over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>, policy: RetryPolicy, timeout: Option<Duration>) -> Self {
        Self {
            store,
            policy,
            timeout,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `work` in a unit of work and commits it.
    ///
    /// `work` may be called several times and must derive everything it
    /// writes from what it reads through the unit of work it is given.
    ///
    /// An integrity error raised by `work` is re-checked against concurrent
    /// commits first: if the unit's reads were invalidated the violation may
    /// be an artifact of a torn read, so the attempt is retried instead.
    ///
    /// # Errors
    /// - `RetriesExhausted` when every attempt conflicted
    /// - `Timeout` when the deadline passed before an attempt committed
    /// - any non-conflict error from `work` or the store, unchanged
    pub fn run<T, F>(&self, mut work: F) -> LinkResult<T>
    where
        F: FnMut(&mut dyn UnitOfWork) -> LinkResult<T>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let mut uow = self.store.begin()?;
            let result = match work(uow.as_mut()) {
                Ok(value) => uow.commit().map(|()| value).map_err(LinkError::from),
                Err(err) if err.is_integrity() => match uow.validate() {
                    Ok(()) => Err(err),
                    Err(conflict) => {
                        debug!(error = %err, "integrity check raced a concurrent commit");
                        Err(conflict.into())
                    }
                },
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "unit of work committed after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_conflict() => err,
                Err(err) => return Err(err),
            };

            if attempt >= self.policy.max_retries {
                warn!(attempts = attempt + 1, error = %err, "unit of work retries exhausted");
                return Err(ExecutionError::RetriesExhausted {
                    attempts: attempt + 1,
                }
                .into());
            }

            let delay = self.policy.delay_for(attempt);
            if let Some(timeout) = self.timeout {
                if started.elapsed() + delay >= timeout {
                    warn!(attempts = attempt + 1, timeout_ms = millis(timeout), "unit of work deadline exceeded");
                    return Err(ExecutionError::Timeout {
                        duration_ms: millis(timeout),
                    }
                    .into());
                }
            }

            warn!(attempt = attempt + 1, delay_ms = millis(delay), error = %err, "unit of work conflicted; retrying");
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contact::NewContact;
    use crate::error::IntegrityError;
    use crate::storage::{InMemoryContactStore, StorageError};

    fn guard(store: &InMemoryContactStore, policy: RetryPolicy) -> ConsistencyGuard {
        ConsistencyGuard::new(Arc::new(store.clone()), policy, None)
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for(4), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1000), Duration::from_millis(100));
    }

    #[test]
    fn validate_rejects_inverted_delays() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_millis(1),
        };
        assert!(policy.validate().is_err());
        RetryPolicy::default().validate().unwrap();
    }

    #[test]
    fn conflicted_attempt_is_rerun_on_fresh_snapshot() {
        let store = InMemoryContactStore::new();
        let interloper = store.clone();
        let mut calls = 0;

        let created = guard(&store, RetryPolicy::default())
            .run(|uow| {
                calls += 1;
                let existing = uow.find_by_email_or_phone(Some("e@x"), None)?;
                if calls == 1 {
                    // A concurrent request commits the same email mid-flight.
                    let mut other = interloper.begin()?;
                    other.create(NewContact::primary(Some("e@x".into()), None))?;
                    other.commit()?;
                }
                if existing.is_empty() {
                    uow.create(NewContact::primary(Some("e@x".into()), None))?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert!(!created);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn exhausted_retries_surface_as_transient() {
        let store = InMemoryContactStore::new();
        let interloper = store.clone();
        let mut n = 0;

        let err = guard(&store, RetryPolicy::default().with_max_retries(2))
            .run(|uow| {
                n += 1;
                let _ = uow.find_by_email_or_phone(Some("hot@x"), None)?;
                let mut other = interloper.begin()?;
                other.create(NewContact::primary(Some("hot@x".into()), Some(n.to_string())))?;
                other.commit()?;
                uow.create(NewContact::primary(Some("hot@x".into()), None))?;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(
            err,
            LinkError::Execution(ExecutionError::RetriesExhausted { attempts: 3 })
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn non_conflict_errors_are_not_retried() {
        let store = InMemoryContactStore::new();
        let mut calls = 0;
        let err = guard(&store, RetryPolicy::default())
            .run(|_uow| -> LinkResult<()> {
                calls += 1;
                Err(StorageError::ConnectionError("down".into()).into())
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(!err.is_conflict());
    }

    #[test]
    fn integrity_error_with_valid_reads_is_returned() {
        let store = InMemoryContactStore::new();
        let err = guard(&store, RetryPolicy::default())
            .run(|uow| -> LinkResult<()> {
                let _ = uow.find_by_email_or_phone(Some("e@x"), None)?;
                Err(IntegrityError::MissingPrimary { members: 1 }.into())
            })
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn deadline_stops_retrying() {
        let store = InMemoryContactStore::new();
        let interloper = store.clone();
        let policy = RetryPolicy {
            max_retries: 1000,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
        };
        let guard = ConsistencyGuard::new(Arc::new(store.clone()), policy, Some(Duration::from_millis(50)));

        let mut n = 0;
        let err = guard
            .run(|uow| {
                n += 1;
                let _ = uow.find_by_email_or_phone(Some("hot@x"), None)?;
                let mut other = interloper.begin()?;
                other.create(NewContact::primary(Some("hot@x".into()), Some(n.to_string())))?;
                other.commit()?;
                uow.create(NewContact::primary(Some("hot@x".into()), None))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, LinkError::Execution(ExecutionError::Timeout { duration_ms: 50 })));
    }
}
