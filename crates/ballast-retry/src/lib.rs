//! Policy-driven retry with circuit breaking.
//!
//! [`RetryManager`] wraps any remote call with bounded retries and fails
//! fast when a downstream dependency is clearly unhealthy. Failure
//! classification lives on [`ballast_types::Error`]: network, timeout, and
//! server failures are retried up to the policy budget; validation,
//! authentication, and permission failures are terminal and surface on the
//! first attempt.
//!
//! Breaker state is tracked per [`CallCategory`], each behind its own lock,
//! so an unhealthy write path never blocks reads.
//!
//! # Example
//!
//! ```ignore
//! use ballast_retry::{RetryManager, RetryPolicy, BreakerConfig};
//! use ballast_types::CallCategory;
//!
//! let retry = RetryManager::new(RetryPolicy::default(), BreakerConfig::default());
//! let value = retry
//!     .execute(CallCategory::Read, || transport.call("invoice", "count", params.clone()))
//!     .await?;
//! ```

pub mod backoff;
pub mod breaker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use ballast_types::{CallCategory, Error};

pub use backoff::{Backoff, RetryContext, RetryPolicy};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};

/// Timing and classification of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub elapsed: Duration,
    /// `None` for the successful attempt.
    pub error: Option<Error>,
}

/// Observability record for one `execute` call.
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub category: CallCategory,
    /// One entry per attempt that reached the transport.
    pub attempts: Vec<AttemptRecord>,
    /// The breaker rejected the call without contacting the transport.
    pub short_circuited: bool,
}

impl RetryReport {
    fn new(category: CallCategory) -> Self {
        RetryReport {
            category,
            attempts: Vec::new(),
            short_circuited: false,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn total_elapsed(&self) -> Duration {
        self.attempts.iter().map(|a| a.elapsed).sum()
    }
}

/// Wraps remote calls with retry policy and per-category circuit breakers.
pub struct RetryManager {
    policy: RetryPolicy,
    breaker_config: BreakerConfig,
    breakers: RwLock<HashMap<CallCategory, Arc<CircuitBreaker>>>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, breaker_config: BreakerConfig) -> Self {
        assert!(policy.max_attempts >= 1, "max_attempts must be at least 1");
        RetryManager {
            policy,
            breaker_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current breaker state for a category (Closed if never used).
    pub fn breaker_state(&self, category: CallCategory) -> CircuitState {
        self.breakers
            .read()
            .get(&category)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    fn breaker(&self, category: CallCategory) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(&category) {
            return b.clone();
        }
        self.breakers
            .write()
            .entry(category)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config)))
            .clone()
    }

    /// Execute `call`, retrying per policy. Returns the call's value or the
    /// last classified error once retries or the circuit budget are
    /// exhausted.
    pub async fn execute<T, F, Fut>(&self, category: CallCategory, call: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.execute_with_report(category, call).await.0
    }

    /// Like [`RetryManager::execute`], also returning per-attempt metadata.
    pub async fn execute_with_report<T, F, Fut>(
        &self,
        category: CallCategory,
        call: F,
    ) -> (Result<T, Error>, RetryReport)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let breaker = self.breaker(category);
        let mut report = RetryReport::new(category);
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            if let Err(retry_after) = breaker.try_acquire() {
                report.short_circuited = true;
                return (
                    Err(Error::CircuitOpen {
                        category,
                        retry_after,
                    }),
                    report,
                );
            }

            let attempt_started = Instant::now();
            let outcome = match self.policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::Timeout(limit)),
                },
                None => call().await,
            };
            let elapsed = attempt_started.elapsed();

            match outcome {
                Ok(value) => {
                    breaker.record_success();
                    report.attempts.push(AttemptRecord {
                        attempt,
                        elapsed,
                        error: None,
                    });
                    return (Ok(value), report);
                }
                Err(err) => {
                    breaker.record_failure();
                    report.attempts.push(AttemptRecord {
                        attempt,
                        elapsed,
                        error: Some(err.clone()),
                    });

                    if !err.is_retryable() || attempt >= self.policy.max_attempts {
                        return (Err(err), report);
                    }

                    let ctx = RetryContext {
                        category,
                        attempt,
                        elapsed: started.elapsed(),
                        last_error: err,
                    };
                    let delay = self.policy.backoff.delay_for(&ctx);
                    debug!(
                        category = %category,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %ctx.last_error,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
            attempt_timeout: None,
        }
    }

    fn manager(max_attempts: u32, threshold: u32, cooldown_ms: u64) -> RetryManager {
        RetryManager::new(
            fast_policy(max_attempts),
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_exactly_max_attempts_on_retryable_failure() {
        let retry = manager(3, 100, 1000);
        let calls = AtomicU32::new(0);

        let (result, report) = retry
            .execute_with_report(CallCategory::Read, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Network("reset".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.attempt_count(), 3);
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_terminal_failure_not_retried() {
        let retry = manager(5, 100, 1000);
        let calls = AtomicU32::new(0);

        let result = retry
            .execute(CallCategory::Write, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Permission("denied".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Permission(_))));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let retry = manager(3, 100, 1000);
        let calls = AtomicU32::new(0);

        let (result, report) = retry
            .execute_with_report(CallCategory::Read, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::server("hiccup", Some(503)))
                    } else {
                        Ok(42u64)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(report.attempt_count(), 3);
        assert!(report.attempts[2].error.is_none());
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        // Threshold 2, one attempt per call: two failing calls trip it.
        let retry = manager(1, 2, 60_000);
        for _ in 0..2 {
            let _ = retry
                .execute(CallCategory::Read, || async {
                    Err::<(), _>(Error::Network("down".into()))
                })
                .await;
        }
        assert_eq!(retry.breaker_state(CallCategory::Read), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let (result, report) = retry
            .execute_with_report(CallCategory::Read, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(1u64) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "transport must not be contacted");
        assert!(report.short_circuited);
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));

        // Another category is unaffected.
        let ok = retry
            .execute(CallCategory::Write, || async { Ok::<_, Error>(2u64) })
            .await;
        assert_eq!(ok.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_on_success() {
        let retry = manager(1, 1, 20);
        let _ = retry
            .execute(CallCategory::Read, || async {
                Err::<(), _>(Error::Network("down".into()))
            })
            .await;
        assert_eq!(retry.breaker_state(CallCategory::Read), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = retry
            .execute(CallCategory::Read, || async { Ok::<_, Error>(7u64) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(
            retry.breaker_state(CallCategory::Read),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_attempt_timeout_classifies_as_timeout() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
            attempt_timeout: Some(Duration::from_millis(10)),
        };
        let retry = RetryManager::new(policy, BreakerConfig::default());

        let (result, report) = retry
            .execute_with_report(CallCategory::Read, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(1u64)
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(report.attempt_count(), 2);
    }
}
