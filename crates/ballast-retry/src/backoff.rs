//! Backoff policies for retry delays.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ballast_types::{CallCategory, Error};
use rand::Rng;

/// Context handed to the backoff policy when deciding the next delay.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Category of the call being retried.
    pub category: CallCategory,
    /// 1-based attempt number that just failed.
    pub attempt: u32,
    /// Total elapsed time since the first attempt started.
    pub elapsed: Duration,
    /// Classification of the failure that triggered the retry.
    pub last_error: Error,
}

/// How long to wait between attempts.
#[derive(Clone)]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, clamped to `max`. With `jitter`, the delay is
    /// scaled by a uniform factor in [0.5, 1.0] so synchronized clients
    /// spread out.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
    /// Caller-supplied policy.
    Custom(Arc<dyn Fn(&RetryContext) -> Duration + Send + Sync>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Backoff::Exponential { base, max, jitter } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Backoff {
    /// Delay to apply after the failure described by `ctx`.
    pub fn delay_for(&self, ctx: &RetryContext) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max, jitter } => {
                let exp = ctx.attempt.saturating_sub(1).min(16);
                let delay = base.saturating_mul(1u32 << exp).min(*max);
                if *jitter {
                    let factor: f64 = rand::rng().random_range(0.5..=1.0);
                    delay.mul_f64(factor)
                } else {
                    delay
                }
            }
            Backoff::Custom(f) => f(ctx),
        }
    }
}

/// Retry policy: attempt budget, backoff, optional per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Per-attempt time budget; a breached attempt classifies as a
    /// retryable timeout.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_millis(5000),
                jitter: true,
            },
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for callers that want breaker protection
    /// only.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            attempt_timeout: None,
        }
    }
}
