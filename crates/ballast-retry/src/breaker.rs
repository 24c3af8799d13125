//! Circuit breaker per call category.
//!
//! State machine: **closed** (calls pass; consecutive failures counted) →
//! **open** after `failure_threshold` consecutive failures (calls rejected
//! without touching the transport for `cooldown`) → **half-open** (exactly
//! one trial call; success closes the circuit, failure re-opens it with a
//! fresh cooldown).

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before admitting a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A half-open trial call is currently in flight.
    trial_in_flight: bool,
}

/// Thread-safe breaker for one call category.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        assert!(
            config.failure_threshold > 0,
            "breaker failure_threshold must be at least 1"
        );
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to make a call. `Ok(())` admits the call; `Err(retry_after)`
    /// rejects it without contacting the transport.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.expect("open breaker has opened_at");
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    debug!("breaker cooldown elapsed, admitting half-open trial");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // Another caller holds the trial slot.
                    Err(self.config.cooldown)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            debug!("breaker closing after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                debug!("half-open trial failed, re-opening breaker");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    debug!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening breaker"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {
                // Late failure from a call admitted before the trip; the
                // cooldown clock keeps its original start.
                inner.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}
