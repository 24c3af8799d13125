//! Classified failure taxonomy shared by every layer.
//!
//! The variants mirror what the transport can report (network, timeout,
//! authentication, validation, permission, server) plus the failures the
//! resilience layer itself introduces: [`Error::CircuitOpen`] when a breaker
//! refuses a call without touching the transport, and [`Error::Aborted`] when
//! a transaction was rolled back after a mid-flight failure.
//!
//! Cache misses are internal to the cache layer (an `Option` in its store
//! API) and never surface through this enum.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical grouping of remote calls for retry/circuit-breaker purposes.
///
/// Breaker state is tracked per category so a failing write path does not
/// take down reads that may still be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallCategory {
    Read,
    Write,
    Call,
}

impl fmt::Display for CallCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallCategory::Read => write!(f, "read"),
            CallCategory::Write => write!(f, "write"),
            CallCategory::Call => write!(f, "call"),
        }
    }
}

/// Summary of a rollback attempt, attached to [`Error::Aborted`].
///
/// The full per-compensation detail lives in the transaction crate's
/// rollback report; this is the compact outcome carried inside the error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// Compensations that were applied successfully.
    pub applied: usize,
    /// Compensations that could not be applied.
    pub failed: usize,
    /// Compensations that restored data but not the original remote identity.
    pub lossy: usize,
}

impl RollbackOutcome {
    /// True when every compensation applied and none were lossy.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.lossy == 0
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} lossy",
            self.applied, self.failed, self.lossy
        )
    }
}

/// Typed failure for every public operation in the workspace.
///
/// Cloneable so cached negative entries and retry attempt records can carry
/// the original classification.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Malformed operation caught before dispatch (unknown field, bad
    /// operator, invalid payload). Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connection-level failure reaching the remote service. Retryable.
    #[error("network failure: {0}")]
    Network(String),

    /// An attempt (or batch item) exceeded its time budget. Retryable.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials rejected. Terminal; surfaced immediately, never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Authenticated but not allowed. Terminal.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The remote service failed internally. Retryable up to policy limit.
    #[error("remote service error: {message}")]
    Server {
        message: String,
        /// Remote status/error code when the transport provides one.
        code: Option<i64>,
    },

    /// The circuit breaker for this category is open; the transport was not
    /// contacted. Distinguishable from genuine remote failures so callers
    /// can apply fallback logic.
    #[error("circuit open for {category} calls, retry after {retry_after:?}")]
    CircuitOpen {
        category: CallCategory,
        retry_after: Duration,
    },

    /// A transaction failed mid-flight and was automatically rolled back.
    /// Carries the original failure and the rollback outcome.
    #[error("transaction aborted: {source} (rollback: {rollback})")]
    Aborted {
        source: Box<Error>,
        rollback: RollbackOutcome,
    },
}

impl Error {
    /// Construct a server error with an optional remote code.
    pub fn server(message: impl Into<String>, code: Option<i64>) -> Self {
        Error::Server {
            message: message.into(),
            code,
        }
    }

    /// Whether the retry subsystem may attempt this failure again.
    ///
    /// Network, timeout, and server failures are transient; validation,
    /// authentication, and permission failures are terminal and must never
    /// be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Server { .. }
        )
    }

    /// Short stable label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::Authentication(_) => "authentication",
            Error::Permission(_) => "permission",
            Error::Server { .. } => "server",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::server("500", Some(500)).is_retryable());

        assert!(!Error::Validation("bad field".into()).is_retryable());
        assert!(!Error::Authentication("expired".into()).is_retryable());
        assert!(!Error::Permission("denied".into()).is_retryable());
        assert!(!Error::CircuitOpen {
            category: CallCategory::Read,
            retry_after: Duration::from_secs(5),
        }
        .is_retryable());
    }

    #[test]
    fn test_aborted_display_includes_rollback_outcome() {
        let err = Error::Aborted {
            source: Box::new(Error::Network("reset".into())),
            rollback: RollbackOutcome {
                applied: 2,
                failed: 1,
                lossy: 0,
            },
        };
        let rendered = err.to_string();
        assert!(rendered.contains("network failure"));
        assert!(rendered.contains("2 applied"));
        assert!(rendered.contains("1 failed"));
    }

    #[test]
    fn test_rollback_outcome_clean() {
        assert!(RollbackOutcome::default().is_clean());
        assert!(!RollbackOutcome {
            applied: 1,
            failed: 0,
            lossy: 1,
        }
        .is_clean());
    }
}
