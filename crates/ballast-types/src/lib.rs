//! Shared types for the ballast workspace.
//!
//! This crate provides foundational types used across multiple crates in the
//! workspace, breaking circular dependency chains.
//!
//! ## Core Types
//!
//! - [`Operation`] - an immutable description of a requested remote action
//! - [`Filter`] - composable filter predicates (AND/OR/NOT over comparisons)
//! - [`Record`] / [`FieldValue`] - dynamically shaped records with tagged values
//! - [`LazyRef`] - a deferred pointer to related records, resolved on demand
//! - [`Error`] - the classified failure taxonomy shared by every layer
//! - [`CacheKey`] / [`KeyPattern`] - deterministic cache addressing

pub mod error;
pub mod key;
pub mod operation;
pub mod record;

// Re-export commonly used types at crate root
pub use error::{CallCategory, Error, RollbackOutcome};
pub use key::{CacheKey, KeyPattern};
pub use operation::{CmpOp, Filter, OpKind, Operation, OrderBy, OrderDir};
pub use record::{FieldValue, LazyRef, Record};
