//! Ballast
//!
//! Resilient data access over an unreliable remote record service.
//!
//! Ballast turns a raw request/response RPC channel into a dependable
//! data-access API: declarative queries with lazy relationship resolution,
//! a read-through cache with TTL/LRU eviction and stampede protection, a
//! chunked batch executor with bounded concurrency, policy-driven retries
//! behind per-category circuit breakers, and compensating transactions over
//! services with no native multi-call atomicity.
//!
//! The workspace is layered leaves-first; each layer wraps the next by
//! constructor injection:
//!
//! - [`ballast_transport`]: the consumed [`Transport`]/[`ModelRegistry`]
//!   seams, plus an in-memory implementation for tests and demos
//! - [`ballast_retry`]: [`RetryManager`] with backoff and circuit breaking
//! - [`ballast_cache`]: [`CacheManager`] in front of the retry layer
//! - [`ballast_query`]: [`QueryBuilder`] resolving through cache → retry →
//!   transport, with batched relationship prefetch
//! - [`ballast_batch`]: [`BatchExecutor`] for bulk writes
//! - [`ballast_txn`]: [`TransactionManager`] with compensating rollback
//!
//! # Example
//!
//! ```ignore
//! use ballast::{Client, Config, Filter};
//!
//! let client = Client::new(transport, registry, Config::default());
//!
//! // Query with caching and lazy refs.
//! let open = client
//!     .query("invoice")
//!     .filter(Filter::eq("state", "open"))
//!     .all()
//!     .await?;
//!
//! // Atomic multi-step change.
//! client
//!     .run_transaction(|tx| Box::pin(async move {
//!         let id = tx.create("invoice", payload).await?;
//!         tx.update("partner", "p1", changes).await
//!     }))
//!     .await?;
//! ```

mod client;
mod config;

pub use client::Client;
pub use config::Config;

// Re-export the workspace surface at the crate root.
pub use ballast_batch::{BatchConfig, BatchExecutor, BatchItemOutcome, BatchJob, BatchReport};
pub use ballast_cache::{
    CacheBackendKind, CacheConfig, CacheManager, CachedValue, MetricsSnapshot,
};
pub use ballast_query::{QueryBuilder, QueryEngine};
pub use ballast_retry::{
    AttemptRecord, Backoff, BreakerConfig, CircuitState, RetryContext, RetryManager, RetryPolicy,
    RetryReport,
};
pub use ballast_transport::{
    FieldKind, InMemoryTransport, ModelRegistry, StaticRegistry, Transport,
};
pub use ballast_txn::{
    CompensationFailure, LossyCompensation, RollbackReport, Savepoint, Transaction,
    TransactionManager,
};
pub use ballast_types::{
    CacheKey, CallCategory, CmpOp, Error, FieldValue, Filter, KeyPattern, LazyRef, OpKind,
    Operation, OrderBy, OrderDir, Record, RollbackOutcome,
};
