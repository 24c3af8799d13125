//! The client context object.
//!
//! A [`Client`] owns one composed resilience stack: Cache wraps Retry wraps
//! Transport, assembled by constructor injection so the call chain is
//! statically inspectable. Every component state (cache entries, breaker
//! counters) belongs to the client instance; two clients share nothing, so
//! independent instances in tests cannot interfere.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use ballast_batch::{BatchExecutor, BatchJob, BatchReport};
use ballast_cache::{CacheManager, MetricsSnapshot};
use ballast_query::{QueryBuilder, QueryEngine};
use ballast_retry::{CircuitState, RetryManager};
use ballast_transport::{ModelRegistry, Transport};
use ballast_txn::{Transaction, TransactionManager};
use ballast_types::{CallCategory, Error, KeyPattern};

use crate::config::Config;

/// An assembled remote-data client: queries, batches, transactions, and
/// cache control over one transport.
pub struct Client {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheManager>,
    retry: Arc<RetryManager>,
    engine: QueryEngine,
    batch: BatchExecutor,
    txns: TransactionManager,
}

impl Client {
    /// Wire the full stack over `transport` and `registry`.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ModelRegistry>,
        config: Config,
    ) -> Self {
        let cache = Arc::new(CacheManager::new(config.cache));
        let retry = Arc::new(RetryManager::new(config.retry, config.breaker));
        let engine = QueryEngine::new(
            transport.clone(),
            registry,
            cache.clone(),
            retry.clone(),
        );
        let batch = BatchExecutor::new(transport.clone(), retry.clone(), config.batch)
            .with_cache(cache.clone());
        let txns =
            TransactionManager::new(transport.clone(), retry.clone()).with_cache(cache.clone());

        Client {
            transport,
            cache,
            retry,
            engine,
            batch,
            txns,
        }
    }

    /// Start building a query over `entity`.
    pub fn query(&self, entity: impl Into<String>) -> QueryBuilder {
        self.engine.query(entity)
    }

    /// The query engine, for lazy-ref resolution and prefetching.
    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// The batch executor, for progress subscriptions.
    pub fn batch(&self) -> &BatchExecutor {
        &self.batch
    }

    /// Execute a batch job; outcomes preserve input order.
    pub async fn submit_batch(&self, job: BatchJob) -> BatchReport {
        self.batch.submit(job).await
    }

    /// The transaction manager.
    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    /// Open a transaction context.
    pub fn begin(&self) -> Transaction {
        self.txns.begin()
    }

    /// Run `scope` in a transaction: commit on success, automatic rollback
    /// and [`Error::Aborted`] on failure.
    pub async fn run_transaction<T, F>(&self, scope: F) -> Result<T, Error>
    where
        F: for<'a> FnOnce(&'a mut Transaction) -> BoxFuture<'a, Result<T, Error>>,
    {
        self.txns.run(scope).await
    }

    /// Pass a named call straight through retry to the transport, outside
    /// any transaction.
    pub async fn call(&self, entity: &str, method: &str, params: Value) -> Result<Value, Error> {
        self.retry
            .execute(CallCategory::Call, || {
                let params = params.clone();
                async move { self.transport.call(entity, method, params).await }
            })
            .await
    }

    /// Drop cached reads matching `pattern`.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        self.cache.invalidate(pattern)
    }

    pub fn cache_metrics(&self) -> MetricsSnapshot {
        self.cache.metrics()
    }

    pub fn breaker_state(&self, category: CallCategory) -> CircuitState {
        self.retry.breaker_state(category)
    }

    /// Tear down client state: flush the cache and log final metrics.
    /// Idempotent; the client remains usable (a fresh cache) afterwards.
    pub fn close(&self) {
        let metrics = self.cache.metrics();
        debug!(
            hits = metrics.hits,
            misses = metrics.misses,
            evictions = metrics.evictions,
            stampede_waits = metrics.stampede_waits,
            "closing client"
        );
        self.cache.clear();
    }
}
