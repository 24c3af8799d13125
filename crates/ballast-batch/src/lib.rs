//! Chunked bulk execution with bounded concurrency.
//!
//! [`BatchExecutor`] runs a homogeneous set of operations in chunks, with at
//! most `max_concurrency` chunks in flight at once: a bounded worker pool,
//! not unbounded fan-out. One item's failure never aborts the rest: every
//! item's outcome is recorded independently and returned at its original
//! input index, whatever order chunks completed in.
//!
//! Writes carry a client-generated idempotency token so a retried item is
//! not double-applied by transports that support deduplication.
//!
//! # Example
//!
//! ```ignore
//! use ballast_batch::{BatchExecutor, BatchConfig, BatchJob};
//!
//! let executor = BatchExecutor::new(transport, retry, BatchConfig::default());
//! let job = BatchJob::creates("invoice", payloads);
//! let report = executor.submit(job).await;
//! assert_eq!(report.len(), payloads_len);
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;
use uuid::Uuid;

use ballast_cache::CacheManager;
use ballast_retry::RetryManager;
use ballast_transport::Transport;
use ballast_types::{CallCategory, Error, KeyPattern, OpKind, Operation};

/// Batch executor tuning.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum operations per chunk. Must be at least 1.
    pub chunk_size: usize,
    /// Maximum chunks in flight simultaneously. Must be at least 1.
    pub max_concurrency: usize,
    /// Per-item time budget covering all retry attempts for that item.
    pub item_timeout: Option<Duration>,
    /// Retry/breaker category batch calls run under.
    pub category: CallCategory,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            chunk_size: 100,
            max_concurrency: 4,
            item_timeout: Some(Duration::from_secs(30)),
            category: CallCategory::Write,
        }
    }
}

/// An ordered list of operations of one kind.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub kind: OpKind,
    pub operations: Vec<Operation>,
}

impl BatchJob {
    /// Build a job, validating that every operation matches `kind`.
    pub fn new(kind: OpKind, operations: Vec<Operation>) -> Result<Self, Error> {
        if let Some(op) = operations.iter().find(|op| op.kind != kind) {
            return Err(Error::Validation(format!(
                "batch of {kind:?} contains a {:?} operation for {}",
                op.kind, op.entity
            )));
        }
        Ok(BatchJob { kind, operations })
    }

    /// A job creating one record per payload.
    pub fn creates(entity: &str, payloads: Vec<Value>) -> Self {
        BatchJob {
            kind: OpKind::Create,
            operations: payloads
                .into_iter()
                .map(|p| Operation::create(entity, p))
                .collect(),
        }
    }

    /// A job applying per-record field changes.
    pub fn updates(entity: &str, changes: Vec<(String, Value)>) -> Self {
        BatchJob {
            kind: OpKind::Update,
            operations: changes
                .into_iter()
                .map(|(id, c)| Operation::update(entity, id, c))
                .collect(),
        }
    }

    /// A job deleting the given records.
    pub fn deletes(entity: &str, ids: Vec<String>) -> Self {
        BatchJob {
            kind: OpKind::Delete,
            operations: ids
                .into_iter()
                .map(|id| Operation::delete(entity, id))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Successful outcome of one batch item.
#[derive(Debug, Clone)]
pub struct BatchItemOutcome {
    /// Raw transport return value.
    pub value: Value,
    /// Token attached to the write, when the item was a write.
    pub idempotency_token: Option<String>,
}

/// Result of one submitted job; outcomes preserve input order.
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<Result<BatchItemOutcome, Error>>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failed() == 0
    }
}

/// Executes bulk operations through the retry layer with bounded load.
pub struct BatchExecutor {
    transport: Arc<dyn Transport>,
    retry: Arc<RetryManager>,
    cache: Option<Arc<CacheManager>>,
    config: BatchConfig,
    /// Cumulative completed-item counter across jobs; strictly monotonic.
    completed: watch::Sender<u64>,
}

impl BatchExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: Arc<RetryManager>,
        config: BatchConfig,
    ) -> Self {
        assert!(config.chunk_size > 0, "batch chunk_size must be at least 1");
        assert!(
            config.max_concurrency > 0,
            "batch max_concurrency must be at least 1"
        );
        let (completed, _) = watch::channel(0);
        BatchExecutor {
            transport,
            retry,
            cache: None,
            config,
            completed,
        }
    }

    /// Invalidate affected entity caches after successful writes.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Completed-item counter, updated as items finish. Usable for UI
    /// progress without blocking execution.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.completed.subscribe()
    }

    /// The progress counter as a stream.
    pub fn progress_stream(&self) -> WatchStream<u64> {
        WatchStream::new(self.completed.subscribe())
    }

    /// Execute `job`, returning one outcome per input item at its original
    /// index.
    pub async fn submit(&self, job: BatchJob) -> BatchReport {
        let started = Instant::now();
        let total = job.operations.len();
        let kind = job.kind;
        let entities: Vec<String> = job.operations.iter().map(|op| op.entity.clone()).collect();

        debug!(
            kind = ?kind,
            items = total,
            chunk_size = self.config.chunk_size,
            max_concurrency = self.config.max_concurrency,
            "submitting batch"
        );

        let indexed: Vec<(usize, Operation)> = job.operations.into_iter().enumerate().collect();
        let chunks: Vec<Vec<(usize, Operation)>> = indexed
            .chunks(self.config.chunk_size)
            .map(<[_]>::to_vec)
            .collect();

        let chunk_results: Vec<Vec<(usize, Result<BatchItemOutcome, Error>)>> =
            stream::iter(chunks)
                .map(|chunk| self.run_chunk(chunk))
                .buffer_unordered(self.config.max_concurrency)
                .collect()
                .await;

        let mut slots: Vec<Option<Result<BatchItemOutcome, Error>>> =
            (0..total).map(|_| None).collect();
        for (index, outcome) in chunk_results.into_iter().flatten() {
            slots[index] = Some(outcome);
        }
        let outcomes: Vec<Result<BatchItemOutcome, Error>> = slots
            .into_iter()
            .map(|slot| slot.expect("every input index produces exactly one outcome"))
            .collect();

        if kind.is_write() {
            self.invalidate_written(&entities, &outcomes);
        }

        let report = BatchReport {
            outcomes,
            elapsed: started.elapsed(),
        };
        debug!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch complete"
        );
        report
    }

    /// Run one chunk's items sequentially; chunks themselves run
    /// concurrently.
    async fn run_chunk(
        &self,
        chunk: Vec<(usize, Operation)>,
    ) -> Vec<(usize, Result<BatchItemOutcome, Error>)> {
        let mut out = Vec::with_capacity(chunk.len());
        for (index, op) in chunk {
            let outcome = self.run_item(&op).await;
            self.completed.send_modify(|n| *n += 1);
            out.push((index, outcome));
        }
        out
    }

    async fn run_item(&self, op: &Operation) -> Result<BatchItemOutcome, Error> {
        let token = op.kind.is_write().then(|| Uuid::new_v4().to_string());
        let params = op.wire_params_with_token(token.as_deref());
        let entity = op.entity.clone();
        let method = op.wire_method().to_string();

        let retried = self.retry.execute(self.config.category, || {
            let params = params.clone();
            let entity = &entity;
            let method = &method;
            async move { self.transport.call(entity, method, params).await }
        });

        let result = match self.config.item_timeout {
            Some(limit) => match tokio::time::timeout(limit, retried).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout(limit)),
            },
            None => retried.await,
        };

        result.map(|value| BatchItemOutcome {
            value,
            idempotency_token: token,
        })
    }

    fn invalidate_written(
        &self,
        entities: &[String],
        outcomes: &[Result<BatchItemOutcome, Error>],
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        let written: HashSet<&String> = entities
            .iter()
            .zip(outcomes)
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(entity, _)| entity)
            .collect();
        for entity in written {
            cache.invalidate(&KeyPattern::Entity(entity.clone()));
        }
    }
}
