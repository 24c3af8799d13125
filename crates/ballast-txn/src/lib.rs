//! Compensating transactions.
//!
//! The remote service has no multi-call transaction primitive, so
//! [`Transaction`] provides atomic-looking execution with a log-then-apply
//! model: each operation is applied remotely as it is issued, and a
//! compensating action is logged alongside it. `commit` discards the log;
//! `rollback` replays compensations in strict reverse order.
//!
//! Derived compensations:
//! - create → delete the created record
//! - update → revert to pre-update values, captured by reading the record
//!   before applying the update
//! - delete → recreate from a pre-delete snapshot; flagged lossy when the
//!   service reissues a different id
//!
//! A compensation failure is recorded and replay continues; rollback is
//! best-effort and reports what could not be undone. A transaction opened
//! inside another is a savepoint: its sub-log can be rolled back alone.
//!
//! # Example
//!
//! ```ignore
//! use ballast_txn::TransactionManager;
//!
//! let txns = TransactionManager::new(transport, retry);
//! let mut tx = txns.begin();
//! let id = tx.create("invoice", serde_json::json!({"amount": 10})).await?;
//! tx.update("invoice", &id, serde_json::json!({"state": "posted"})).await?;
//! tx.commit();
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use ballast_cache::CacheManager;
use ballast_retry::RetryManager;
use ballast_transport::Transport;
use ballast_types::{CallCategory, Error, KeyPattern, OpKind, RollbackOutcome};

/// The inverse action recorded for one applied operation.
#[derive(Debug, Clone)]
enum Compensation {
    DeleteCreated {
        entity: String,
        id: String,
    },
    RevertUpdated {
        entity: String,
        id: String,
        /// Previous values of exactly the fields the update touched.
        pre_image: Value,
    },
    RecreateDeleted {
        entity: String,
        original_id: String,
        snapshot: Value,
    },
}

/// One applied operation and its compensation.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub entity: String,
    pub kind: OpKind,
    pub applied_at: DateTime<Utc>,
    compensation: Compensation,
}

/// A compensation that could not be applied during rollback.
#[derive(Debug)]
pub struct CompensationFailure {
    /// Index of the original operation in the transaction log.
    pub index: usize,
    pub entity: String,
    pub error: Error,
}

/// A recreate that restored data under a different remote identity.
#[derive(Debug)]
pub struct LossyCompensation {
    pub entity: String,
    pub original_id: String,
    pub new_id: String,
}

/// Outcome of a rollback replay.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Compensations applied successfully (lossy ones included).
    pub applied: usize,
    pub failures: Vec<CompensationFailure>,
    pub lossy: Vec<LossyCompensation>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.lossy.is_empty()
    }

    /// Compact summary carried inside [`Error::Aborted`].
    pub fn outcome(&self) -> RollbackOutcome {
        RollbackOutcome {
            applied: self.applied,
            failed: self.failures.len(),
            lossy: self.lossy.len(),
        }
    }

    fn merge(&mut self, other: RollbackReport) {
        self.applied += other.applied;
        self.failures.extend(other.failures);
        self.lossy.extend(other.lossy);
    }
}

/// Marks a position in a transaction log; rolling back to it undoes only
/// the operations applied after it.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint(usize);

/// Creates transactions over the shared write path.
pub struct TransactionManager {
    transport: Arc<dyn Transport>,
    retry: Arc<RetryManager>,
    cache: Option<Arc<CacheManager>>,
}

impl TransactionManager {
    pub fn new(transport: Arc<dyn Transport>, retry: Arc<RetryManager>) -> Self {
        TransactionManager {
            transport,
            retry,
            cache: None,
        }
    }

    /// Invalidate affected entity caches after each successful write.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Open a transaction context.
    pub fn begin(&self) -> Transaction {
        Transaction {
            transport: self.transport.clone(),
            retry: self.retry.clone(),
            cache: self.cache.clone(),
            log: Vec::new(),
            committed: false,
        }
    }

    /// Run `scope` inside a transaction. On success the transaction commits;
    /// on error it is rolled back automatically and the original error is
    /// re-raised as [`Error::Aborted`] carrying the rollback outcome.
    pub async fn run<T, F>(&self, scope: F) -> Result<T, Error>
    where
        F: for<'a> FnOnce(&'a mut Transaction) -> BoxFuture<'a, Result<T, Error>>,
    {
        let mut tx = self.begin();
        let result = scope(&mut tx).await;
        match result {
            Ok(value) => {
                tx.commit();
                Ok(value)
            }
            Err(source) => {
                warn!(error = %source, "transaction scope failed, rolling back");
                let report = tx.rollback().await;
                Err(Error::Aborted {
                    source: Box::new(source),
                    rollback: report.outcome(),
                })
            }
        }
    }
}

/// An open transaction: an ordered log of applied operations and their
/// compensations.
///
/// Operations are applied remotely as they are issued. Committing consumes
/// the transaction and discards the log, so a committed transaction can
/// never be rolled back. Cancelling the local caller does not un-log
/// already-issued writes; drop without commit leaves remote changes in
/// place and logs a warning.
pub struct Transaction {
    transport: Arc<dyn Transport>,
    retry: Arc<RetryManager>,
    cache: Option<Arc<CacheManager>>,
    log: Vec<LogEntry>,
    committed: bool,
}

impl Transaction {
    /// Create a record; the compensation deletes it. Returns the new id.
    pub async fn create(&mut self, entity: &str, payload: Value) -> Result<String, Error> {
        let created = self
            .apply_write(entity, "create", json!({ "payload": payload }))
            .await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::server(format!("create returned no id for {entity}"), None)
            })?
            .to_string();

        self.push_log(entity, OpKind::Create, Compensation::DeleteCreated {
            entity: entity.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }

    /// Update a record; the compensation reverts exactly the touched fields
    /// to the values read just before the update.
    pub async fn update(&mut self, entity: &str, id: &str, changes: Value) -> Result<(), Error> {
        let Value::Object(change_map) = &changes else {
            return Err(Error::Validation("update changes must be an object".into()));
        };

        let before = self.read_snapshot(entity, id).await?;
        let mut pre_image = serde_json::Map::new();
        for field in change_map.keys() {
            if field == "id" {
                continue;
            }
            pre_image.insert(
                field.clone(),
                before.get(field).cloned().unwrap_or(Value::Null),
            );
        }

        self.apply_write(entity, "update", json!({ "ids": [id], "payload": changes }))
            .await?;

        self.push_log(entity, OpKind::Update, Compensation::RevertUpdated {
            entity: entity.to_string(),
            id: id.to_string(),
            pre_image: Value::Object(pre_image),
        });
        Ok(())
    }

    /// Delete a record; the compensation recreates it from a pre-delete
    /// snapshot. Best-effort: if the service reissues a different id the
    /// compensation is flagged lossy.
    pub async fn delete(&mut self, entity: &str, id: &str) -> Result<(), Error> {
        let snapshot = self.read_snapshot(entity, id).await?;

        self.apply_write(entity, "delete", json!({ "ids": [id] }))
            .await?;

        self.push_log(entity, OpKind::Delete, Compensation::RecreateDeleted {
            entity: entity.to_string(),
            original_id: id.to_string(),
            snapshot,
        });
        Ok(())
    }

    /// Pass a named call through the transaction's write path. No
    /// compensation can be derived for arbitrary calls, so a rollback will
    /// not undo it.
    pub async fn execute_call(
        &mut self,
        entity: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, Error> {
        let transport = &self.transport;
        self.retry
            .execute(CallCategory::Call, || {
                let params = params.clone();
                async move { transport.call(entity, method, params).await }
            })
            .await
    }

    /// Mark the current log position. Equivalent to opening a nested
    /// transaction: [`Transaction::rollback_to`] undoes only what came
    /// after.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.log.len())
    }

    /// Alias for [`Transaction::savepoint`], matching the nested-begin
    /// reading of the same operation.
    pub fn begin_nested(&mut self) -> Savepoint {
        self.savepoint()
    }

    /// Number of logged (compensatable) operations.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// The logged operations, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// Discard the compensation log, keeping every applied operation.
    /// Consumes the transaction: a committed transaction cannot be rolled
    /// back.
    pub fn commit(mut self) {
        debug!(operations = self.log.len(), "transaction committed");
        self.committed = true;
        self.log.clear();
    }

    /// Undo every logged operation, newest first. Failures are recorded and
    /// replay continues.
    pub async fn rollback(mut self) -> RollbackReport {
        let report = self.replay_from(0).await;
        self.committed = true; // Nothing left to warn about on drop.
        report
    }

    /// Undo operations applied after `savepoint`, newest first, keeping the
    /// rest of the transaction open.
    pub async fn rollback_to(&mut self, savepoint: Savepoint) -> RollbackReport {
        self.replay_from(savepoint.0.min(self.log.len())).await
    }

    async fn replay_from(&mut self, from: usize) -> RollbackReport {
        let tail = self.log.split_off(from);
        let mut report = RollbackReport::default();
        debug!(compensations = tail.len(), "rolling back");

        for (offset, entry) in tail.iter().enumerate().rev() {
            match self.apply_compensation(&entry.compensation).await {
                Ok(None) => report.applied += 1,
                Ok(Some(lossy)) => {
                    report.applied += 1;
                    report.lossy.push(lossy);
                }
                Err(error) => {
                    warn!(
                        entity = %entry.entity,
                        index = from + offset,
                        error = %error,
                        "compensation failed, continuing rollback"
                    );
                    report.failures.push(CompensationFailure {
                        index: from + offset,
                        entity: entry.entity.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    async fn apply_compensation(
        &self,
        compensation: &Compensation,
    ) -> Result<Option<LossyCompensation>, Error> {
        match compensation {
            Compensation::DeleteCreated { entity, id } => {
                self.apply_write(entity, "delete", json!({ "ids": [id] }))
                    .await?;
                Ok(None)
            }
            Compensation::RevertUpdated {
                entity,
                id,
                pre_image,
            } => {
                self.apply_write(entity, "update", json!({ "ids": [id], "payload": pre_image }))
                    .await?;
                Ok(None)
            }
            Compensation::RecreateDeleted {
                entity,
                original_id,
                snapshot,
            } => {
                let created = self
                    .apply_write(entity, "create", json!({ "payload": snapshot }))
                    .await?;
                let new_id = created
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if new_id == *original_id {
                    Ok(None)
                } else {
                    Ok(Some(LossyCompensation {
                        entity: entity.clone(),
                        original_id: original_id.clone(),
                        new_id,
                    }))
                }
            }
        }
    }

    /// Issue one write through retry with an idempotency token, then
    /// invalidate the entity's cached reads.
    async fn apply_write(&self, entity: &str, method: &str, params: Value) -> Result<Value, Error> {
        let token = Uuid::new_v4().to_string();
        let mut params = params;
        if let Value::Object(obj) = &mut params {
            obj.insert("_idempotency_token".into(), Value::String(token));
        }

        let result = self
            .retry
            .execute(CallCategory::Write, || {
                let params = params.clone();
                async move { self.transport.call(entity, method, params).await }
            })
            .await?;

        if let Some(cache) = &self.cache {
            cache.invalidate(&KeyPattern::Entity(entity.to_string()));
        }
        Ok(result)
    }

    /// Fresh pre-image read, bypassing the cache: compensations must revert
    /// to actual remote state, not a cached view.
    async fn read_snapshot(&self, entity: &str, id: &str) -> Result<Value, Error> {
        let filter = ballast_types::Filter::is_in("id", vec![id]);
        let params = json!({ "filter": serde_json::to_value(&filter).unwrap_or(Value::Null) });

        let rows = self
            .retry
            .execute(CallCategory::Read, || {
                let params = params.clone();
                async move { self.transport.call(entity, "search_read", params).await }
            })
            .await?;

        rows.as_array()
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no such record: {entity}/{id}")))
    }

    fn push_log(&mut self, entity: &str, kind: OpKind, compensation: Compensation) {
        self.log.push(LogEntry {
            entity: entity.to_string(),
            kind,
            applied_at: Utc::now(),
            compensation,
        });
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed && !self.log.is_empty() {
            warn!(
                operations = self.log.len(),
                "transaction dropped without commit or rollback; remote changes remain applied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ballast_retry::{Backoff, BreakerConfig, RetryPolicy};
    use ballast_transport::InMemoryTransport;

    fn manager(transport: Arc<InMemoryTransport>) -> TransactionManager {
        let retry = Arc::new(RetryManager::new(
            RetryPolicy {
                max_attempts: 2,
                backoff: Backoff::Fixed(Duration::from_millis(1)),
                attempt_timeout: None,
            },
            BreakerConfig {
                failure_threshold: 1000,
                cooldown: Duration::from_secs(60),
            },
        ));
        TransactionManager::new(transport, retry)
    }

    fn seeded() -> Arc<InMemoryTransport> {
        let t = Arc::new(InMemoryTransport::new());
        t.seed(
            "invoice",
            vec![
                json!({"id": "b1", "amount": 20, "state": "open"}),
                json!({"id": "c1", "amount": 30, "state": "open"}),
            ],
        );
        t
    }

    #[tokio::test]
    async fn test_commit_keeps_changes() {
        let transport = seeded();
        let txns = manager(transport.clone());

        let mut tx = txns.begin();
        let id = tx.create("invoice", json!({"amount": 5})).await.unwrap();
        tx.update("invoice", "b1", json!({"state": "posted"}))
            .await
            .unwrap();
        tx.commit();

        assert!(transport.stored_record("invoice", &id).is_some());
        assert_eq!(
            transport.stored_record("invoice", "b1").unwrap()["state"],
            "posted"
        );
    }

    #[tokio::test]
    async fn test_rollback_compensates_in_reverse_order() {
        let transport = seeded();
        let txns = manager(transport.clone());

        // create A, update B, delete C.
        let mut tx = txns.begin();
        let a = tx.create("invoice", json!({"amount": 1})).await.unwrap();
        tx.update("invoice", "b1", json!({"amount": 99})).await.unwrap();
        tx.delete("invoice", "c1").await.unwrap();

        let report = tx.rollback().await;
        assert!(report.is_clean());
        assert_eq!(report.applied, 3);

        // State restored: A gone, B reverted, C recreated with its id.
        assert!(transport.stored_record("invoice", &a).is_none());
        assert_eq!(
            transport.stored_record("invoice", "b1").unwrap()["amount"],
            20
        );
        assert!(transport.stored_record("invoice", "c1").is_some());

        // Replay issued the inverse of each original write.
        assert_eq!(transport.call_count("invoice", "create"), 2); // A + recreate C
        assert_eq!(transport.call_count("invoice", "update"), 2); // B + revert B
        assert_eq!(transport.call_count("invoice", "delete"), 2); // C + delete A
    }

    #[tokio::test]
    async fn test_failed_compensation_does_not_halt_replay() {
        let transport = seeded();
        let txns = manager(transport.clone());

        let mut tx = txns.begin();
        let a = tx.create("invoice", json!({"amount": 1})).await.unwrap();
        tx.update("invoice", "b1", json!({"amount": 99})).await.unwrap();
        tx.delete("invoice", "c1").await.unwrap();

        // Poison only the revert of b1; the other compensations must still
        // be attempted.
        transport.fail_matching("\"b1\"", Error::Permission("locked".into()));

        let report = tx.rollback().await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity, "invoice");

        assert!(transport.stored_record("invoice", &a).is_none());
        assert!(transport.stored_record("invoice", "c1").is_some());
        // The failed revert left the updated value in place.
        assert_eq!(
            transport.stored_record("invoice", "b1").unwrap()["amount"],
            99
        );
    }

    #[tokio::test]
    async fn test_lossy_recreate_is_flagged() {
        let transport = seeded();
        transport.set_reissue_ids(true);
        let txns = manager(transport.clone());

        let mut tx = txns.begin();
        tx.delete("invoice", "c1").await.unwrap();
        let report = tx.rollback().await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.lossy.len(), 1);
        assert_eq!(report.lossy[0].original_id, "c1");
        assert_ne!(report.lossy[0].new_id, "c1");
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_update_reverts_only_touched_fields() {
        let transport = seeded();
        let txns = manager(transport.clone());

        let mut tx = txns.begin();
        tx.update("invoice", "b1", json!({"amount": 50})).await.unwrap();
        // A later out-of-band change to another field must survive the
        // revert.
        transport
            .call(
                "invoice",
                "update",
                json!({"ids": ["b1"], "payload": {"state": "sent"}}),
            )
            .await
            .unwrap();

        tx.rollback().await;
        let row = transport.stored_record("invoice", "b1").unwrap();
        assert_eq!(row["amount"], 20);
        assert_eq!(row["state"], "sent");
    }

    #[tokio::test]
    async fn test_savepoint_rolls_back_own_portion_only() {
        let transport = seeded();
        let txns = manager(transport.clone());

        let mut tx = txns.begin();
        let outer = tx.create("invoice", json!({"amount": 1})).await.unwrap();

        let sp = tx.begin_nested();
        let inner = tx.create("invoice", json!({"amount": 2})).await.unwrap();
        tx.update("invoice", "b1", json!({"amount": 77})).await.unwrap();

        let report = tx.rollback_to(sp).await;
        assert_eq!(report.applied, 2);
        assert_eq!(tx.len(), 1);

        // Inner work undone, outer create still applied.
        assert!(transport.stored_record("invoice", &inner).is_none());
        assert_eq!(
            transport.stored_record("invoice", "b1").unwrap()["amount"],
            20
        );
        assert!(transport.stored_record("invoice", &outer).is_some());

        tx.commit();
        assert!(transport.stored_record("invoice", &outer).is_some());
    }

    #[tokio::test]
    async fn test_run_rolls_back_on_error_and_augments_it() {
        let transport = seeded();
        let txns = manager(transport.clone());
        let rows_before = transport.row_count("invoice");

        let result: Result<(), Error> = txns
            .run(|tx| {
                Box::pin(async move {
                    tx.create("invoice", json!({"amount": 1})).await?;
                    Err(Error::Network("connection lost".into()))
                })
            })
            .await;

        match result {
            Err(Error::Aborted { source, rollback }) => {
                assert!(matches!(*source, Error::Network(_)));
                assert_eq!(rollback.applied, 1);
                assert_eq!(rollback.failed, 0);
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert_eq!(transport.row_count("invoice"), rows_before);
    }

    #[tokio::test]
    async fn test_run_commits_on_success() {
        let transport = seeded();
        let txns = manager(transport.clone());

        let id = txns
            .run(|tx| {
                Box::pin(async move { tx.create("invoice", json!({"amount": 8})).await })
            })
            .await
            .unwrap();

        assert!(transport.stored_record("invoice", &id).is_some());
    }

    #[tokio::test]
    async fn test_failed_operation_is_not_logged() {
        let transport = seeded();
        let txns = manager(transport.clone());

        let mut tx = txns.begin();
        tx.create("invoice", json!({"amount": 1})).await.unwrap();
        let err = tx
            .update("invoice", "missing", json!({"amount": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Only the successful create is compensatable.
        assert_eq!(tx.len(), 1);
        let report = tx.rollback().await;
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn test_writes_invalidate_entity_cache() {
        use ballast_cache::{CacheConfig, CachedValue};
        use ballast_types::Operation;

        let transport = seeded();
        let cache = Arc::new(CacheManager::new(CacheConfig::default()));
        let txns = manager(transport).with_cache(cache.clone());

        let read = Operation::read("invoice");
        cache
            .get_or_fetch(&read, || async { Ok(CachedValue::Count(2)) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        let mut tx = txns.begin();
        tx.update("invoice", "b1", json!({"amount": 1})).await.unwrap();
        assert_eq!(cache.len(), 0);
        tx.commit();
    }
}
