//! Declarative query construction with caching and lazy relationships.
//!
//! [`QueryEngine`] composes the read path: validation against the model
//! registry, then CacheManager → RetryManager → Transport. [`QueryBuilder`]
//! accumulates filters, field selection, ordering, and pagination into an
//! immutable [`Operation`] that is only executed when a terminal call
//! (`all`, `first`, `count`, `iterate`) runs.
//!
//! Relationship fields come back as [`LazyRef`] placeholders. Resolving one
//! ref at a time ([`QueryEngine::resolve`]) costs one remote call each, the
//! N+1 pattern; [`QueryEngine::prefetch`] resolves the same relationship
//! across an entire result set in one call keyed by the distinct referenced
//! ids.
//!
//! # Example
//!
//! ```ignore
//! use ballast_query::QueryEngine;
//! use ballast_types::Filter;
//!
//! let engine = QueryEngine::new(transport, registry, cache, retry);
//! let open = engine
//!     .query("invoice")
//!     .filter(Filter::eq("state", "open"))
//!     .order_by(OrderBy::desc("amount"))
//!     .limit(20);
//!
//! let records = open.clone().all().await?;
//! let partners = engine.prefetch(&records, "partner_id").await?;
//! ```

pub mod builder;
pub mod shape;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use ballast_cache::{CacheManager, CachedValue};
use ballast_retry::RetryManager;
use ballast_transport::{FieldKind, ModelRegistry, Transport};
use ballast_types::{CallCategory, Error, FieldValue, Filter, LazyRef, Operation, Record};

pub use builder::QueryBuilder;

/// The composed read path: validation, cache, retry, transport.
#[derive(Clone)]
pub struct QueryEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ModelRegistry>,
    cache: Arc<CacheManager>,
    retry: Arc<RetryManager>,
}

impl QueryEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ModelRegistry>,
        cache: Arc<CacheManager>,
        retry: Arc<RetryManager>,
    ) -> Self {
        QueryEngine {
            transport,
            registry,
            cache,
            retry,
        }
    }

    /// Start building a query over `entity`.
    pub fn query(&self, entity: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(self.clone(), entity.into())
    }

    /// Resolve one lazy reference with a single remote call.
    ///
    /// Calling this per record over a result set is the N+1 pattern; prefer
    /// [`QueryEngine::prefetch`] for whole result sets.
    pub async fn resolve(&self, lazy: &LazyRef) -> Result<Vec<Record>, Error> {
        if lazy.ids.is_empty() {
            return Ok(Vec::new());
        }
        let op = ref_read_op(&lazy.entity, lazy.ids.clone());
        self.fetch_records(&op).await
    }

    /// Resolve `field` across all of `records` in one call keyed by the
    /// distinct set of referenced ids. Returns resolved records by id.
    pub async fn prefetch(
        &self,
        records: &[Record],
        field: &str,
    ) -> Result<HashMap<String, Record>, Error> {
        let mut target: Option<String> = None;
        let mut ids: Vec<String> = Vec::new();
        for record in records {
            if let Some(lazy) = record.get(field).and_then(FieldValue::as_ref_value) {
                target.get_or_insert_with(|| lazy.entity.clone());
                ids.extend(lazy.ids.iter().cloned());
            }
        }
        let Some(target) = target else {
            return Ok(HashMap::new());
        };

        debug!(
            field,
            target = %target,
            referenced = ids.len(),
            "prefetching relationship"
        );
        let op = ref_read_op(&target, ids);
        let related = self.fetch_records(&op).await?;
        Ok(related.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    /// Replace `field`'s lazy refs with resolved records from `related`.
    /// Refs whose target is missing from `related` are left unresolved.
    pub fn attach_prefetched(
        records: Vec<Record>,
        field: &str,
        related: &HashMap<String, Record>,
    ) -> Vec<Record> {
        records
            .into_iter()
            .map(|mut record| {
                let resolved = match record.get(field) {
                    Some(FieldValue::Ref(lazy)) => lazy
                        .single_id()
                        .and_then(|id| related.get(id))
                        .map(|r| FieldValue::Related(Box::new(r.clone()))),
                    Some(FieldValue::RefList(lazy)) => Some(FieldValue::RelatedList(
                        lazy.ids
                            .iter()
                            .filter_map(|id| related.get(id).cloned())
                            .collect(),
                    )),
                    _ => None,
                };
                if let Some(value) = resolved {
                    record.set(field, value);
                }
                record
            })
            .collect()
    }

    pub(crate) async fn fetch_records(&self, op: &Operation) -> Result<Vec<Record>, Error> {
        let fields = self.registry.fields_for(&op.entity)?;
        shape::validate_read(&fields, op)?;

        let cached = self
            .cache
            .get_or_fetch(op, || self.fetch_remote_records(op, &fields))
            .await?;
        match cached {
            CachedValue::Records(records) => Ok(records),
            _ => unreachable!("record read keys only ever cache record lists"),
        }
    }

    async fn fetch_remote_records(
        &self,
        op: &Operation,
        fields: &BTreeMap<String, FieldKind>,
    ) -> Result<CachedValue, Error> {
        let params = op.wire_params();
        let raw = self
            .retry
            .execute(CallCategory::Read, || {
                let params = params.clone();
                async move {
                    self.transport
                        .call(&op.entity, op.wire_method(), params)
                        .await
                }
            })
            .await?;
        let records = shape::shape_records(&op.entity, fields, raw)?;
        Ok(CachedValue::Records(records))
    }

    pub(crate) async fn fetch_count(&self, op: &Operation) -> Result<u64, Error> {
        let fields = self.registry.fields_for(&op.entity)?;
        shape::validate_read(&fields, op)?;

        let cached = self
            .cache
            .get_or_fetch(op, || async move {
                let params = op.wire_params();
                let raw = self
                    .retry
                    .execute(CallCategory::Read, || {
                        let params = params.clone();
                        async move {
                            self.transport
                                .call(&op.entity, op.wire_method(), params)
                                .await
                        }
                    })
                    .await?;
                let count = raw.as_u64().ok_or_else(|| {
                    Error::server(
                        format!("malformed count response for {}: {raw}", op.entity),
                        None,
                    )
                })?;
                Ok(CachedValue::Count(count))
            })
            .await?;
        match cached {
            CachedValue::Count(n) => Ok(n),
            _ => unreachable!("count keys only ever cache counts"),
        }
    }

    /// Validate eager relationship fields before a fetch.
    pub(crate) fn check_eager(&self, entity: &str, eager: &[String]) -> Result<(), Error> {
        if eager.is_empty() {
            return Ok(());
        }
        let fields = self.registry.fields_for(entity)?;
        shape::validate_eager(&fields, entity, eager)
    }
}

/// Canonical read for a set of referenced ids: sorted and deduplicated so
/// identical id sets share one cache key.
fn ref_read_op(entity: &str, mut ids: Vec<String>) -> Operation {
    ids.sort();
    ids.dedup();
    let mut op = Operation::read(entity);
    op.filter = Some(Filter::is_in("id", ids));
    op
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use ballast_cache::CacheConfig;
    use ballast_retry::{Backoff, BreakerConfig, RetryPolicy};
    use ballast_transport::{InMemoryTransport, StaticRegistry};
    use ballast_types::OrderBy;

    fn registry() -> StaticRegistry {
        StaticRegistry::new()
            .with_entity(
                "invoice",
                vec![
                    ("amount", FieldKind::Float),
                    ("state", FieldKind::Text),
                    ("partner_id", FieldKind::Ref("partner".into())),
                    ("tag_ids", FieldKind::RefList("tag".into())),
                ],
            )
            .with_entity("partner", vec![("name", FieldKind::Text)])
            .with_entity("tag", vec![("label", FieldKind::Text)])
    }

    fn engine_over(transport: Arc<InMemoryTransport>) -> QueryEngine {
        let retry = Arc::new(RetryManager::new(
            RetryPolicy {
                max_attempts: 2,
                backoff: Backoff::Fixed(Duration::from_millis(1)),
                attempt_timeout: None,
            },
            BreakerConfig::default(),
        ));
        let cache = Arc::new(CacheManager::new(CacheConfig {
            default_ttl: None,
            ..CacheConfig::default()
        }));
        QueryEngine::new(transport, Arc::new(registry()), cache, retry)
    }

    fn seeded() -> Arc<InMemoryTransport> {
        let t = Arc::new(InMemoryTransport::new());
        t.seed(
            "invoice",
            vec![
                json!({"id": "1", "amount": 10.0, "state": "open", "partner_id": "p1", "tag_ids": ["t1", "t2"]}),
                json!({"id": "2", "amount": 25.0, "state": "open", "partner_id": "p2", "tag_ids": []}),
                json!({"id": "3", "amount": 40.0, "state": "paid", "partner_id": "p1", "tag_ids": ["t1"]}),
            ],
        );
        t.seed(
            "partner",
            vec![
                json!({"id": "p1", "name": "Acme"}),
                json!({"id": "p2", "name": "Globex"}),
            ],
        );
        t.seed(
            "tag",
            vec![
                json!({"id": "t1", "label": "urgent"}),
                json!({"id": "t2", "label": "export"}),
            ],
        );
        t
    }

    #[tokio::test]
    async fn test_all_shapes_records_with_lazy_refs() {
        let transport = seeded();
        let engine = engine_over(transport);

        let records = engine
            .query("invoice")
            .filter(Filter::eq("state", "open"))
            .order_by(OrderBy::asc("amount"))
            .all()
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "1");
        assert_eq!(
            records[0].get("partner_id"),
            Some(&FieldValue::Ref(LazyRef::one("partner", "p1")))
        );
    }

    #[tokio::test]
    async fn test_identical_chains_share_one_cache_entry() {
        let transport = seeded();
        let engine = engine_over(transport.clone());

        let build = || {
            engine
                .query("invoice")
                .filter(Filter::eq("state", "open").and_with(Filter::gt("amount", 5)))
                .select(["amount", "state"])
                .limit(10)
        };
        assert_eq!(
            build().to_operation().cache_key(),
            build().to_operation().cache_key()
        );

        build().all().await.unwrap();
        build().all().await.unwrap();
        assert_eq!(transport.call_count("invoice", "search_read"), 1);
    }

    #[tokio::test]
    async fn test_unknown_field_fails_before_any_remote_call() {
        let transport = seeded();
        let engine = engine_over(transport.clone());

        let err = engine
            .query("invoice")
            .filter(Filter::eq("no_such_field", 1))
            .all()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_batches_distinct_ids_into_one_call() {
        let transport = seeded();
        let engine = engine_over(transport.clone());

        let records = engine.query("invoice").all().await.unwrap();
        assert_eq!(records.len(), 3);

        // Three invoices reference two distinct partners: one call.
        let partners = engine.prefetch(&records, "partner_id").await.unwrap();
        assert_eq!(partners.len(), 2);
        assert_eq!(transport.call_count("partner", "search_read"), 1);

        let attached = QueryEngine::attach_prefetched(records, "partner_id", &partners);
        match attached[0].get("partner_id") {
            Some(FieldValue::Related(partner)) => {
                assert_eq!(partner.get("name"), Some(&FieldValue::Text("Acme".into())));
            }
            other => panic!("expected resolved partner, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eager_resolves_at_fetch_time() {
        let transport = seeded();
        let engine = engine_over(transport.clone());

        let records = engine
            .query("invoice")
            .eager("tag_ids")
            .all()
            .await
            .unwrap();

        match records[0].get("tag_ids") {
            Some(FieldValue::RelatedList(tags)) => assert_eq!(tags.len(), 2),
            other => panic!("expected resolved tags, got {other:?}"),
        }
        // One call for invoices, one batched call for tags.
        assert_eq!(transport.call_count("invoice", "search_read"), 1);
        assert_eq!(transport.call_count("tag", "search_read"), 1);
    }

    #[tokio::test]
    async fn test_resolve_single_ref() {
        let transport = seeded();
        let engine = engine_over(transport);

        let resolved = engine
            .resolve(&LazyRef::one("partner", "p2"))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].get("name"), Some(&FieldValue::Text("Globex".into())));
    }

    #[tokio::test]
    async fn test_count_and_first() {
        let transport = seeded();
        let engine = engine_over(transport.clone());

        let open = engine.query("invoice").filter(Filter::eq("state", "open"));
        assert_eq!(open.clone().count().await.unwrap(), 2);

        let first = open
            .order_by(OrderBy::desc("amount"))
            .first()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "2");
    }

    #[tokio::test]
    async fn test_iterate_pages_through_results() {
        use futures::TryStreamExt;

        let transport = seeded();
        let engine = engine_over(transport.clone());

        let records: Vec<Record> = engine
            .query("invoice")
            .order_by(OrderBy::asc("amount"))
            .iterate(2)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "1");
        assert_eq!(records[2].id, "3");
        // Pages of 2 over 3 rows: two remote pages.
        assert_eq!(transport.call_count("invoice", "search_read"), 2);
    }

    #[tokio::test]
    async fn test_builder_branching_leaves_base_untouched() {
        let transport = seeded();
        let engine = engine_over(transport);

        let base = engine.query("invoice").filter(Filter::eq("state", "open"));
        let narrowed = base.clone().filter(Filter::gt("amount", 20));

        assert_ne!(
            base.to_operation().cache_key(),
            narrowed.to_operation().cache_key()
        );
        assert_eq!(base.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_failure_kind_propagates_through_layers() {
        let transport = seeded();
        transport.fail_times(2, Error::Authentication("expired".into()));
        let engine = engine_over(transport);

        let err = engine.query("invoice").all().await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
