//! In-memory transport and registry for tests and demos.
//!
//! [`InMemoryTransport`] implements the full wire contract (`search_read`,
//! `count`, `create`, `update`, `delete`) against an in-process row store,
//! with scriptable failures, optional artificial latency, a call journal
//! for asserting how many calls actually reached the transport, and
//! idempotency-token deduplication for writes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::debug;

use ballast_types::{CmpOp, Error, Filter, OrderBy, OrderDir};

use crate::{FieldKind, ModelRegistry, Transport};

type JsonMap = Map<String, Value>;

/// One entry in the transport's call journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub entity: String,
    pub method: String,
}

/// A scripted failure rule matched against incoming calls.
#[derive(Debug, Clone)]
struct FailRule {
    /// Match only this method, if set.
    method: Option<String>,
    /// Match only calls whose rendered params contain this needle, if set.
    needle: Option<String>,
    /// Remaining times to fire; `None` means unlimited.
    remaining: Option<usize>,
    error: Error,
}

impl FailRule {
    fn matches(&self, method: &str, rendered_params: &str) -> bool {
        if let Some(m) = &self.method {
            if m != method {
                return false;
            }
        }
        if let Some(n) = &self.needle {
            if !rendered_params.contains(n.as_str()) {
                return false;
            }
        }
        true
    }
}

/// In-memory entity store implementing [`Transport`].
#[derive(Default)]
pub struct InMemoryTransport {
    /// entity -> id -> row (row always carries its "id").
    rows: RwLock<HashMap<String, BTreeMap<String, JsonMap>>>,
    next_id: AtomicU64,
    /// When set, ids supplied in create payloads are ignored and fresh ids
    /// are issued, modeling a service that does not preserve deleted
    /// identities.
    reissue_ids: AtomicBool,
    latency: RwLock<Option<Duration>>,
    calls: RwLock<Vec<CallRecord>>,
    /// One-shot failures consumed by any call, in order.
    scripted: Mutex<VecDeque<Error>>,
    fail_rules: RwLock<Vec<FailRule>>,
    /// Idempotency token -> result of the write it completed.
    applied_tokens: Mutex<HashMap<String, Value>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add artificial latency to every call (widens race windows in
    /// concurrency tests).
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    /// Insert rows for `entity`. Rows must be JSON objects; a row without an
    /// `"id"` gets one assigned.
    pub fn seed(&self, entity: &str, rows: Vec<Value>) {
        let mut store = self.rows.write();
        let table = store.entry(entity.to_string()).or_default();
        for row in rows {
            let Value::Object(mut obj) = row else {
                panic!("seed rows must be JSON objects");
            };
            let id = match obj.get("id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => self.issue_id(),
            };
            obj.insert("id".to_string(), Value::String(id.clone()));
            table.insert(id, obj);
        }
    }

    /// Script the next `n` calls (of any kind) to fail with `error`.
    pub fn fail_times(&self, n: usize, error: Error) {
        let mut scripted = self.scripted.lock();
        for _ in 0..n {
            scripted.push_back(error.clone());
        }
    }

    /// Fail every call to `method`, `n` times.
    pub fn fail_method(&self, method: &str, n: usize, error: Error) {
        self.fail_rules.write().push(FailRule {
            method: Some(method.to_string()),
            needle: None,
            remaining: Some(n),
            error,
        });
    }

    /// Fail any call whose rendered params contain `needle`, without limit.
    /// Targets individual records in batch/rollback tests (e.g. an id).
    pub fn fail_matching(&self, needle: &str, error: Error) {
        self.fail_rules.write().push(FailRule {
            method: None,
            needle: Some(needle.to_string()),
            remaining: None,
            error,
        });
    }

    /// Drop all scripted failures and rules.
    pub fn clear_failures(&self) {
        self.scripted.lock().clear();
        self.fail_rules.write().clear();
    }

    /// When enabled, create calls never honor a caller-provided id.
    pub fn set_reissue_ids(&self, reissue: bool) {
        self.reissue_ids.store(reissue, AtomicOrdering::Relaxed);
    }

    /// Number of calls that reached this transport for `entity`/`method`,
    /// including calls that then failed.
    pub fn call_count(&self, entity: &str, method: &str) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|c| c.entity == entity && c.method == method)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.read().len()
    }

    /// Current state of one record, for test assertions.
    pub fn stored_record(&self, entity: &str, id: &str) -> Option<Value> {
        self.rows
            .read()
            .get(entity)
            .and_then(|t| t.get(id))
            .map(|row| Value::Object(row.clone()))
    }

    pub fn row_count(&self, entity: &str) -> usize {
        self.rows.read().get(entity).map_or(0, BTreeMap::len)
    }

    fn issue_id(&self) -> String {
        let n = self.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        format!("{n}")
    }

    fn take_failure(&self, method: &str, rendered_params: &str) -> Option<Error> {
        if let Some(err) = self.scripted.lock().pop_front() {
            return Some(err);
        }
        let mut rules = self.fail_rules.write();
        let mut fired = None;
        for rule in rules.iter_mut() {
            if !rule.matches(method, rendered_params) {
                continue;
            }
            if let Some(remaining) = &mut rule.remaining {
                if *remaining == 0 {
                    continue;
                }
                *remaining -= 1;
            }
            fired = Some(rule.error.clone());
            break;
        }
        if fired.is_some() {
            rules.retain(|r| r.remaining != Some(0));
        }
        fired
    }

    fn search_read(&self, entity: &str, params: &JsonMap) -> Result<Value, Error> {
        let rows = self.matching_rows(entity, params)?;
        let fields: Option<Vec<&str>> = params
            .get("fields")
            .and_then(Value::as_array)
            .map(|fs| fs.iter().filter_map(Value::as_str).collect());

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let projected = match &fields {
                Some(fields) => {
                    let mut obj = JsonMap::new();
                    obj.insert("id".into(), row["id"].clone());
                    for f in fields {
                        if let Some(v) = row.get(*f) {
                            obj.insert((*f).to_string(), v.clone());
                        }
                    }
                    obj
                }
                None => row,
            };
            out.push(Value::Object(projected));
        }
        Ok(Value::Array(out))
    }

    fn count(&self, entity: &str, params: &JsonMap) -> Result<Value, Error> {
        // Counting ignores ordering and pagination.
        let filter = parse_filter(params)?;
        let store = self.rows.read();
        let table = store.get(entity);
        let n = match table {
            Some(table) => table
                .values()
                .filter(|row| filter.as_ref().map_or(true, |f| eval_filter(f, row)))
                .count(),
            None => 0,
        };
        Ok(Value::from(n as u64))
    }

    /// Filtered, ordered, paginated row set for a read.
    fn matching_rows(&self, entity: &str, params: &JsonMap) -> Result<Vec<JsonMap>, Error> {
        let filter = parse_filter(params)?;
        let store = self.rows.read();
        let mut rows: Vec<JsonMap> = match store.get(entity) {
            Some(table) => table
                .values()
                .filter(|row| filter.as_ref().map_or(true, |f| eval_filter(f, row)))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        drop(store);

        if let Some(order) = params.get("order") {
            let terms: Vec<OrderBy> = serde_json::from_value(order.clone())
                .map_err(|e| Error::Validation(format!("malformed order clause: {e}")))?;
            rows.sort_by(|a, b| compare_rows(a, b, &terms));
        }

        let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        if offset > 0 {
            rows = rows.into_iter().skip(offset).collect();
        }
        if let Some(limit) = params.get("limit").and_then(Value::as_u64) {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    fn create(&self, entity: &str, params: &JsonMap) -> Result<Value, Error> {
        let Some(Value::Object(payload)) = params.get("payload") else {
            return Err(Error::Validation("create requires an object payload".into()));
        };

        let requested_id = payload.get("id").and_then(Value::as_str).map(str::to_string);
        let mut store = self.rows.write();
        let table = store.entry(entity.to_string()).or_default();

        let id = match requested_id {
            Some(id)
                if !self.reissue_ids.load(AtomicOrdering::Relaxed)
                    && !table.contains_key(&id) =>
            {
                id
            }
            _ => {
                // Skip past any seeded ids the counter has not seen.
                let mut id = self.issue_id();
                while table.contains_key(&id) {
                    id = self.issue_id();
                }
                id
            }
        };

        let mut row = payload.clone();
        row.insert("id".to_string(), Value::String(id.clone()));
        table.insert(id, row.clone());
        Ok(Value::Object(row))
    }

    fn update(&self, entity: &str, params: &JsonMap) -> Result<Value, Error> {
        let ids = parse_ids(params)?;
        let Some(Value::Object(payload)) = params.get("payload") else {
            return Err(Error::Validation("update requires an object payload".into()));
        };

        let mut store = self.rows.write();
        let table = store
            .get_mut(entity)
            .ok_or_else(|| Error::Validation(format!("unknown entity: {entity}")))?;

        // Validate before mutating so a bad id never half-applies.
        for id in &ids {
            if !table.contains_key(id) {
                return Err(Error::Validation(format!("no such record: {entity}/{id}")));
            }
        }
        for id in &ids {
            let row = table.get_mut(id).expect("validated above");
            for (k, v) in payload {
                if k == "id" {
                    continue;
                }
                row.insert(k.clone(), v.clone());
            }
        }
        Ok(Value::from(ids.len() as u64))
    }

    fn delete(&self, entity: &str, params: &JsonMap) -> Result<Value, Error> {
        let ids = parse_ids(params)?;
        let mut store = self.rows.write();
        let table = store
            .get_mut(entity)
            .ok_or_else(|| Error::Validation(format!("unknown entity: {entity}")))?;

        for id in &ids {
            if !table.contains_key(id) {
                return Err(Error::Validation(format!("no such record: {entity}/{id}")));
            }
        }
        for id in &ids {
            table.remove(id);
        }
        Ok(Value::from(ids.len() as u64))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn call(&self, entity: &str, method: &str, params: Value) -> Result<Value, Error> {
        // Journal before the latency sleep so calls abandoned by caller-side
        // timeouts still count as having reached the transport.
        self.calls.write().push(CallRecord {
            entity: entity.to_string(),
            method: method.to_string(),
        });

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let params_obj = match &params {
            Value::Object(obj) => obj.clone(),
            Value::Null => JsonMap::new(),
            _ => return Err(Error::Validation("params must be a JSON object".into())),
        };
        let rendered = params.to_string();

        if let Some(err) = self.take_failure(method, &rendered) {
            debug!(entity, method, error = %err, "in-memory transport failing by script");
            return Err(err);
        }

        let token = params_obj
            .get("_idempotency_token")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(token) = &token {
            if let Some(prior) = self.applied_tokens.lock().get(token) {
                debug!(entity, method, token, "deduplicated write by idempotency token");
                return Ok(prior.clone());
            }
        }

        let result = match method {
            "search_read" => self.search_read(entity, &params_obj),
            "count" => self.count(entity, &params_obj),
            "create" => self.create(entity, &params_obj),
            "update" => self.update(entity, &params_obj),
            "delete" => self.delete(entity, &params_obj),
            other => Err(Error::Validation(format!("unsupported method: {other}"))),
        };

        if let (Some(token), Ok(value)) = (token, &result) {
            self.applied_tokens.lock().insert(token, value.clone());
        }
        result
    }
}

fn parse_filter(params: &JsonMap) -> Result<Option<Filter>, Error> {
    match params.get("filter") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| Error::Validation(format!("malformed filter: {e}"))),
    }
}

fn parse_ids(params: &JsonMap) -> Result<Vec<String>, Error> {
    let ids: Vec<String> = params
        .get("ids")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return Err(Error::Validation("write requires target ids".into()));
    }
    Ok(ids)
}

fn eval_filter(filter: &Filter, row: &JsonMap) -> bool {
    match filter {
        Filter::Cmp { field, cmp, value } => {
            let actual = row.get(field).unwrap_or(&Value::Null);
            match cmp {
                CmpOp::Eq => value_eq(actual, value),
                CmpOp::Ne => !value_eq(actual, value),
                CmpOp::Lt => value_cmp(actual, value) == Some(std::cmp::Ordering::Less),
                CmpOp::Le => matches!(
                    value_cmp(actual, value),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                ),
                CmpOp::Gt => value_cmp(actual, value) == Some(std::cmp::Ordering::Greater),
                CmpOp::Ge => matches!(
                    value_cmp(actual, value),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ),
                CmpOp::In => value
                    .as_array()
                    .map_or(false, |set| set.iter().any(|v| value_eq(actual, v))),
                CmpOp::Like => match (actual.as_str(), value.as_str()) {
                    (Some(text), Some(pattern)) => like_match(text, pattern),
                    _ => false,
                },
            }
        }
        Filter::And { clauses } => clauses.iter().all(|c| eval_filter(c, row)),
        Filter::Or { clauses } => clauses.iter().any(|c| eval_filter(c, row)),
        Filter::Not { clause } => !eval_filter(clause, row),
    }
}

/// Equality that treats 5 and 5.0 as equal.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    if let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) {
        return Some(x.cmp(&y));
    }
    None
}

fn compare_rows(a: &JsonMap, b: &JsonMap, terms: &[OrderBy]) -> std::cmp::Ordering {
    for term in terms {
        let left = a.get(&term.field).unwrap_or(&Value::Null);
        let right = b.get(&term.field).unwrap_or(&Value::Null);
        let ord = value_cmp(left, right).unwrap_or(std::cmp::Ordering::Equal);
        let ord = match term.dir {
            OrderDir::Asc => ord,
            OrderDir::Desc => ord.reverse(),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// `%`-wildcard matching: segments between wildcards must appear in order.
fn like_match(text: &str, pattern: &str) -> bool {
    if !pattern.contains('%') {
        return text == pattern;
    }
    let parts: Vec<&str> = pattern.split('%').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !text.starts_with(first) {
        return false;
    }
    let mut pos = first.len();

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(i) => pos = pos + i + part.len(),
            None => return false,
        }
    }

    if last.is_empty() {
        return true;
    }
    text.len() >= pos + last.len() && text.ends_with(last)
}

/// Fixed field shapes for a known set of entities.
#[derive(Default)]
pub struct StaticRegistry {
    entities: HashMap<String, BTreeMap<String, FieldKind>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity with its fields. An `id` text field is implied.
    pub fn with_entity(
        mut self,
        entity: impl Into<String>,
        fields: Vec<(&str, FieldKind)>,
    ) -> Self {
        let mut map: BTreeMap<String, FieldKind> = fields
            .into_iter()
            .map(|(name, kind)| (name.to_string(), kind))
            .collect();
        map.entry("id".to_string()).or_insert(FieldKind::Text);
        self.entities.insert(entity.into(), map);
        self
    }
}

impl ModelRegistry for StaticRegistry {
    fn fields_for(&self, entity: &str) -> Result<BTreeMap<String, FieldKind>, Error> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("unknown entity: {entity}")))
    }
}
