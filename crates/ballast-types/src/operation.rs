//! Immutable operation descriptions and composable filters.
//!
//! An [`Operation`] captures everything about a requested remote action:
//! kind, target entity, filter, field selection, ordering, pagination, and
//! (for writes) the payload or target ids. Operations are built by the query
//! builder and the batch/transaction helpers, never mutated afterwards.
//!
//! Filters form a small algebra: atomic comparisons combined with AND/OR/NOT.
//! Same-kind groups are flattened at construction so composition is
//! associative and two equivalent chains canonicalize to the same shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::key::CacheKey;

/// The kind of remote action an operation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Read,
    Create,
    Update,
    Delete,
    Call,
}

impl OpKind {
    /// Whether this kind mutates remote state.
    pub fn is_write(&self) -> bool {
        matches!(self, OpKind::Create | OpKind::Update | OpKind::Delete)
    }

    /// The well-known transport method name for this kind.
    ///
    /// `Call` operations carry their own method name in
    /// [`Operation::method`].
    pub fn wire_method(&self) -> &'static str {
        match self {
            OpKind::Read => "search_read",
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Call => "call",
        }
    }
}

/// Comparison operator for an atomic filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Membership test; the value must be a JSON array.
    In,
    /// Pattern match with `%` wildcards; text fields only.
    Like,
}

/// A composable filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Cmp {
        field: String,
        cmp: CmpOp,
        value: Value,
    },
    And { clauses: Vec<Filter> },
    Or { clauses: Vec<Filter> },
    Not { clause: Box<Filter> },
}

impl Filter {
    fn cmp(field: impl Into<String>, cmp: CmpOp, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            field: field.into(),
            cmp,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Ge, value)
    }

    /// Membership test against a list of values.
    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: Vec<V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::cmp(field, CmpOp::In, Value::Array(values))
    }

    /// Pattern match with `%` wildcards (e.g. `"foo%"`).
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::cmp(field, CmpOp::Like, Value::String(pattern.into()))
    }

    /// Combine with another filter under AND, flattening nested ANDs so
    /// `a.and_with(b).and_with(c)` and `a.and_with(b.and_with(c))` produce
    /// the same canonical shape.
    pub fn and_with(self, other: Filter) -> Filter {
        let mut clauses = match self {
            Filter::And { clauses } => clauses,
            f => vec![f],
        };
        match other {
            Filter::And { clauses: more } => clauses.extend(more),
            f => clauses.push(f),
        }
        Filter::And { clauses }
    }

    /// Combine with another filter under OR, flattening nested ORs.
    pub fn or_with(self, other: Filter) -> Filter {
        let mut clauses = match self {
            Filter::Or { clauses } => clauses,
            f => vec![f],
        };
        match other {
            Filter::Or { clauses: more } => clauses.extend(more),
            f => clauses.push(f),
        }
        Filter::Or { clauses }
    }

    /// Negate this filter.
    pub fn negate(self) -> Filter {
        Filter::Not {
            clause: Box::new(self),
        }
    }

    /// Visit every field name referenced by this filter.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Filter::Cmp { field, .. } => out.push(field.clone()),
            Filter::And { clauses } | Filter::Or { clauses } => {
                for c in clauses {
                    c.referenced_fields(out);
                }
            }
            Filter::Not { clause } => clause.referenced_fields(out),
        }
    }
}

/// Sort direction for one ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDir {
    Asc,
    Desc,
}

/// One ordering term: field plus direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub dir: OrderDir,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            dir: OrderDir::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            dir: OrderDir::Desc,
        }
    }
}

/// An immutable description of a requested remote action.
///
/// Built incrementally by the query builder (reads) or the batch/transaction
/// helpers (writes); once handed to an executor it is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub entity: String,

    /// Row filter (reads, and filtered bulk writes).
    pub filter: Option<Filter>,

    /// Explicit target record ids (update/delete).
    pub target_ids: Vec<String>,

    /// Write payload (create/update) or call params.
    pub payload: Option<Value>,

    /// Field selection; empty means the remote default field set.
    pub fields: Vec<String>,

    pub order: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,

    /// Method name for `Call` operations.
    pub method: Option<String>,
}

impl Operation {
    /// A read over `entity` with no constraints.
    pub fn read(entity: impl Into<String>) -> Self {
        Self::bare(OpKind::Read, entity)
    }

    /// A create carrying `payload`.
    pub fn create(entity: impl Into<String>, payload: Value) -> Self {
        let mut op = Self::bare(OpKind::Create, entity);
        op.payload = Some(payload);
        op
    }

    /// An update of one record.
    pub fn update(entity: impl Into<String>, id: impl Into<String>, changes: Value) -> Self {
        let mut op = Self::bare(OpKind::Update, entity);
        op.target_ids = vec![id.into()];
        op.payload = Some(changes);
        op
    }

    /// A delete of one record.
    pub fn delete(entity: impl Into<String>, id: impl Into<String>) -> Self {
        let mut op = Self::bare(OpKind::Delete, entity);
        op.target_ids = vec![id.into()];
        op
    }

    /// A named pass-through call.
    pub fn call(entity: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        let mut op = Self::bare(OpKind::Call, entity);
        op.method = Some(method.into());
        op.payload = Some(params);
        op
    }

    fn bare(kind: OpKind, entity: impl Into<String>) -> Self {
        Operation {
            kind,
            entity: entity.into(),
            filter: None,
            target_ids: Vec::new(),
            payload: None,
            fields: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            method: None,
        }
    }

    /// The transport method name this operation dispatches to.
    ///
    /// Reads default to `search_read` but may carry an override (`count`);
    /// `Call` operations always use their own method name.
    pub fn wire_method(&self) -> &str {
        match (&self.kind, &self.method) {
            (OpKind::Call | OpKind::Read, Some(m)) => m.as_str(),
            (kind, _) => kind.wire_method(),
        }
    }

    /// Encode the operation's semantic content as transport params.
    ///
    /// This is the single canonical encoding used by the read path, the
    /// batch executor, and the transaction manager, so the in-memory
    /// transport and any real transport see one wire shape.
    pub fn wire_params(&self) -> Value {
        self.wire_params_with_token(None)
    }

    /// Like [`Operation::wire_params`], with a client-generated idempotency
    /// token attached for writes the transport can deduplicate.
    pub fn wire_params_with_token(&self, token: Option<&str>) -> Value {
        let mut params = serde_json::Map::new();
        if let Some(filter) = &self.filter {
            params.insert(
                "filter".to_string(),
                serde_json::to_value(filter).unwrap_or(Value::Null),
            );
        }
        if !self.target_ids.is_empty() {
            params.insert(
                "ids".to_string(),
                Value::Array(
                    self.target_ids
                        .iter()
                        .map(|id| Value::String(id.clone()))
                        .collect(),
                ),
            );
        }
        if let Some(payload) = &self.payload {
            params.insert("payload".to_string(), payload.clone());
        }
        if !self.fields.is_empty() {
            params.insert(
                "fields".to_string(),
                Value::Array(
                    self.fields
                        .iter()
                        .map(|f| Value::String(f.clone()))
                        .collect(),
                ),
            );
        }
        if !self.order.is_empty() {
            params.insert(
                "order".to_string(),
                serde_json::to_value(&self.order).unwrap_or(Value::Null),
            );
        }
        if let Some(limit) = self.limit {
            params.insert("limit".to_string(), Value::from(limit));
        }
        if let Some(offset) = self.offset {
            params.insert("offset".to_string(), Value::from(offset));
        }
        if let Some(token) = token {
            params.insert(
                "_idempotency_token".to_string(),
                Value::String(token.to_string()),
            );
        }
        Value::Object(params)
    }

    /// Derive the deterministic cache key for this operation.
    ///
    /// The key is a pure function of semantic content: kind, entity, filter,
    /// field selection (order-insensitive), ordering, pagination, and method.
    /// Two independently built chains with the same meaning hash identically;
    /// `serde_json` keeps object keys sorted, so the JSON rendering is
    /// canonical.
    pub fn cache_key(&self) -> CacheKey {
        let mut fields = self.fields.clone();
        fields.sort();

        let canonical = serde_json::json!({
            "kind": self.kind,
            "entity": self.entity,
            "filter": self.filter,
            "ids": self.target_ids,
            "fields": fields,
            "order": self.order,
            "limit": self.limit,
            "offset": self.offset,
            "method": self.method,
        });

        let digest = Sha256::digest(canonical.to_string().as_bytes());
        CacheKey {
            entity: self.entity.clone(),
            digest: hex::encode(digest),
        }
    }
}
