//! Dynamically shaped records with tagged field values.
//!
//! Entity shapes are defined by the remote service and evolve independently
//! of this client, so records are a mapping from field name to a tagged
//! [`FieldValue`] validated against the model registry, not per-entity
//! generated structs. Record ids are strings for JSON compatibility.
//!
//! Relationship fields hold a [`LazyRef`] until explicitly resolved: a pure
//! deferred pointer (entity name plus ids), never a live object graph.
//! Resolution is routed through the query engine's batched prefetch path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A deferred pointer to one or more records of another entity.
///
/// Holds only the target entity name and the referenced ids; resolving the
/// pointer is a query-engine operation. Accessing a `LazyRef` one record at
/// a time costs one remote call each (the N+1 pattern); prefer the engine's
/// prefetch, which resolves the same relationship across a whole result set
/// in a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyRef {
    pub entity: String,
    pub ids: Vec<String>,
}

impl LazyRef {
    /// A reference to a single record.
    pub fn one(entity: impl Into<String>, id: impl Into<String>) -> Self {
        LazyRef {
            entity: entity.into(),
            ids: vec![id.into()],
        }
    }

    /// A reference to a list of records.
    pub fn many(entity: impl Into<String>, ids: Vec<String>) -> Self {
        LazyRef {
            entity: entity.into(),
            ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// The single referenced id, when exactly one is present.
    pub fn single_id(&self) -> Option<&str> {
        match self.ids.as_slice() {
            [id] => Some(id),
            _ => None,
        }
    }
}

/// A tagged field value.
///
/// `Ref`/`RefList` are unresolved relationship pointers; `Related`/
/// `RelatedList` are the same relationships after eager or prefetched
/// resolution (depth one: resolved children carry their own unresolved
/// refs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Structured data passed through unshaped.
    Json(Value),
    /// Unresolved to-one reference.
    Ref(LazyRef),
    /// Unresolved to-many reference.
    RefList(LazyRef),
    /// Resolved to-one reference.
    Related(Box<Record>),
    /// Resolved to-many reference.
    RelatedList(Vec<Record>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The unresolved reference, for `Ref` and `RefList` values.
    pub fn as_ref_value(&self) -> Option<&LazyRef> {
        match self {
            FieldValue::Ref(r) | FieldValue::RefList(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// A record fetched from (or destined for) the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Owning entity name.
    pub entity: String,
    /// Unique remote identifier.
    pub id: String,
    /// Field name to tagged value. BTreeMap keeps serialization canonical.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Record {
            entity: entity.into(),
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Builder-style field insertion, used heavily in tests.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_ref_single_id() {
        let one = LazyRef::one("partner", "7");
        assert_eq!(one.single_id(), Some("7"));
        assert_eq!(one.len(), 1);

        let many = LazyRef::many("tag", vec!["1".into(), "2".into()]);
        assert_eq!(many.single_id(), None);
        assert!(!many.is_empty());
    }

    #[test]
    fn test_field_value_accessors() {
        assert_eq!(FieldValue::Int(42).as_i64(), Some(42));
        assert_eq!(FieldValue::Int(42).as_f64(), Some(42.0));
        assert_eq!(FieldValue::Text("x".into()).as_str(), Some("x"));
        assert!(FieldValue::Null.is_null());

        let r = FieldValue::Ref(LazyRef::one("partner", "7"));
        assert_eq!(r.as_ref_value().unwrap().entity, "partner");
    }

    #[test]
    fn test_record_round_trip_serialization() {
        let rec = Record::new("invoice", "5")
            .with_field("amount", FieldValue::Float(12.5))
            .with_field("partner_id", FieldValue::Ref(LazyRef::one("partner", "7")));

        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
