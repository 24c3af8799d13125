//! Operation validation and record shaping.
//!
//! Validation runs against the model registry's field map before any remote
//! call: unknown fields and operator/kind mismatches fail fast with a
//! validation error. Shaping turns raw transport JSON into [`Record`]s with
//! tagged values; relationship fields become [`LazyRef`] placeholders.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use ballast_transport::FieldKind;
use ballast_types::{CmpOp, Error, FieldValue, Filter, LazyRef, Operation, Record};

/// Validate a read operation against the entity's field map.
pub fn validate_read(fields: &BTreeMap<String, FieldKind>, op: &Operation) -> Result<(), Error> {
    if let Some(filter) = &op.filter {
        validate_filter(fields, &op.entity, filter)?;
    }
    for field in &op.fields {
        if !fields.contains_key(field) {
            return Err(unknown_field(&op.entity, field));
        }
    }
    for term in &op.order {
        if !fields.contains_key(&term.field) {
            return Err(unknown_field(&op.entity, &term.field));
        }
    }
    Ok(())
}

/// Validate that each eager field is a relationship.
pub fn validate_eager(
    fields: &BTreeMap<String, FieldKind>,
    entity: &str,
    eager: &[String],
) -> Result<(), Error> {
    for field in eager {
        match fields.get(field) {
            None => return Err(unknown_field(entity, field)),
            Some(kind) if !kind.is_relation() => {
                return Err(Error::Validation(format!(
                    "{entity}.{field} is not a relationship field"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn validate_filter(
    fields: &BTreeMap<String, FieldKind>,
    entity: &str,
    filter: &Filter,
) -> Result<(), Error> {
    match filter {
        Filter::Cmp { field, cmp, value } => {
            let kind = fields
                .get(field)
                .ok_or_else(|| unknown_field(entity, field))?;
            match cmp {
                CmpOp::Like => {
                    if !matches!(kind, FieldKind::Text) {
                        return Err(Error::Validation(format!(
                            "like requires a text field, {entity}.{field} is {kind:?}"
                        )));
                    }
                }
                CmpOp::In => {
                    if !value.is_array() {
                        return Err(Error::Validation(format!(
                            "in requires an array value for {entity}.{field}"
                        )));
                    }
                }
                CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                    if !matches!(kind, FieldKind::Int | FieldKind::Float | FieldKind::Text) {
                        return Err(Error::Validation(format!(
                            "ordering comparison not supported on {entity}.{field} ({kind:?})"
                        )));
                    }
                }
                CmpOp::Eq | CmpOp::Ne => {}
            }
            Ok(())
        }
        Filter::And { clauses } | Filter::Or { clauses } => {
            for clause in clauses {
                validate_filter(fields, entity, clause)?;
            }
            Ok(())
        }
        Filter::Not { clause } => validate_filter(fields, entity, clause),
    }
}

fn unknown_field(entity: &str, field: &str) -> Error {
    Error::Validation(format!("unknown field: {entity}.{field}"))
}

/// Shape a transport response (array of JSON objects) into records.
pub fn shape_records(
    entity: &str,
    fields: &BTreeMap<String, FieldKind>,
    raw: Value,
) -> Result<Vec<Record>, Error> {
    let Value::Array(rows) = raw else {
        return Err(malformed(entity, "response is not an array"));
    };
    rows.into_iter()
        .map(|row| shape_record(entity, fields, row))
        .collect()
}

/// Shape one JSON object into a record.
pub fn shape_record(
    entity: &str,
    fields: &BTreeMap<String, FieldKind>,
    raw: Value,
) -> Result<Record, Error> {
    let Value::Object(obj) = raw else {
        return Err(malformed(entity, "row is not an object"));
    };
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(entity, "row is missing a string id"))?
        .to_string();

    let mut record = Record::new(entity, id);
    for (name, value) in obj {
        if name == "id" {
            continue;
        }
        let Some(kind) = fields.get(&name) else {
            // The remote shape evolved past the registry; ignore the field.
            debug!(entity, field = %name, "dropping field unknown to the registry");
            continue;
        };
        record.set(name.clone(), shape_value(entity, &name, kind, value)?);
    }
    Ok(record)
}

fn shape_value(
    entity: &str,
    field: &str,
    kind: &FieldKind,
    value: Value,
) -> Result<FieldValue, Error> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    match kind {
        FieldKind::Bool => value
            .as_bool()
            .map(FieldValue::Bool)
            .ok_or_else(|| mismatch(entity, field, "bool", &value)),
        FieldKind::Int => value
            .as_i64()
            .map(FieldValue::Int)
            .ok_or_else(|| mismatch(entity, field, "int", &value)),
        FieldKind::Float => value
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| mismatch(entity, field, "float", &value)),
        FieldKind::Text => value
            .as_str()
            .map(|s| FieldValue::Text(s.to_string()))
            .ok_or_else(|| mismatch(entity, field, "text", &value)),
        FieldKind::Json => Ok(FieldValue::Json(value)),
        FieldKind::Ref(target) => value
            .as_str()
            .map(|id| FieldValue::Ref(LazyRef::one(target.clone(), id)))
            .ok_or_else(|| mismatch(entity, field, "reference id", &value)),
        FieldKind::RefList(target) => {
            let ids: Option<Vec<String>> = value.as_array().map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });
            match ids {
                Some(ids) => Ok(FieldValue::RefList(LazyRef::many(target.clone(), ids))),
                None => Err(mismatch(entity, field, "reference id list", &value)),
            }
        }
    }
}

fn malformed(entity: &str, detail: &str) -> Error {
    Error::server(format!("malformed response for {entity}: {detail}"), None)
}

fn mismatch(entity: &str, field: &str, expected: &str, got: &Value) -> Error {
    Error::server(
        format!("malformed response for {entity}.{field}: expected {expected}, got {got}"),
        None,
    )
}
