//! Transport and model-registry interfaces for ballast.
//!
//! The resilience layer consumes the remote service through two narrow
//! seams:
//!
//! - [`Transport`]: perform one named remote call with parameters, returning
//!   structured data or a classified failure. The layer never inspects
//!   transport specifics beyond the [`ballast_types::Error`] classification.
//! - [`ModelRegistry`]: map an entity name to its field shape, used to
//!   validate filters and field selections before dispatch and to shape
//!   returned records.
//!
//! The [`memory`] module provides an in-memory implementation of both,
//! used by unit tests, the integration suite, and the runnable demos.
//!
//! # Example
//!
//! ```ignore
//! use ballast_transport::{InMemoryTransport, StaticRegistry, FieldKind, Transport};
//!
//! let transport = InMemoryTransport::new();
//! transport.seed("invoice", vec![serde_json::json!({"id": "1", "amount": 10})]);
//!
//! let rows = transport.call("invoice", "search_read", serde_json::json!({})).await?;
//! ```

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ballast_types::Error;

pub use memory::{InMemoryTransport, StaticRegistry};

/// Shape of one field as reported by the model registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    /// Structured data with no client-side shape.
    Json,
    /// To-one relationship to the named entity.
    Ref(String),
    /// To-many relationship to the named entity.
    RefList(String),
}

impl FieldKind {
    /// Whether this field points at other records.
    pub fn is_relation(&self) -> bool {
        matches!(self, FieldKind::Ref(_) | FieldKind::RefList(_))
    }

    /// The related entity name, for relationship fields.
    pub fn related_entity(&self) -> Option<&str> {
        match self {
            FieldKind::Ref(e) | FieldKind::RefList(e) => Some(e),
            _ => None,
        }
    }
}

/// A transport capable of performing one named remote call.
///
/// Failures must use the classified [`Error`] taxonomy (network, timeout,
/// authentication, validation, permission, server) so the retry layer can
/// tell transient from terminal without inspecting transport details.
///
/// Write deduplication: the resilience layer attaches a client-generated
/// `_idempotency_token` param to write calls. Transports for services that
/// support idempotency keys should forward it so a retried write is not
/// double-applied; transports that cannot must document the exposure.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, entity: &str, method: &str, params: Value) -> Result<Value, Error>;
}

/// Field shapes for remote entities.
pub trait ModelRegistry: Send + Sync {
    /// The field map for `entity`, or a validation error when the entity is
    /// unknown.
    fn fields_for(&self, entity: &str) -> Result<BTreeMap<String, FieldKind>, Error>;
}
