#![allow(dead_code)]

//! Shared fixtures for the integration suite: a small invoicing schema over
//! the in-memory transport, and a client tuned for fast tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ballast::{
    Backoff, BatchConfig, BreakerConfig, CacheConfig, CallCategory, Client, Config, FieldKind,
    InMemoryTransport, RetryPolicy, StaticRegistry,
};

pub fn registry() -> Arc<StaticRegistry> {
    Arc::new(
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
            .with_entity("tag", vec![("label", FieldKind::Text)]),
    )
}

pub fn seeded_transport() -> Arc<InMemoryTransport> {
    let transport = Arc::new(InMemoryTransport::new());
    transport.seed(
        "invoice",
        vec![
            json!({"id": "1", "amount": 10.0, "state": "open", "partner_id": "p1", "tag_ids": ["t1"]}),
            json!({"id": "2", "amount": 25.0, "state": "open", "partner_id": "p2", "tag_ids": []}),
            json!({"id": "3", "amount": 40.0, "state": "paid", "partner_id": "p1", "tag_ids": ["t1", "t2"]}),
        ],
    );
    transport.seed(
        "partner",
        vec![
            json!({"id": "p1", "name": "Acme"}),
            json!({"id": "p2", "name": "Globex"}),
        ],
    );
    transport.seed(
        "tag",
        vec![
            json!({"id": "t1", "label": "urgent"}),
            json!({"id": "t2", "label": "export"}),
        ],
    );
    transport
}

/// Tight timings so retry/breaker paths run in milliseconds.
pub fn fast_config() -> Config {
    Config {
        cache: CacheConfig {
            default_ttl: None,
            ..CacheConfig::default()
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
            attempt_timeout: None,
        },
        breaker: BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_millis(50),
        },
        batch: BatchConfig {
            chunk_size: 3,
            max_concurrency: 2,
            item_timeout: None,
            category: CallCategory::Write,
        },
    }
}

pub fn client_over(transport: Arc<InMemoryTransport>) -> Client {
    Client::new(transport, registry(), fast_config())
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
