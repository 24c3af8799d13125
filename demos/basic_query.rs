//! Basic Query - Your First Ballast Client
//!
//! Runs entirely locally against the in-memory transport - no remote
//! service required. It demonstrates the core read path:
//!
//! 1. Wire a client over a transport and model registry
//! 2. Build and execute a filtered query
//! 3. Watch the cache absorb repeated reads
//! 4. Resolve relationships with a single batched prefetch
//!
//! Run with: cargo run --example basic_query

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use ballast::{Client, Config, FieldKind, Filter, InMemoryTransport, OrderBy, StaticRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // =========================================================================
    // Step 1: Wire the client
    // =========================================================================
    // The transport and registry are the two external seams; everything else
    // (cache, retry, breaker, batch, transactions) is composed by Client::new.

    let transport = Arc::new(InMemoryTransport::new());
    transport.seed(
        "invoice",
        vec![
            json!({"id": "1", "amount": 120.0, "state": "open", "partner_id": "p1"}),
            json!({"id": "2", "amount": 80.0, "state": "open", "partner_id": "p2"}),
            json!({"id": "3", "amount": 45.0, "state": "paid", "partner_id": "p1"}),
        ],
    );
    transport.seed(
        "partner",
        vec![
            json!({"id": "p1", "name": "Acme"}),
            json!({"id": "p2", "name": "Globex"}),
        ],
    );

    let registry = Arc::new(
        StaticRegistry::new()
            .with_entity(
                "invoice",
                vec![
                    ("amount", FieldKind::Float),
                    ("state", FieldKind::Text),
                    ("partner_id", FieldKind::Ref("partner".into())),
                ],
            )
            .with_entity("partner", vec![("name", FieldKind::Text)]),
    );

    let client = Client::new(transport.clone(), registry, Config::default());

    // =========================================================================
    // Step 2: Query with filters and ordering
    // =========================================================================

    println!("Open invoices, largest first:");
    let open = client
        .query("invoice")
        .filter(Filter::eq("state", "open"))
        .order_by(OrderBy::desc("amount"))
        .all()
        .await?;
    for record in &open {
        println!("   invoice {} amount={:?}", record.id, record.get("amount"));
    }

    // =========================================================================
    // Step 3: Repeated reads are served from cache
    // =========================================================================

    for _ in 0..10 {
        client
            .query("invoice")
            .filter(Filter::eq("state", "open"))
            .order_by(OrderBy::desc("amount"))
            .all()
            .await?;
    }
    let metrics = client.cache_metrics();
    println!(
        "\nAfter 11 identical queries: {} remote call(s), {} cache hit(s)",
        transport.call_count("invoice", "search_read"),
        metrics.hits
    );

    // =========================================================================
    // Step 4: Resolve relationships without N+1 calls
    // =========================================================================
    // Three invoices reference two partners; prefetch fetches them all in
    // one remote call keyed by the distinct id set.

    let all = client.query("invoice").all().await?;
    let partners = client.engine().prefetch(&all, "partner_id").await?;
    println!(
        "\nPrefetched {} partner(s) in {} remote call(s)",
        partners.len(),
        transport.call_count("partner", "search_read"),
    );

    client.close();
    Ok(())
}
