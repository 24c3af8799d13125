//! Batch Execution and Compensating Rollback
//!
//! Demonstrates the write side of the client:
//!
//! 1. Submit a bulk create through the chunked batch executor
//! 2. Watch partial failure isolation keep healthy items alive
//! 3. Run a multi-step transaction and roll it back
//!
//! Run with: cargo run --example batch_and_rollback

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use ballast::{BatchJob, Client, Config, Error, FieldKind, InMemoryTransport, StaticRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let transport = Arc::new(InMemoryTransport::new());
    transport.seed(
        "invoice",
        vec![json!({"id": "seed", "amount": 10.0, "state": "open"})],
    );
    let registry = Arc::new(StaticRegistry::new().with_entity(
        "invoice",
        vec![("amount", FieldKind::Float), ("state", FieldKind::Text)],
    ));
    let client = Client::new(transport.clone(), registry, Config::default());

    // =========================================================================
    // Step 1: Bulk create with chunking and bounded concurrency
    // =========================================================================

    let payloads: Vec<_> = (1..=25)
        .map(|i| json!({"amount": f64::from(i) * 10.0, "state": "draft"}))
        .collect();
    let report = client.submit_batch(BatchJob::creates("invoice", payloads)).await;
    println!(
        "Bulk create: {} succeeded, {} failed, {:?} elapsed",
        report.succeeded(),
        report.failed(),
        report.elapsed
    );

    // =========================================================================
    // Step 2: Partial failure stays partial
    // =========================================================================
    // Poison one record; the rest of the batch is unaffected and every
    // outcome stays at its input index.

    transport.fail_matching("\"seed\"", Error::Permission("record locked".into()));
    let job = BatchJob::deletes("invoice", vec!["seed".into(), "1".into(), "2".into()]);
    let report = client.submit_batch(job).await;
    for (i, outcome) in report.outcomes.iter().enumerate() {
        match outcome {
            Ok(_) => println!("   item {i}: deleted"),
            Err(err) => println!("   item {i}: {err}"),
        }
    }
    transport.clear_failures();

    // =========================================================================
    // Step 3: Transaction with automatic rollback
    // =========================================================================
    // The scope fails after two applied writes; both are compensated in
    // reverse order and the original error comes back wrapped.

    let rows_before = transport.row_count("invoice");
    let result: Result<(), Error> = client
        .run_transaction(|tx| {
            Box::pin(async move {
                let id = tx.create("invoice", json!({"amount": 1.0, "state": "draft"})).await?;
                tx.update("invoice", &id, json!({"state": "posted"})).await?;
                Err(Error::server("downstream rejected the posting", None))
            })
        })
        .await;

    match result {
        Err(Error::Aborted { source, rollback }) => {
            println!("\nTransaction aborted: {source}");
            println!("Rollback: {rollback}");
        }
        other => println!("\nUnexpected outcome: {other:?}"),
    }
    assert_eq!(transport.row_count("invoice"), rows_before);
    println!("Row count unchanged: {rows_before}");

    client.close();
    Ok(())
}
