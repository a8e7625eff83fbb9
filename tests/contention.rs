//! Stock-correctness invariants under concurrent hold creation.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;

use flashsale::error::CheckoutError;
use flashsale::inventory::CreatedHold;
use flashsale::store::MemDb;
use flashsale::{CheckoutApp, Config};

fn test_config() -> Config {
    Config {
        retry_backoff_ms: 1,
        retry_max_attempts: 12,
        ..Config::default()
    }
}

async fn app_with_stock(stock: i64) -> (Arc<CheckoutApp>, Arc<MemDb>) {
    let (app, _fast, db) = CheckoutApp::in_process(test_config());
    db.put_product(1, "limited-sneaker", 19_900, stock).await;
    (Arc::new(app), db)
}

async fn fire_concurrent_creates(
    app: &Arc<CheckoutApp>,
    requests: usize,
    qty: i64,
) -> (Vec<CreatedHold>, usize) {
    let tasks: Vec<_> = (0..requests)
        .map(|_| {
            let holds = app.holds.clone();
            tokio::spawn(async move { holds.create(1, qty).await })
        })
        .collect();

    let mut created = Vec::new();
    let mut rejected = 0usize;
    for result in join_all(tasks).await {
        match result.expect("create task panicked") {
            Ok(hold) => created.push(hold),
            Err(CheckoutError::InsufficientStock { .. }) => rejected += 1,
            Err(other) => panic!("unexpected create failure: {other:?}"),
        }
    }
    (created, rejected)
}

#[tokio::test]
async fn test_single_unit_contention() {
    let (app, _db) = app_with_stock(1).await;

    let (created, rejected) = fire_concurrent_creates(&app, 100, 1).await;
    assert_eq!(created.len(), 1);
    assert_eq!(rejected, 99);

    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 0);
    assert_eq!(snap.reserved, 1);
}

#[tokio::test]
async fn test_oversell_stress() {
    let (app, _db) = app_with_stock(5).await;

    let (created, rejected) = fire_concurrent_creates(&app, 50, 1).await;
    assert_eq!(created.len(), 5);
    assert_eq!(rejected, 45);

    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 0);
    assert_eq!(snap.reserved, 5);
}

#[tokio::test]
async fn test_hold_ids_are_unique_under_contention() {
    let (app, _db) = app_with_stock(20).await;

    let (created, _) = fire_concurrent_creates(&app, 20, 1).await;
    let ids: HashSet<&str> = created.iter().map(|h| h.hold_id.as_str()).collect();
    assert_eq!(ids.len(), created.len());
}

#[tokio::test]
async fn test_reserved_never_exceeds_base_stock() {
    let (app, _db) = app_with_stock(7).await;

    let (created, _) = fire_concurrent_creates(&app, 30, 2).await;
    let total_reserved: i64 = created.iter().map(|h| h.qty).sum();
    assert!(total_reserved <= 7);

    let snap = app.ledger.snapshot(1).await.unwrap();
    assert!(snap.available >= 0);
    assert!(snap.reserved >= 0);
    assert_eq!(snap.reserved, total_reserved);
    assert_eq!(snap.available + snap.reserved, 7);
}

#[tokio::test]
async fn test_version_witnesses_every_mutation() {
    let (app, _db) = app_with_stock(10).await;

    let (created, _) = fire_concurrent_creates(&app, 10, 1).await;
    let snap = app.ledger.snapshot(1).await.unwrap();
    // Init set the version to 1; every successful creation bumped it once.
    assert_eq!(snap.version, 1 + created.len() as i64);

    let mut versions: Vec<i64> = created.iter().map(|h| h.snapshot.version).collect();
    versions.sort_unstable();
    versions.dedup();
    // No two commits share a version.
    assert_eq!(versions.len(), created.len());
}

#[tokio::test]
async fn test_concurrent_create_and_release_interleave_safely() {
    let (app, _db) = app_with_stock(10).await;

    // Seed ten holds, then concurrently release them while ten new
    // creations race for the freed units.
    let (seed, _) = fire_concurrent_creates(&app, 10, 1).await;
    assert_eq!(seed.len(), 10);

    let mut tasks = Vec::new();
    for hold in &seed {
        let holds = app.holds.clone();
        let id = hold.hold_id.clone();
        tasks.push(tokio::spawn(async move {
            holds.release(&id).await.map(|_| ()).map_err(|e| format!("{e:?}"))
        }));
    }
    for _ in 0..10 {
        let holds = app.holds.clone();
        tasks.push(tokio::spawn(async move {
            match holds.create(1, 1).await {
                Ok(_) | Err(CheckoutError::InsufficientStock { .. }) => Ok(()),
                Err(other) => Err(format!("{other:?}")),
            }
        }));
    }
    for result in join_all(tasks).await {
        result.expect("task panicked").expect("operation failed");
    }

    let snap = app.ledger.snapshot(1).await.unwrap();
    assert!(snap.available >= 0);
    assert!(snap.reserved >= 0);
    assert_eq!(snap.available + snap.reserved, 10);
}
