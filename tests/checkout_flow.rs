//! End-to-end checkout scenarios over the in-process store backends.

use std::sync::Arc;

use chrono::Utc;

use flashsale::error::CheckoutError;
use flashsale::model::{HoldStatus, IdempotencyStatus, OrderState, WebhookStatus};
use flashsale::services::{WebhookOutcome, WebhookRequest};
use flashsale::store::{keys, DurableStore, FastStore, MemDb, MemoryStore};
use flashsale::{CheckoutApp, Config};

fn test_config() -> Config {
    Config {
        // Tight backoff keeps contention tests fast; extra attempts keep
        // the optimistic path from ever spilling into the fallback.
        retry_backoff_ms: 1,
        retry_max_attempts: 12,
        ..Config::default()
    }
}

async fn app_with_stock(stock: i64) -> (CheckoutApp, Arc<MemoryStore>, Arc<MemDb>) {
    let (app, fast, db) = CheckoutApp::in_process(test_config());
    db.put_product(1, "limited-sneaker", 19_900, stock).await;
    (app, fast, db)
}

fn webhook(key: &str, order_id: i64, status: WebhookStatus) -> WebhookRequest {
    WebhookRequest {
        idempotency_key: key.to_string(),
        order_id,
        status,
    }
}

/// Force a hold's deadline into the past, as if wall-clock time had moved
/// on, so the reaper and the expiry gates see it as stale.
async fn age_out_hold(fast: &MemoryStore, hold_id: &str, product_id: i64) {
    let past = Utc::now().timestamp() - 10;
    fast.hash_set_multi(
        &keys::hold(hold_id),
        &[("expires_at_epoch".into(), past.to_string())],
    )
    .await
    .unwrap();
    fast.sorted_set_add(&keys::expiring_index(product_id), hold_id, past)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_purchase_funnel_success() {
    let (app, _fast, db) = app_with_stock(10).await;

    let created = app.holds.create(1, 2).await.unwrap();
    assert_eq!(created.snapshot.available, 8);
    assert_eq!(created.snapshot.reserved, 2);

    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();
    assert_eq!(order.state, OrderState::PendingPayment);

    let outcome = app
        .webhooks
        .apply(&webhook("k-1", order.order_id, WebhookStatus::Success))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            order_state: OrderState::Paid
        }
    );

    // The units are consumed: durable stock shrank, the reservation is
    // gone, availability is unchanged.
    assert_eq!(db.product(1).await.unwrap().unwrap().stock, 8);
    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 8);
    assert_eq!(snap.reserved, 0);
    assert!(app.holds.get(&created.hold_id).await.unwrap().is_none());
    assert_eq!(
        db.order(order.order_id).await.unwrap().unwrap().state,
        OrderState::Paid
    );
    assert_eq!(db.hold_row(&created.hold_id).await.unwrap().outcome, "used");
}

#[tokio::test]
async fn test_failure_webhook_refunds_reservation() {
    let (app, _fast, db) = app_with_stock(10).await;

    let created = app.holds.create(1, 3).await.unwrap();
    assert_eq!(created.snapshot.available, 7);
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();

    let outcome = app
        .webhooks
        .apply(&webhook("k-fail", order.order_id, WebhookStatus::Failure))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            order_state: OrderState::Cancelled
        }
    );

    // Order cancelled, hold deleted, stock fully restored, durable stock
    // untouched.
    assert_eq!(
        db.order(order.order_id).await.unwrap().unwrap().state,
        OrderState::Cancelled
    );
    assert!(app.holds.get(&created.hold_id).await.unwrap().is_none());
    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 10);
    assert_eq!(snap.reserved, 0);
    assert_eq!(db.product(1).await.unwrap().unwrap().stock, 10);
    assert_eq!(
        db.hold_row(&created.hold_id).await.unwrap().outcome,
        "payment_failed"
    );
}

#[tokio::test]
async fn test_webhook_is_idempotent_per_key() {
    let (app, _fast, db) = app_with_stock(10).await;

    let created = app.holds.create(1, 2).await.unwrap();
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();

    let request = webhook("k-dup", order.order_id, WebhookStatus::Success);
    let first = app.webhooks.apply(&request).await.unwrap();
    assert_eq!(
        first,
        WebhookOutcome::Applied {
            order_state: OrderState::Paid
        }
    );

    // Retries with the same key: no further mutations, recorded state
    // returned. The order is already finalized, so the short-circuit
    // answers before the key is even consulted.
    for _ in 0..2 {
        let retry = app.webhooks.apply(&request).await.unwrap();
        assert_eq!(
            retry,
            WebhookOutcome::AlreadyFinalized {
                order_state: OrderState::Paid
            }
        );
    }

    assert_eq!(db.idempotency_row_count().await, 1);
    assert_eq!(db.product(1).await.unwrap().unwrap().stock, 8);
    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 8);
    assert_eq!(snap.reserved, 0);
}

#[tokio::test]
async fn test_success_webhook_after_reap_returns_hold_gone() {
    let (app, fast, db) = app_with_stock(10).await;

    let created = app.holds.create(1, 2).await.unwrap();
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();

    // The hold ages out and the reaper sweeps it before the processor
    // answers.
    age_out_hold(&fast, &created.hold_id, 1).await;
    let report = app.reaper.run_once().await.unwrap();
    assert_eq!(report.expired, 1);

    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 10);
    assert_eq!(snap.reserved, 0);

    let outcome = app
        .webhooks
        .apply(&webhook("k-late", order.order_id, WebhookStatus::Success))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::HoldGone {
            order_state: OrderState::Cancelled
        }
    );
    assert_eq!(
        db.order(order.order_id).await.unwrap().unwrap().state,
        OrderState::Cancelled
    );
    // Durable stock was never decremented.
    assert_eq!(db.product(1).await.unwrap().unwrap().stock, 10);
}

#[tokio::test]
async fn test_paid_order_then_contradicting_failure_webhook() {
    let (app, _fast, db) = app_with_stock(10).await;

    let created = app.holds.create(1, 2).await.unwrap();
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();

    app.webhooks
        .apply(&webhook("k-pay", order.order_id, WebhookStatus::Success))
        .await
        .unwrap();

    // A failure verdict with a fresh key arrives after finalization: no
    // mutations, but the delivery is still recorded for audit.
    let outcome = app
        .webhooks
        .apply(&webhook("k-contra", order.order_id, WebhookStatus::Failure))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::AlreadyFinalized {
            order_state: OrderState::Paid
        }
    );
    assert_eq!(db.idempotency_row_count().await, 2);
    assert_eq!(db.product(1).await.unwrap().unwrap().stock, 8);
    assert_eq!(
        db.order(order.order_id).await.unwrap().unwrap().state,
        OrderState::Paid
    );
}

#[tokio::test]
async fn test_webhook_for_unknown_order_is_not_found() {
    let (app, _fast, _db) = app_with_stock(10).await;
    match app
        .webhooks
        .apply(&webhook("k-404", 999, WebhookStatus::Success))
        .await
    {
        Err(CheckoutError::OrderNotFound { order_id: 999 }) => {}
        other => panic!("expected OrderNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_order_creation_rejects_expired_hold_and_refunds() {
    let (app, fast, _db) = app_with_stock(10).await;

    let created = app.holds.create(1, 4).await.unwrap();
    age_out_hold(&fast, &created.hold_id, 1).await;

    // Stale-active holds are expired in-line during validation.
    match app.orders.create_from_hold(&created.hold_id).await {
        Err(CheckoutError::HoldExpired { .. }) => {}
        other => panic!("expected HoldExpired, got {other:?}"),
    }
    let snap = app.ledger.snapshot(1).await.unwrap();
    assert_eq!(snap.available, 10);
    assert_eq!(snap.reserved, 0);
    assert!(app.holds.get(&created.hold_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_order_creation_just_before_expiry_then_late_success() {
    let (app, _fast, db) = app_with_stock(10).await;

    // Order lands while the hold is live; the success webhook arrives
    // after the deadline but before the reaper, and still commits (the
    // hold is only consumed now).
    let created = app.holds.create(1, 2).await.unwrap();
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();

    let fast = app.fast.clone();
    let past = Utc::now().timestamp() - 1;
    fast.hash_set_multi(
        &keys::hold(&created.hold_id),
        &[("expires_at_epoch".into(), past.to_string())],
    )
    .await
    .unwrap();

    let outcome = app
        .webhooks
        .apply(&webhook("k-late-ok", order.order_id, WebhookStatus::Success))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            order_state: OrderState::Paid
        }
    );
    assert_eq!(db.product(1).await.unwrap().unwrap().stock, 8);
}

#[tokio::test]
async fn test_create_then_release_restores_snapshot() {
    let (app, _fast, _db) = app_with_stock(10).await;

    let before = app.ledger.snapshot(1).await.unwrap();
    let created = app.holds.create(1, 5).await.unwrap();
    app.holds.release(&created.hold_id).await.unwrap();
    let after = app.ledger.snapshot(1).await.unwrap();

    assert_eq!(after.available, before.available);
    assert_eq!(after.reserved, before.reserved);
    // Modulo the version bumps of the two mutations.
    assert_eq!(after.version, before.version + 2);
}

#[tokio::test]
async fn test_used_hold_cannot_back_a_second_order() {
    let (app, _fast, _db) = app_with_stock(10).await;

    let created = app.holds.create(1, 1).await.unwrap();
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();
    app.webhooks
        .apply(&webhook("k-used", order.order_id, WebhookStatus::Success))
        .await
        .unwrap();

    // The hold is gone after payment; a second order attempt 404s.
    match app.orders.create_from_hold(&created.hold_id).await {
        Err(CheckoutError::HoldNotFound { .. }) => {}
        other => panic!("expected HoldNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hold_view_normalizes_numeric_fields() {
    let (app, _fast, _db) = app_with_stock(10).await;
    let created = app.holds.create(1, 7).await.unwrap();

    let hold = app.holds.get(&created.hold_id).await.unwrap().unwrap();
    assert_eq!(hold.product_id, 1);
    assert_eq!(hold.qty, 7);
    assert_eq!(hold.status, HoldStatus::Active);
    assert_eq!(hold.expires_at_epoch, created.expires_at.timestamp());
}

#[tokio::test]
async fn test_conflicting_verdict_on_pending_order_records_key() {
    let (app, fast, db) = app_with_stock(10).await;

    let created = app.holds.create(1, 2).await.unwrap();
    let order = app.orders.create_from_hold(&created.hold_id).await.unwrap();

    // Paint the hold as used without touching the order: the failure
    // verdict now contradicts the hold's payment state.
    fast.hash_set_multi(
        &keys::hold(&created.hold_id),
        &[("status".into(), "used".into())],
    )
    .await
    .unwrap();

    let outcome = app
        .webhooks
        .apply(&webhook("k-conf", order.order_id, WebhookStatus::Failure))
        .await
        .unwrap();
    match &outcome {
        WebhookOutcome::Conflict { order_state, .. } => {
            assert_eq!(*order_state, OrderState::PendingPayment)
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert_eq!(outcome.status_class(), 409);
    // The delivery that did not apply is still on the audit log, and a
    // replay of the same key is answered from it.
    assert_eq!(db.idempotency_row_count().await, 1);
    let replay = app
        .webhooks
        .apply(&webhook("k-conf", order.order_id, WebhookStatus::Failure))
        .await
        .unwrap();
    assert_eq!(
        replay,
        WebhookOutcome::Duplicate {
            order_state: OrderState::PendingPayment,
            recorded: IdempotencyStatus::Failed
        }
    );
}
