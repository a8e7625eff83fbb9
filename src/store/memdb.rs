use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::DurableError;
use crate::model::{IdempotencyStatus, OrderState};

use super::durable::{
    DurableStore, DurableTxn, HoldRow, IdempotencyRecord, OrderRecord, ProductRow,
    HOLD_OUTCOME_ACTIVE,
};

#[derive(Default, Clone)]
struct DbInner {
    products: HashMap<i64, ProductRow>,
    orders: HashMap<i64, OrderRecord>,
    next_order_id: i64,
    idempotency: HashMap<String, IdempotencyRecord>,
    next_idempotency_id: i64,
    holds: HashMap<String, HoldRow>,
    heartbeats: HashMap<String, serde_json::Value>,
}

/// In-process [`DurableStore`] backend.
///
/// Transactions hold the single database mutex for their whole lifetime,
/// which makes them trivially serializable (and deadlock-free); mutations
/// are staged on a copy and only written back on commit. Fine for
/// single-process deployments and the test suite, not a scalability play.
#[derive(Default)]
pub struct MemDb {
    inner: Arc<Mutex<DbInner>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a product row; the catalog itself is outside the core, so this
    /// stands in for it in dev and test setups.
    pub async fn put_product(&self, id: i64, name: &str, price_cents: i64, stock: i64) {
        let now = Utc::now();
        self.inner.lock().await.products.insert(
            id,
            ProductRow {
                id,
                name: name.to_string(),
                price_cents,
                stock,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub async fn heartbeat(&self, component: &str) -> Option<serde_json::Value> {
        self.inner.lock().await.heartbeats.get(component).cloned()
    }

    pub async fn idempotency_row_count(&self) -> usize {
        self.inner.lock().await.idempotency.len()
    }

    pub async fn hold_row(&self, hold_id: &str) -> Option<HoldRow> {
        self.inner.lock().await.holds.get(hold_id).cloned()
    }
}

struct MemTxn {
    guard: OwnedMutexGuard<DbInner>,
    work: DbInner,
}

impl MemTxn {
    fn new(guard: OwnedMutexGuard<DbInner>) -> Self {
        let work = guard.clone();
        Self { guard, work }
    }
}

#[async_trait]
impl DurableTxn for MemTxn {
    async fn lock_order(&mut self, order_id: i64) -> Result<Option<OrderRecord>, DurableError> {
        Ok(self.work.orders.get(&order_id).cloned())
    }

    async fn lock_product(
        &mut self,
        product_id: i64,
    ) -> Result<Option<ProductRow>, DurableError> {
        Ok(self.work.products.get(&product_id).cloned())
    }

    async fn find_idempotency(
        &mut self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DurableError> {
        Ok(self.work.idempotency.get(key).cloned())
    }

    async fn insert_idempotency(
        &mut self,
        key: &str,
        order_id: i64,
        status: IdempotencyStatus,
    ) -> Result<(), DurableError> {
        if self.work.idempotency.contains_key(key) {
            return Err(DurableError::Corrupt(format!(
                "idempotency key `{key}` already claimed"
            )));
        }
        self.work.next_idempotency_id += 1;
        let now = Utc::now();
        self.work.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                id: self.work.next_idempotency_id,
                key: key.to_string(),
                order_id,
                status,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn set_order_state(
        &mut self,
        order_id: i64,
        state: OrderState,
    ) -> Result<(), DurableError> {
        match self.work.orders.get_mut(&order_id) {
            Some(order) => {
                order.state = state;
                order.updated_at = Utc::now();
                Ok(())
            }
            None => Err(DurableError::Corrupt(format!(
                "order {order_id} vanished mid-transaction"
            ))),
        }
    }

    async fn decrement_stock(
        &mut self,
        product_id: i64,
        qty: i64,
    ) -> Result<bool, DurableError> {
        match self.work.products.get_mut(&product_id) {
            Some(product) if product.stock >= qty => {
                product.stock -= qty;
                product.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn product_stock(&mut self, product_id: i64) -> Result<Option<i64>, DurableError> {
        Ok(self.work.products.get(&product_id).map(|p| p.stock))
    }

    async fn active_hold_qty(&mut self, product_id: i64) -> Result<i64, DurableError> {
        Ok(self
            .work
            .holds
            .values()
            .filter(|h| h.product_id == product_id && h.outcome == HOLD_OUTCOME_ACTIVE)
            .map(|h| h.qty)
            .sum())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DurableError> {
        *self.guard = std::mem::take(&mut self.work);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DurableError> {
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemDb {
    async fn product(&self, product_id: i64) -> Result<Option<ProductRow>, DurableError> {
        Ok(self.inner.lock().await.products.get(&product_id).cloned())
    }

    async fn insert_order(&self, hold_id: &str) -> Result<OrderRecord, DurableError> {
        let mut inner = self.inner.lock().await;
        inner.next_order_id += 1;
        let now = Utc::now();
        let order = OrderRecord {
            id: inner.next_order_id,
            hold_id: hold_id.to_string(),
            state: OrderState::PendingPayment,
            created_at: now,
            updated_at: now,
        };
        inner.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn order(&self, order_id: i64) -> Result<Option<OrderRecord>, DurableError> {
        Ok(self.inner.lock().await.orders.get(&order_id).cloned())
    }

    async fn insert_hold(&self, row: &HoldRow) -> Result<(), DurableError> {
        self.inner
            .lock()
            .await
            .holds
            .insert(row.hold_id.clone(), row.clone());
        Ok(())
    }

    async fn mark_hold(&self, hold_id: &str, outcome: &str) -> Result<(), DurableError> {
        if let Some(row) = self.inner.lock().await.holds.get_mut(hold_id) {
            row.outcome = outcome.to_string();
        }
        Ok(())
    }

    async fn active_holds_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<HoldRow>, DurableError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<HoldRow> = inner
            .holds
            .values()
            .filter(|h| h.product_id == product_id && h.outcome == HOLD_OUTCOME_ACTIVE)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn record_heartbeat(
        &self,
        component: &str,
        metadata: serde_json::Value,
    ) -> Result<(), DurableError> {
        self.inner
            .lock()
            .await
            .heartbeats
            .insert(component.to_string(), metadata);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn DurableTxn>, DurableError> {
        let guard = self.inner.clone().lock_owned().await;
        Ok(Box::new(MemTxn::new(guard)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let db = MemDb::new();
        db.put_product(1, "widget", 500, 10).await;

        let mut txn = db.begin().await.unwrap();
        assert!(txn.decrement_stock(1, 4).await.unwrap());
        txn.rollback().await.unwrap();

        assert_eq!(db.product(1).await.unwrap().unwrap().stock, 10);
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let db = MemDb::new();
        db.put_product(1, "widget", 500, 10).await;

        let mut txn = db.begin().await.unwrap();
        assert!(txn.decrement_stock(1, 4).await.unwrap());
        txn.commit().await.unwrap();

        assert_eq!(db.product(1).await.unwrap().unwrap().stock, 6);
    }

    #[tokio::test]
    async fn test_guarded_decrement_refuses_oversell() {
        let db = MemDb::new();
        db.put_product(1, "widget", 500, 3).await;

        let mut txn = db.begin().await.unwrap();
        assert!(!txn.decrement_stock(1, 4).await.unwrap());
        assert_eq!(txn.product_stock(1).await.unwrap(), Some(3));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotency_key_claimed_once() {
        let db = MemDb::new();
        let order = db.insert_order("h1").await.unwrap();

        let mut txn = db.begin().await.unwrap();
        txn.insert_idempotency("k1", order.id, IdempotencyStatus::Paid)
            .await
            .unwrap();
        assert!(txn
            .insert_idempotency("k1", order.id, IdempotencyStatus::Paid)
            .await
            .is_err());
        txn.rollback().await.unwrap();
    }
}
