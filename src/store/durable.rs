use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DurableError;
use crate::model::{IdempotencyStatus, OrderState};

/// Product row from the catalog. The core treats it as read-only reference
/// data except for the guarded stock decrement on confirmed payment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRow {
    pub id: i64,
    pub name: String,
    pub price_cents: i64,
    pub stock: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable order ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub id: i64,
    pub hold_id: String,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Idempotency log row; presence signifies the key has been observed and
/// acted upon.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub id: i64,
    pub key: String,
    pub order_id: i64,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable shadow of a hold. The fast store stays the live source of
/// truth; these rows feed the pessimistic reservation path, the
/// `refresh-stock` recomputation, and the audit trail. `outcome` is the
/// terminal disposition (`released` included, which the fast-store state
/// machine expresses as deletion).
#[derive(Debug, Clone, PartialEq)]
pub struct HoldRow {
    pub hold_id: String,
    pub product_id: i64,
    pub qty: i64,
    pub outcome: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub const HOLD_OUTCOME_ACTIVE: &str = "active";
pub const HOLD_OUTCOME_USED: &str = "used";
pub const HOLD_OUTCOME_EXPIRED: &str = "expired";
pub const HOLD_OUTCOME_RELEASED: &str = "released";
pub const HOLD_OUTCOME_PAYMENT_FAILED: &str = "payment_failed";

/// The relational store: order ledger, idempotency log, product stock,
/// durable hold shadow, and operator heartbeats.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn product(&self, product_id: i64) -> Result<Option<ProductRow>, DurableError>;

    /// Insert a fresh order in `pending_payment` for the given hold.
    async fn insert_order(&self, hold_id: &str) -> Result<OrderRecord, DurableError>;

    async fn order(&self, order_id: i64) -> Result<Option<OrderRecord>, DurableError>;

    async fn insert_hold(&self, row: &HoldRow) -> Result<(), DurableError>;

    /// Record a hold's terminal disposition on its shadow row.
    async fn mark_hold(&self, hold_id: &str, outcome: &str) -> Result<(), DurableError>;

    /// Active hold shadows for one product, oldest first.
    async fn active_holds_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<HoldRow>, DurableError>;

    /// Liveness heartbeat, upserted per component.
    async fn record_heartbeat(
        &self,
        component: &str,
        metadata: serde_json::Value,
    ) -> Result<(), DurableError>;

    /// Open a transaction. The handle serializes row access through the
    /// backend's native locking; dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn DurableTxn>, DurableError>;
}

/// Transactional handle used by the webhook processor and the pessimistic
/// reservation path.
#[async_trait]
pub trait DurableTxn: Send {
    /// `SELECT ... FOR UPDATE` on the order row.
    async fn lock_order(&mut self, order_id: i64) -> Result<Option<OrderRecord>, DurableError>;

    /// `SELECT ... FOR UPDATE` on the product row.
    async fn lock_product(&mut self, product_id: i64)
        -> Result<Option<ProductRow>, DurableError>;

    /// Idempotency lookup with a write lock, so a duplicate delivery
    /// serializes behind the first.
    async fn find_idempotency(
        &mut self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DurableError>;

    async fn insert_idempotency(
        &mut self,
        key: &str,
        order_id: i64,
        status: IdempotencyStatus,
    ) -> Result<(), DurableError>;

    async fn set_order_state(
        &mut self,
        order_id: i64,
        state: OrderState,
    ) -> Result<(), DurableError>;

    /// Guarded decrement: `stock = stock - qty WHERE stock >= qty`.
    /// Returns whether a row was affected.
    async fn decrement_stock(&mut self, product_id: i64, qty: i64)
        -> Result<bool, DurableError>;

    async fn product_stock(&mut self, product_id: i64) -> Result<Option<i64>, DurableError>;

    /// Sum of active hold quantities for the product, inside the
    /// transaction.
    async fn active_hold_qty(&mut self, product_id: i64) -> Result<i64, DurableError>;

    async fn commit(self: Box<Self>) -> Result<(), DurableError>;

    async fn rollback(self: Box<Self>) -> Result<(), DurableError>;
}
