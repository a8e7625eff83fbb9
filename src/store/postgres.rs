//! Postgres-backed durable store.
//!
//! Expected schema (migrations live with the host deployment, not here):
//!
//! ```sql
//! CREATE TABLE products (
//!     id          BIGSERIAL PRIMARY KEY,
//!     name        TEXT NOT NULL,
//!     price_cents BIGINT NOT NULL,
//!     stock       BIGINT NOT NULL CHECK (stock >= 0),
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE TABLE orders (
//!     id         BIGSERIAL PRIMARY KEY,
//!     hold_id    TEXT NOT NULL,
//!     state      TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE UNIQUE INDEX orders_live_hold
//!     ON orders (hold_id) WHERE state = 'pending_payment';
//!
//! CREATE TABLE idempotency_keys (
//!     id         BIGSERIAL PRIMARY KEY,
//!     key        VARCHAR(100) NOT NULL UNIQUE,
//!     order_id   BIGINT NOT NULL REFERENCES orders (id),
//!     status     TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX idempotency_keys_key_order ON idempotency_keys (key, order_id);
//!
//! CREATE TABLE holds (
//!     hold_id    TEXT PRIMARY KEY,
//!     product_id BIGINT NOT NULL,
//!     qty        BIGINT NOT NULL,
//!     outcome    TEXT NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX holds_product_active ON holds (product_id) WHERE outcome = 'active';
//!
//! CREATE TABLE component_heartbeats (
//!     component_name TEXT PRIMARY KEY,
//!     metadata       JSONB,
//!     last_heartbeat TIMESTAMPTZ NOT NULL
//! );
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::error::DurableError;
use crate::model::{IdempotencyStatus, OrderState};

use super::durable::{
    DurableStore, DurableTxn, HoldRow, IdempotencyRecord, OrderRecord, ProductRow,
    HOLD_OUTCOME_ACTIVE,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DurableError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn product_from_row(row: &PgRow) -> Result<ProductRow, DurableError> {
    Ok(ProductRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        price_cents: row.try_get("price_cents")?,
        stock: row.try_get("stock")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<OrderRecord, DurableError> {
    let raw_state: String = row.try_get("state")?;
    let state = OrderState::parse(&raw_state)
        .ok_or_else(|| DurableError::Corrupt(format!("unknown order state `{raw_state}`")))?;
    Ok(OrderRecord {
        id: row.try_get("id")?,
        hold_id: row.try_get("hold_id")?,
        state,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn idempotency_from_row(row: &PgRow) -> Result<IdempotencyRecord, DurableError> {
    let raw_status: String = row.try_get("status")?;
    let status = IdempotencyStatus::parse(&raw_status).ok_or_else(|| {
        DurableError::Corrupt(format!("unknown idempotency status `{raw_status}`"))
    })?;
    Ok(IdempotencyRecord {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        order_id: row.try_get("order_id")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn hold_from_row(row: &PgRow) -> Result<HoldRow, DurableError> {
    Ok(HoldRow {
        hold_id: row.try_get("hold_id")?,
        product_id: row.try_get("product_id")?,
        qty: row.try_get("qty")?,
        outcome: row.try_get("outcome")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DurableStore for PgStore {
    async fn product(&self, product_id: i64) -> Result<Option<ProductRow>, DurableError> {
        let row = sqlx::query(
            "SELECT id, name, price_cents, stock, created_at, updated_at \
             FROM products WHERE id = $1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_order(&self, hold_id: &str) -> Result<OrderRecord, DurableError> {
        let row = sqlx::query(
            "INSERT INTO orders (hold_id, state) VALUES ($1, $2) \
             RETURNING id, hold_id, state, created_at, updated_at",
        )
        .bind(hold_id)
        .bind(OrderState::PendingPayment.as_str())
        .fetch_one(&self.pool)
        .await?;
        order_from_row(&row)
    }

    async fn order(&self, order_id: i64) -> Result<Option<OrderRecord>, DurableError> {
        let row = sqlx::query(
            "SELECT id, hold_id, state, created_at, updated_at FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn insert_hold(&self, hold: &HoldRow) -> Result<(), DurableError> {
        sqlx::query(
            "INSERT INTO holds (hold_id, product_id, qty, outcome, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (hold_id) DO NOTHING",
        )
        .bind(&hold.hold_id)
        .bind(hold.product_id)
        .bind(hold.qty)
        .bind(&hold.outcome)
        .bind(hold.expires_at)
        .bind(hold.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_hold(&self, hold_id: &str, outcome: &str) -> Result<(), DurableError> {
        sqlx::query("UPDATE holds SET outcome = $2 WHERE hold_id = $1")
            .bind(hold_id)
            .bind(outcome)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_holds_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<HoldRow>, DurableError> {
        let rows = sqlx::query(
            "SELECT hold_id, product_id, qty, outcome, expires_at, created_at \
             FROM holds WHERE product_id = $1 AND outcome = $2 ORDER BY created_at",
        )
        .bind(product_id)
        .bind(HOLD_OUTCOME_ACTIVE)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hold_from_row).collect()
    }

    async fn record_heartbeat(
        &self,
        component: &str,
        metadata: serde_json::Value,
    ) -> Result<(), DurableError> {
        sqlx::query(
            "INSERT INTO component_heartbeats (component_name, metadata, last_heartbeat) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (component_name) DO UPDATE SET \
                 metadata = EXCLUDED.metadata, last_heartbeat = now()",
        )
        .bind(component)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn DurableTxn>, DurableError> {
        let txn = self.pool.begin().await?;
        Ok(Box::new(PgTxn { txn }))
    }
}

struct PgTxn {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl DurableTxn for PgTxn {
    async fn lock_order(&mut self, order_id: i64) -> Result<Option<OrderRecord>, DurableError> {
        let row = sqlx::query(
            "SELECT id, hold_id, state, created_at, updated_at \
             FROM orders WHERE id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *self.txn)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn lock_product(
        &mut self,
        product_id: i64,
    ) -> Result<Option<ProductRow>, DurableError> {
        let row = sqlx::query(
            "SELECT id, name, price_cents, stock, created_at, updated_at \
             FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(product_id)
        .fetch_optional(&mut *self.txn)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn find_idempotency(
        &mut self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DurableError> {
        let row = sqlx::query(
            "SELECT id, key, order_id, status, created_at, updated_at \
             FROM idempotency_keys WHERE key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *self.txn)
        .await?;
        row.as_ref().map(idempotency_from_row).transpose()
    }

    async fn insert_idempotency(
        &mut self,
        key: &str,
        order_id: i64,
        status: IdempotencyStatus,
    ) -> Result<(), DurableError> {
        sqlx::query("INSERT INTO idempotency_keys (key, order_id, status) VALUES ($1, $2, $3)")
            .bind(key)
            .bind(order_id)
            .bind(status.as_str())
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn set_order_state(
        &mut self,
        order_id: i64,
        state: OrderState,
    ) -> Result<(), DurableError> {
        sqlx::query("UPDATE orders SET state = $2, updated_at = now() WHERE id = $1")
            .bind(order_id)
            .bind(state.as_str())
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn decrement_stock(
        &mut self,
        product_id: i64,
        qty: i64,
    ) -> Result<bool, DurableError> {
        let result = sqlx::query(
            "UPDATE products SET stock = stock - $2, updated_at = now() \
             WHERE id = $1 AND stock >= $2",
        )
        .bind(product_id)
        .bind(qty)
        .execute(&mut *self.txn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn product_stock(&mut self, product_id: i64) -> Result<Option<i64>, DurableError> {
        let row = sqlx::query("SELECT stock FROM products WHERE id = $1")
            .bind(product_id)
            .fetch_optional(&mut *self.txn)
            .await?;
        row.map(|r| r.try_get("stock").map_err(DurableError::from))
            .transpose()
    }

    async fn active_hold_qty(&mut self, product_id: i64) -> Result<i64, DurableError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(qty), 0)::BIGINT AS total \
             FROM holds WHERE product_id = $1 AND outcome = $2",
        )
        .bind(product_id)
        .bind(HOLD_OUTCOME_ACTIVE)
        .fetch_one(&mut *self.txn)
        .await?;
        Ok(row.try_get("total")?)
    }

    async fn commit(self: Box<Self>) -> Result<(), DurableError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DurableError> {
        self.txn.rollback().await?;
        Ok(())
    }
}
