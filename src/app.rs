use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::error::CheckoutError;
use crate::inventory::{HoldRegistry, StockLedger};
use crate::services::{ExpiryReaper, OrderService, WebhookProcessor};
use crate::store::{DurableStore, FastStore, MemDb, MemoryStore, PgStore, RedisStore};

/// Product read-model: catalog row plus live stock counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProductView {
    pub id: i64,
    pub name: String,
    pub price_cents: i64,
    pub total_stock: i64,
    pub available_stock: i64,
    pub reserved_stock: i64,
    pub active_holds: i64,
    pub version: i64,
}

/// CheckoutApp - the wired component stack.
///
/// Owns the two store backends and the components built on top of them.
/// Everything is constructor-injected; there is no process-global state
/// beyond what lives in the stores themselves.
pub struct CheckoutApp {
    pub config: Config,
    pub fast: Arc<dyn FastStore>,
    pub durable: Arc<dyn DurableStore>,
    pub ledger: StockLedger,
    pub holds: Arc<HoldRegistry>,
    pub orders: OrderService,
    pub webhooks: WebhookProcessor,
    pub reaper: Arc<ExpiryReaper>,
}

impl CheckoutApp {
    /// Connect to Redis and Postgres and wire the full stack.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let fast: Arc<dyn FastStore> = Arc::new(
            RedisStore::connect(&config.fast_store_url)
                .await
                .context("failed to connect to the fast store")?,
        );
        let durable: Arc<dyn DurableStore> = Arc::new(
            PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("failed to connect to the durable store")?,
        );
        Ok(Self::with_stores(config, fast, durable))
    }

    /// Wire the stack over in-process backends; single-process deployments
    /// and the test suite run through this.
    pub fn in_process(config: Config) -> (Self, Arc<MemoryStore>, Arc<MemDb>) {
        let fast = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemDb::new());
        let app = Self::with_stores(config, fast.clone(), durable.clone());
        (app, fast, durable)
    }

    pub fn with_stores(
        config: Config,
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let retry = config.retry_policy();
        let ledger = StockLedger::new(fast.clone(), durable.clone(), retry);
        let holds = Arc::new(HoldRegistry::new(
            fast.clone(),
            durable.clone(),
            ledger.clone(),
            config.hold_ttl_secs,
            config.max_hold_qty,
            retry,
        ));
        let orders = OrderService::new(fast.clone(), durable.clone(), holds.clone(), retry);
        let webhooks = WebhookProcessor::new(
            fast.clone(),
            durable.clone(),
            holds.clone(),
            ledger.clone(),
            retry,
        );
        let reaper = Arc::new(ExpiryReaper::new(
            fast.clone(),
            durable.clone(),
            holds.clone(),
            config.reaper_settings(),
        ));

        Self {
            config,
            fast,
            durable,
            ledger,
            holds,
            orders,
            webhooks,
            reaper,
        }
    }

    /// Catalog row joined with the live counters, the shape the product
    /// endpoint serves.
    pub async fn product_view(&self, product_id: i64) -> std::result::Result<ProductView, CheckoutError> {
        let product = self
            .durable
            .product(product_id)
            .await?
            .ok_or(CheckoutError::ProductNotFound { product_id })?;
        let snapshot = self.ledger.snapshot(product_id).await?;
        let active_holds = self.ledger.active_holds(product_id).await?;
        Ok(ProductView {
            id: product.id,
            name: product.name,
            price_cents: product.price_cents,
            total_stock: product.stock,
            available_stock: snapshot.available,
            reserved_stock: snapshot.reserved,
            active_holds,
            version: snapshot.version,
        })
    }
}
