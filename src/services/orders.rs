use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::CheckoutError;
use crate::inventory::HoldRegistry;
use crate::model::{HoldStatus, OrderState};
use crate::store::{DurableStore, FastStore, TxnOutcome};
use crate::util::RetryPolicy;

/// A freshly created order awaiting payment.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub state: OrderState,
    pub hold_id: String,
    pub product_id: i64,
    pub quantity: i64,
}

/// Turns a validated active hold into a durable `pending_payment` order.
///
/// The hold is deliberately *not* marked used here: if the payment webhook
/// never arrives, the hold simply ages out and the reaper returns its
/// units. Marking-as-used happens on webhook success.
pub struct OrderService {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    registry: Arc<HoldRegistry>,
    retry: RetryPolicy,
}

impl OrderService {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        registry: Arc<HoldRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fast,
            durable,
            registry,
            retry,
        }
    }

    pub async fn create_from_hold(&self, hold_id: &str) -> Result<PlacedOrder, CheckoutError> {
        // Availability probe first: better a clean 503 than a half-validated
        // order.
        self.fast.ping().await.map_err(CheckoutError::from)?;

        for attempt in 1..=self.retry.max_attempts() {
            let candidate = self
                .registry
                .get(hold_id)
                .await?
                .ok_or_else(|| CheckoutError::HoldNotFound {
                    hold_id: hold_id.to_string(),
                })?;

            match candidate.status {
                HoldStatus::Used => {
                    return Err(CheckoutError::HoldAlreadyUsed {
                        hold_id: hold_id.to_string(),
                    })
                }
                HoldStatus::Expired => {
                    return Err(CheckoutError::HoldExpired {
                        expires_at: candidate.expires_at,
                    })
                }
                HoldStatus::PaymentFailed => {
                    return Err(CheckoutError::HoldInvalid {
                        reason: "prior payment failure".into(),
                    })
                }
                HoldStatus::Active => {}
            }

            let now_epoch = Utc::now().timestamp();
            if candidate.is_expired_at(now_epoch) {
                // Stale-active: drive the expiration in-line, then report
                // it the way a pre-expired hold would be reported.
                self.registry.expire(hold_id, now_epoch).await?;
                info!("[ORDERS] hold {} expired in-line during order creation", hold_id);
                return Err(CheckoutError::HoldExpired {
                    expires_at: candidate.expires_at,
                });
            }

            match self.registry.touch(hold_id).await? {
                TxnOutcome::Committed => {
                    let order = self.durable.insert_order(hold_id).await?;
                    info!(
                        "[ORDERS] order {} created for hold {} (product {}, qty {})",
                        order.id, hold_id, candidate.product_id, candidate.qty
                    );
                    return Ok(PlacedOrder {
                        order_id: order.id,
                        state: order.state,
                        hold_id: order.hold_id,
                        product_id: candidate.product_id,
                        quantity: candidate.qty,
                    });
                }
                TxnOutcome::Conflict => {
                    debug!(
                        "[ORDERS] hold {} changed while stamping access (attempt {})",
                        hold_id, attempt
                    );
                    self.retry.pause_after(attempt).await;
                }
            }
        }
        Err(CheckoutError::ConcurrentModification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StockLedger;
    use crate::store::{MemDb, MemoryStore};
    use std::time::Duration;

    async fn service(stock: i64, ttl_secs: i64) -> (OrderService, Arc<HoldRegistry>) {
        let fast = Arc::new(MemoryStore::new());
        let db = Arc::new(MemDb::new());
        db.put_product(1, "widget", 1500, stock).await;
        let retry = RetryPolicy::new(3, Duration::from_millis(1));
        let ledger = StockLedger::new(fast.clone(), db.clone(), retry);
        let registry = Arc::new(HoldRegistry::new(
            fast.clone(),
            db.clone(),
            ledger,
            ttl_secs,
            1000,
            retry,
        ));
        (
            OrderService::new(fast, db, registry.clone(), retry),
            registry,
        )
    }

    #[tokio::test]
    async fn test_create_order_from_active_hold() {
        let (service, registry) = service(10, 120).await;
        let created = registry.create(1, 2).await.unwrap();

        let order = service.create_from_hold(&created.hold_id).await.unwrap();
        assert_eq!(order.state, OrderState::PendingPayment);
        assert_eq!(order.hold_id, created.hold_id);
        assert_eq!(order.quantity, 2);

        // The hold stays active and reserved; only the webhook consumes it.
        let hold = registry.get(&created.hold_id).await.unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Active);
        assert!(hold.last_accessed_at.is_some());
    }

    #[tokio::test]
    async fn test_create_order_for_missing_hold() {
        let (service, _registry) = service(10, 120).await;
        assert!(matches!(
            service.create_from_hold("no-such-hold").await,
            Err(CheckoutError::HoldNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_order_expires_stale_hold_inline() {
        let (service, registry) = service(10, 0).await;
        let created = registry.create(1, 2).await.unwrap();

        match service.create_from_hold(&created.hold_id).await {
            Err(CheckoutError::HoldExpired { .. }) => {}
            other => panic!("expected HoldExpired, got {other:?}"),
        }

        // The in-line expiration refunded the reservation.
        assert!(registry.get(&created.hold_id).await.unwrap().is_none());
    }
}
