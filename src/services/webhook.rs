use std::sync::Arc;

use tracing::{info, warn};

use crate::error::CheckoutError;
use crate::inventory::holds::CODE_NOT_ACTIVE;
use crate::inventory::{HoldRegistry, StockLedger};
use crate::model::{Hold, HoldStatus, IdempotencyStatus, OrderState, WebhookStatus};
use crate::store::durable::{HOLD_OUTCOME_PAYMENT_FAILED, HOLD_OUTCOME_USED};
use crate::store::{
    keys, AtomicOutcome, AtomicProgram, DurableStore, FastStore, Guard, WriteOp,
};
use crate::util::RetryPolicy;

/// One webhook delivery from the payment processor.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookRequest {
    pub idempotency_key: String,
    pub order_id: i64,
    pub status: WebhookStatus,
}

/// Canonical outcome of applying a webhook; the transport layer maps this
/// to a response code via [`WebhookOutcome::status_class`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The verdict was applied: stock committed (paid) or refunded
    /// (cancelled).
    Applied { order_state: OrderState },
    /// The order was already paid or cancelled; nothing to do.
    AlreadyFinalized { order_state: OrderState },
    /// The idempotency key was seen before; returning the recorded state,
    /// no mutations performed.
    Duplicate {
        order_state: OrderState,
        recorded: IdempotencyStatus,
    },
    /// The hold aged out between order creation and the webhook; the order
    /// is now cancelled.
    HoldGone { order_state: OrderState },
    /// The hold is in a payment state that contradicts the verdict.
    Conflict {
        order_state: OrderState,
        reason: String,
    },
}

impl WebhookOutcome {
    pub fn status_class(&self) -> u16 {
        match self {
            WebhookOutcome::Applied { .. }
            | WebhookOutcome::AlreadyFinalized { .. }
            | WebhookOutcome::Duplicate { .. } => 200,
            WebhookOutcome::HoldGone { .. } => 410,
            WebhookOutcome::Conflict { .. } => 409,
        }
    }
}

/// How the hold looks at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldDisposition {
    Absent,
    Active,
    Used,
    PaymentFailed,
    OtherTerminal,
}

fn classify(hold: Option<&Hold>) -> HoldDisposition {
    match hold {
        None => HoldDisposition::Absent,
        Some(h) => match h.status {
            HoldStatus::Active => HoldDisposition::Active,
            HoldStatus::Used => HoldDisposition::Used,
            HoldStatus::PaymentFailed => HoldDisposition::PaymentFailed,
            HoldStatus::Expired => HoldDisposition::OtherTerminal,
        },
    }
}

/// What to do for a pending order, given the verdict and the hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookAction {
    /// Decrement durable stock, mark paid, commit the reservation.
    CommitAndPay,
    /// Reservation already consumed; just make sure the order says paid.
    MarkPaidOnly,
    /// Mark cancelled and refund the reservation.
    RefundAndCancel,
    /// Hold aged out; cancel the order.
    CancelHoldGone,
    /// Verdict contradicts the hold's payment state.
    PaymentStateConflict,
    /// Hold exists but is in no state this verdict can act on.
    InvalidHold,
}

/// The state-transition table for `pending_payment` orders.
fn decide(status: WebhookStatus, hold: HoldDisposition) -> WebhookAction {
    match (status, hold) {
        (WebhookStatus::Success, HoldDisposition::Active) => WebhookAction::CommitAndPay,
        (WebhookStatus::Success, HoldDisposition::Used) => WebhookAction::MarkPaidOnly,
        (WebhookStatus::Success, HoldDisposition::PaymentFailed) => {
            WebhookAction::PaymentStateConflict
        }
        (WebhookStatus::Failure, HoldDisposition::Active) => WebhookAction::RefundAndCancel,
        (WebhookStatus::Failure, HoldDisposition::Used) => WebhookAction::PaymentStateConflict,
        (WebhookStatus::Failure, HoldDisposition::PaymentFailed) => {
            WebhookAction::PaymentStateConflict
        }
        (_, HoldDisposition::Absent) => WebhookAction::CancelHoldGone,
        (_, HoldDisposition::OtherTerminal) => WebhookAction::InvalidHold,
    }
}

/// Idempotent webhook application.
///
/// The whole protocol runs inside one durable transaction with the order
/// row locked; deadlock-class failures are retried. On success the durable
/// mutation commits *before* the fast-store commit, on failure the order
/// is inverted, so a crash between the two always leaves durable state
/// ahead of the cache, which can be recomputed.
pub struct WebhookProcessor {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    registry: Arc<HoldRegistry>,
    ledger: StockLedger,
    retry: RetryPolicy,
}

impl WebhookProcessor {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        registry: Arc<HoldRegistry>,
        ledger: StockLedger,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fast,
            durable,
            registry,
            ledger,
            retry,
        }
    }

    pub async fn apply(&self, request: &WebhookRequest) -> Result<WebhookOutcome, CheckoutError> {
        for attempt in 1..=self.retry.max_attempts() {
            match self.apply_once(request).await {
                Err(CheckoutError::Durable(err))
                    if err.is_deadlock() && !self.retry.is_last(attempt) =>
                {
                    warn!(
                        "[WEBHOOK] deadlock applying key {} (attempt {}), retrying",
                        request.idempotency_key, attempt
                    );
                    self.retry.pause_after(attempt).await;
                }
                outcome => return outcome,
            }
        }
        Err(CheckoutError::ConcurrentModification)
    }

    async fn apply_once(&self, request: &WebhookRequest) -> Result<WebhookOutcome, CheckoutError> {
        // Early returns drop the handle, which rolls the transaction back.
        let mut txn = self.durable.begin().await?;

        let order = match txn.lock_order(request.order_id).await? {
            Some(order) => order,
            None => {
                txn.rollback().await?;
                return Err(CheckoutError::OrderNotFound {
                    order_id: request.order_id,
                });
            }
        };

        // Finalization short-circuit: retries stay idempotent even when
        // they arrive with a fresh key.
        if order.state.is_final() {
            if txn
                .find_idempotency(&request.idempotency_key)
                .await?
                .is_none()
            {
                txn.insert_idempotency(
                    &request.idempotency_key,
                    order.id,
                    request.status.into(),
                )
                .await?;
            }
            txn.commit().await?;
            return Ok(WebhookOutcome::AlreadyFinalized {
                order_state: order.state,
            });
        }

        if let Some(existing) = txn.find_idempotency(&request.idempotency_key).await? {
            txn.rollback().await?;
            info!(
                "[WEBHOOK] duplicate delivery for key {} (order {})",
                request.idempotency_key, order.id
            );
            return Ok(WebhookOutcome::Duplicate {
                order_state: order.state,
                recorded: existing.status,
            });
        }
        // The insert both claims the key and is the audit trail.
        txn.insert_idempotency(&request.idempotency_key, order.id, request.status.into())
            .await?;

        let hold = self.registry.get(&order.hold_id).await?;
        match decide(request.status, classify(hold.as_ref())) {
            WebhookAction::CommitAndPay => {
                let Some(hold) = hold else {
                    txn.rollback().await?;
                    return Err(CheckoutError::StateConflict {
                        reason: "hold vanished mid-dispatch".into(),
                    });
                };
                if !txn.decrement_stock(hold.product_id, hold.qty).await? {
                    let stock = txn.product_stock(hold.product_id).await?;
                    txn.rollback().await?;
                    return Err(self.stock_guard_failure(&hold, stock).await);
                }
                txn.set_order_state(order.id, OrderState::Paid).await?;
                txn.commit().await?;

                self.commit_reservation(&hold).await?;
                self.registry.mark_shadow(&hold.id, HOLD_OUTCOME_USED).await;
                info!(
                    "[WEBHOOK] order {} paid, {} units of product {} committed",
                    order.id, hold.qty, hold.product_id
                );
                Ok(WebhookOutcome::Applied {
                    order_state: OrderState::Paid,
                })
            }
            WebhookAction::MarkPaidOnly => {
                txn.set_order_state(order.id, OrderState::Paid).await?;
                txn.commit().await?;
                Ok(WebhookOutcome::Applied {
                    order_state: OrderState::Paid,
                })
            }
            WebhookAction::RefundAndCancel => {
                let Some(hold) = hold else {
                    txn.rollback().await?;
                    return Err(CheckoutError::StateConflict {
                        reason: "hold vanished mid-dispatch".into(),
                    });
                };
                txn.set_order_state(order.id, OrderState::Cancelled).await?;
                txn.commit().await?;

                self.refund_reservation(&hold).await?;
                self.registry
                    .mark_shadow(&hold.id, HOLD_OUTCOME_PAYMENT_FAILED)
                    .await;
                info!(
                    "[WEBHOOK] order {} cancelled, {} units of product {} refunded",
                    order.id, hold.qty, hold.product_id
                );
                Ok(WebhookOutcome::Applied {
                    order_state: OrderState::Cancelled,
                })
            }
            WebhookAction::CancelHoldGone => {
                txn.set_order_state(order.id, OrderState::Cancelled).await?;
                txn.commit().await?;
                info!(
                    "[WEBHOOK] order {} cancelled: hold {} already gone",
                    order.id, order.hold_id
                );
                Ok(WebhookOutcome::HoldGone {
                    order_state: OrderState::Cancelled,
                })
            }
            WebhookAction::PaymentStateConflict => {
                // The idempotency row stays as the audit of the delivery
                // that did not apply.
                txn.commit().await?;
                Ok(WebhookOutcome::Conflict {
                    order_state: order.state,
                    reason: "payment state conflict".into(),
                })
            }
            WebhookAction::InvalidHold => {
                txn.commit().await?;
                Err(CheckoutError::HoldInvalid {
                    reason: "hold is not active".into(),
                })
            }
        }
    }

    async fn stock_guard_failure(
        &self,
        hold: &Hold,
        stock: Option<i64>,
    ) -> CheckoutError {
        match stock {
            None => CheckoutError::ProductNotFound {
                product_id: hold.product_id,
            },
            Some(stock) if stock < hold.qty => {
                let snapshot = self.ledger.snapshot(hold.product_id).await.ok();
                CheckoutError::InsufficientStock {
                    available: stock,
                    reserved: snapshot.map(|s| s.reserved).unwrap_or(0),
                    version: snapshot.map(|s| s.version).unwrap_or(0),
                }
            }
            Some(_) => CheckoutError::StateConflict {
                reason: "concurrent stock modification".into(),
            },
        }
    }

    /// Consume the reservation: `reserved` shrinks, `available` stays (the
    /// units left the system), the hold disappears from record and
    /// indices. `available` was already accounted for at reserve time.
    fn commit_program(hold: &Hold) -> AtomicProgram {
        AtomicProgram {
            guards: vec![Guard::HashFieldEquals {
                key: keys::hold(&hold.id),
                field: "status".into(),
                expected: HoldStatus::Active.as_str().into(),
                code: CODE_NOT_ACTIVE,
            }],
            writes: vec![
                WriteOp::IncrBy {
                    key: keys::reserved_stock(hold.product_id),
                    delta: -hold.qty,
                },
                WriteOp::IncrBy {
                    key: keys::stock_version(hold.product_id),
                    delta: 1,
                },
                WriteOp::IncrBy {
                    key: keys::active_holds(hold.product_id),
                    delta: -hold.qty,
                },
                WriteOp::Delete {
                    key: keys::hold(&hold.id),
                },
                WriteOp::SetRemove {
                    key: keys::product_holds(hold.product_id),
                    member: hold.id.clone(),
                },
                WriteOp::SortedSetRemove {
                    key: keys::expiring_index(hold.product_id),
                    member: hold.id.clone(),
                },
                WriteOp::SetRemove {
                    key: keys::holds_by_status(HoldStatus::Active.as_str()),
                    member: hold.id.clone(),
                },
            ],
        }
    }

    async fn commit_reservation(&self, hold: &Hold) -> Result<(), CheckoutError> {
        match self.fast.run_atomic(Self::commit_program(hold)).await? {
            AtomicOutcome::Applied => Ok(()),
            AtomicOutcome::Rejected(code) => {
                // The reaper (or a concurrent release) beat us to the hold
                // after the durable commit; the counters no longer add up,
                // so recompute them from the durable truth.
                warn!(
                    "[WEBHOOK] fast-store commit for hold {} rejected ({}), refreshing product {}",
                    hold.id, code, hold.product_id
                );
                self.ledger.refresh(hold.product_id).await?;
                Ok(())
            }
        }
    }

    async fn refund_reservation(&self, hold: &Hold) -> Result<(), CheckoutError> {
        match self
            .fast
            .run_atomic(HoldRegistry::release_program(hold))
            .await?
        {
            AtomicOutcome::Applied => Ok(()),
            AtomicOutcome::Rejected(code) => {
                warn!(
                    "[WEBHOOK] fast-store refund for hold {} rejected ({}), refreshing product {}",
                    hold.id, code, hold.product_id
                );
                self.ledger.refresh(hold.product_id).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table_success_rows() {
        assert_eq!(
            decide(WebhookStatus::Success, HoldDisposition::Active),
            WebhookAction::CommitAndPay
        );
        assert_eq!(
            decide(WebhookStatus::Success, HoldDisposition::Used),
            WebhookAction::MarkPaidOnly
        );
        assert_eq!(
            decide(WebhookStatus::Success, HoldDisposition::PaymentFailed),
            WebhookAction::PaymentStateConflict
        );
        assert_eq!(
            decide(WebhookStatus::Success, HoldDisposition::Absent),
            WebhookAction::CancelHoldGone
        );
        assert_eq!(
            decide(WebhookStatus::Success, HoldDisposition::OtherTerminal),
            WebhookAction::InvalidHold
        );
    }

    #[test]
    fn test_decision_table_failure_rows() {
        assert_eq!(
            decide(WebhookStatus::Failure, HoldDisposition::Active),
            WebhookAction::RefundAndCancel
        );
        assert_eq!(
            decide(WebhookStatus::Failure, HoldDisposition::Used),
            WebhookAction::PaymentStateConflict
        );
        assert_eq!(
            decide(WebhookStatus::Failure, HoldDisposition::PaymentFailed),
            WebhookAction::PaymentStateConflict
        );
        assert_eq!(
            decide(WebhookStatus::Failure, HoldDisposition::Absent),
            WebhookAction::CancelHoldGone
        );
        assert_eq!(
            decide(WebhookStatus::Failure, HoldDisposition::OtherTerminal),
            WebhookAction::InvalidHold
        );
    }

    #[test]
    fn test_outcome_status_classes() {
        assert_eq!(
            WebhookOutcome::Applied {
                order_state: OrderState::Paid
            }
            .status_class(),
            200
        );
        assert_eq!(
            WebhookOutcome::HoldGone {
                order_state: OrderState::Cancelled
            }
            .status_class(),
            410
        );
        assert_eq!(
            WebhookOutcome::Conflict {
                order_state: OrderState::PendingPayment,
                reason: "payment state conflict".into()
            }
            .status_class(),
            409
        );
    }
}
