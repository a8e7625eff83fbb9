use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::CheckoutError;
use crate::model::StockSnapshot;
use crate::store::{
    keys, AtomicOutcome, AtomicProgram, DurableStore, FastStore, Guard, GuardedWrite, TxnOutcome,
    WatchKey, WriteOp,
};
use crate::util::{worker_tag, RetryPolicy};

/// How long the lazy-initialization guard lease lives.
const INIT_LEASE_SECS: u64 = 5;
/// Polling schedule for callers that lost the initialization race.
const INIT_POLL_ATTEMPTS: u32 = 10;
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-product stock accounting over the fast store.
///
/// Counters live under `available_stock:{p}` / `reserved_stock:{p}` /
/// `stock_version:{p}`; the version moves on every mutation and is the
/// watch anchor for every optimistic transaction. The durable product row
/// is only consulted for lazy initialization, the pessimistic path, and
/// `refresh`.
#[derive(Clone)]
pub struct StockLedger {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    retry: RetryPolicy,
}

impl StockLedger {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fast,
            durable,
            retry,
        }
    }

    /// Make sure the product's counters exist, seeding them from the
    /// durable store if this caller wins the init lease. Returns `false`
    /// when initialization could not be confirmed within the polling
    /// budget; callers then take the pessimistic path.
    pub async fn ensure_initialized(&self, product_id: i64) -> Result<bool, CheckoutError> {
        if self
            .fast
            .get_i64(&keys::stock_version(product_id))
            .await?
            .is_some()
        {
            return Ok(true);
        }

        let lease = keys::stock_init(product_id);
        if self
            .fast
            .set_nx_ex(&lease, &worker_tag(), INIT_LEASE_SECS)
            .await?
        {
            let result = self.seed_counters(product_id).await;
            // The lease is ours; release it no matter how seeding went.
            let _ = self.fast.delete(&lease).await;
            result?;
            return Ok(true);
        }

        for _ in 0..INIT_POLL_ATTEMPTS {
            tokio::time::sleep(INIT_POLL_INTERVAL).await;
            if self
                .fast
                .get_i64(&keys::stock_version(product_id))
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn seed_counters(&self, product_id: i64) -> Result<(), CheckoutError> {
        let product = self
            .durable
            .product(product_id)
            .await?
            .ok_or(CheckoutError::ProductNotFound { product_id })?;
        // Holds survive in the durable shadow even when the fast store was
        // flushed; seed from them rather than assuming a cold start.
        let reserved: i64 = self
            .durable
            .active_holds_for_product(product_id)
            .await?
            .iter()
            .map(|h| h.qty)
            .sum();
        let available = (product.stock - reserved).max(0);

        self.fast
            .set_i64(&keys::available_stock(product_id), available)
            .await?;
        self.fast
            .set_i64(&keys::reserved_stock(product_id), reserved)
            .await?;
        self.fast
            .set_i64(&keys::active_holds(product_id), reserved)
            .await?;
        self.fast
            .set_i64(&keys::stock_version(product_id), 1)
            .await?;
        info!(
            "[STOCK] initialized counters for product {}: available={} reserved={}",
            product_id, available, reserved
        );
        Ok(())
    }

    /// Current `(available, reserved, version)`, or `None` if any counter
    /// is missing.
    pub(crate) async fn read_counters(
        &self,
        product_id: i64,
    ) -> Result<Option<(i64, i64, i64)>, CheckoutError> {
        let available = self.fast.get_i64(&keys::available_stock(product_id)).await?;
        let reserved = self.fast.get_i64(&keys::reserved_stock(product_id)).await?;
        let version = self.fast.get_i64(&keys::stock_version(product_id)).await?;
        Ok(match (available, reserved, version) {
            (Some(a), Some(r), Some(v)) => Some((a, r, v)),
            _ => None,
        })
    }

    pub async fn snapshot(&self, product_id: i64) -> Result<StockSnapshot, CheckoutError> {
        self.ensure_initialized(product_id).await?;
        match self.read_counters(product_id).await? {
            Some((available, reserved, version)) => Ok(StockSnapshot {
                available,
                reserved,
                version,
            }),
            None => self.refresh(product_id).await,
        }
    }

    pub async fn active_holds(&self, product_id: i64) -> Result<i64, CheckoutError> {
        Ok(self
            .fast
            .get_i64(&keys::active_holds(product_id))
            .await?
            .unwrap_or(0))
    }

    /// The watch set and counter mutations of a reservation, for bundling
    /// with further writes in the same optimistic transaction.
    pub(crate) fn reserve_mutation(
        product_id: i64,
        available: i64,
        reserved: i64,
        version: i64,
        qty: i64,
    ) -> GuardedWrite {
        GuardedWrite {
            watches: vec![
                WatchKey::int_equals(keys::available_stock(product_id), available),
                WatchKey::int_equals(keys::reserved_stock(product_id), reserved),
                WatchKey::int_equals(keys::stock_version(product_id), version),
            ],
            writes: vec![
                WriteOp::SetInt {
                    key: keys::available_stock(product_id),
                    value: available - qty,
                },
                WriteOp::SetInt {
                    key: keys::reserved_stock(product_id),
                    value: reserved + qty,
                },
                WriteOp::SetInt {
                    key: keys::stock_version(product_id),
                    value: version + 1,
                },
            ],
        }
    }

    /// Reserve `qty` units. Optimistic with bounded retries, then the
    /// pessimistic row-lock path.
    pub async fn reserve(&self, product_id: i64, qty: i64) -> Result<StockSnapshot, CheckoutError> {
        if !self.ensure_initialized(product_id).await? {
            return self.reserve_pessimistic(product_id, qty).await;
        }

        for attempt in 1..=self.retry.max_attempts() {
            let Some((available, reserved, version)) = self.read_counters(product_id).await?
            else {
                return self.reserve_pessimistic(product_id, qty).await;
            };
            if available < qty {
                return Err(CheckoutError::InsufficientStock {
                    available,
                    reserved,
                    version,
                });
            }

            let txn = Self::reserve_mutation(product_id, available, reserved, version, qty);
            match self.fast.guarded_write(txn).await? {
                TxnOutcome::Committed => {
                    return Ok(StockSnapshot {
                        available: available - qty,
                        reserved: reserved + qty,
                        version: version + 1,
                    })
                }
                TxnOutcome::Conflict => {
                    debug!(
                        "[STOCK] reserve conflict on product {} (attempt {})",
                        product_id, attempt
                    );
                    self.retry.pause_after(attempt).await;
                }
            }
        }
        self.reserve_pessimistic(product_id, qty).await
    }

    /// Return `qty` reserved units to availability.
    pub async fn release(&self, product_id: i64, qty: i64) -> Result<StockSnapshot, CheckoutError> {
        self.ensure_initialized(product_id).await?;

        for attempt in 1..=self.retry.max_attempts() {
            let Some((available, reserved, version)) = self.read_counters(product_id).await?
            else {
                self.refresh(product_id).await?;
                continue;
            };
            if reserved < qty {
                return Err(CheckoutError::InvalidRelease {
                    reserved,
                    requested: qty,
                });
            }

            let txn = GuardedWrite {
                watches: vec![
                    WatchKey::int_equals(keys::available_stock(product_id), available),
                    WatchKey::int_equals(keys::reserved_stock(product_id), reserved),
                    WatchKey::int_equals(keys::stock_version(product_id), version),
                ],
                writes: vec![
                    WriteOp::SetInt {
                        key: keys::available_stock(product_id),
                        value: available + qty,
                    },
                    WriteOp::SetInt {
                        key: keys::reserved_stock(product_id),
                        value: reserved - qty,
                    },
                    WriteOp::SetInt {
                        key: keys::stock_version(product_id),
                        value: version + 1,
                    },
                ],
            };
            match self.fast.guarded_write(txn).await? {
                TxnOutcome::Committed => {
                    return Ok(StockSnapshot {
                        available: available + qty,
                        reserved: reserved - qty,
                        version: version + 1,
                    })
                }
                TxnOutcome::Conflict => {
                    debug!(
                        "[STOCK] release conflict on product {} (attempt {})",
                        product_id, attempt
                    );
                    self.retry.pause_after(attempt).await;
                }
            }
        }
        Err(CheckoutError::ConcurrentModification)
    }

    /// Consume `qty` reserved units permanently: `reserved` shrinks,
    /// `available` is untouched. The durable `products.stock` decrement
    /// happens in the caller's webhook transaction.
    pub async fn commit_reserved(&self, product_id: i64, qty: i64) -> Result<(), CheckoutError> {
        let program = AtomicProgram {
            guards: vec![Guard::IntAtLeast {
                key: keys::reserved_stock(product_id),
                min: qty,
                code: "insufficient_reserved",
            }],
            writes: vec![
                WriteOp::IncrBy {
                    key: keys::reserved_stock(product_id),
                    delta: -qty,
                },
                WriteOp::IncrBy {
                    key: keys::stock_version(product_id),
                    delta: 1,
                },
            ],
        };
        match self.fast.run_atomic(program).await? {
            AtomicOutcome::Applied => Ok(()),
            AtomicOutcome::Rejected(_) => Err(CheckoutError::StateConflict {
                reason: format!("reserved counter underflow committing {qty} units"),
            }),
        }
    }

    /// Row-lock reservation against the durable store, used when the
    /// optimistic path is exhausted or the counters are unconfirmed. The
    /// fast-store counters are overwritten with the recomputed truth while
    /// the product row lock is held.
    pub(crate) async fn reserve_pessimistic(
        &self,
        product_id: i64,
        qty: i64,
    ) -> Result<StockSnapshot, CheckoutError> {
        warn!(
            "[STOCK] falling back to pessimistic reservation for product {}",
            product_id
        );
        let mut txn = self.durable.begin().await?;
        let product = match txn.lock_product(product_id).await? {
            Some(product) => product,
            None => {
                txn.rollback().await?;
                return Err(CheckoutError::ProductNotFound { product_id });
            }
        };
        let reserved = txn.active_hold_qty(product_id).await?;
        let available = product.stock - reserved;
        if available < qty {
            let version = self
                .fast
                .get_i64(&keys::stock_version(product_id))
                .await?
                .unwrap_or(0);
            txn.rollback().await?;
            return Err(CheckoutError::InsufficientStock {
                available,
                reserved,
                version,
            });
        }

        self.fast
            .set_i64(&keys::available_stock(product_id), available - qty)
            .await?;
        self.fast
            .set_i64(&keys::reserved_stock(product_id), reserved + qty)
            .await?;
        let version = self
            .fast
            .incr_by(&keys::stock_version(product_id), 1)
            .await?;
        txn.commit().await?;

        Ok(StockSnapshot {
            available: available - qty,
            reserved: reserved + qty,
            version,
        })
    }

    /// Administrative `refresh-stock`: recompute the fast-store counters
    /// from the durable store by fiat.
    pub async fn refresh(&self, product_id: i64) -> Result<StockSnapshot, CheckoutError> {
        let product = self
            .durable
            .product(product_id)
            .await?
            .ok_or(CheckoutError::ProductNotFound { product_id })?;
        let reserved: i64 = self
            .durable
            .active_holds_for_product(product_id)
            .await?
            .iter()
            .map(|h| h.qty)
            .sum();
        let available = (product.stock - reserved).max(0);

        self.fast
            .set_i64(&keys::available_stock(product_id), available)
            .await?;
        self.fast
            .set_i64(&keys::reserved_stock(product_id), reserved)
            .await?;
        self.fast
            .set_i64(&keys::active_holds(product_id), reserved)
            .await?;
        let version = self
            .fast
            .incr_by(&keys::stock_version(product_id), 1)
            .await?;
        info!(
            "[STOCK] refreshed counters for product {}: available={} reserved={}",
            product_id, available, reserved
        );
        Ok(StockSnapshot {
            available,
            reserved,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemDb, MemoryStore};
    use std::time::Duration;

    async fn seeded(stock: i64) -> (StockLedger, Arc<MemoryStore>, Arc<MemDb>) {
        let fast = Arc::new(MemoryStore::new());
        let db = Arc::new(MemDb::new());
        db.put_product(1, "widget", 1500, stock).await;
        let ledger = StockLedger::new(
            fast.clone(),
            db.clone(),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        (ledger, fast, db)
    }

    #[tokio::test]
    async fn test_lazy_init_seeds_counters() {
        let (ledger, _fast, _db) = seeded(10).await;
        let snap = ledger.snapshot(1).await.unwrap();
        assert_eq!(
            snap,
            StockSnapshot {
                available: 10,
                reserved: 0,
                version: 1
            }
        );
    }

    #[tokio::test]
    async fn test_reserve_and_release_round_trip() {
        let (ledger, _fast, _db) = seeded(10).await;
        let before = ledger.snapshot(1).await.unwrap();

        let reserved = ledger.reserve(1, 3).await.unwrap();
        assert_eq!(reserved.available, 7);
        assert_eq!(reserved.reserved, 3);
        assert_eq!(reserved.version, before.version + 1);

        let released = ledger.release(1, 3).await.unwrap();
        assert_eq!(released.available, before.available);
        assert_eq!(released.reserved, before.reserved);
        assert_eq!(released.version, before.version + 2);
    }

    #[tokio::test]
    async fn test_reserve_insufficient_carries_snapshot() {
        let (ledger, _fast, _db) = seeded(2).await;
        match ledger.reserve(1, 3).await {
            Err(CheckoutError::InsufficientStock {
                available,
                reserved,
                version,
            }) => {
                assert_eq!(available, 2);
                assert_eq!(reserved, 0);
                assert_eq!(version, 1);
            }
            other => panic!("expected InsufficientStock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_more_than_reserved_is_invalid() {
        let (ledger, _fast, _db) = seeded(10).await;
        ledger.reserve(1, 2).await.unwrap();
        assert!(matches!(
            ledger.release(1, 3).await,
            Err(CheckoutError::InvalidRelease {
                reserved: 2,
                requested: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_commit_reserved_leaves_available_untouched() {
        let (ledger, _fast, _db) = seeded(10).await;
        ledger.reserve(1, 4).await.unwrap();
        ledger.commit_reserved(1, 4).await.unwrap();
        let snap = ledger.snapshot(1).await.unwrap();
        assert_eq!(snap.available, 6);
        assert_eq!(snap.reserved, 0);
    }

    #[tokio::test]
    async fn test_pessimistic_reserve_recomputes_from_durable() {
        let (ledger, _fast, _db) = seeded(8).await;
        let snap = ledger.reserve_pessimistic(1, 3).await.unwrap();
        assert_eq!(snap.available, 5);
        assert_eq!(snap.reserved, 3);

        // Counters now match the recomputed truth.
        let read = ledger.snapshot(1).await.unwrap();
        assert_eq!(read.available, 5);
        assert_eq!(read.reserved, 3);
    }

    #[tokio::test]
    async fn test_refresh_overwrites_counters_by_fiat() {
        let (ledger, fast, _db) = seeded(10).await;
        ledger.snapshot(1).await.unwrap();
        // Simulated divergence.
        fast.set_i64("available_stock:1", 99).await.unwrap();

        let snap = ledger.refresh(1).await.unwrap();
        assert_eq!(snap.available, 10);
        assert_eq!(snap.reserved, 0);
    }

    #[tokio::test]
    async fn test_version_strictly_increases() {
        let (ledger, _fast, _db) = seeded(10).await;
        let mut last = ledger.snapshot(1).await.unwrap().version;
        for _ in 0..3 {
            let v = ledger.reserve(1, 1).await.unwrap().version;
            assert!(v > last);
            last = v;
        }
        let v = ledger.release(1, 1).await.unwrap().version;
        assert!(v > last);
    }
}
