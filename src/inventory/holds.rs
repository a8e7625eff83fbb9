use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CheckoutError;
use crate::model::{Hold, HoldStatus, StockSnapshot};
use crate::store::{
    keys, AtomicOutcome, AtomicProgram, DurableStore, FastStore, Guard, GuardedWrite, HoldRow,
    TxnOutcome, WatchKey, WriteOp,
    durable::{HOLD_OUTCOME_ACTIVE, HOLD_OUTCOME_EXPIRED, HOLD_OUTCOME_RELEASED},
};
use crate::util::RetryPolicy;

use super::ledger::StockLedger;

/// Guard failure codes shared between the release/expire programs and
/// their callers.
pub(crate) const CODE_NOT_ACTIVE: &str = "not_active";
pub(crate) const CODE_NOT_EXPIRED: &str = "not_expired";
pub(crate) const CODE_INSUFFICIENT_RESERVED: &str = "insufficient_reserved";

/// Result of a successful hold creation, including the post-commit stock
/// snapshot for the client.
#[derive(Debug, Clone)]
pub struct CreatedHold {
    pub hold_id: String,
    pub product_id: i64,
    pub qty: i64,
    pub expires_at: chrono::DateTime<Utc>,
    pub snapshot: StockSnapshot,
}

#[derive(Debug, Clone)]
pub struct ReleasedHold {
    pub hold_id: String,
    pub product_id: i64,
    pub qty: i64,
}

/// Outcome of a timeout-driven expiration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    Expired { product_id: i64, qty: i64 },
    /// The hold was already terminalized (or never existed); zero units
    /// released.
    AlreadyGone,
}

/// Lifecycle owner of hold records and their three indices.
///
/// A hold is either discoverable through all of `product_holds`,
/// `expiring_index` and `holds_by_status:active`, or through none of them:
/// creation is one optimistic transaction and every terminal transition is
/// one atomic program, so no half-indexed state is observable.
#[derive(Clone)]
pub struct HoldRegistry {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    ledger: StockLedger,
    ttl_secs: i64,
    max_qty: i64,
    retry: RetryPolicy,
}

impl HoldRegistry {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        ledger: StockLedger,
        ttl_secs: i64,
        max_qty: i64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fast,
            durable,
            ledger,
            ttl_secs,
            max_qty,
            retry,
        }
    }

    /// Reserve `qty` units and materialize the hold in one optimistic
    /// transaction: counters, hash record, and all three indices commit or
    /// conflict together.
    pub async fn create(&self, product_id: i64, qty: i64) -> Result<CreatedHold, CheckoutError> {
        if qty < 1 || qty > self.max_qty {
            return Err(CheckoutError::InvalidQuantity { qty });
        }

        let hold_id = Uuid::new_v4().to_string();
        if !self.ledger.ensure_initialized(product_id).await? {
            return self.create_pessimistic(&hold_id, product_id, qty).await;
        }

        for attempt in 1..=self.retry.max_attempts() {
            let Some((available, reserved, version)) =
                self.ledger.read_counters(product_id).await?
            else {
                return self.create_pessimistic(&hold_id, product_id, qty).await;
            };
            if available < qty {
                return Err(CheckoutError::InsufficientStock {
                    available,
                    reserved,
                    version,
                });
            }
            let active_qty = self
                .fast
                .get_i64(&keys::active_holds(product_id))
                .await?;

            let hold = self.hold_record(&hold_id, product_id, qty, version + 1);
            let mut txn =
                StockLedger::reserve_mutation(product_id, available, reserved, version, qty);
            match active_qty {
                Some(current) => txn
                    .watches
                    .push(WatchKey::int_equals(keys::active_holds(product_id), current)),
                None => txn.watches.push(WatchKey::absent(keys::active_holds(product_id))),
            }
            txn.watches.push(WatchKey::any(keys::product_holds(product_id)));
            txn.watches.push(WatchKey::any(keys::expiring_index(product_id)));
            txn.writes.extend(Self::materialize_ops(&hold));

            match self.fast.guarded_write(txn).await? {
                TxnOutcome::Committed => {
                    self.persist_shadow(&hold).await;
                    return Ok(CreatedHold {
                        hold_id: hold.id,
                        product_id,
                        qty,
                        expires_at: hold.expires_at,
                        snapshot: StockSnapshot {
                            available: available - qty,
                            reserved: reserved + qty,
                            version: version + 1,
                        },
                    });
                }
                TxnOutcome::Conflict => {
                    debug!(
                        "[HOLDS] create conflict on product {} (attempt {})",
                        product_id, attempt
                    );
                    self.retry.pause_after(attempt).await;
                }
            }
        }
        self.create_pessimistic(&hold_id, product_id, qty).await
    }

    /// Row-lock fallback: the reservation happens under the durable
    /// product lock, then the hold is materialized without a guard (the
    /// counters already account for it).
    async fn create_pessimistic(
        &self,
        hold_id: &str,
        product_id: i64,
        qty: i64,
    ) -> Result<CreatedHold, CheckoutError> {
        let snapshot = self.ledger.reserve_pessimistic(product_id, qty).await?;
        let hold = self.hold_record(hold_id, product_id, qty, snapshot.version);

        for op in Self::materialize_ops(&hold) {
            apply_unguarded(self.fast.as_ref(), &op).await?;
        }
        self.persist_shadow(&hold).await;
        Ok(CreatedHold {
            hold_id: hold.id,
            product_id,
            qty,
            expires_at: hold.expires_at,
            snapshot,
        })
    }

    fn hold_record(&self, hold_id: &str, product_id: i64, qty: i64, version: i64) -> Hold {
        let created_at = Utc::now();
        let expires_at = created_at + ChronoDuration::seconds(self.ttl_secs);
        Hold {
            id: hold_id.to_string(),
            product_id,
            qty,
            status: HoldStatus::Active,
            created_at,
            expires_at,
            expires_at_epoch: expires_at.timestamp(),
            version,
            last_accessed_at: None,
        }
    }

    /// Index and record writes that make a hold discoverable.
    fn materialize_ops(hold: &Hold) -> Vec<WriteOp> {
        vec![
            WriteOp::IncrBy {
                key: keys::active_holds(hold.product_id),
                delta: hold.qty,
            },
            WriteOp::HashSet {
                key: keys::hold(&hold.id),
                fields: hold.to_fields(),
            },
            WriteOp::SetAdd {
                key: keys::product_holds(hold.product_id),
                member: hold.id.clone(),
            },
            WriteOp::SortedSetAdd {
                key: keys::expiring_index(hold.product_id),
                member: hold.id.clone(),
                score: hold.expires_at_epoch,
            },
            WriteOp::SetAdd {
                key: keys::holds_by_status(HoldStatus::Active.as_str()),
                member: hold.id.clone(),
            },
        ]
    }

    async fn persist_shadow(&self, hold: &Hold) {
        let row = HoldRow {
            hold_id: hold.id.clone(),
            product_id: hold.product_id,
            qty: hold.qty,
            outcome: HOLD_OUTCOME_ACTIVE.to_string(),
            expires_at: hold.expires_at,
            created_at: hold.created_at,
        };
        if let Err(err) = self.durable.insert_hold(&row).await {
            warn!(
                "[HOLDS] failed to persist durable shadow for hold {}: {}",
                hold.id, err
            );
        }
    }

    pub(crate) async fn mark_shadow(&self, hold_id: &str, outcome: &str) {
        if let Err(err) = self.durable.mark_hold(hold_id, outcome).await {
            warn!(
                "[HOLDS] failed to mark durable shadow for hold {} as {}: {}",
                hold_id, outcome, err
            );
        }
    }

    pub async fn get(&self, hold_id: &str) -> Result<Option<Hold>, CheckoutError> {
        match self.fast.hash_get_all(&keys::hold(hold_id)).await? {
            Some(fields) => Hold::from_fields(hold_id, &fields).map(Some),
            None => Ok(None),
        }
    }

    /// Hydrate many holds in one pipelined round trip; absent ids are
    /// skipped, malformed records are logged and skipped.
    pub async fn get_many(&self, hold_ids: &[String]) -> Result<Vec<Hold>, CheckoutError> {
        let hash_keys: Vec<String> = hold_ids.iter().map(|id| keys::hold(id)).collect();
        let records = self.fast.hash_get_all_multi(&hash_keys).await?;
        let mut holds = Vec::with_capacity(hold_ids.len());
        for (id, record) in hold_ids.iter().zip(records) {
            let Some(fields) = record else { continue };
            match Hold::from_fields(id, &fields) {
                Ok(hold) => holds.push(hold),
                Err(err) => warn!("[HOLDS] skipping malformed hold {}: {}", id, err),
            }
        }
        Ok(holds)
    }

    /// The terminal-transition program: refund the reservation and erase
    /// the hold from the record and all indices in one indivisible step.
    fn teardown_ops(hold: &Hold) -> Vec<WriteOp> {
        vec![
            WriteOp::IncrBy {
                key: keys::available_stock(hold.product_id),
                delta: hold.qty,
            },
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
        ]
    }

    pub(crate) fn release_program(hold: &Hold) -> AtomicProgram {
        AtomicProgram {
            guards: vec![
                Guard::HashFieldEquals {
                    key: keys::hold(&hold.id),
                    field: "status".into(),
                    expected: HoldStatus::Active.as_str().into(),
                    code: CODE_NOT_ACTIVE,
                },
                Guard::IntAtLeast {
                    key: keys::reserved_stock(hold.product_id),
                    min: hold.qty,
                    code: CODE_INSUFFICIENT_RESERVED,
                },
            ],
            writes: Self::teardown_ops(hold),
        }
    }

    pub(crate) fn expire_program(hold: &Hold, now_epoch: i64) -> AtomicProgram {
        let mut program = Self::release_program(hold);
        program.guards.insert(
            1,
            Guard::HashFieldIntAtMost {
                key: keys::hold(&hold.id),
                field: "expires_at_epoch".into(),
                max: now_epoch,
                code: CODE_NOT_EXPIRED,
            },
        );
        program
    }

    /// Caller-initiated cancel of an active hold.
    pub async fn release(&self, hold_id: &str) -> Result<ReleasedHold, CheckoutError> {
        let hold = self
            .get(hold_id)
            .await?
            .ok_or_else(|| CheckoutError::HoldNotFound {
                hold_id: hold_id.to_string(),
            })?;
        if hold.status != HoldStatus::Active {
            return Err(CheckoutError::HoldInvalid {
                reason: format!("hold is {}", hold.status),
            });
        }

        match self.fast.run_atomic(Self::release_program(&hold)).await? {
            AtomicOutcome::Applied => {
                self.mark_shadow(hold_id, HOLD_OUTCOME_RELEASED).await;
                Ok(ReleasedHold {
                    hold_id: hold.id,
                    product_id: hold.product_id,
                    qty: hold.qty,
                })
            }
            AtomicOutcome::Rejected(CODE_NOT_ACTIVE) => Err(CheckoutError::HoldInvalid {
                reason: "hold is not active".into(),
            }),
            AtomicOutcome::Rejected(CODE_INSUFFICIENT_RESERVED) => {
                let reserved = self
                    .fast
                    .get_i64(&keys::reserved_stock(hold.product_id))
                    .await?
                    .unwrap_or(0);
                Err(CheckoutError::InvalidRelease {
                    reserved,
                    requested: hold.qty,
                })
            }
            AtomicOutcome::Rejected(code) => Err(CheckoutError::StateConflict {
                reason: format!("release rejected: {code}"),
            }),
        }
    }

    /// Timeout-driven expiration, gated on `expires_at_epoch <= now`.
    pub async fn expire(&self, hold_id: &str, now_epoch: i64) -> Result<ExpireOutcome, CheckoutError> {
        let Some(hold) = self.get(hold_id).await? else {
            return Ok(ExpireOutcome::AlreadyGone);
        };
        if hold.status != HoldStatus::Active {
            return Ok(ExpireOutcome::AlreadyGone);
        }
        if !hold.is_expired_at(now_epoch) {
            return Err(CheckoutError::HoldNotExpired {
                expires_at: hold.expires_at,
                seconds_remaining: hold.expires_at_epoch - now_epoch,
            });
        }

        match self
            .fast
            .run_atomic(Self::expire_program(&hold, now_epoch))
            .await?
        {
            AtomicOutcome::Applied => {
                self.mark_shadow(hold_id, HOLD_OUTCOME_EXPIRED).await;
                Ok(ExpireOutcome::Expired {
                    product_id: hold.product_id,
                    qty: hold.qty,
                })
            }
            AtomicOutcome::Rejected(CODE_NOT_EXPIRED) => Err(CheckoutError::HoldNotExpired {
                expires_at: hold.expires_at,
                seconds_remaining: (hold.expires_at_epoch - now_epoch).max(0),
            }),
            // Raced with a release or a payment commit.
            AtomicOutcome::Rejected(_) => Ok(ExpireOutcome::AlreadyGone),
        }
    }

    /// Expire a batch of holds in one indivisible round trip. Outcomes are
    /// positionally aligned with `holds`.
    pub async fn expire_many(
        &self,
        holds: &[Hold],
        now_epoch: i64,
    ) -> Result<Vec<ExpireOutcome>, CheckoutError> {
        let programs = holds
            .iter()
            .map(|hold| Self::expire_program(hold, now_epoch))
            .collect();
        let outcomes = self.fast.run_atomic_batch(programs).await?;

        let mut results = Vec::with_capacity(holds.len());
        for (hold, outcome) in holds.iter().zip(outcomes) {
            match outcome {
                AtomicOutcome::Applied => {
                    self.mark_shadow(&hold.id, HOLD_OUTCOME_EXPIRED).await;
                    results.push(ExpireOutcome::Expired {
                        product_id: hold.product_id,
                        qty: hold.qty,
                    });
                }
                AtomicOutcome::Rejected(_) => results.push(ExpireOutcome::AlreadyGone),
            }
        }
        Ok(results)
    }

    /// Up to `limit` expired-and-still-active holds across all products,
    /// hydrated and re-validated against a concurrent terminalization.
    pub async fn find_expired(
        &self,
        limit: usize,
        now_epoch: i64,
    ) -> Result<Vec<Hold>, CheckoutError> {
        let mut index_keys = self.fast.keys_matching(keys::EXPIRING_INDEX_PATTERN).await?;
        index_keys.sort();

        let mut candidate_ids: Vec<String> = Vec::new();
        for index_key in &index_keys {
            if candidate_ids.len() >= limit {
                break;
            }
            let remaining = limit - candidate_ids.len();
            let ids = self
                .fast
                .sorted_set_range_by_score(index_key, 0, now_epoch, remaining)
                .await?;
            candidate_ids.extend(ids);
        }

        let mut holds = self.get_many(&candidate_ids).await?;
        holds.retain(|hold| hold.status == HoldStatus::Active && hold.is_expired_at(now_epoch));
        holds.truncate(limit);
        Ok(holds)
    }

    /// Stamp `last_accessed_at` on an active hold; audit-only, monitored
    /// for concurrent transition via the watch.
    pub async fn touch(&self, hold_id: &str) -> Result<TxnOutcome, CheckoutError> {
        let txn = GuardedWrite {
            watches: vec![WatchKey::any(keys::hold(hold_id))],
            writes: vec![WriteOp::HashSet {
                key: keys::hold(hold_id),
                fields: vec![("last_accessed_at".into(), Utc::now().to_rfc3339())],
            }],
        };
        Ok(self.fast.guarded_write(txn).await?)
    }

    pub fn hold_ttl_secs(&self) -> i64 {
        self.ttl_secs
    }
}

async fn apply_unguarded(fast: &dyn FastStore, op: &WriteOp) -> Result<(), CheckoutError> {
    match op {
        WriteOp::SetInt { key, value } => fast.set_i64(key, *value).await?,
        WriteOp::IncrBy { key, delta } => {
            fast.incr_by(key, *delta).await?;
        }
        WriteOp::HashSet { key, fields } => fast.hash_set_multi(key, fields).await?,
        WriteOp::SetAdd { key, member } => fast.set_add(key, member).await?,
        WriteOp::SetRemove { key, member } => fast.set_remove(key, member).await?,
        WriteOp::SortedSetAdd { key, member, score } => {
            fast.sorted_set_add(key, member, *score).await?
        }
        WriteOp::SortedSetRemove { key, member } => fast.sorted_set_remove(key, member).await?,
        WriteOp::Delete { key } => fast.delete(key).await?,
    }
    Ok(())
}
