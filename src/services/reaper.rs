use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::CheckoutError;
use crate::inventory::{ExpireOutcome, HoldRegistry};
use crate::model::Hold;
use crate::store::{keys, DurableStore, FastStore};
use crate::util::worker_tag;

/// How many per-hold failures are surfaced verbosely per sweep; the rest
/// are only counted.
const VERBOSE_FAILURES: usize = 5;

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub batch_size: usize,
    pub max_runtime: Duration,
    pub lease_ttl_secs: u64,
    pub cadence: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_runtime: Duration::from_secs(55),
            lease_ttl_secs: 5,
            cadence: Duration::from_secs(60),
        }
    }
}

/// Totals for one sweep invocation. Per-hold failures never abort the
/// sweep; they land here.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl SweepReport {
    fn record_failure(&mut self, hold_id: &str, err: &CheckoutError) {
        self.failed += 1;
        if self.errors.len() < VERBOSE_FAILURES {
            self.errors.push(format!("{hold_id}: {err}"));
        }
    }
}

/// Background sweeper that drives expired holds to their terminal state.
///
/// Multiple reaper instances may coexist; the per-hold `expire_lock`
/// lease (short TTL, self-owned release) keeps them from stomping each
/// other. One invocation is bounded by `batch_size` pages and a wall-clock
/// budget.
pub struct ExpiryReaper {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    registry: Arc<HoldRegistry>,
    settings: ReaperSettings,
}

impl ExpiryReaper {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        registry: Arc<HoldRegistry>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            fast,
            durable,
            registry,
            settings,
        }
    }

    /// One `--once` invocation: page through expired candidates until the
    /// index is drained or the runtime budget is spent.
    pub async fn run_once(&self) -> Result<SweepReport, CheckoutError> {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let mut attempted: HashSet<String> = HashSet::new();

        'sweep: loop {
            if started.elapsed() >= self.settings.max_runtime {
                info!("[REAPER] runtime budget spent, exiting cleanly");
                break;
            }
            let now_epoch = Utc::now().timestamp();
            let mut batch = self
                .registry
                .find_expired(self.settings.batch_size, now_epoch)
                .await?;
            // Holds we already tried this sweep stay failed; don't spin on
            // them.
            batch.retain(|hold| !attempted.contains(&hold.id));
            if batch.is_empty() {
                break;
            }
            for hold in &batch {
                attempted.insert(hold.id.clone());
            }

            let mut by_product: BTreeMap<i64, Vec<Hold>> = BTreeMap::new();
            for hold in batch {
                by_product.entry(hold.product_id).or_default().push(hold);
            }

            for (product_id, holds) in by_product {
                if started.elapsed() >= self.settings.max_runtime {
                    info!("[REAPER] runtime budget spent mid-batch, exiting cleanly");
                    break 'sweep;
                }
                report.examined += holds.len();
                if holds.len() >= 2 {
                    self.sweep_product(product_id, &holds, now_epoch, &mut report)
                        .await;
                } else {
                    self.sweep_single(&holds[0], now_epoch, &mut report).await;
                }
            }
        }

        self.write_heartbeat(&report).await;
        info!(
            "[REAPER] sweep done: examined={} expired={} skipped={} failed={}",
            report.examined, report.expired, report.skipped, report.failed
        );
        for line in &report.errors {
            warn!("[REAPER] failed hold: {}", line);
        }
        Ok(report)
    }

    /// Looping host mode; each tick is an independent `run_once`.
    pub async fn run_forever(&self) {
        let mut ticker = tokio::time::interval(self.settings.cadence);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!("[REAPER] sweep failed: {}", err);
            }
        }
    }

    /// Two or more candidates on one product: expire them in a single
    /// indivisible round trip.
    async fn sweep_product(
        &self,
        product_id: i64,
        holds: &[Hold],
        now_epoch: i64,
        report: &mut SweepReport,
    ) {
        let mut leased: Vec<(Hold, String)> = Vec::with_capacity(holds.len());
        for hold in holds {
            match self.acquire_lease(&hold.id).await {
                Ok(Some(tag)) => leased.push((hold.clone(), tag)),
                Ok(None) => {
                    debug!("[REAPER] hold {} leased elsewhere, skipping", hold.id);
                    report.skipped += 1;
                }
                Err(err) => report.record_failure(&hold.id, &err),
            }
        }
        if leased.is_empty() {
            return;
        }

        let batch: Vec<Hold> = leased.iter().map(|(hold, _)| hold.clone()).collect();
        let result = self.registry.expire_many(&batch, now_epoch).await;
        match result {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        ExpireOutcome::Expired { qty, .. } => {
                            debug!(
                                "[REAPER] expired {} units on product {}",
                                qty, product_id
                            );
                            report.expired += 1;
                        }
                        ExpireOutcome::AlreadyGone => report.skipped += 1,
                    }
                }
            }
            Err(err) => {
                for (hold, _) in &leased {
                    report.record_failure(&hold.id, &err);
                }
            }
        }
        for (hold, tag) in &leased {
            self.release_lease(&hold.id, tag).await;
        }
    }

    async fn sweep_single(&self, hold: &Hold, now_epoch: i64, report: &mut SweepReport) {
        let tag = match self.acquire_lease(&hold.id).await {
            Ok(Some(tag)) => tag,
            Ok(None) => {
                debug!("[REAPER] hold {} leased elsewhere, skipping", hold.id);
                report.skipped += 1;
                return;
            }
            Err(err) => {
                report.record_failure(&hold.id, &err);
                return;
            }
        };

        let result = self.registry.expire(&hold.id, now_epoch).await;
        // The lease is ours; release it on every path.
        self.release_lease(&hold.id, &tag).await;

        match result {
            Ok(ExpireOutcome::Expired { product_id, qty }) => {
                debug!(
                    "[REAPER] expired hold {} ({} units on product {})",
                    hold.id, qty, product_id
                );
                report.expired += 1;
            }
            Ok(ExpireOutcome::AlreadyGone) => report.skipped += 1,
            // Raced with a clock edge; it will come around again.
            Err(CheckoutError::HoldNotExpired { .. }) => report.skipped += 1,
            Err(err) => report.record_failure(&hold.id, &err),
        }
    }

    async fn acquire_lease(&self, hold_id: &str) -> Result<Option<String>, CheckoutError> {
        let tag = worker_tag();
        let acquired = self
            .fast
            .set_nx_ex(&keys::expire_lock(hold_id), &tag, self.settings.lease_ttl_secs)
            .await?;
        Ok(acquired.then_some(tag))
    }

    /// Delete the lease only if it is still ours; an expired-and-retaken
    /// lease belongs to someone else.
    async fn release_lease(&self, hold_id: &str, tag: &str) {
        let key = keys::expire_lock(hold_id);
        match self.fast.get_string(&key).await {
            Ok(Some(current)) if current == tag => {
                if let Err(err) = self.fast.delete(&key).await {
                    warn!("[REAPER] failed to release lease on {}: {}", hold_id, err);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("[REAPER] failed to read lease on {}: {}", hold_id, err),
        }
    }

    /// Liveness heartbeat: total live holds plus per-product stock
    /// readings, so operators can spot a wedged reaper.
    async fn write_heartbeat(&self, report: &SweepReport) {
        let metadata = match self.heartbeat_metadata(report).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("[REAPER] could not gather heartbeat readings: {}", err);
                json!({
                    "sweep": {
                        "examined": report.examined,
                        "expired": report.expired,
                        "skipped": report.skipped,
                        "failed": report.failed,
                    }
                })
            }
        };
        if let Err(err) = self.durable.record_heartbeat("expiry-reaper", metadata).await {
            warn!("[REAPER] failed to record heartbeat: {}", err);
        }
    }

    async fn heartbeat_metadata(
        &self,
        report: &SweepReport,
    ) -> Result<serde_json::Value, CheckoutError> {
        let total_holds = self.fast.keys_matching(keys::HOLD_PATTERN).await?.len();

        let mut products = serde_json::Map::new();
        for key in self.fast.keys_matching(keys::STOCK_VERSION_PATTERN).await? {
            let Some(product_id) = keys::product_of_stock_version(&key) else {
                continue;
            };
            let available = self
                .fast
                .get_i64(&keys::available_stock(product_id))
                .await?
                .unwrap_or(0);
            let reserved = self
                .fast
                .get_i64(&keys::reserved_stock(product_id))
                .await?
                .unwrap_or(0);
            let version = self.fast.get_i64(&key).await?.unwrap_or(0);
            products.insert(
                product_id.to_string(),
                json!({ "available": available, "reserved": reserved, "version": version }),
            );
        }

        Ok(json!({
            "at": Utc::now().to_rfc3339(),
            "total_holds": total_holds,
            "products": products,
            "sweep": {
                "examined": report.examined,
                "expired": report.expired,
                "skipped": report.skipped,
                "failed": report.failed,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StockLedger;
    use crate::store::{MemDb, MemoryStore};
    use crate::util::RetryPolicy;

    async fn reaper(
        stock: i64,
        ttl_secs: i64,
    ) -> (ExpiryReaper, Arc<HoldRegistry>, Arc<MemoryStore>, Arc<MemDb>) {
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
        let reaper = ExpiryReaper::new(
            fast.clone(),
            db.clone(),
            registry.clone(),
            ReaperSettings::default(),
        );
        (reaper, registry, fast, db)
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_holds_and_refunds_stock() {
        let (reaper, registry, fast, db) = reaper(10, 0).await;
        let first = registry.create(1, 2).await.unwrap();
        let second = registry.create(1, 3).await.unwrap();

        let report = reaper.run_once().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.expired, 2);
        assert_eq!(report.failed, 0);

        assert!(registry.get(&first.hold_id).await.unwrap().is_none());
        assert!(registry.get(&second.hold_id).await.unwrap().is_none());
        assert_eq!(fast.get_i64("available_stock:1").await.unwrap(), Some(10));
        assert_eq!(fast.get_i64("reserved_stock:1").await.unwrap(), Some(0));

        assert_eq!(db.hold_row(&first.hold_id).await.unwrap().outcome, "expired");
        assert!(db.heartbeat("expiry-reaper").await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_skips_live_holds() {
        let (reaper, registry, _fast, _db) = reaper(10, 300).await;
        registry.create(1, 2).await.unwrap();

        let report = reaper.run_once().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_holds_leased_by_another_worker() {
        let (reaper, registry, fast, _db) = reaper(10, 0).await;
        let created = registry.create(1, 2).await.unwrap();

        // Another worker owns the lease.
        assert!(fast
            .set_nx_ex(&keys::expire_lock(&created.hold_id), "other:1:0", 60)
            .await
            .unwrap());

        let report = reaper.run_once().await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.skipped, 1);

        // The hold is untouched for the owner to process.
        assert!(registry.get(&created.hold_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lease_released_after_sweep() {
        let (reaper, registry, fast, _db) = reaper(10, 0).await;
        let created = registry.create(1, 2).await.unwrap();

        reaper.run_once().await.unwrap();
        assert_eq!(
            fast.get_string(&keys::expire_lock(&created.hold_id))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_heartbeat_carries_stock_readings() {
        let (reaper, registry, _fast, db) = reaper(10, 300).await;
        registry.create(1, 4).await.unwrap();

        reaper.run_once().await.unwrap();
        let heartbeat = db.heartbeat("expiry-reaper").await.unwrap();
        assert_eq!(heartbeat["total_holds"], 1);
        assert_eq!(heartbeat["products"]["1"]["available"], 6);
        assert_eq!(heartbeat["products"]["1"]["reserved"], 4);
    }
}
