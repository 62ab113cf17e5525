use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::amount::MicroUsd;
use super::sqlite_store::now_millis;
use super::{CreditError, CreditLedger};

/// Background job retiring expired, unused lots. Every mutation is keyed by a
/// deterministic per-lot reference id, so re-runs and concurrent instances
/// converge instead of double-expiring.
pub struct LotExpirySweep {
    ledger: Arc<CreditLedger>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_lots: usize,
    pub expired_micros: MicroUsd,
}

impl LotExpirySweep {
    pub fn new(ledger: Arc<CreditLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run_once(&self) -> Result<SweepReport, CreditError> {
        self.run_once_at(now_millis()).await
    }

    /// Sweep against an explicit clock. One lot per durable transaction; a
    /// lot that fails is skipped, never aborting its siblings.
    pub async fn run_once_at(&self, now_ms: i64) -> Result<SweepReport, CreditError> {
        let batch_limit = self.ledger.config().sweep.batch_limit;
        let expired = self
            .ledger
            .store()
            .expire_due_lots(now_ms, batch_limit)
            .await?;

        let mut report = SweepReport::default();
        for lot in &expired {
            report.expired_lots += 1;
            report.expired_micros = report.expired_micros.saturating_add(lot.expired_micros);

            #[cfg(feature = "store-redis")]
            if let Some(cache) = self.ledger.cache() {
                if let Err(err) = cache
                    .apply_expiry(&lot.account_id, lot.lot_id, lot.expired_micros)
                    .await
                {
                    tracing::warn!(
                        account_id = %lot.account_id,
                        lot_id = lot.lot_id,
                        error = %err,
                        "cache credit adjustment failed after expiry"
                    );
                }
            }
            tracing::info!(
                account_id = %lot.account_id,
                lot_id = lot.lot_id,
                expired_micros = lot.expired_micros.micros(),
                "expired lot retired"
            );
        }

        if report.expired_lots > 0 {
            self.ledger
                .metrics()
                .record_swept_lots(report.expired_lots as u64);
            let _ = self
                .ledger
                .store()
                .append_audit_log(
                    "sweep.completed",
                    serde_json::json!({
                        "expired_lots": report.expired_lots,
                        "expired_micros": report.expired_micros.micros(),
                    }),
                )
                .await;
        }
        Ok(report)
    }

    /// Run on a fixed interval until the handle is aborted. Failures log and
    /// reschedule; nothing waits on this task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval_secs = self.ledger.config().sweep.interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) if report.expired_lots > 0 => {
                        tracing::debug!(
                            expired_lots = report.expired_lots,
                            expired_micros = report.expired_micros.micros(),
                            "sweep pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "sweep pass failed; will retry next tick");
                    }
                }
            }
        })
    }
}
