use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::guard::DriftReport;
use super::{CreditError, CreditLedger};

#[cfg(feature = "store-redis")]
use super::daily::{seconds_until_day_end, spending_date};
#[cfg(feature = "store-redis")]
use time::OffsetDateTime;

/// Cursor-based replayer: re-derives cache-tier committed state from the
/// durable usage-event log. Replays are idempotent by event id, so multiple
/// instances may run concurrently with each other and with live traffic.
pub struct ReconciliationWorker {
    ledger: Arc<CreditLedger>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub accounts: usize,
    /// Events read past the cursors.
    pub replayed_events: usize,
    /// Events whose effect was actually missing from the cache tier.
    pub corrected_events: usize,
    pub drift_reports: Vec<DriftReport>,
}

impl ReconciliationWorker {
    pub fn new(ledger: Arc<CreditLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport, CreditError> {
        let mut report = ReconcileReport::default();
        let accounts = self.ledger.store().accounts_with_usage().await?;
        for account_id in accounts {
            report.accounts += 1;
            self.reconcile_account(&account_id, &mut report).await?;
        }
        if report.corrected_events > 0 {
            let _ = self
                .ledger
                .store()
                .append_audit_log(
                    "reconcile.corrected",
                    serde_json::json!({
                        "replayed_events": report.replayed_events,
                        "corrected_events": report.corrected_events,
                    }),
                )
                .await;
        }
        Ok(report)
    }

    /// Replay one account's events past its cursor, then re-check drift.
    pub async fn reconcile_account(
        &self,
        account_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), CreditError> {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.ledger.cache() {
            let batch_size = self.ledger.config().reconcile.batch_size;
            let store = self.ledger.store();
            let replayed_before = report.replayed_events;
            let mut cursor = store.reconciliation_cursor(account_id).await?;

            loop {
                let events = store
                    .usage_events_after(account_id, cursor, batch_size)
                    .await?;
                if events.is_empty() {
                    break;
                }
                for event in &events {
                    let event_date = spending_date(
                        OffsetDateTime::from_unix_timestamp(event.created_at_ms / 1_000)
                            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
                    );
                    let day_ttl = seconds_until_day_end(OffsetDateTime::now_utc());
                    let applied = cache
                        .apply_usage_event(
                            &event.account_id,
                            event.event_id,
                            event.cost_micros,
                            &event_date,
                            day_ttl,
                        )
                        .await
                        .map_err(|err| CreditError::Unavailable {
                            message: format!("cache replay failed: {err}"),
                        })?;

                    report.replayed_events += 1;
                    if applied {
                        report.corrected_events += 1;
                        tracing::info!(
                            account_id,
                            event_id = event.event_id,
                            cost_micros = event.cost_micros.micros(),
                            "reconciliation applied missing cache write"
                        );
                    }
                    // The cursor only moves once the cache write is durable
                    // on the cache side; a crash here replays harmlessly.
                    store
                        .advance_reconciliation_cursor(account_id, event.event_id)
                        .await?;
                    cursor = cursor.max(event.event_id);
                }
                if events.len() < batch_size {
                    break;
                }
            }

            self.ledger
                .metrics()
                .record_reconciled_events((report.replayed_events - replayed_before) as u64);
            if let Some(drift) = self.ledger.check_conservation(account_id).await? {
                report.drift_reports.push(drift);
            }
            return Ok(());
        }

        // Without a cache tier there is nothing to re-derive.
        let _ = (account_id, report);
        Ok(())
    }

    /// Run on a fixed interval until the handle is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval_secs = self.ledger.config().reconcile.interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) if report.corrected_events > 0 => {
                        tracing::info!(
                            corrected_events = report.corrected_events,
                            "reconciliation corrected cache drift"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            "reconciliation pass failed; will retry next tick"
                        );
                    }
                }
            }
        })
    }
}
