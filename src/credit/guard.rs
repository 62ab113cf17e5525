use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::CreditError;
use super::amount::MicroUsd;
use super::config::ConservationConfig;
use super::observability::CreditMetrics;
use super::sqlite_store::SqliteStore;

#[cfg(feature = "store-redis")]
use super::redis_store::RedisStore;

/// Fence issuer and cross-tier drift auditor. The only component allowed to
/// authorize a transition that mutates both tiers.
pub struct ConservationGuard {
    durable: SqliteStore,
    #[cfg(feature = "store-redis")]
    cache: Option<RedisStore>,
    config: ConservationConfig,
    metrics: Arc<CreditMetrics>,
}

/// Outcome of one conservation check. `drift_micros` is signed:
/// cache committed minus durable committed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriftReport {
    pub account_id: String,
    pub cache_committed_micros: MicroUsd,
    pub durable_committed_micros: MicroUsd,
    pub drift_micros: MicroUsd,
    pub tolerance_micros: MicroUsd,
    pub breaker_micros: MicroUsd,
    pub within_tolerance: bool,
    pub breaker_tripped: bool,
}

impl ConservationGuard {
    pub fn new(
        durable: SqliteStore,
        config: ConservationConfig,
        metrics: Arc<CreditMetrics>,
    ) -> Self {
        Self {
            durable,
            #[cfg(feature = "store-redis")]
            cache: None,
            config,
            metrics,
        }
    }

    #[cfg(feature = "store-redis")]
    pub fn with_cache(mut self, cache: RedisStore) -> Self {
        self.cache = Some(cache);
        self
    }

    #[cfg(feature = "store-redis")]
    fn cache(&self) -> Option<&RedisStore> {
        self.cache.as_ref()
    }

    /// Issue a fence token: cache-tier increment on the fast path, durable
    /// compare-and-advance when the cache tier is absent or unreachable.
    pub async fn acquire_fence(&self, account_id: &str) -> Result<u64, CreditError> {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            match cache.acquire_fence(account_id).await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    tracing::warn!(
                        account_id,
                        error = %err,
                        "cache fence acquisition failed; falling back to durable tier"
                    );
                }
            }
        }
        Ok(self.durable.acquire_fence(account_id).await?)
    }

    /// True when the circuit breaker is open for the account. The cache flag
    /// answers first; the durable halt row is authoritative.
    pub async fn is_halted(&self, account_id: &str) -> Result<bool, CreditError> {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            match cache.is_halted(account_id).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(account_id, error = %err, "cache halt check failed");
                }
            }
        }
        Ok(self.durable.halt(account_id).await?.is_some())
    }

    /// Compare the cache tier's committed total against the durable sum of
    /// usage-event cost. Returns `None` when the cache tier is absent or did
    /// not answer; a single unreachable check is skipped, never a halt.
    pub async fn check_conservation(
        &self,
        account_id: &str,
        daily_cap: Option<MicroUsd>,
    ) -> Result<Option<DriftReport>, CreditError> {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            let cache_committed = match cache.committed_total(account_id).await {
                Ok(total) => total,
                Err(err) => {
                    tracing::warn!(
                        account_id,
                        error = %err,
                        "conservation check skipped: cache tier unreachable"
                    );
                    return Ok(None);
                }
            };
            let durable_committed = self.durable.committed_total(account_id).await?;

            let drift = cache_committed.saturating_sub(durable_committed);
            let (tolerance, breaker) = self.drift_thresholds(daily_cap);
            let magnitude = drift.abs();
            let within_tolerance = magnitude <= tolerance;
            let breaker_tripped = magnitude > breaker;

            self.metrics.record_drift(drift.micros());
            let report = DriftReport {
                account_id: account_id.to_string(),
                cache_committed_micros: cache_committed,
                durable_committed_micros: durable_committed,
                drift_micros: drift,
                tolerance_micros: tolerance,
                breaker_micros: breaker,
                within_tolerance,
                breaker_tripped,
            };

            if breaker_tripped {
                self.trip_breaker(&report).await?;
            } else if !within_tolerance {
                tracing::warn!(
                    account_id,
                    drift_micros = drift.micros(),
                    tolerance_micros = tolerance.micros(),
                    "conservation drift above tolerance"
                );
            }
            return Ok(Some(report));
        }

        let _ = (account_id, daily_cap);
        Ok(None)
    }

    /// Operator clear. Refuses while drift is still above tolerance, and
    /// refuses when the cache tier cannot confirm it has recovered.
    pub async fn clear_halt(
        &self,
        account_id: &str,
        daily_cap: Option<MicroUsd>,
    ) -> Result<DriftReport, CreditError> {
        let Some(report) = self.check_conservation(account_id, daily_cap).await? else {
            return Err(CreditError::Unavailable {
                message: "cache tier unreachable; cannot confirm drift recovery".to_string(),
            });
        };
        if !report.within_tolerance {
            return Err(CreditError::ConservationHalted {
                account_id: account_id.to_string(),
            });
        }

        self.durable.clear_halt(account_id).await?;
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            if let Err(err) = cache.clear_halt(account_id).await {
                tracing::warn!(account_id, error = %err, "cache halt flag clear failed");
            }
        }
        let _ = self
            .durable
            .append_audit_log(
                "conservation.halt_cleared",
                serde_json::json!({
                    "account_id": account_id,
                    "drift_micros": report.drift_micros.micros(),
                }),
            )
            .await;
        tracing::info!(account_id, "conservation halt cleared");
        Ok(report)
    }

    /// Tolerance and breaker thresholds for an account, in micros.
    pub fn drift_thresholds(&self, daily_cap: Option<MicroUsd>) -> (MicroUsd, MicroUsd) {
        match daily_cap {
            Some(cap) => (
                bps_of(cap, self.config.tolerance_bps),
                bps_of(cap, self.config.breaker_bps),
            ),
            None => (
                self.config.uncapped_tolerance_micros,
                self.config.uncapped_breaker_micros,
            ),
        }
    }

    #[cfg(feature = "store-redis")]
    async fn trip_breaker(&self, report: &DriftReport) -> Result<(), CreditError> {
        let account_id = report.account_id.as_str();
        self.durable
            .set_halt(account_id, report.drift_micros)
            .await?;
        if let Some(cache) = self.cache() {
            if let Err(err) = cache.set_halt(account_id, report.drift_micros).await {
                tracing::warn!(account_id, error = %err, "cache halt flag write failed");
            }
        }
        self.metrics.record_halt_tripped();
        let _ = self
            .durable
            .append_audit_log(
                "conservation.halted",
                serde_json::json!({
                    "account_id": account_id,
                    "drift_micros": report.drift_micros.micros(),
                    "breaker_micros": report.breaker_micros.micros(),
                    "cache_committed_micros": report.cache_committed_micros.micros(),
                    "durable_committed_micros": report.durable_committed_micros.micros(),
                }),
            )
            .await;
        tracing::error!(
            account_id,
            drift_micros = report.drift_micros.micros(),
            breaker_micros = report.breaker_micros.micros(),
            "conservation breaker tripped; new reservations halted"
        );
        Ok(())
    }
}

fn bps_of(amount: MicroUsd, bps: u32) -> MicroUsd {
    let micros = (amount.micros() as i128 * bps as i128) / 10_000;
    MicroUsd::from_micros(micros.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
}
