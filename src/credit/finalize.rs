use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::amount::MicroUsd;
use super::config::CapOverflow;
use super::daily::spending_date_utc;
use super::sqlite_store::{DurableFinalize, FinalizeArgs};
use super::store_types::{LotEntryRecord, UsageEventRecord};
use super::{CreditError, CreditLedger};

#[cfg(feature = "store-redis")]
use super::daily::seconds_until_day_end;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub account_id: String,
    /// Caller-generated; re-issuing the same id does not double-hold.
    pub reservation_id: String,
    pub estimate_micros: MicroUsd,
}

/// Ticket returned by a successful reservation. `held_in_cache` is false when
/// the cache tier was absent or unreachable and only an advisory cap check
/// ran; the durable finalize transaction still enforces the cap either way.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reservation {
    pub account_id: String,
    pub reservation_id: String,
    pub estimate_micros: MicroUsd,
    pub held_in_cache: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub account_id: String,
    /// Caller-supplied idempotency key; a retry after an unknown outcome must
    /// reuse it.
    pub finalization_id: String,
    /// Token from [`CreditLedger::acquire_fence`].
    pub fence_token: u64,
    /// Actual cost reported by the provider.
    pub cost_micros: MicroUsd,
    /// The hold to release once the outcome is terminal.
    pub reservation_id: Option<String>,
    /// Overrides the account's configured cap policy for this call.
    pub cap_policy: Option<CapOverflow>,
}

/// Terminal states of one finalize call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FinalizeOutcome {
    Finalized {
        event: UsageEventRecord,
        entries: Vec<LotEntryRecord>,
        balance_micros: MicroUsd,
    },
    /// Idempotent replay; carries the prior result.
    Duplicate {
        event: UsageEventRecord,
        balance_micros: MicroUsd,
    },
    /// Lost the fence race. Retry with a freshly acquired token and the same
    /// finalization id.
    StaleFence { stored_token: u64 },
    BudgetExceeded {
        limit_micros: MicroUsd,
        attempted_micros: MicroUsd,
    },
}

impl CreditLedger {
    /// Fast-path admission check: place a hold against the daily cap before
    /// the metered work starts. Rejected outright at the cap; clamping only
    /// ever happens at finalize.
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Reservation, CreditError> {
        if self.is_halted(&request.account_id).await? {
            self.metrics().record_reservation_rejected();
            return Err(CreditError::ConservationHalted {
                account_id: request.account_id,
            });
        }

        let account = self.config().account(&request.account_id);
        let estimate = request.estimate_micros.max_zero();
        let spending_date = spending_date_utc();

        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            match cache
                .reserve(
                    &request.account_id,
                    &request.reservation_id,
                    estimate,
                    account.daily_cap_micros,
                    &spending_date,
                    self.config().reservation_ttl_secs,
                )
                .await
            {
                Ok(()) => {
                    self.metrics().record_reservation();
                    return Ok(Reservation {
                        account_id: request.account_id,
                        reservation_id: request.reservation_id,
                        estimate_micros: estimate,
                        held_in_cache: true,
                    });
                }
                Err(err @ super::RedisStoreError::BudgetExceeded { .. })
                | Err(err @ super::RedisStoreError::Halted { .. }) => {
                    self.metrics().record_reservation_rejected();
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(
                        account_id = %request.account_id,
                        error = %err,
                        "cache reservation failed; falling back to advisory cap check"
                    );
                }
            }
        }

        // No cache hold available: check the cap against the daily counter
        // chain. The durable finalize transaction remains the enforcement
        // point of record.
        if let Some(cap) = account.daily_cap_micros {
            let spent = self.daily().get(&request.account_id, &spending_date).await?;
            let attempted = spent.saturating_add(estimate);
            if attempted > cap {
                self.metrics().record_reservation_rejected();
                return Err(CreditError::BudgetExceeded {
                    limit_micros: cap.micros(),
                    attempted_micros: attempted.micros(),
                });
            }
        }
        self.metrics().record_reservation();
        Ok(Reservation {
            account_id: request.account_id,
            reservation_id: request.reservation_id,
            estimate_micros: estimate,
            held_in_cache: false,
        })
    }

    /// Commit the actual cost of one finalized unit of work. A halted account
    /// may still finalize already-reserved work; only new reservations are
    /// blocked by the breaker.
    pub async fn finalize(
        &self,
        request: FinalizeRequest,
    ) -> Result<FinalizeOutcome, CreditError> {
        let started = Instant::now();
        let account = self.config().account(&request.account_id);
        let cap_policy = request.cap_policy.unwrap_or(account.cap_overflow);
        let spending_date = spending_date_utc();
        let reserved_other = self
            .reserved_excluding(&request.account_id, request.reservation_id.as_deref())
            .await;

        let durable = self
            .store()
            .finalize_usage(FinalizeArgs {
                account_id: request.account_id.clone(),
                finalization_id: request.finalization_id.clone(),
                fence_token: request.fence_token,
                cost_micros: request.cost_micros,
                spending_date: spending_date.clone(),
                daily_cap_micros: account.daily_cap_micros,
                reserved_other_micros: reserved_other,
                cap_to_remaining: cap_policy == CapOverflow::Clamp,
            })
            .await;

        let durable = match durable {
            Ok(durable) => durable,
            Err(err) => {
                if matches!(
                    err,
                    super::SqliteStoreError::InsufficientCredit { .. }
                ) {
                    self.metrics().record_insufficient_credit();
                    self.release_hold(request.reservation_id.as_deref()).await;
                }
                return Err(err.into());
            }
        };

        match durable {
            DurableFinalize::Committed {
                event,
                entries,
                balance_micros,
            } => {
                self.settle_cache_after_commit(&event, &spending_date).await;
                self.release_hold(request.reservation_id.as_deref()).await;
                self.metrics()
                    .record_finalized(started.elapsed().as_millis() as u64);
                tracing::info!(
                    account_id = %event.account_id,
                    finalization_id = %event.finalization_id,
                    event_id = event.event_id,
                    cost_micros = event.cost_micros.micros(),
                    "finalize committed"
                );
                Ok(FinalizeOutcome::Finalized {
                    event,
                    entries,
                    balance_micros,
                })
            }
            DurableFinalize::Duplicate {
                event,
                balance_micros,
            } => {
                // The original call already settled the cache; just drop any
                // hold the retry carried.
                self.release_hold(request.reservation_id.as_deref()).await;
                self.metrics().record_duplicate();
                Ok(FinalizeOutcome::Duplicate {
                    event,
                    balance_micros,
                })
            }
            DurableFinalize::StaleFence { stored_token } => {
                // The hold stays: the caller retries with a fresh token and
                // the same finalization id.
                self.metrics().record_stale_fence();
                Ok(FinalizeOutcome::StaleFence { stored_token })
            }
            DurableFinalize::BudgetExceeded {
                limit_micros,
                attempted_micros,
            } => {
                self.release_hold(request.reservation_id.as_deref()).await;
                self.metrics().record_budget_exceeded();
                Ok(FinalizeOutcome::BudgetExceeded {
                    limit_micros,
                    attempted_micros,
                })
            }
        }
    }

    /// Cache-tier holds for other in-flight work, excluding the caller's own
    /// reservation. Advisory input to the durable budget check; zero when the
    /// cache tier is absent.
    async fn reserved_excluding(
        &self,
        account_id: &str,
        reservation_id: Option<&str>,
    ) -> MicroUsd {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            let reserved = match cache.ledger(account_id).await {
                Ok(ledger) => ledger.reserved_micros,
                Err(err) => {
                    tracing::warn!(account_id, error = %err, "cache ledger read failed");
                    return MicroUsd::ZERO;
                }
            };
            let own = match reservation_id {
                Some(id) => match cache.reservation_amount(id).await {
                    Ok(amount) => amount.unwrap_or(MicroUsd::ZERO),
                    Err(_) => MicroUsd::ZERO,
                },
                None => MicroUsd::ZERO,
            };
            return reserved.saturating_sub(own).max_zero();
        }
        let _ = (account_id, reservation_id);
        MicroUsd::ZERO
    }

    /// Post-commit cache write. Failures are logged and left to the
    /// reconciliation worker; the caller-visible result is already durable.
    async fn settle_cache_after_commit(&self, event: &UsageEventRecord, spending_date: &str) {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            let day_ttl = seconds_until_day_end(time::OffsetDateTime::now_utc());
            if let Err(err) = cache
                .apply_usage_event(
                    &event.account_id,
                    event.event_id,
                    event.cost_micros,
                    spending_date,
                    day_ttl,
                )
                .await
            {
                tracing::warn!(
                    account_id = %event.account_id,
                    event_id = event.event_id,
                    error = %err,
                    "cache settle failed after commit; reconciliation will correct"
                );
            }
        }
        let _ = (event, spending_date);
    }

    async fn release_hold(&self, reservation_id: Option<&str>) {
        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            if let Some(id) = reservation_id {
                if let Err(err) = cache.release_reservation(id).await {
                    tracing::warn!(
                        reservation_id = id,
                        error = %err,
                        "reservation release failed; hold expires by TTL"
                    );
                }
            }
        }
        let _ = reservation_id;
    }
}
