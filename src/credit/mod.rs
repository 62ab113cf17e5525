//! Conservation and credit-lot ledger.
//!
//! Prepaid credit for metered agent inference, tracked as double-entry credit
//! lots in a durable SQLite tier with an advisory Redis cache tier in front.
//! Committed spend never exceeds available credit and never diverges between
//! tiers beyond a configured tolerance; the durable store is always the
//! source of truth.

pub mod amount;
pub mod config;
pub mod daily;
pub mod finalize;
pub mod guard;
pub mod memory;
pub mod observability;
pub mod reconcile;
pub mod sqlite_store;
pub mod store_types;
pub mod sweep;

#[cfg(feature = "store-redis")]
pub mod redis_store;

use std::sync::Arc;

use thiserror::Error;

pub use amount::MicroUsd;
pub use config::{
    AccountConfig, CapOverflow, ConservationConfig, CreditConfig, CreditConfigError,
    ReconcileConfig, SweepConfig,
};
pub use daily::{DailySpending, MemoryTier, SpendingTier, SqliteTier, TierError};
pub use finalize::{FinalizeOutcome, FinalizeRequest, Reservation, ReserveRequest};
pub use guard::{ConservationGuard, DriftReport};
pub use memory::MemoryCounters;
pub use observability::{CreditMetrics, CreditMetricsSnapshot};
pub use reconcile::{ReconcileReport, ReconciliationWorker};
pub use sqlite_store::{DurableFinalize, FinalizeArgs, SqliteStore, SqliteStoreError};
pub use store_types::{
    AuditLogRecord, CacheLedgerRecord, CreditLotRecord, DailySpendingRecord, EntryKind,
    ExpiredLot, HaltRecord, LotEntryRecord, LotSource, LotStatus, UsageEventRecord,
};
pub use sweep::{LotExpirySweep, SweepReport};

#[cfg(feature = "store-redis")]
pub use daily::RedisTier;
#[cfg(feature = "store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};

/// Caller-visible error taxonomy. Finalize race/replay/cap results are
/// [`FinalizeOutcome`] variants, not errors; raw storage errors never cross
/// this boundary.
#[derive(Debug, Error)]
pub enum CreditError {
    #[error(
        "insufficient credit: requested_micros={requested_micros} available_micros={available_micros}"
    )]
    InsufficientCredit {
        requested_micros: i64,
        available_micros: i64,
    },
    #[error("budget exceeded: limit_micros={limit_micros} attempted_micros={attempted_micros}")]
    BudgetExceeded {
        limit_micros: i64,
        attempted_micros: i64,
    },
    #[error("conservation halted: account={account_id}")]
    ConservationHalted { account_id: String },
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },
}

impl From<SqliteStoreError> for CreditError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::InsufficientCredit {
                requested_micros,
                available_micros,
            } => CreditError::InsufficientCredit {
                requested_micros,
                available_micros,
            },
            other => CreditError::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(feature = "store-redis")]
impl From<RedisStoreError> for CreditError {
    fn from(err: RedisStoreError) -> Self {
        match err {
            RedisStoreError::BudgetExceeded {
                limit_micros,
                attempted_micros,
            } => CreditError::BudgetExceeded {
                limit_micros,
                attempted_micros,
            },
            RedisStoreError::Halted { account_id } => CreditError::ConservationHalted {
                account_id,
            },
            other => CreditError::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

/// Facade over both tiers: minting, balances, the reserve/finalize workflow
/// and the guard. Background jobs borrow it through an `Arc`.
pub struct CreditLedger {
    config: CreditConfig,
    store: SqliteStore,
    #[cfg(feature = "store-redis")]
    cache: Option<RedisStore>,
    daily: DailySpending,
    guard: ConservationGuard,
    memory: Arc<MemoryCounters>,
    metrics: Arc<CreditMetrics>,
}

impl CreditLedger {
    pub fn new(config: CreditConfig, store: SqliteStore) -> Self {
        let metrics = Arc::new(CreditMetrics::default());
        let memory = Arc::new(MemoryCounters::new());
        let daily = DailySpending::new(vec![
            Arc::new(SqliteTier::new(store.clone())),
            Arc::new(MemoryTier::new(memory.clone())),
        ]);
        let guard = ConservationGuard::new(
            store.clone(),
            config.conservation.clone(),
            metrics.clone(),
        );
        Self {
            config,
            store,
            #[cfg(feature = "store-redis")]
            cache: None,
            daily,
            guard,
            memory,
            metrics,
        }
    }

    /// Attach the cache tier: it becomes the first daily-counter tier, the
    /// fence issuer and the drift comparison's fast side.
    #[cfg(feature = "store-redis")]
    pub fn with_cache(mut self, cache: RedisStore) -> Self {
        self.daily = DailySpending::new(vec![
            Arc::new(RedisTier::new(cache.clone())),
            Arc::new(SqliteTier::new(self.store.clone())),
            Arc::new(MemoryTier::new(self.memory.clone())),
        ]);
        self.guard = ConservationGuard::new(
            self.store.clone(),
            self.config.conservation.clone(),
            self.metrics.clone(),
        )
        .with_cache(cache.clone());
        self.cache = Some(cache);
        self
    }

    pub async fn init(&self) -> Result<(), CreditError> {
        self.store.init().await?;
        Ok(())
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    #[cfg(feature = "store-redis")]
    pub fn cache(&self) -> Option<&RedisStore> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> &CreditMetrics {
        &self.metrics
    }

    pub fn daily(&self) -> &DailySpending {
        &self.daily
    }

    /// In-process fallback counters, the last tier of the daily chain.
    pub fn fallback_counters(&self) -> &MemoryCounters {
        &self.memory
    }

    pub async fn mint(
        &self,
        account_id: &str,
        amount: MicroUsd,
        source: LotSource,
        expires_at_ms: Option<i64>,
    ) -> Result<CreditLotRecord, CreditError> {
        let lot = self
            .store
            .mint_lot(account_id, amount, source, expires_at_ms)
            .await?;

        #[cfg(feature = "store-redis")]
        if let Some(cache) = self.cache() {
            if let Err(err) = cache.add_credit(account_id, amount).await {
                tracing::warn!(
                    account_id,
                    lot_id = lot.lot_id,
                    error = %err,
                    "cache credit bump failed after mint"
                );
            }
        }
        let _ = self
            .store
            .append_audit_log(
                "lot.minted",
                serde_json::json!({
                    "lot_id": lot.lot_id,
                    "account_id": account_id,
                    "amount_micros": amount.micros(),
                    "source": source.as_str(),
                    "expires_at_ms": expires_at_ms,
                }),
            )
            .await;
        tracing::info!(
            account_id,
            lot_id = lot.lot_id,
            amount_micros = amount.micros(),
            source = source.as_str(),
            "credit lot minted"
        );
        Ok(lot)
    }

    pub async fn balance(&self, account_id: &str) -> Result<MicroUsd, CreditError> {
        Ok(self.store.balance(account_id).await?)
    }

    pub async fn acquire_fence(&self, account_id: &str) -> Result<u64, CreditError> {
        self.guard.acquire_fence(account_id).await
    }

    pub async fn is_halted(&self, account_id: &str) -> Result<bool, CreditError> {
        self.guard.is_halted(account_id).await
    }

    pub async fn check_conservation(
        &self,
        account_id: &str,
    ) -> Result<Option<DriftReport>, CreditError> {
        let cap = self.config.account(account_id).daily_cap_micros;
        self.guard.check_conservation(account_id, cap).await
    }

    pub async fn clear_halt(&self, account_id: &str) -> Result<DriftReport, CreditError> {
        let cap = self.config.account(account_id).daily_cap_micros;
        self.guard.clear_halt(account_id, cap).await
    }
}
