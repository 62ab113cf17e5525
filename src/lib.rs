//! tally-credit: prepaid credit ledger for metered agent inference.
//!
//! Double-entry credit lots in a durable SQLite tier, an advisory Redis cache
//! tier (`store-redis` feature), per-account fencing tokens, a cross-tier
//! drift detector with a circuit breaker, and idempotent background jobs for
//! lot expiry and cache reconciliation.

pub mod credit;

pub use credit::{
    AccountConfig, CapOverflow, ConservationConfig, ConservationGuard, CreditConfig,
    CreditConfigError, CreditError, CreditLedger, CreditLotRecord, CreditMetrics,
    CreditMetricsSnapshot, DriftReport, EntryKind, FinalizeOutcome, FinalizeRequest, LotEntryRecord,
    LotExpirySweep, LotSource, LotStatus, MicroUsd, ReconcileReport, ReconciliationWorker,
    Reservation, ReserveRequest, SqliteStore, SweepReport, UsageEventRecord,
};

#[cfg(feature = "store-redis")]
pub use credit::{RedisStore, RedisStoreError};
