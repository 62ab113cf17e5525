use serde::{Deserialize, Serialize};

use super::amount::MicroUsd;

/// A grant of prepaid credit. `amount_micros` is immutable after creation;
/// consumption is recorded only through `lot_entries`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditLotRecord {
    pub lot_id: i64,
    pub account_id: String,
    pub source: LotSource,
    pub amount_micros: MicroUsd,
    pub expires_at_ms: Option<i64>,
    pub status: LotStatus,
    pub created_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotSource {
    Seed,
    Purchase,
    Grant,
}

impl LotSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LotSource::Seed => "seed",
            LotSource::Purchase => "purchase",
            LotSource::Grant => "grant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "seed" => Some(LotSource::Seed),
            "purchase" => Some(LotSource::Purchase),
            "grant" => Some(LotSource::Grant),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Active,
    Expired,
}

impl LotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LotStatus::Active => "active",
            LotStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(LotStatus::Active),
            "expired" => Some(LotStatus::Expired),
            _ => None,
        }
    }
}

/// One line of the double-entry ledger. Append-only; a lot's balance is its
/// `amount_micros` plus the signed sum of its entries and never goes negative.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LotEntryRecord {
    pub entry_id: i64,
    pub lot_id: i64,
    pub kind: EntryKind,
    pub amount_micros: MicroUsd,
    pub reference_id: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Credit,
    Debit,
    Expiry,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
            EntryKind::Expiry => "expiry",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(EntryKind::Credit),
            "debit" => Some(EntryKind::Debit),
            "expiry" => Some(EntryKind::Expiry),
            _ => None,
        }
    }
}

/// Immutable record of one finalized unit of work.
/// `(account_id, finalization_id)` is unique; replays add zero rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEventRecord {
    pub event_id: i64,
    pub account_id: String,
    pub finalization_id: String,
    pub fence_token: u64,
    pub cost_micros: MicroUsd,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DailySpendingRecord {
    pub account_id: String,
    pub spending_date: String,
    pub spent_micros: MicroUsd,
    pub updated_at_ms: i64,
}

/// Cache-tier view of an account's counters. Advisory only; any discrepancy
/// is resolved in favor of the durable store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheLedgerRecord {
    pub account_id: String,
    pub committed_micros: MicroUsd,
    pub reserved_micros: MicroUsd,
    pub credit_micros: MicroUsd,
    pub updated_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HaltRecord {
    pub account_id: String,
    pub drift_micros: MicroUsd,
    pub halted_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub id: i64,
    pub ts_ms: u64,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// A lot retired by the expiry sweep, with the balance written off.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpiredLot {
    pub lot_id: i64,
    pub account_id: String,
    pub expired_micros: MicroUsd,
}
