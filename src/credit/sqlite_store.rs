use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, Transaction};
use thiserror::Error;

use super::amount::MicroUsd;
use super::store_types::{
    AuditLogRecord, CreditLotRecord, DailySpendingRecord, EntryKind, ExpiredLot, HaltRecord,
    LotEntryRecord, LotSource, LotStatus, UsageEventRecord,
};

/// Durable tier. The only place invariants are authoritative; every mutation
/// here runs inside an explicit transaction opened on a per-call connection.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(
        "insufficient credit: requested_micros={requested_micros} available_micros={available_micros}"
    )]
    InsufficientCredit {
        requested_micros: i64,
        available_micros: i64,
    },
    #[error("invalid amount: {amount_micros} micros (must be positive)")]
    InvalidAmount { amount_micros: i64 },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Inputs for the single durable finalize transaction.
#[derive(Clone, Debug)]
pub struct FinalizeArgs {
    pub account_id: String,
    pub finalization_id: String,
    pub fence_token: u64,
    pub cost_micros: MicroUsd,
    pub spending_date: String,
    pub daily_cap_micros: Option<MicroUsd>,
    /// Holds for other in-flight work, read from the cache tier before the
    /// transaction opens. Advisory; zero when the cache tier is absent.
    pub reserved_other_micros: MicroUsd,
    pub cap_to_remaining: bool,
}

/// Result of the durable finalize transaction. `StaleFence`, `Duplicate` and
/// `BudgetExceeded` commit nothing.
#[derive(Clone, Debug)]
pub enum DurableFinalize {
    Committed {
        event: UsageEventRecord,
        entries: Vec<LotEntryRecord>,
        balance_micros: MicroUsd,
    },
    Duplicate {
        event: UsageEventRecord,
        balance_micros: MicroUsd,
    },
    StaleFence {
        stored_token: u64,
    },
    BudgetExceeded {
        limit_micros: MicroUsd,
        attempted_micros: MicroUsd,
    },
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn mint_lot(
        &self,
        account_id: &str,
        amount: MicroUsd,
        source: LotSource,
        expires_at_ms: Option<i64>,
    ) -> Result<CreditLotRecord, SqliteStoreError> {
        if !amount.is_positive() {
            return Err(SqliteStoreError::InvalidAmount {
                amount_micros: amount.micros(),
            });
        }
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<CreditLotRecord, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO credit_lots
                     (account_id, source, amount_micros, expires_at_ms, status, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                rusqlite::params![
                    account_id,
                    source.as_str(),
                    amount.micros(),
                    expires_at_ms,
                    now_ms
                ],
            )?;
            Ok(CreditLotRecord {
                lot_id: conn.last_insert_rowid(),
                account_id,
                source,
                amount_micros: amount,
                expires_at_ms,
                status: LotStatus::Active,
                created_at_ms: now_ms,
            })
        })
        .await?
    }

    /// Sum of active, unexpired lot balances.
    pub async fn balance(&self, account_id: &str) -> Result<MicroUsd, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<MicroUsd, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            tx_balance(&conn, &account_id, now_ms)
        })
        .await?
    }

    pub async fn list_lots(
        &self,
        account_id: &str,
    ) -> Result<Vec<CreditLotRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<CreditLotRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT lot_id, account_id, source, amount_micros, expires_at_ms, status, created_at_ms
                 FROM credit_lots
                 WHERE account_id = ?1
                 ORDER BY lot_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (lot_id, account_id, source, amount, expires_at_ms, status, created_at_ms) =
                    row?;
                out.push(CreditLotRecord {
                    lot_id,
                    account_id,
                    source: LotSource::parse(&source).ok_or_else(|| {
                        SqliteStoreError::Corrupt(format!("unknown lot source {source:?}"))
                    })?,
                    amount_micros: MicroUsd::from_micros(amount),
                    expires_at_ms,
                    status: LotStatus::parse(&status).ok_or_else(|| {
                        SqliteStoreError::Corrupt(format!("unknown lot status {status:?}"))
                    })?,
                    created_at_ms,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Debit outside the finalize path (tooling and tests). Earliest expiry
    /// first, idempotent by `reference_id`, own transaction.
    pub async fn debit_lots(
        &self,
        account_id: &str,
        amount: MicroUsd,
        reference_id: &str,
    ) -> Result<Vec<LotEntryRecord>, SqliteStoreError> {
        if !amount.is_positive() {
            return Err(SqliteStoreError::InvalidAmount {
                amount_micros: amount.micros(),
            });
        }
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let reference_id = reference_id.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<Vec<LotEntryRecord>, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            let entries = tx_debit_lots(&tx, &account_id, amount, &reference_id, now_ms)?;
            tx.commit()?;
            Ok(entries)
        })
        .await?
    }

    pub async fn entries_for_reference(
        &self,
        reference_id: &str,
    ) -> Result<Vec<LotEntryRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let reference_id = reference_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<LotEntryRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            tx_entries_for_reference(&conn, &reference_id)
        })
        .await?
    }

    /// The finalize transaction: duplicate lookup, fence verify-and-advance,
    /// budget clamp/reject, usage event insert, lot debits and the daily
    /// upsert, all or nothing.
    pub async fn finalize_usage(
        &self,
        args: FinalizeArgs,
    ) -> Result<DurableFinalize, SqliteStoreError> {
        let path = self.path.clone();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<DurableFinalize, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            if let Some(event) = tx_usage_event(&tx, &args.account_id, &args.finalization_id)? {
                let balance_micros = tx_balance(&tx, &args.account_id, now_ms)?;
                return Ok(DurableFinalize::Duplicate {
                    event,
                    balance_micros,
                });
            }

            let stored_token: i64 = tx
                .query_row(
                    "SELECT token FROM fence_tokens WHERE account_id = ?1",
                    rusqlite::params![args.account_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let stored_token = i64_to_u64(stored_token);
            if args.fence_token <= stored_token {
                return Ok(DurableFinalize::StaleFence { stored_token });
            }
            tx.execute(
                "INSERT INTO fence_tokens (account_id, token, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id) DO UPDATE SET
                     token = excluded.token,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![args.account_id, u64_to_i64(args.fence_token), now_ms],
            )?;

            let mut cost = args.cost_micros.max_zero();
            if let Some(cap) = args.daily_cap_micros {
                let spent = tx_daily_get(&tx, &args.account_id, &args.spending_date)?
                    .unwrap_or(MicroUsd::ZERO);
                let remaining = cap
                    .saturating_sub(spent)
                    .saturating_sub(args.reserved_other_micros)
                    .max_zero();
                if cost > remaining {
                    if args.cap_to_remaining {
                        cost = remaining;
                    } else {
                        return Ok(DurableFinalize::BudgetExceeded {
                            limit_micros: cap,
                            attempted_micros: spent
                                .saturating_add(args.reserved_other_micros)
                                .saturating_add(cost),
                        });
                    }
                }
            }

            tx.execute(
                "INSERT INTO usage_events
                     (account_id, finalization_id, fence_token, cost_micros, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    args.account_id,
                    args.finalization_id,
                    u64_to_i64(args.fence_token),
                    cost.micros(),
                    now_ms
                ],
            )?;
            let event = UsageEventRecord {
                event_id: tx.last_insert_rowid(),
                account_id: args.account_id.clone(),
                finalization_id: args.finalization_id.clone(),
                fence_token: args.fence_token,
                cost_micros: cost,
                created_at_ms: now_ms,
            };

            let entries = if cost.is_positive() {
                tx_debit_lots(&tx, &args.account_id, cost, &args.finalization_id, now_ms)?
            } else {
                Vec::new()
            };

            tx.execute(
                "INSERT INTO daily_agent_spending
                     (account_id, spending_date, spent_micros, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, spending_date) DO UPDATE SET
                     spent_micros = spent_micros + excluded.spent_micros,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![args.account_id, args.spending_date, cost.micros(), now_ms],
            )?;

            let balance_micros = tx_balance(&tx, &args.account_id, now_ms)?;
            tx.commit()?;
            Ok(DurableFinalize::Committed {
                event,
                entries,
                balance_micros,
            })
        })
        .await?
    }

    /// Degraded-mode fence acquisition when the cache tier is unreachable.
    pub async fn acquire_fence(&self, account_id: &str) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO fence_tokens (account_id, token, updated_at_ms)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(account_id) DO UPDATE SET
                     token = token + 1,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![account_id, now_ms],
            )?;
            let token: i64 = tx.query_row(
                "SELECT token FROM fence_tokens WHERE account_id = ?1",
                rusqlite::params![account_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(i64_to_u64(token))
        })
        .await?
    }

    pub async fn fence_token(&self, account_id: &str) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let token: Option<i64> = conn
                .query_row(
                    "SELECT token FROM fence_tokens WHERE account_id = ?1",
                    rusqlite::params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(i64_to_u64(token.unwrap_or(0)))
        })
        .await?
    }

    /// Durable sum of finalized cost for the account; the conservation
    /// check's source of truth.
    pub async fn committed_total(&self, account_id: &str) -> Result<MicroUsd, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<MicroUsd, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_micros), 0) FROM usage_events WHERE account_id = ?1",
                rusqlite::params![account_id],
                |row| row.get(0),
            )?;
            Ok(MicroUsd::from_micros(total))
        })
        .await?
    }

    pub async fn daily_add(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
    ) -> Result<MicroUsd, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let spending_date = spending_date.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<MicroUsd, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO daily_agent_spending
                     (account_id, spending_date, spent_micros, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, spending_date) DO UPDATE SET
                     spent_micros = spent_micros + excluded.spent_micros,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![account_id, spending_date, amount.micros(), now_ms],
            )?;
            let total =
                tx_daily_get(&tx, &account_id, &spending_date)?.unwrap_or(MicroUsd::ZERO);
            tx.commit()?;
            Ok(total)
        })
        .await?
    }

    pub async fn daily_get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<MicroUsd>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let spending_date = spending_date.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<MicroUsd>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            tx_daily_get(&conn, &account_id, &spending_date)
        })
        .await?
    }

    pub async fn daily_record(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<DailySpendingRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let spending_date = spending_date.to_string();

        tokio::task::spawn_blocking(
            move || -> Result<Option<DailySpendingRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let record = conn
                    .query_row(
                        "SELECT spent_micros, updated_at_ms FROM daily_agent_spending
                         WHERE account_id = ?1 AND spending_date = ?2",
                        rusqlite::params![account_id, spending_date],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                Ok(record.map(|(spent, updated_at_ms)| DailySpendingRecord {
                    account_id,
                    spending_date,
                    spent_micros: MicroUsd::from_micros(spent),
                    updated_at_ms,
                }))
            },
        )
        .await?
    }

    /// Retire lots whose `expires_at_ms` has passed. One lot per transaction;
    /// a failed lot is logged and skipped, never aborting its siblings.
    pub async fn expire_due_lots(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<ExpiredLot>, SqliteStoreError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<ExpiredLot>, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;

            let lot_ids: Vec<i64> = {
                let mut stmt = conn.prepare(
                    "SELECT lot_id FROM credit_lots
                     WHERE status = 'active'
                       AND expires_at_ms IS NOT NULL
                       AND expires_at_ms <= ?1
                     ORDER BY expires_at_ms, lot_id
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![now_ms, limit], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut out = Vec::new();
            for lot_id in lot_ids {
                match expire_one_lot(&mut conn, lot_id, now_ms) {
                    Ok(Some(expired)) => out.push(expired),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(lot_id, error = %err, "lot expiry failed; skipping");
                    }
                }
            }
            Ok(out)
        })
        .await?
    }

    pub async fn usage_events_after(
        &self,
        account_id: &str,
        after_event_id: i64,
        limit: usize,
    ) -> Result<Vec<UsageEventRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<UsageEventRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT event_id, account_id, finalization_id, fence_token, cost_micros, created_at_ms
                 FROM usage_events
                 WHERE account_id = ?1 AND event_id > ?2
                 ORDER BY event_id
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![account_id, after_event_id, limit],
                |row| {
                    Ok(UsageEventRecord {
                        event_id: row.get(0)?,
                        account_id: row.get(1)?,
                        finalization_id: row.get(2)?,
                        fence_token: i64_to_u64(row.get(3)?),
                        cost_micros: MicroUsd::from_micros(row.get(4)?),
                        created_at_ms: row.get(5)?,
                    })
                },
            )?;
            rows.collect::<Result<_, _>>().map_err(Into::into)
        })
        .await?
    }

    pub async fn accounts_with_usage(&self) -> Result<Vec<String>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt =
                conn.prepare("SELECT DISTINCT account_id FROM usage_events ORDER BY account_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>().map_err(Into::into)
        })
        .await?
    }

    pub async fn reconciliation_cursor(&self, account_id: &str) -> Result<i64, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<i64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let cursor: Option<i64> = conn
                .query_row(
                    "SELECT last_event_id FROM reconciliation_cursors WHERE account_id = ?1",
                    rusqlite::params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(cursor.unwrap_or(0))
        })
        .await?
    }

    /// Forward-only; a concurrent instance that already advanced further wins.
    pub async fn advance_reconciliation_cursor(
        &self,
        account_id: &str,
        event_id: i64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO reconciliation_cursors (account_id, last_event_id, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id) DO UPDATE SET
                     last_event_id = MAX(last_event_id, excluded.last_event_id),
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![account_id, event_id, now_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn set_halt(
        &self,
        account_id: &str,
        drift: MicroUsd,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let now_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO conservation_halts (account_id, drift_micros, halted_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id) DO UPDATE SET
                     drift_micros = excluded.drift_micros",
                rusqlite::params![account_id, drift.micros(), now_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn clear_halt(&self, account_id: &str) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "DELETE FROM conservation_halts WHERE account_id = ?1",
                rusqlite::params![account_id],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn halt(&self, account_id: &str) -> Result<Option<HaltRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<HaltRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT drift_micros, halted_at_ms FROM conservation_halts
                     WHERE account_id = ?1",
                    rusqlite::params![account_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            Ok(record.map(|(drift, halted_at_ms)| HaltRecord {
                account_id,
                drift_micros: MicroUsd::from_micros(drift),
                halted_at_ms,
            }))
        })
        .await?
    }

    pub async fn append_audit_log(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let kind = kind.into();
        let payload_json = serde_json::to_string(&payload)?;
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO audit_logs (ts_ms, kind, payload_json) VALUES (?1, ?2, ?3)",
                rusqlite::params![ts_ms, kind, payload_json],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_audit_logs(
        &self,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<AuditLogRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, ts_ms, kind, payload_json
                 FROM audit_logs
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, ts_ms, kind, payload_json) = row?;
                let payload = serde_json::from_str(&payload_json)?;
                out.push(AuditLogRecord {
                    id,
                    ts_ms: i64_to_u64(ts_ms),
                    kind,
                    payload,
                });
            }
            Ok(out)
        })
        .await?
    }
}

/// Candidate rows for a debit: active, unexpired lots ordered earliest expiry
/// first (never-expiring lots last), with their current balances.
fn tx_available_lots(
    conn: &rusqlite::Connection,
    account_id: &str,
    now_ms: i64,
) -> Result<Vec<(i64, MicroUsd)>, SqliteStoreError> {
    let mut stmt = conn.prepare(
        "SELECT l.lot_id,
                l.amount_micros + COALESCE(SUM(e.amount_micros), 0) AS balance_micros
         FROM credit_lots l
         LEFT JOIN lot_entries e ON e.lot_id = l.lot_id
         WHERE l.account_id = ?1
           AND l.status = 'active'
           AND (l.expires_at_ms IS NULL OR l.expires_at_ms > ?2)
         GROUP BY l.lot_id
         HAVING balance_micros > 0
         ORDER BY l.expires_at_ms IS NULL, l.expires_at_ms, l.lot_id",
    )?;
    let rows = stmt.query_map(rusqlite::params![account_id, now_ms], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (lot_id, balance) = row?;
        out.push((lot_id, MicroUsd::from_micros(balance)));
    }
    Ok(out)
}

fn tx_balance(
    conn: &rusqlite::Connection,
    account_id: &str,
    now_ms: i64,
) -> Result<MicroUsd, SqliteStoreError> {
    let total = tx_available_lots(conn, account_id, now_ms)?
        .into_iter()
        .fold(MicroUsd::ZERO, |acc, (_, balance)| {
            acc.saturating_add(balance)
        });
    Ok(total)
}

fn tx_entries_for_reference(
    conn: &rusqlite::Connection,
    reference_id: &str,
) -> Result<Vec<LotEntryRecord>, SqliteStoreError> {
    let mut stmt = conn.prepare(
        "SELECT entry_id, lot_id, entry_kind, amount_micros, reference_id, created_at_ms
         FROM lot_entries
         WHERE reference_id = ?1
         ORDER BY entry_id",
    )?;
    let rows = stmt.query_map(rusqlite::params![reference_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (entry_id, lot_id, kind, amount, reference_id, created_at_ms) = row?;
        out.push(LotEntryRecord {
            entry_id,
            lot_id,
            kind: EntryKind::parse(&kind).ok_or_else(|| {
                SqliteStoreError::Corrupt(format!("unknown entry kind {kind:?}"))
            })?,
            amount_micros: MicroUsd::from_micros(amount),
            reference_id,
            created_at_ms,
        });
    }
    Ok(out)
}

/// Debit inside an open transaction. Replays of a known `reference_id` return
/// the original entries without touching the ledger.
fn tx_debit_lots(
    tx: &Transaction<'_>,
    account_id: &str,
    amount: MicroUsd,
    reference_id: &str,
    now_ms: i64,
) -> Result<Vec<LotEntryRecord>, SqliteStoreError> {
    let existing = tx_entries_for_reference(tx, reference_id)?;
    if !existing.is_empty() {
        return Ok(existing);
    }

    let lots = tx_available_lots(tx, account_id, now_ms)?;
    let available = lots
        .iter()
        .fold(MicroUsd::ZERO, |acc, (_, balance)| {
            acc.saturating_add(*balance)
        });
    if available < amount {
        return Err(SqliteStoreError::InsufficientCredit {
            requested_micros: amount.micros(),
            available_micros: available.micros(),
        });
    }

    let mut remaining = amount;
    let mut entries = Vec::new();
    for (lot_id, balance) in lots {
        if !remaining.is_positive() {
            break;
        }
        let take = balance.min(remaining);
        tx.execute(
            "INSERT INTO lot_entries (lot_id, entry_kind, amount_micros, reference_id, created_at_ms)
             VALUES (?1, 'debit', ?2, ?3, ?4)",
            rusqlite::params![lot_id, -take.micros(), reference_id, now_ms],
        )?;
        entries.push(LotEntryRecord {
            entry_id: tx.last_insert_rowid(),
            lot_id,
            kind: EntryKind::Debit,
            amount_micros: MicroUsd::from_micros(-take.micros()),
            reference_id: reference_id.to_string(),
            created_at_ms: now_ms,
        });
        remaining = remaining.saturating_sub(take);
    }
    Ok(entries)
}

fn tx_usage_event(
    conn: &rusqlite::Connection,
    account_id: &str,
    finalization_id: &str,
) -> Result<Option<UsageEventRecord>, SqliteStoreError> {
    let record = conn
        .query_row(
            "SELECT event_id, fence_token, cost_micros, created_at_ms
             FROM usage_events
             WHERE account_id = ?1 AND finalization_id = ?2",
            rusqlite::params![account_id, finalization_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    Ok(record.map(|(event_id, fence_token, cost, created_at_ms)| UsageEventRecord {
        event_id,
        account_id: account_id.to_string(),
        finalization_id: finalization_id.to_string(),
        fence_token: i64_to_u64(fence_token),
        cost_micros: MicroUsd::from_micros(cost),
        created_at_ms,
    }))
}

fn tx_daily_get(
    conn: &rusqlite::Connection,
    account_id: &str,
    spending_date: &str,
) -> Result<Option<MicroUsd>, SqliteStoreError> {
    let spent: Option<i64> = conn
        .query_row(
            "SELECT spent_micros FROM daily_agent_spending
             WHERE account_id = ?1 AND spending_date = ?2",
            rusqlite::params![account_id, spending_date],
            |row| row.get(0),
        )
        .optional()?;
    Ok(spent.map(MicroUsd::from_micros))
}

/// One lot, one transaction. The expiry reference id is derived from the lot
/// id, so a re-run finds the entry and does nothing.
fn expire_one_lot(
    conn: &mut rusqlite::Connection,
    lot_id: i64,
    now_ms: i64,
) -> Result<Option<ExpiredLot>, SqliteStoreError> {
    let tx = conn.transaction()?;

    let row: Option<(String, i64, String, Option<i64>)> = tx
        .query_row(
            "SELECT account_id, amount_micros, status, expires_at_ms
             FROM credit_lots WHERE lot_id = ?1",
            rusqlite::params![lot_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            },
        )
        .optional()?;
    let Some((account_id, amount, status, expires_at_ms)) = row else {
        return Ok(None);
    };
    if status != "active" {
        return Ok(None);
    }
    match expires_at_ms {
        Some(expires) if expires <= now_ms => {}
        _ => return Ok(None),
    }

    let already_expired: bool = tx.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM lot_entries WHERE lot_id = ?1 AND entry_kind = 'expiry'
         )",
        rusqlite::params![lot_id],
        |row| row.get(0),
    )?;
    if already_expired {
        tx.execute(
            "UPDATE credit_lots SET status = 'expired' WHERE lot_id = ?1",
            rusqlite::params![lot_id],
        )?;
        tx.commit()?;
        return Ok(None);
    }

    let entry_sum: i64 = tx.query_row(
        "SELECT COALESCE(SUM(amount_micros), 0) FROM lot_entries WHERE lot_id = ?1",
        rusqlite::params![lot_id],
        |row| row.get(0),
    )?;
    let balance = MicroUsd::from_micros(amount.saturating_add(entry_sum)).max_zero();

    if balance.is_positive() {
        let reference_id = format!("sweep:lot:{lot_id}");
        tx.execute(
            "INSERT INTO lot_entries (lot_id, entry_kind, amount_micros, reference_id, created_at_ms)
             VALUES (?1, 'expiry', ?2, ?3, ?4)",
            rusqlite::params![lot_id, -balance.micros(), reference_id, now_ms],
        )?;
    }
    tx.execute(
        "UPDATE credit_lots SET status = 'expired' WHERE lot_id = ?1",
        rusqlite::params![lot_id],
    )?;
    tx.commit()?;

    Ok(Some(ExpiredLot {
        lot_id,
        account_id,
        expired_micros: balance,
    }))
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credit_lots (
            lot_id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            source TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            expires_at_ms INTEGER,
            status TEXT NOT NULL DEFAULT 'active',
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_lots_account_status
            ON credit_lots(account_id, status);
        CREATE INDEX IF NOT EXISTS idx_credit_lots_expiry
            ON credit_lots(status, expires_at_ms);

        CREATE TABLE IF NOT EXISTS lot_entries (
            entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
            lot_id INTEGER NOT NULL,
            entry_kind TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            reference_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_lot_entries_lot
            ON lot_entries(lot_id);
        CREATE INDEX IF NOT EXISTS idx_lot_entries_reference
            ON lot_entries(reference_id);

        CREATE TABLE IF NOT EXISTS usage_events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            finalization_id TEXT NOT NULL,
            fence_token INTEGER NOT NULL,
            cost_micros INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            UNIQUE(account_id, finalization_id)
        );

        CREATE TABLE IF NOT EXISTS fence_tokens (
            account_id TEXT PRIMARY KEY NOT NULL,
            token INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS daily_agent_spending (
            account_id TEXT NOT NULL,
            spending_date TEXT NOT NULL,
            spent_micros INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (account_id, spending_date)
        );

        CREATE TABLE IF NOT EXISTS reconciliation_cursors (
            account_id TEXT PRIMARY KEY NOT NULL,
            last_event_id INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conservation_halts (
            account_id TEXT PRIMARY KEY NOT NULL,
            drift_micros INTEGER NOT NULL,
            halted_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_logs_ts_ms
            ON audit_logs(ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(value: i64) -> MicroUsd {
        MicroUsd::from_micros(value)
    }

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("credit.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn mint_and_balance_round_trip() {
        let (_dir, store) = open_store().await;
        let lot = store
            .mint_lot("acct-1", micros(1_000_000), LotSource::Seed, None)
            .await
            .expect("mint");
        assert_eq!(lot.status, LotStatus::Active);
        assert_eq!(store.balance("acct-1").await.expect("balance"), micros(1_000_000));
        assert_eq!(store.balance("acct-2").await.expect("balance"), MicroUsd::ZERO);
    }

    #[tokio::test]
    async fn mint_rejects_non_positive_amounts() {
        let (_dir, store) = open_store().await;
        let err = store
            .mint_lot("acct-1", MicroUsd::ZERO, LotSource::Grant, None)
            .await;
        assert!(matches!(err, Err(SqliteStoreError::InvalidAmount { .. })));
    }

    #[tokio::test]
    async fn debit_splits_earliest_expiry_first() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        // B minted first but expires later; A must be drained first.
        let lot_b = store
            .mint_lot("acct-1", micros(900_000), LotSource::Purchase, Some(now + 200_000))
            .await
            .expect("mint b");
        let lot_a = store
            .mint_lot("acct-1", micros(100_000), LotSource::Seed, Some(now + 100_000))
            .await
            .expect("mint a");

        let entries = store
            .debit_lots("acct-1", micros(150_000), "ref-1")
            .await
            .expect("debit");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].lot_id, lot_a.lot_id);
        assert_eq!(entries[0].amount_micros, micros(-100_000));
        assert_eq!(entries[1].lot_id, lot_b.lot_id);
        assert_eq!(entries[1].amount_micros, micros(-50_000));
        assert_eq!(store.balance("acct-1").await.expect("balance"), micros(850_000));
    }

    #[tokio::test]
    async fn debit_is_idempotent_by_reference() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(500_000), LotSource::Seed, None)
            .await
            .expect("mint");

        let first = store
            .debit_lots("acct-1", micros(200_000), "ref-1")
            .await
            .expect("debit");
        let replay = store
            .debit_lots("acct-1", micros(200_000), "ref-1")
            .await
            .expect("replay");
        assert_eq!(first.len(), replay.len());
        assert_eq!(first[0].entry_id, replay[0].entry_id);
        assert_eq!(store.balance("acct-1").await.expect("balance"), micros(300_000));
    }

    #[tokio::test]
    async fn debit_insufficient_credit_leaves_ledger_untouched() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(100_000), LotSource::Seed, None)
            .await
            .expect("mint");

        let err = store.debit_lots("acct-1", micros(150_000), "ref-1").await;
        assert!(matches!(
            err,
            Err(SqliteStoreError::InsufficientCredit {
                requested_micros: 150_000,
                available_micros: 100_000,
            })
        ));
        assert_eq!(store.balance("acct-1").await.expect("balance"), micros(100_000));
        assert!(store
            .entries_for_reference("ref-1")
            .await
            .expect("entries")
            .is_empty());
    }

    fn finalize_args(finalization_id: &str, fence_token: u64, cost: i64) -> FinalizeArgs {
        FinalizeArgs {
            account_id: "acct-1".to_string(),
            finalization_id: finalization_id.to_string(),
            fence_token,
            cost_micros: micros(cost),
            spending_date: "2026-08-07".to_string(),
            daily_cap_micros: None,
            reserved_other_micros: MicroUsd::ZERO,
            cap_to_remaining: false,
        }
    }

    #[tokio::test]
    async fn finalize_commits_event_debits_and_daily_total() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(1_000_000), LotSource::Seed, None)
            .await
            .expect("mint");

        let result = store
            .finalize_usage(finalize_args("f1", 1, 300_000))
            .await
            .expect("finalize");
        let DurableFinalize::Committed {
            event,
            entries,
            balance_micros,
        } = result
        else {
            panic!("expected committed, got {result:?}");
        };
        assert_eq!(event.cost_micros, micros(300_000));
        assert_eq!(entries.len(), 1);
        assert_eq!(balance_micros, micros(700_000));
        assert_eq!(
            store
                .daily_get("acct-1", "2026-08-07")
                .await
                .expect("daily"),
            Some(micros(300_000))
        );
        assert_eq!(store.committed_total("acct-1").await.expect("total"), micros(300_000));
    }

    #[tokio::test]
    async fn finalize_replay_returns_duplicate_without_new_rows() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(1_000_000), LotSource::Seed, None)
            .await
            .expect("mint");

        store
            .finalize_usage(finalize_args("f1", 1, 300_000))
            .await
            .expect("finalize");
        let replay = store
            .finalize_usage(finalize_args("f1", 2, 300_000))
            .await
            .expect("replay");
        let DurableFinalize::Duplicate {
            event,
            balance_micros,
        } = replay
        else {
            panic!("expected duplicate, got {replay:?}");
        };
        assert_eq!(event.cost_micros, micros(300_000));
        assert_eq!(balance_micros, micros(700_000));
        assert_eq!(store.committed_total("acct-1").await.expect("total"), micros(300_000));
        // Replay must not advance the fence either.
        assert_eq!(store.fence_token("acct-1").await.expect("fence"), 1);
    }

    #[tokio::test]
    async fn finalize_rejects_stale_fence_without_writes() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(1_000_000), LotSource::Seed, None)
            .await
            .expect("mint");

        store
            .finalize_usage(finalize_args("f1", 2, 100_000))
            .await
            .expect("finalize");
        let stale = store
            .finalize_usage(finalize_args("f2", 1, 100_000))
            .await
            .expect("stale");
        assert!(matches!(
            stale,
            DurableFinalize::StaleFence { stored_token: 2 }
        ));
        assert_eq!(store.committed_total("acct-1").await.expect("total"), micros(100_000));
    }

    #[tokio::test]
    async fn finalize_clamps_cost_at_cap_crossing() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(2_000_000), LotSource::Seed, None)
            .await
            .expect("mint");

        let mut args = finalize_args("f1", 1, 300_000);
        args.daily_cap_micros = Some(micros(500_000));
        store.finalize_usage(args).await.expect("finalize f1");

        let mut args = finalize_args("f2", 2, 300_000);
        args.daily_cap_micros = Some(micros(500_000));
        args.cap_to_remaining = true;
        let result = store.finalize_usage(args).await.expect("finalize f2");
        let DurableFinalize::Committed { event, .. } = result else {
            panic!("expected committed, got {result:?}");
        };
        assert_eq!(event.cost_micros, micros(200_000));
        assert_eq!(
            store
                .daily_get("acct-1", "2026-08-07")
                .await
                .expect("daily"),
            Some(micros(500_000))
        );
    }

    #[tokio::test]
    async fn finalize_rejects_over_cap_without_opt_in() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(2_000_000), LotSource::Seed, None)
            .await
            .expect("mint");

        let mut args = finalize_args("f1", 1, 600_000);
        args.daily_cap_micros = Some(micros(500_000));
        let result = store.finalize_usage(args).await.expect("finalize");
        assert!(matches!(result, DurableFinalize::BudgetExceeded { .. }));
        assert_eq!(store.committed_total("acct-1").await.expect("total"), MicroUsd::ZERO);
        assert_eq!(
            store
                .daily_get("acct-1", "2026-08-07")
                .await
                .expect("daily"),
            None
        );
    }

    #[tokio::test]
    async fn finalize_insufficient_credit_rolls_back_event_and_daily() {
        let (_dir, store) = open_store().await;
        store
            .mint_lot("acct-1", micros(100_000), LotSource::Seed, None)
            .await
            .expect("mint");

        let err = store.finalize_usage(finalize_args("f1", 1, 300_000)).await;
        assert!(matches!(
            err,
            Err(SqliteStoreError::InsufficientCredit { .. })
        ));
        assert_eq!(store.committed_total("acct-1").await.expect("total"), MicroUsd::ZERO);
        assert_eq!(store.fence_token("acct-1").await.expect("fence"), 0);
        assert_eq!(
            store
                .daily_get("acct-1", "2026-08-07")
                .await
                .expect("daily"),
            None
        );
    }

    #[tokio::test]
    async fn sweep_expires_remainder_once() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        let lot = store
            .mint_lot("acct-1", micros(1_000_000), LotSource::Seed, Some(now + 1_000))
            .await
            .expect("mint");
        store
            .debit_lots("acct-1", micros(300_000), "ref-1")
            .await
            .expect("debit");

        let expired = store
            .expire_due_lots(now + 2_000, 64)
            .await
            .expect("sweep");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].lot_id, lot.lot_id);
        assert_eq!(expired[0].expired_micros, micros(700_000));
        assert_eq!(store.balance("acct-1").await.expect("balance"), MicroUsd::ZERO);

        let again = store
            .expire_due_lots(now + 3_000, 64)
            .await
            .expect("sweep again");
        assert!(again.is_empty());

        let entries = store
            .entries_for_reference(&format!("sweep:lot:{}", lot.lot_id))
            .await
            .expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Expiry);
        assert_eq!(entries[0].amount_micros, micros(-700_000));

        let lots = store.list_lots("acct-1").await.expect("lots");
        assert_eq!(lots[0].status, LotStatus::Expired);
    }

    #[tokio::test]
    async fn durable_fence_acquisition_is_monotonic() {
        let (_dir, store) = open_store().await;
        assert_eq!(store.acquire_fence("acct-1").await.expect("fence"), 1);
        assert_eq!(store.acquire_fence("acct-1").await.expect("fence"), 2);
        assert_eq!(store.acquire_fence("acct-2").await.expect("fence"), 1);
    }

    #[tokio::test]
    async fn reconciliation_cursor_only_moves_forward() {
        let (_dir, store) = open_store().await;
        assert_eq!(store.reconciliation_cursor("acct-1").await.expect("cursor"), 0);
        store
            .advance_reconciliation_cursor("acct-1", 7)
            .await
            .expect("advance");
        store
            .advance_reconciliation_cursor("acct-1", 3)
            .await
            .expect("advance back");
        assert_eq!(store.reconciliation_cursor("acct-1").await.expect("cursor"), 7);
    }

    #[tokio::test]
    async fn halts_round_trip() {
        let (_dir, store) = open_store().await;
        assert!(store.halt("acct-1").await.expect("halt").is_none());
        store
            .set_halt("acct-1", micros(42_000))
            .await
            .expect("set halt");
        let halt = store.halt("acct-1").await.expect("halt").expect("record");
        assert_eq!(halt.drift_micros, micros(42_000));
        store.clear_halt("acct-1").await.expect("clear");
        assert!(store.halt("acct-1").await.expect("halt").is_none());
    }

    #[tokio::test]
    async fn conservation_identity_holds_after_mixed_operations() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        store
            .mint_lot("acct-1", micros(600_000), LotSource::Seed, Some(now + 1_000))
            .await
            .expect("mint a");
        store
            .mint_lot("acct-1", micros(400_000), LotSource::Grant, None)
            .await
            .expect("mint b");
        store
            .debit_lots("acct-1", micros(250_000), "ref-1")
            .await
            .expect("debit");
        store
            .expire_due_lots(now + 2_000, 64)
            .await
            .expect("sweep");

        // sum(lot amounts) + sum(entry amounts) == sum(active lot balances)
        let lots = store.list_lots("acct-1").await.expect("lots");
        let mut entry_sum = 0i64;
        for lot in &lots {
            for entry in store
                .entries_for_reference(&format!("sweep:lot:{}", lot.lot_id))
                .await
                .expect("entries")
            {
                entry_sum += entry.amount_micros.micros();
            }
        }
        for entry in store.entries_for_reference("ref-1").await.expect("entries") {
            entry_sum += entry.amount_micros.micros();
        }
        let amount_sum: i64 = lots.iter().map(|lot| lot.amount_micros.micros()).sum();
        let balance = store.balance("acct-1").await.expect("balance");
        assert_eq!(amount_sum + entry_sum, balance.micros());
        assert_eq!(balance, micros(400_000));
    }
}
