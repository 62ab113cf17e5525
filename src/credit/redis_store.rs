use std::collections::HashMap;

use redis::AsyncCommands;
use thiserror::Error;

use super::amount::MicroUsd;
use super::store_types::CacheLedgerRecord;

const DEFAULT_MARKER_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Cache tier. Advisory counters only; every multi-step mutation is a single
/// atomic Lua script so concurrent writers never observe partial state.
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("budget exceeded: limit_micros={limit_micros} attempted_micros={attempted_micros}")]
    BudgetExceeded {
        limit_micros: i64,
        attempted_micros: i64,
    },
    #[error("account halted: {account_id}")]
    Halted { account_id: String },
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "tally".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_fence(&self, account_id: &str) -> String {
        format!("{}:fence:{account_id}", self.prefix)
    }

    fn key_ledger(&self, account_id: &str) -> String {
        format!("{}:ledger:{account_id}", self.prefix)
    }

    fn key_reservation(&self, reservation_id: &str) -> String {
        format!("{}:resv:{reservation_id}", self.prefix)
    }

    fn key_daily(&self, account_id: &str, spending_date: &str) -> String {
        format!("{}:daily:{account_id}:{spending_date}", self.prefix)
    }

    fn key_marker(&self, kind: &str, id: &str) -> String {
        format!("{}:mark:{kind}:{id}", self.prefix)
    }

    fn key_halt(&self, account_id: &str) -> String {
        format!("{}:halt:{account_id}", self.prefix)
    }

    /// Monotonic per-account fence counter; the cache tier is the issuer,
    /// the durable tier the validator.
    pub async fn acquire_fence(&self, account_id: &str) -> Result<u64, RedisStoreError> {
        let mut conn = self.connection().await?;
        let token: i64 = conn.incr(self.key_fence(account_id), 1).await?;
        Ok(i64_to_u64(token))
    }

    pub async fn is_halted(&self, account_id: &str) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(self.key_halt(account_id)).await?;
        Ok(exists)
    }

    pub async fn set_halt(
        &self,
        account_id: &str,
        drift: MicroUsd,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .set(self.key_halt(account_id), drift.micros())
            .await?;
        Ok(())
    }

    pub async fn clear_halt(&self, account_id: &str) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.key_halt(account_id)).await?;
        Ok(())
    }

    /// Place a hold against the daily cap. Atomic: halt check, cap check
    /// against spent + reserved, reservation write and reserved increment in
    /// one script. Re-issuing a known reservation id is a no-op.
    pub async fn reserve(
        &self,
        account_id: &str,
        reservation_id: &str,
        estimate: MicroUsd,
        daily_cap: Option<MicroUsd>,
        spending_date: &str,
        reservation_ttl_secs: u64,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();

        let script = redis::Script::new(
            r#"
local halt_key = KEYS[1]
local reservation_key = KEYS[2]
local ledger_key = KEYS[3]
local daily_key = KEYS[4]

local account_id = ARGV[1]
local amount = tonumber(ARGV[2]) or 0
local cap = tonumber(ARGV[3]) or -1
local spending_date = ARGV[4]
local ts_ms = ARGV[5]
local ttl_secs = tonumber(ARGV[6]) or 0

if redis.call("EXISTS", halt_key) == 1 then
  return { "ERR", "halted" }
end

if redis.call("EXISTS", reservation_key) == 1 then
  return { "OK", "exists" }
end

if cap >= 0 then
  local spent = tonumber(redis.call("GET", daily_key) or "0") or 0
  local reserved = tonumber(redis.call("HGET", ledger_key, "reserved_micros") or "0") or 0
  local attempted = spent + reserved + amount
  if attempted > cap then
    return { "ERR", "budget_exceeded", tostring(attempted) }
  end
end

redis.call("HSET", reservation_key,
  "account_id", account_id,
  "amount_micros", tostring(amount),
  "spending_date", spending_date,
  "ts_ms", ts_ms)
if ttl_secs > 0 then
  redis.call("EXPIRE", reservation_key, ttl_secs)
end

redis.call("HINCRBY", ledger_key, "reserved_micros", amount)
redis.call("HSET", ledger_key, "updated_at_ms", ts_ms)
return { "OK" }
"#,
        );

        let result: Vec<String> = script
            .key(self.key_halt(account_id))
            .key(self.key_reservation(reservation_id))
            .key(self.key_ledger(account_id))
            .key(self.key_daily(account_id, spending_date))
            .arg(account_id)
            .arg(estimate.micros())
            .arg(daily_cap.map(MicroUsd::micros).unwrap_or(-1))
            .arg(spending_date)
            .arg(ts_ms)
            .arg(reservation_ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(|s| s.as_str()) {
            Some("OK") => Ok(()),
            Some("ERR") if result.get(1).map(|s| s.as_str()) == Some("halted") => {
                Err(RedisStoreError::Halted {
                    account_id: account_id.to_string(),
                })
            }
            Some("ERR") if result.get(1).map(|s| s.as_str()) == Some("budget_exceeded") => {
                let limit = daily_cap.map(MicroUsd::micros).unwrap_or(0);
                let attempted = result
                    .get(2)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or_else(|| limit.saturating_add(estimate.micros()));
                Err(RedisStoreError::BudgetExceeded {
                    limit_micros: limit,
                    attempted_micros: attempted,
                })
            }
            _ => Err(unexpected_script_response()),
        }
    }

    /// Amount held by an outstanding reservation, if it still exists.
    pub async fn reservation_amount(
        &self,
        reservation_id: &str,
    ) -> Result<Option<MicroUsd>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .hget(self.key_reservation(reservation_id), "amount_micros")
            .await?;
        Ok(raw
            .and_then(|value| value.parse::<i64>().ok())
            .map(MicroUsd::from_micros))
    }

    /// Drop a hold and give its amount back to the cap. Used both after a
    /// successful durable commit (the spend itself lands via
    /// [`apply_usage_event`](Self::apply_usage_event), keyed by event id so
    /// reconciliation replays stay idempotent) and on rejected finalizes.
    /// Missing reservations (expired or already released) are a no-op.
    pub async fn release_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();

        let script = redis::Script::new(
            r#"
local reservation_key = KEYS[1]

local prefix = ARGV[1]
local ts_ms = ARGV[2]

if redis.call("EXISTS", reservation_key) == 0 then
  return { "OK", "missing" }
end

local account_id = redis.call("HGET", reservation_key, "account_id")
local held = tonumber(redis.call("HGET", reservation_key, "amount_micros") or "0") or 0
redis.call("DEL", reservation_key)
if (not account_id) then
  return { "OK", "missing_account" }
end

local ledger_key = prefix .. ":ledger:" .. account_id
local reserved_after = tonumber(redis.call("HINCRBY", ledger_key, "reserved_micros", -held) or "0") or 0
if reserved_after < 0 then
  redis.call("HSET", ledger_key, "reserved_micros", 0)
end
redis.call("HSET", ledger_key, "updated_at_ms", ts_ms)
return { "OK", account_id }
"#,
        );

        let _: Vec<String> = script
            .key(self.key_reservation(reservation_id))
            .arg(self.prefix.clone())
            .arg(ts_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Replay one usage event's effect into the cache counters. Idempotent by
    /// event id via a TTL'd marker; returns whether this call applied it.
    pub async fn apply_usage_event(
        &self,
        account_id: &str,
        event_id: i64,
        cost: MicroUsd,
        spending_date: &str,
        day_ttl_secs: u64,
    ) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();

        let script = redis::Script::new(
            r#"
local marker_key = KEYS[1]
local ledger_key = KEYS[2]
local daily_key = KEYS[3]

local cost = tonumber(ARGV[1]) or 0
local ts_ms = ARGV[2]
local marker_ttl = tonumber(ARGV[3]) or 0
local day_ttl = tonumber(ARGV[4]) or 0

if not redis.call("SET", marker_key, "1", "NX", "EX", marker_ttl) then
  return { "OK", "seen" }
end

redis.call("HINCRBY", ledger_key, "committed_micros", cost)
local credit_after = tonumber(redis.call("HINCRBY", ledger_key, "credit_micros", -cost) or "0") or 0
if credit_after < 0 then
  redis.call("HSET", ledger_key, "credit_micros", 0)
end
redis.call("HSET", ledger_key, "updated_at_ms", ts_ms)
local total = redis.call("INCRBY", daily_key, cost)
if tonumber(total) == cost and day_ttl > 0 then
  redis.call("EXPIRE", daily_key, day_ttl)
end
return { "OK", "applied" }
"#,
        );

        let result: Vec<String> = script
            .key(self.key_marker("event", &event_id.to_string()))
            .key(self.key_ledger(account_id))
            .key(self.key_daily(account_id, spending_date))
            .arg(cost.micros())
            .arg(ts_ms)
            .arg(DEFAULT_MARKER_TTL_SECS)
            .arg(day_ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        match result.get(1).map(|s| s.as_str()) {
            Some("applied") => Ok(true),
            Some("seen") => Ok(false),
            _ => Err(unexpected_script_response()),
        }
    }

    /// Draw cached credit down after a lot expired. Idempotent per lot.
    pub async fn apply_expiry(
        &self,
        account_id: &str,
        lot_id: i64,
        expired: MicroUsd,
    ) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();

        let script = redis::Script::new(
            r#"
local marker_key = KEYS[1]
local ledger_key = KEYS[2]

local amount = tonumber(ARGV[1]) or 0
local ts_ms = ARGV[2]
local marker_ttl = tonumber(ARGV[3]) or 0

if not redis.call("SET", marker_key, "1", "NX", "EX", marker_ttl) then
  return { "OK", "seen" }
end

local credit_after = tonumber(redis.call("HINCRBY", ledger_key, "credit_micros", -amount) or "0") or 0
if credit_after < 0 then
  redis.call("HSET", ledger_key, "credit_micros", 0)
end
redis.call("HSET", ledger_key, "updated_at_ms", ts_ms)
return { "OK", "applied" }
"#,
        );

        let result: Vec<String> = script
            .key(self.key_marker("sweep", &lot_id.to_string()))
            .key(self.key_ledger(account_id))
            .arg(expired.micros())
            .arg(ts_ms)
            .arg(DEFAULT_MARKER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        match result.get(1).map(|s| s.as_str()) {
            Some("applied") => Ok(true),
            Some("seen") => Ok(false),
            _ => Err(unexpected_script_response()),
        }
    }

    /// Best-effort bump of the cached available credit after a mint.
    pub async fn add_credit(
        &self,
        account_id: &str,
        amount: MicroUsd,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let ledger_key = self.key_ledger(account_id);
        let _: () = redis::pipe()
            .atomic()
            .hincr(&ledger_key, "credit_micros", amount.micros())
            .hset(&ledger_key, "updated_at_ms", now_millis())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Cache-tier committed total, the fast side of the drift comparison.
    pub async fn committed_total(&self, account_id: &str) -> Result<MicroUsd, RedisStoreError> {
        let mut conn = self.connection().await?;
        let committed: Option<String> = conn
            .hget(self.key_ledger(account_id), "committed_micros")
            .await?;
        Ok(MicroUsd::from_micros(
            committed.and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(0),
        ))
    }

    pub async fn ledger(&self, account_id: &str) -> Result<CacheLedgerRecord, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key_ledger(account_id)).await?;
        let field = |name: &str| -> i64 {
            raw.get(name)
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(0)
        };
        Ok(CacheLedgerRecord {
            account_id: account_id.to_string(),
            committed_micros: MicroUsd::from_micros(field("committed_micros")),
            reserved_micros: MicroUsd::from_micros(field("reserved_micros")),
            credit_micros: MicroUsd::from_micros(field("credit_micros")),
            updated_at_ms: raw
                .get("updated_at_ms")
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0),
        })
    }

    /// Daily counter write: one round trip, expiry set only when the INCRBY
    /// created the key (first write of the day).
    pub async fn daily_incr(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
        day_ttl_secs: u64,
    ) -> Result<MicroUsd, RedisStoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local daily_key = KEYS[1]
local amount = tonumber(ARGV[1]) or 0
local day_ttl = tonumber(ARGV[2]) or 0

local total = redis.call("INCRBY", daily_key, amount)
if tonumber(total) == amount and day_ttl > 0 then
  redis.call("EXPIRE", daily_key, day_ttl)
end
return total
"#,
        );

        let total: i64 = script
            .key(self.key_daily(account_id, spending_date))
            .arg(amount.micros())
            .arg(day_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(MicroUsd::from_micros(total))
    }

    pub async fn daily_get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<MicroUsd>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.key_daily(account_id, spending_date))
            .await?;
        Ok(raw
            .and_then(|value| value.parse::<i64>().ok())
            .map(MicroUsd::from_micros))
    }
}

fn unexpected_script_response() -> RedisStoreError {
    redis::RedisError::from((
        redis::ErrorKind::ResponseError,
        "unexpected redis script response",
    ))
    .into()
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
