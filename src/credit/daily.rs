use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use super::CreditError;
use super::amount::MicroUsd;
use super::memory::MemoryCounters;
use super::sqlite_store::SqliteStore;

#[cfg(feature = "store-redis")]
use super::redis_store::RedisStore;

#[derive(Debug, Error)]
#[error("{tier}: {message}")]
pub struct TierError {
    pub tier: &'static str,
    pub message: String,
}

/// One tier of the daily spending counter. Tiers share this interface so the
/// fallback order is testable independently of any concrete store.
#[async_trait]
pub trait SpendingTier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Add to the counter, returning the new total for the day.
    async fn add(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
    ) -> Result<MicroUsd, TierError>;

    /// `Ok(None)` means the tier answered and the key is confirmed empty.
    async fn get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<MicroUsd>, TierError>;
}

/// Ordered chain over the tiers: cache, durable, in-process. First successful
/// write wins; reads return the first definite answer and only fall back to
/// zero when every tier confirms the key empty.
pub struct DailySpending {
    tiers: Vec<Arc<dyn SpendingTier>>,
}

impl DailySpending {
    pub fn new(tiers: Vec<Arc<dyn SpendingTier>>) -> Self {
        Self { tiers }
    }

    pub async fn add(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
    ) -> Result<MicroUsd, CreditError> {
        for tier in &self.tiers {
            match tier.add(account_id, spending_date, amount).await {
                Ok(total) => return Ok(total),
                Err(err) => {
                    tracing::warn!(
                        tier = tier.name(),
                        account_id,
                        error = %err,
                        "daily counter write failed; falling through"
                    );
                }
            }
        }
        Err(CreditError::Unavailable {
            message: "no spending tier accepted the write".to_string(),
        })
    }

    pub async fn get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<MicroUsd, CreditError> {
        let mut any_error = false;
        for tier in &self.tiers {
            match tier.get(account_id, spending_date).await {
                Ok(Some(total)) => return Ok(total),
                Ok(None) => {}
                Err(err) => {
                    any_error = true;
                    tracing::warn!(
                        tier = tier.name(),
                        account_id,
                        error = %err,
                        "daily counter read failed; falling through"
                    );
                }
            }
        }
        if any_error {
            return Err(CreditError::Unavailable {
                message: "no spending tier answered the read".to_string(),
            });
        }
        Ok(MicroUsd::ZERO)
    }
}

#[cfg(feature = "store-redis")]
pub struct RedisTier {
    store: RedisStore,
}

#[cfg(feature = "store-redis")]
impl RedisTier {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

#[cfg(feature = "store-redis")]
#[async_trait]
impl SpendingTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn add(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
    ) -> Result<MicroUsd, TierError> {
        let ttl = seconds_until_day_end(OffsetDateTime::now_utc());
        self.store
            .daily_incr(account_id, spending_date, amount, ttl)
            .await
            .map_err(|err| TierError {
                tier: "redis",
                message: err.to_string(),
            })
    }

    async fn get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<MicroUsd>, TierError> {
        self.store
            .daily_get(account_id, spending_date)
            .await
            .map_err(|err| TierError {
                tier: "redis",
                message: err.to_string(),
            })
    }
}

pub struct SqliteTier {
    store: SqliteStore,
}

impl SqliteTier {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SpendingTier for SqliteTier {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn add(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
    ) -> Result<MicroUsd, TierError> {
        self.store
            .daily_add(account_id, spending_date, amount)
            .await
            .map_err(|err| TierError {
                tier: "sqlite",
                message: err.to_string(),
            })
    }

    async fn get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<MicroUsd>, TierError> {
        self.store
            .daily_get(account_id, spending_date)
            .await
            .map_err(|err| TierError {
                tier: "sqlite",
                message: err.to_string(),
            })
    }
}

pub struct MemoryTier {
    counters: Arc<MemoryCounters>,
}

impl MemoryTier {
    pub fn new(counters: Arc<MemoryCounters>) -> Self {
        Self { counters }
    }
}

#[async_trait]
impl SpendingTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn add(
        &self,
        account_id: &str,
        spending_date: &str,
        amount: MicroUsd,
    ) -> Result<MicroUsd, TierError> {
        Ok(self.counters.daily_add(account_id, spending_date, amount))
    }

    async fn get(
        &self,
        account_id: &str,
        spending_date: &str,
    ) -> Result<Option<MicroUsd>, TierError> {
        Ok(self.counters.daily_get(account_id, spending_date))
    }
}

/// UTC calendar date key for the daily counter tables and cache keys.
pub fn spending_date(now: OffsetDateTime) -> String {
    let date = now.date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn spending_date_utc() -> String {
    spending_date(OffsetDateTime::now_utc())
}

/// TTL for a daily cache key set on its first write: the rest of the UTC day
/// plus a minute of slack for clock skew between writers.
pub fn seconds_until_day_end(now: OffsetDateTime) -> u64 {
    match now.date().next_day() {
        Some(next) => {
            let midnight = next.midnight().assume_utc();
            let remaining = (midnight - now).whole_seconds().max(0) as u64;
            remaining + 60
        }
        None => 24 * 60 * 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingTier;

    #[async_trait]
    impl SpendingTier for FailingTier {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn add(&self, _: &str, _: &str, _: MicroUsd) -> Result<MicroUsd, TierError> {
            Err(TierError {
                tier: "failing",
                message: "connection refused".to_string(),
            })
        }

        async fn get(&self, _: &str, _: &str) -> Result<Option<MicroUsd>, TierError> {
            Err(TierError {
                tier: "failing",
                message: "connection refused".to_string(),
            })
        }
    }

    fn micros(value: i64) -> MicroUsd {
        MicroUsd::from_micros(value)
    }

    #[tokio::test]
    async fn write_falls_through_to_next_tier() {
        let counters = Arc::new(MemoryCounters::new());
        let chain = DailySpending::new(vec![
            Arc::new(FailingTier),
            Arc::new(MemoryTier::new(counters.clone())),
        ]);

        let total = chain.add("a", "2026-08-07", micros(100)).await.expect("add");
        assert_eq!(total, micros(100));
        assert_eq!(counters.daily_get("a", "2026-08-07"), Some(micros(100)));
    }

    #[tokio::test]
    async fn read_does_not_default_to_zero_when_tiers_errored() {
        let chain = DailySpending::new(vec![Arc::new(FailingTier)]);
        let err = chain.get("a", "2026-08-07").await;
        assert!(matches!(err, Err(CreditError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn read_returns_zero_only_when_all_tiers_confirm_empty() {
        let chain = DailySpending::new(vec![Arc::new(MemoryTier::new(Arc::new(
            MemoryCounters::new(),
        )))]);
        let total = chain.get("a", "2026-08-07").await.expect("get");
        assert_eq!(total, MicroUsd::ZERO);
    }

    #[tokio::test]
    async fn read_prefers_earlier_tiers() {
        let first = Arc::new(MemoryCounters::new());
        let second = Arc::new(MemoryCounters::new());
        first.daily_add("a", "2026-08-07", micros(10));
        second.daily_add("a", "2026-08-07", micros(999));

        let chain = DailySpending::new(vec![
            Arc::new(MemoryTier::new(first)),
            Arc::new(MemoryTier::new(second)),
        ]);
        assert_eq!(chain.get("a", "2026-08-07").await.expect("get"), micros(10));
    }

    #[test]
    fn spending_date_formats_utc_calendar_day() {
        let now = OffsetDateTime::from_unix_timestamp(1_754_500_000).expect("timestamp");
        assert_eq!(spending_date(now), "2025-08-06");
    }

    #[test]
    fn day_end_ttl_covers_rest_of_day_with_slack() {
        let now = OffsetDateTime::from_unix_timestamp(1_754_500_000).expect("timestamp");
        let ttl = seconds_until_day_end(now);
        assert!(ttl > 60);
        assert!(ttl <= 24 * 60 * 60 + 60);
    }
}
