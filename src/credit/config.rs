use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::amount::MicroUsd;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub conservation: ConservationConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// TTL for cache-tier reservation holds. An abandoned hold stops counting
    /// against the cap once this elapses.
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            conservation: ConservationConfig::default(),
            sweep: SweepConfig::default(),
            reconcile: ReconcileConfig::default(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CreditConfigError {
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid conservation thresholds: breaker_bps={breaker_bps} < tolerance_bps={tolerance_bps}")]
    BreakerBelowTolerance { tolerance_bps: u32, breaker_bps: u32 },
    #[error("duplicate account config: {account_id}")]
    DuplicateAccount { account_id: String },
}

impl CreditConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, CreditConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CreditConfigError> {
        let conservation = &self.conservation;
        if conservation.breaker_bps < conservation.tolerance_bps {
            return Err(CreditConfigError::BreakerBelowTolerance {
                tolerance_bps: conservation.tolerance_bps,
                breaker_bps: conservation.breaker_bps,
            });
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.account_id.as_str()) {
                return Err(CreditConfigError::DuplicateAccount {
                    account_id: account.account_id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn account(&self, account_id: &str) -> AccountConfig {
        self.accounts
            .iter()
            .find(|account| account.account_id == account_id)
            .cloned()
            .unwrap_or_else(|| AccountConfig::new(account_id))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    /// Daily spending cap. `None` means uncapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cap_micros: Option<MicroUsd>,
    /// What finalize does when the actual cost would cross the cap.
    #[serde(default)]
    pub cap_overflow: CapOverflow,
}

impl AccountConfig {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            daily_cap_micros: None,
            cap_overflow: CapOverflow::default(),
        }
    }
}

/// Finalize-time policy for actual cost crossing the remaining daily budget.
/// Reservation-time checks always reject; clamping only corrects for
/// estimate-vs-actual drift on work that was already admitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapOverflow {
    #[default]
    Reject,
    Clamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConservationConfig {
    /// Drift accepted as normal tier skew, in basis points of the daily cap.
    #[serde(default = "default_tolerance_bps")]
    pub tolerance_bps: u32,
    /// Drift that trips the circuit breaker, in basis points of the daily cap.
    #[serde(default = "default_breaker_bps")]
    pub breaker_bps: u32,
    /// Absolute thresholds used for accounts without a daily cap.
    #[serde(default = "default_uncapped_tolerance_micros")]
    pub uncapped_tolerance_micros: MicroUsd,
    #[serde(default = "default_uncapped_breaker_micros")]
    pub uncapped_breaker_micros: MicroUsd,
}

impl Default for ConservationConfig {
    fn default() -> Self {
        Self {
            tolerance_bps: default_tolerance_bps(),
            breaker_bps: default_breaker_bps(),
            uncapped_tolerance_micros: default_uncapped_tolerance_micros(),
            uncapped_breaker_micros: default_uncapped_breaker_micros(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on lots retired per pass; the remainder waits for the next
    /// tick.
    #[serde(default = "default_sweep_batch_limit")]
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            batch_limit: default_sweep_batch_limit(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_reconcile_batch_size")]
    pub batch_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            batch_size: default_reconcile_batch_size(),
        }
    }
}

fn default_reservation_ttl_secs() -> u64 {
    60 * 60
}

fn default_tolerance_bps() -> u32 {
    100
}

fn default_breaker_bps() -> u32 {
    500
}

fn default_uncapped_tolerance_micros() -> MicroUsd {
    MicroUsd::from_micros(100_000)
}

fn default_uncapped_breaker_micros() -> MicroUsd {
    MicroUsd::from_micros(500_000)
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_sweep_batch_limit() -> usize {
    128
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_reconcile_batch_size() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_with_defaults() {
        let raw = r#"
            [[accounts]]
            account_id = "guild-1"
            daily_cap_micros = 5000000
            cap_overflow = "clamp"
        "#;
        let config = CreditConfig::from_toml_str(raw).expect("config");
        assert_eq!(config.conservation.tolerance_bps, 100);
        assert_eq!(config.conservation.breaker_bps, 500);
        assert_eq!(config.reservation_ttl_secs, 3600);

        let account = config.account("guild-1");
        assert_eq!(
            account.daily_cap_micros,
            Some(MicroUsd::from_micros(5_000_000))
        );
        assert_eq!(account.cap_overflow, CapOverflow::Clamp);

        let unknown = config.account("guild-2");
        assert_eq!(unknown.daily_cap_micros, None);
        assert_eq!(unknown.cap_overflow, CapOverflow::Reject);
    }

    #[test]
    fn rejects_breaker_below_tolerance() {
        let raw = r#"
            [conservation]
            tolerance_bps = 500
            breaker_bps = 100
        "#;
        let err = CreditConfig::from_toml_str(raw);
        assert!(matches!(
            err,
            Err(CreditConfigError::BreakerBelowTolerance { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let raw = r#"
            [[accounts]]
            account_id = "guild-1"

            [[accounts]]
            account_id = "guild-1"
        "#;
        let err = CreditConfig::from_toml_str(raw);
        assert!(matches!(
            err,
            Err(CreditConfigError::DuplicateAccount { .. })
        ));
    }
}
