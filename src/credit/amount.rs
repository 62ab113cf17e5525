use std::fmt;

use serde::{Deserialize, Serialize};

/// Currency amount as an integer count of micro-USD (1e-6 dollars).
///
/// All arithmetic is exact integer arithmetic. Ledger entries are signed, so
/// negative values are representable, but every amount accepted at the public
/// mint/debit surface must be strictly positive.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MicroUsd(i64);

impl MicroUsd {
    pub const ZERO: MicroUsd = MicroUsd(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Negative amounts floor to zero. Used where a derived counter may have
    /// been decremented past zero by an idempotent replay.
    pub fn max_zero(self) -> Self {
        Self(self.0.max(0))
    }
}

impl fmt::Display for MicroUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(
            f,
            "{sign}${}.{:06}",
            magnitude / 1_000_000,
            magnitude % 1_000_000
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_decimal_usd() {
        assert_eq!(MicroUsd::from_micros(1_250_000).to_string(), "$1.250000");
        assert_eq!(MicroUsd::from_micros(-42).to_string(), "-$0.000042");
        assert_eq!(MicroUsd::ZERO.to_string(), "$0.000000");
    }

    #[test]
    fn checked_arithmetic_detects_overflow() {
        let max = MicroUsd::from_micros(i64::MAX);
        assert!(max.checked_add(MicroUsd::from_micros(1)).is_none());
        assert_eq!(
            max.saturating_add(MicroUsd::from_micros(1)),
            MicroUsd::from_micros(i64::MAX)
        );
    }

    #[test]
    fn max_zero_floors_negative_values() {
        assert_eq!(MicroUsd::from_micros(-5).max_zero(), MicroUsd::ZERO);
        assert_eq!(
            MicroUsd::from_micros(5).max_zero(),
            MicroUsd::from_micros(5)
        );
    }

    #[test]
    fn serde_is_transparent() {
        let amount = MicroUsd::from_micros(300_000);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "300000");
        let parsed: MicroUsd = serde_json::from_str("300000").unwrap();
        assert_eq!(parsed, amount);
    }
}
