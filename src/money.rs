//! Fixed-point currency amounts
//!
//! All balances, fares and penalties are counted in minor units (paise for
//! INR). Decimal text goes through [`rust_decimal::Decimal`], rounded
//! half away from zero to two places, and is always rendered with exactly two
//! decimals, so `"35"`, `"35.0"` and `"35.004"` are the same amount.
//!
//! There is no `+` operator: every sum goes through [`Money::checked_add`] so
//! an oversized fare surfaces as an error instead of wrapping.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StorageError;

const MINOR_PER_MAJOR: i64 = 100;
const MINOR_DIGITS: u32 = 2;

/// A currency amount in minor units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Construct from minor units (e.g. paise)
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Construct from whole major units (e.g. rupees)
    pub const fn from_major(major: i64) -> Self {
        Money(major * MINOR_PER_MAJOR)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    /// Exact decimal value in major units
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, MINOR_DIGITS)
    }

    /// Round a decimal to the minor unit; `None` if it does not fit
    pub fn from_decimal(amount: Decimal) -> Option<Money> {
        amount
            .round_dp_with_strategy(MINOR_DIGITS, RoundingStrategy::MidpointAwayFromZero)
            .checked_mul(Decimal::from(MINOR_PER_MAJOR))?
            .to_i64()
            .map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_decimal(), f)
    }
}

impl FromStr for Money {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let amount = Decimal::from_str(s.trim())
            .map_err(|e| StorageError::InvalidInput(format!("Invalid amount {:?}: {}", s, e)))?;

        Money::from_decimal(amount)
            .ok_or_else(|| StorageError::InvalidInput(format!("Amount out of range: {:?}", s)))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Whole(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Whole(major) => major
                .checked_mul(MINOR_PER_MAJOR)
                .map(Money)
                .ok_or_else(|| serde::de::Error::custom(format!("amount out of range: {}", major))),
        }
    }
}
