//! A Bitcoin amount newtype holding *signed* satoshis.
//!
//! All internal accounting (balances, tx amounts, fees) is done in signed
//! 64-bit satoshis; conversion to the 8-decimal-place BTC values that
//! Bitcoin Core's JSON surface expects happens only at the JSON boundary.
//!
//! Note that we don't impl `From<i64>` / `From<f64>` etc because we want
//! calling code to be explicit about what the input unit is.

use std::{
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Neg, Sub},
};

use rust_decimal::{prelude::ToPrimitive, Decimal};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Satoshis per BTC, as a [`Decimal`].
const SATS_PER_BTC: Decimal = dec!(100_000_000);

/// Errors that can occur when constructing an [`Amount`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("amount is not a whole number of satoshis")]
    NotWholeSats,
    #[error("amount does not fit in an i64 satoshi value")]
    OutOfRange,
}

/// A signed amount of satoshis. Negative values appear in SEND transaction
/// rows, where the amount reflects value leaving the wallet.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash,
    Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Self = Self(0);

    /// Construct from a signed satoshi value.
    #[inline]
    pub const fn from_sats(sats: i64) -> Self {
        Self(sats)
    }

    /// Construct from a BTC decimal, e.g. one parsed off a JSON request.
    /// Rounds to the nearest satoshi like the Core RPC surface does.
    pub fn try_from_btc(btc: Decimal) -> Result<Self, Error> {
        let sats = (btc * SATS_PER_BTC).round();
        if sats.fract() != Decimal::ZERO {
            return Err(Error::NotWholeSats);
        }
        sats.to_i64().map(Self).ok_or(Error::OutOfRange)
    }

    /// The contained satoshi value.
    #[inline]
    pub const fn sats(self) -> i64 {
        self.0
    }

    /// The value in BTC as an exact [`Decimal`].
    pub fn btc(self) -> Decimal {
        Decimal::from(self.0) / SATS_PER_BTC
    }

    /// The value in BTC as an `f64`, rounded to 8 decimal places. This is
    /// the only lossy conversion and exists solely for building JSON
    /// responses whose fields Core renders as floats.
    pub fn btc_f64(self) -> f64 {
        self.btc().round_dp(8).to_f64().unwrap_or_default()
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Self;
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).sum())
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert_eq, proptest};

    use super::*;

    /// Satoshis -> BTC decimal -> satoshis must not lose precision.
    #[test]
    fn sat_btc_roundtrip() {
        proptest!(|(sats in any::<i32>())| {
            let amount = Amount::from_sats(i64::from(sats));
            let roundtrip = Amount::try_from_btc(amount.btc()).unwrap();
            prop_assert_eq!(amount, roundtrip);
        })
    }

    #[test]
    fn btc_f64_matches_core_rounding() {
        assert_eq!(Amount::from_sats(50_000).btc_f64(), 0.0005);
        assert_eq!(Amount::from_sats(-150_000_000).btc_f64(), -1.5);
        assert_eq!(Amount::ZERO.btc_f64(), 0.0);
    }

    #[test]
    fn rejects_sub_satoshi_btc() {
        let btc = dec!(0.000000001); // 0.1 sat
        assert_eq!(Amount::try_from_btc(btc), Err(Error::NotWholeSats));
    }

    #[test]
    fn sum_and_neg() {
        let amounts = [10, -4, 6].map(Amount::from_sats);
        let total: Amount = amounts.into_iter().sum();
        assert_eq!(total, Amount::from_sats(12));
        assert_eq!(-total, Amount::from_sats(-12));
    }
}
