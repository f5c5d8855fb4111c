use crate::enums::Side;
use crate::error::DomainError;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fraction in `(0, 1)`, e.g. the distance between a reference price and a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Percentage(Decimal);

impl Percentage {
    /// 2%, the stop distance used for adopted positions unless configured.
    pub const DEFAULT_STOP: Self = Self(Decimal::from_parts(2, 0, 0, false, 2));

    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO || value >= Decimal::ONE {
            return Err(DomainError::PercentageOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn from_bps(bps: u32) -> Result<Self, DomainError> {
        Self::new(Decimal::from(bps) / Decimal::from(10000))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn to_bps(&self) -> u32 {
        (self.0 * Decimal::from(10000)).to_u32().unwrap_or(0)
    }

    /// Stop price that bounds the loss of a position held on `side`.
    ///
    /// Longs are protected below the reference price, shorts above it.
    pub fn stop_price(&self, side: Side, reference: Decimal) -> Decimal {
        match side {
            Side::Buy => reference * (Decimal::ONE - self.0),
            Side::Sell => reference * (Decimal::ONE + self.0),
        }
    }
}

impl TryFrom<Decimal> for Percentage {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Percentage> for Decimal {
    fn from(pct: Percentage) -> Self {
        pct.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0 * Decimal::from(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bps_conversion() {
        let pct = Percentage::from_bps(200).unwrap();
        assert_eq!(pct.value(), dec!(0.02));
        assert_eq!(pct.to_bps(), 200);
        assert_eq!(Percentage::DEFAULT_STOP, pct);
    }

    #[test]
    fn test_bps_out_of_range_is_rejected() {
        assert!(Percentage::from_bps(0).is_err());
        assert!(Percentage::from_bps(10000).is_err());
        assert!(Percentage::from_bps(25000).is_err());
        assert!(Percentage::from_bps(9999).is_ok());
    }

    #[test]
    fn test_deserialize_checks_range() {
        assert!(serde_json::from_str::<Percentage>(r#""0.05""#).is_ok());
        assert!(serde_json::from_str::<Percentage>(r#""1.2""#).is_err());
    }

    #[test]
    fn test_stop_price_is_on_losing_side() {
        let pct = Percentage::from_bps(200).unwrap();
        assert_eq!(pct.stop_price(Side::Buy, dec!(100)), dec!(98));
        assert_eq!(pct.stop_price(Side::Sell, dec!(100)), dec!(102));
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(Percentage::new(dec!(0)).is_err());
        assert!(Percentage::new(dec!(1.5)).is_err());
        assert!(Percentage::new(dec!(0.01)).is_ok());
    }
}
