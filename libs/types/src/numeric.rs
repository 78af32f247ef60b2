//! Fixed-point money and integer quantity types
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors).
//! Valuations are sums of `quantity × price`, so the result is exact and
//! independent of the order in which events are applied.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A non-negative unit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    pub const ZERO: Price = Price(Decimal::ZERO);

    /// Create a price, rejecting negative values.
    pub fn new(value: Decimal) -> Option<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            None
        } else {
            Some(Self(value.normalize()))
        }
    }

    /// Whole-unit price, mostly for tests and defaults.
    pub fn from_u64(units: u64) -> Self {
        Self(Decimal::from(units))
    }

    /// Parse a decimal string such as `"2.00"`.
    pub fn parse(s: &str) -> Option<Self> {
        Decimal::from_str(s.trim()).ok().and_then(Self::new)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Value of `quantity` units at this price.
    pub fn extend(&self, quantity: Quantity) -> Decimal {
        self.0 * Decimal::from(quantity.get())
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A positive item count within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u32);

impl Quantity {
    /// Create a quantity; zero is not a valid count.
    pub fn new(count: u32) -> Option<Self> {
        if count == 0 {
            None
        } else {
            Some(Self(count))
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Sum two quantities, `None` on overflow.
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_rejects_negative() {
        assert!(Price::new(Decimal::from(-1)).is_none());
        assert_eq!(Price::new(Decimal::ZERO), Some(Price::ZERO));
    }

    #[test]
    fn test_price_parse() {
        assert_eq!(Price::parse("2.00"), Some(Price::from_u64(2)));
        assert_eq!(Price::parse(" 0.25 ").unwrap().to_string(), "0.25");
        assert!(Price::parse("abc").is_none());
        assert!(Price::parse("-3").is_none());
    }

    #[test]
    fn test_price_extend_is_exact() {
        let price = Price::parse("0.10").unwrap();
        let qty = Quantity::new(3).unwrap();
        assert_eq!(price.extend(qty), Decimal::from_str("0.3").unwrap());
    }

    #[test]
    fn test_quantity_rejects_zero() {
        assert!(Quantity::new(0).is_none());
        assert_eq!(Quantity::new(4).unwrap().get(), 4);
    }

    #[test]
    fn test_quantity_checked_add_overflow() {
        let max = Quantity::new(u32::MAX).unwrap();
        assert!(max.checked_add(Quantity::new(1).unwrap()).is_none());
    }

    #[test]
    fn test_price_serialization_roundtrip() {
        let price = Price::parse("13.37").unwrap();
        let json = serde_json::to_string(&price).unwrap();
        let back: Price = serde_json::from_str(&json).unwrap();
        assert_eq!(price, back);
    }
}
