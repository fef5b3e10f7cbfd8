//! Credit amounts
//!
//! Credits are whole units held in a `u128`. On the wire they travel as a
//! decimal string so no consumer ever routes them through a float.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Credits(u128);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid credit amount '{input}': {reason}")]
pub struct CreditsParseError {
    pub input: String,
    pub reason: String,
}

impl Credits {
    pub const ZERO: Credits = Credits(0);
    pub const MAX: Credits = Credits(u128::MAX);

    pub const fn new(value: u128) -> Self {
        Credits(value)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_mul(self, factor: u128) -> Option<Credits> {
        self.0.checked_mul(factor).map(Credits)
    }

    pub fn saturating_add(self, other: Credits) -> Credits {
        Credits(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Credits) -> Credits {
        Credits(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for Credits {
    fn from(value: u64) -> Self {
        Credits(u128::from(value))
    }
}

impl From<u128> for Credits {
    fn from(value: u128) -> Self {
        Credits(value)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Credits {
    type Err = CreditsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let fail = |reason: &str| CreditsParseError {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        if trimmed.is_empty() {
            return Err(fail("empty"));
        }
        if trimmed.starts_with('-') {
            return Err(fail("negative"));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("not a whole number"));
        }
        trimmed
            .parse::<u128>()
            .map(Credits)
            .map_err(|e| fail(&e.to_string()))
    }
}

impl Serialize for Credits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Credits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CreditsVisitor)
    }
}

struct CreditsVisitor;

impl<'de> Visitor<'de> for CreditsVisitor {
    type Value = Credits;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative whole number, preferably as a decimal string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Credits, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Credits, E> {
        Ok(Credits::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Credits, E> {
        Ok(Credits(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Credits, E> {
        u64::try_from(v)
            .map(Credits::from)
            .map_err(|_| E::custom(format!("negative credit amount {}", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Credits, E> {
        Err(E::custom(format!(
            "credit amount {} must be a whole number or decimal string",
            v
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_decimal_string() {
        let credits = Credits::new(123_456_789_012_345_678_901_234);
        let json = serde_json::to_string(&credits).unwrap();
        assert_eq!(json, "\"123456789012345678901234\"");
        let back: Credits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, credits);
    }

    #[test]
    fn test_accepts_integers_rejects_floats() {
        let c: Credits = serde_json::from_str("250").unwrap();
        assert_eq!(c.get(), 250);
        assert!(serde_json::from_str::<Credits>("2.5").is_err());
        assert!(serde_json::from_str::<Credits>("-4").is_err());
        assert!(serde_json::from_str::<Credits>("\"1e9\"").is_err());
    }

    #[test]
    fn test_parse_errors_name_the_input() {
        let err = "-10".parse::<Credits>().unwrap_err();
        assert_eq!(err.to_string(), "invalid credit amount '-10': negative");
        assert!("".parse::<Credits>().is_err());
        assert_eq!(" 42 ".parse::<Credits>().unwrap(), Credits::new(42));
    }

    #[test]
    fn test_saturating_arithmetic() {
        assert_eq!(Credits::new(5).saturating_sub(Credits::new(9)), Credits::ZERO);
        assert_eq!(Credits::MAX.saturating_add(Credits::new(1)), Credits::MAX);
        assert_eq!(Credits::MAX.checked_add(Credits::new(1)), None);
    }
}
