//! Q16.16 fixed-point weights.
//!
//! Weights are non-negative 16.16 fixed-point integers internally; 1.0 is
//! encoded as `0x10000`. Conversions from floating point happen only at the
//! external boundary (crate::types deserialization).

use serde::{Deserialize, Serialize};
use std::fmt;

/// `1.0` in 16.16 fixed point.
pub const ONE: u32 = 0x1_0000;

/// A non-negative Q16.16 fixed-point weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct Weight(u32);

impl Weight {
    pub const ZERO: Weight = Weight(0);
    pub const ONE: Weight = Weight(ONE);

    /// Construct from a raw Q16.16 value.
    pub const fn from_raw(raw: u32) -> Self {
        Weight(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / ONE as f64
    }

    /// Convert a non-negative float to Q16.16, rounding half to even.
    ///
    /// `f64::round_ties_even` is not assumed available, so the tie-break is
    /// implemented by hand.
    pub fn from_f64(value: f64) -> Self {
        debug_assert!(value.is_finite() && value >= 0.0, "weight must be non-negative and finite");
        let scaled = value * ONE as f64;
        Weight(round_half_to_even(scaled) as u32)
    }

    pub fn checked_add(self, other: Weight) -> Option<Weight> {
        self.0.checked_add(other.0).map(Weight)
    }

    pub fn checked_sub(self, other: Weight) -> Option<Weight> {
        self.0.checked_sub(other.0).map(Weight)
    }

    /// Multiply by a `[0, 1]` ephemeral weight override.
    pub fn scale(self, factor: f64) -> Weight {
        Weight(round_half_to_even(self.0 as f64 * factor) as u64 as u32)
    }
}

fn round_half_to_even(x: f64) -> i64 {
    let floor = x.floor();
    let diff = x - floor;
    let floor_i = floor as i64;
    if diff < 0.5 {
        floor_i
    } else if diff > 0.5 {
        floor_i + 1
    } else if floor_i % 2 == 0 {
        floor_i
    } else {
        floor_i + 1
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5}", self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Weight {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() || value < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "weight must be a non-negative finite number, got {value}"
            )));
        }
        Ok(Weight::from_f64(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_round_trips() {
        assert_eq!(Weight::from_f64(1.0).raw(), ONE);
        assert_eq!(Weight::from_raw(ONE).as_f64(), 1.0);
    }

    #[test]
    fn round_half_to_even_ties() {
        // 0.5 ties toward the even integer.
        assert_eq!(round_half_to_even(0.5), 0);
        assert_eq!(round_half_to_even(1.5), 2);
        assert_eq!(round_half_to_even(2.5), 2);
        assert_eq!(round_half_to_even(-0.5), 0);
    }

    #[test]
    fn scale_zero_forbids_selection() {
        let w = Weight::from_f64(2.0);
        assert!(w.scale(0.0).is_zero());
    }
}
