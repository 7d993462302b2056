//! Range check gadgets for bounding fixed-point values.
//!
//! A range constraint is a lookup into the implicit table `[min, max]`; its
//! size counts toward the circuit's required degree exactly like an
//! activation table.

use serde::{Deserialize, Serialize};

use crate::fields::m31::M31;

/// Range check configuration over signed integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeCheckConfig {
    pub min: i64,
    pub max: i64,
    pub log_size: u32,
}

impl RangeCheckConfig {
    /// Two's-complement style range `[-2^(bits-1), 2^(bits-1))`.
    pub fn signed(bits: u32) -> Self {
        let half = 1i64 << bits.saturating_sub(1);
        Self {
            min: -half,
            max: half - 1,
            log_size: bits,
        }
    }

    /// `[0, 2^bits)`.
    pub fn unsigned(bits: u32) -> Self {
        Self {
            min: 0,
            max: (1i64 << bits) - 1,
            log_size: bits,
        }
    }

    pub fn range_size(&self) -> u64 {
        (self.max - self.min + 1) as u64
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Whether a field element, read as signed, lies in range.
    pub fn contains_field(&self, value: M31) -> bool {
        self.contains(value.to_signed())
    }
}

/// Indices of the values that fall outside the range.
pub fn check_range(values: &[M31], config: &RangeCheckConfig) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !config.contains_field(**v))
        .map(|(i, _)| i)
        .collect()
}

/// Signed bit width needed to hold every integer of magnitude `<= max_abs`.
pub fn signed_bits_for(max_abs: u64) -> u32 {
    // Need 2^(bits-1) > max_abs.
    let magnitude_bits = 64 - max_abs.leading_zeros();
    magnitude_bits + 1
}
