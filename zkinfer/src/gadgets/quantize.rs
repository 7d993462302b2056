//! Fixed-point quantization for mapping real-valued tensors into the field.
//!
//! ```text
//! real x  →  q = round(x · 2^scale)  →  M31::from_i64(q)
//!
//! product of two scale-s values has scale 2s; rescaling divides by 2^s
//! with round-half-up:  acc + 2^(s-1) = out · 2^s + rem,  0 ≤ rem < 2^s
//! ```

use serde::{Deserialize, Serialize};

/// A power-of-two fixed-point format with `scale` fractional bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedPoint {
    pub scale: u32,
}

impl FixedPoint {
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    /// `2^scale` as a float.
    pub fn multiplier(&self) -> f64 {
        (1u64 << self.scale) as f64
    }

    pub fn quantize(&self, value: f64) -> i64 {
        (value * self.multiplier()).round() as i64
    }

    pub fn dequantize(&self, q: i64) -> f64 {
        q as f64 / self.multiplier()
    }

    /// Worst-case absolute rounding error of a single quantization.
    pub fn resolution(&self) -> f64 {
        0.5 / self.multiplier()
    }

    /// Divide a scale-`2s` accumulator back to scale `s`.
    ///
    /// Returns `(out, rem)` with `acc + 2^(s-1) = out · 2^s + rem`.
    pub fn rescale(&self, acc: i64) -> (i64, i64) {
        rescale_rounding(acc, self.scale)
    }
}

/// Round-half-up division by `2^shift`, returning quotient and remainder.
pub fn rescale_rounding(acc: i64, shift: u32) -> (i64, i64) {
    if shift == 0 {
        return (acc, 0);
    }
    let divisor = 1i64 << shift;
    let biased = acc + (divisor >> 1);
    (biased.div_euclid(divisor), biased.rem_euclid(divisor))
}

/// Quantize a flat tensor.
pub fn quantize_tensor(data: &[f64], fp: FixedPoint) -> Vec<i64> {
    data.iter().map(|&v| fp.quantize(v)).collect()
}

/// Dequantize a flat tensor.
pub fn dequantize_tensor(data: &[i64], fp: FixedPoint) -> Vec<f64> {
    data.iter().map(|&q| fp.dequantize(q)).collect()
}
