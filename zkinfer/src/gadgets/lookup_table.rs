//! Precomputed function lookup tables for non-linear operations.
//!
//! A table tabulates one activation over the signed fixed-point domain
//! `[-2^(bits-1), 2^(bits-1))`. Circuits only declare tables; the rows are
//! materialized when key setup commits to them.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::components::activation::ActivationType;
use crate::fields::m31::M31;
use crate::gadgets::quantize::FixedPoint;
use crate::gadgets::range_check::RangeCheckConfig;

/// Tables at or above this log size are built in parallel.
const PARALLEL_THRESHOLD_LOG: u32 = 14;

/// Declaration of an activation lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupTable {
    pub activation: ActivationType,
    /// Signed input bit width; the table has `2^bits` rows.
    pub bits: u32,
    pub fixed_point: FixedPoint,
}

impl LookupTable {
    pub fn new(activation: ActivationType, bits: u32, fixed_point: FixedPoint) -> Self {
        Self {
            activation,
            bits,
            fixed_point,
        }
    }

    pub fn log_size(&self) -> u32 {
        self.bits
    }

    pub fn size(&self) -> usize {
        1usize << self.bits
    }

    pub fn domain(&self) -> RangeCheckConfig {
        RangeCheckConfig::signed(self.bits)
    }

    /// Output for `input`, or `None` when `input` is not a row of the table.
    pub fn lookup(&self, input: i64) -> Option<i64> {
        if !self.domain().contains(input) {
            return None;
        }
        Some(self.activation.eval_fixed(input, self.fixed_point))
    }

    /// Whether `(input, output)` is a row of the table.
    pub fn contains(&self, input: M31, output: M31) -> bool {
        self.lookup(input.to_signed())
            .map(|expected| M31::from_i64(expected) == output)
            .unwrap_or(false)
    }

    /// Materialize all rows as (input, output) field pairs, in domain order.
    pub fn rows(&self) -> Vec<(M31, M31)> {
        let min = self.domain().min;
        let row = |i: usize| {
            let x = min + i as i64;
            let y = self.activation.eval_fixed(x, self.fixed_point);
            (M31::from_i64(x), M31::from_i64(y))
        };
        if self.bits >= PARALLEL_THRESHOLD_LOG {
            (0..self.size()).into_par_iter().map(row).collect()
        } else {
            (0..self.size()).map(row).collect()
        }
    }
}
