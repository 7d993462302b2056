//! Lookup-based activation functions.
//!
//! Non-linear activations are not arithmetized directly. The compiler
//! declares a lookup table of `2^lookup_bit_width` (input, output) rows and
//! every activation output is constrained to be a row of that table.

use serde::{Deserialize, Serialize};

use crate::compiler::graph::OpKind;
use crate::gadgets::quantize::FixedPoint;

/// Activation function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    #[serde(alias = "ReLU")]
    Relu,
    Sigmoid,
    /// Passthrough. Compiles to no constraints at all.
    Identity,
}

impl ActivationType {
    pub fn op_kind(&self) -> OpKind {
        match self {
            ActivationType::Relu => OpKind::Relu,
            ActivationType::Sigmoid => OpKind::Sigmoid,
            ActivationType::Identity => OpKind::Identity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActivationType::Relu => "relu",
            ActivationType::Sigmoid => "sigmoid",
            ActivationType::Identity => "identity",
        }
    }

    /// Tag used to separate tables of different functions in key commitments.
    pub fn type_tag(&self) -> u32 {
        match self {
            ActivationType::Relu => 1,
            ActivationType::Sigmoid => 2,
            ActivationType::Identity => 3,
        }
    }

    /// Whether the fixed-point table reproduces the real function exactly.
    pub fn is_exact(&self) -> bool {
        matches!(self, ActivationType::Relu | ActivationType::Identity)
    }

    /// Whether the compiler must emit a lookup for this activation.
    pub fn needs_table(&self) -> bool {
        !matches!(self, ActivationType::Identity)
    }

    /// Lipschitz constant, used to propagate quantization error.
    pub fn lipschitz(&self) -> f64 {
        match self {
            ActivationType::Relu | ActivationType::Identity => 1.0,
            ActivationType::Sigmoid => 0.25,
        }
    }

    /// Reference floating-point evaluation.
    pub fn eval_f64(&self, x: f64) -> f64 {
        match self {
            ActivationType::Relu => x.max(0.0),
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::Identity => x,
        }
    }

    /// Evaluation over fixed-point integers at the given scale.
    ///
    /// This is the function the lookup table tabulates; witness generation
    /// and key setup both go through it so they cannot disagree.
    pub fn eval_fixed(&self, x: i64, fp: FixedPoint) -> i64 {
        match self {
            ActivationType::Relu => x.max(0),
            ActivationType::Identity => x,
            ActivationType::Sigmoid => fp.quantize(self.eval_f64(fp.dequantize(x))),
        }
    }

    /// Image of the interval `[lo, hi]`. All supported functions are monotone.
    pub fn output_bounds(&self, lo: f64, hi: f64) -> (f64, f64) {
        (self.eval_f64(lo), self.eval_f64(hi))
    }
}

impl std::fmt::Display for ActivationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
