//! Witness generation: the circuit's forward pass over fixed-point integers.
//!
//! Values are computed gate by gate in exactly the order and arithmetic the
//! compiler emitted. Nothing is clamped: a value that leaves its declared
//! range is reported as [`WitnessError::OutOfRange`] with the bit width it
//! would have needed, so a caller can regenerate settings with more room.
//! A dot product that leaves the field's signed range is
//! [`WitnessError::AccumulatorOverflow`]; no lookup width fixes that.

use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::compiler::circuit::{CompiledCircuit, Gate, MAX_LOOKUP_BITS, ONE_WIRE};
use crate::fields::m31::{HALF_P, M31};
use crate::gadgets::quantize::{dequantize_tensor, rescale_rounding, FixedPoint};
use crate::gadgets::range_check::RangeCheckConfig;
use crate::hash::{hash_json, ContentHash};

/// A concrete (private) input vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    pub values: Vec<f64>,
}

impl InputData {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn hash(&self) -> ContentHash {
        hash_json("zkinfer/input/v1", self).unwrap_or(ContentHash::ZERO)
    }
}

/// A full wire assignment for one circuit and one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    pub circuit_hash: ContentHash,
    pub input_hash: ContentHash,
    pub wires: Vec<M31>,
    /// Values on the output wires; these are public.
    pub public_outputs: Vec<M31>,
    /// Outputs decoded back to reals.
    pub outputs: Vec<f64>,
}

impl Witness {
    pub fn hash(&self) -> ContentHash {
        hash_json("zkinfer/witness/v1", self).unwrap_or(ContentHash::ZERO)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WitnessError {
    #[error("input has {actual} values, circuit expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("input value {index} is not finite")]
    NonFiniteInput { index: usize },
    #[error(
        "wire {wire} holds {value}, outside the {bits}-bit signed range (needs {required_bits} bits)"
    )]
    OutOfRange {
        wire: usize,
        value: i64,
        bits: u32,
        required_bits: u32,
    },
    #[error("wire {wire} accumulates {value}, beyond the field's signed range")]
    AccumulatorOverflow { wire: usize, value: i64 },
    #[error("assignment violates gate {gate}")]
    ConstraintViolation { gate: usize },
}

impl WitnessError {
    /// Bit width that would have held the offending value, when a circuit
    /// of that width can be compiled.
    pub fn required_bits(&self) -> Option<u32> {
        match self {
            WitnessError::OutOfRange { required_bits, .. }
                if *required_bits <= MAX_LOOKUP_BITS =>
            {
                Some(*required_bits)
            }
            _ => None,
        }
    }
}

fn required_bits(value: i128) -> u32 {
    (u128::BITS - value.unsigned_abs().leading_zeros()) + 1
}

fn saturate(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// Assign every wire of `circuit` for `input`.
pub fn generate_witness(
    circuit: &CompiledCircuit,
    input: &InputData,
) -> Result<Witness, WitnessError> {
    let _span = info_span!("witness", circuit = %circuit.name).entered();
    let t_start = std::time::Instant::now();

    if input.values.len() != circuit.num_inputs() {
        return Err(WitnessError::ShapeMismatch {
            expected: circuit.num_inputs(),
            actual: input.values.len(),
        });
    }
    if let Some(index) = input.values.iter().position(|v| !v.is_finite()) {
        return Err(WitnessError::NonFiniteInput { index });
    }

    let fp = FixedPoint::new(circuit.scale);
    let mut vals = vec![0i64; circuit.num_wires];
    vals[ONE_WIRE] = 1;
    for (&wire, &x) in circuit.input_wires.iter().zip(&input.values) {
        vals[wire] = fp.quantize(x);
    }

    for gate in &circuit.gates {
        match gate {
            Gate::Affine {
                inputs,
                coeffs,
                constant,
                output,
            } => {
                let acc = inputs
                    .iter()
                    .zip(coeffs)
                    .map(|(i, c)| vals[*i] as i128 * *c as i128)
                    .sum::<i128>()
                    + *constant as i128;
                if acc.unsigned_abs() > HALF_P as u128 {
                    return Err(WitnessError::AccumulatorOverflow {
                        wire: *output,
                        value: saturate(acc),
                    });
                }
                vals[*output] = acc as i64;
            }
            Gate::Rescale {
                input,
                output,
                remainder,
                shift,
            } => {
                let (out, rem) = rescale_rounding(vals[*input], *shift);
                vals[*output] = out;
                vals[*remainder] = rem;
            }
            Gate::Range { wire, bits } => {
                let value = vals[*wire];
                if !RangeCheckConfig::signed(*bits).contains(value) {
                    return Err(WitnessError::OutOfRange {
                        wire: *wire,
                        value,
                        bits: *bits,
                        required_bits: required_bits(value as i128),
                    });
                }
            }
            Gate::Lookup {
                table,
                input,
                output,
            } => {
                let value = vals[*input];
                let table = &circuit.tables[*table];
                match table.lookup(value) {
                    Some(y) => vals[*output] = y,
                    None => {
                        return Err(WitnessError::OutOfRange {
                            wire: *input,
                            value,
                            bits: table.bits,
                            required_bits: required_bits(value as i128),
                        })
                    }
                }
            }
        }
    }

    let wires: Vec<M31> = vals.iter().map(|&v| M31::from_i64(v)).collect();
    circuit
        .check_assignment(&wires)
        .map_err(|failure| WitnessError::ConstraintViolation { gate: failure.gate })?;

    let output_vals: Vec<i64> = circuit.output_wires.iter().map(|&w| vals[w]).collect();
    let witness = Witness {
        circuit_hash: circuit.hash(),
        input_hash: input.hash(),
        public_outputs: circuit.output_wires.iter().map(|&w| wires[w]).collect(),
        outputs: dequantize_tensor(&output_vals, fp),
        wires,
    };

    info!(
        wires = witness.wires.len(),
        elapsed_ms = t_start.elapsed().as_millis() as u64,
        "generated witness"
    );
    Ok(witness)
}
