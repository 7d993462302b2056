//! Circuit compiler: lowers a descriptor under given settings into gates.
//!
//! ```text
//! wire 0            constant one
//! wires 1..=n       private inputs, each range-checked
//!
//! Linear (per output neuron j):
//!   acc_j = Σ_i W_q[j][i] · x_i + b_q[j]          Affine  (scale 2s)
//!   acc_j + 2^(s-1) = y_j · 2^s + r_j             Rescale (0 ≤ r_j < 2^s)
//!   y_j ∈ [-2^(bits-1), 2^(bits-1))               Range
//!
//! Activation (per element):
//!   (x, f(x)) ∈ table[f]                          Lookup
//! ```
//!
//! Identity activations pass wires through untouched.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::cancel::CancellationToken;
use crate::compiler::graph::{DescriptorError, LayerKind, ModelDescriptor, OpKind};
use crate::compiler::settings::Settings;
use crate::fields::m31::{M31, SIGNED_BITS};
use crate::gadgets::lookup_table::LookupTable;
use crate::gadgets::range_check::RangeCheckConfig;
use crate::hash::{hash_json, ContentHash};

/// Wire holding the constant one.
pub const ONE_WIRE: usize = 0;
/// Terms an affine gate packs per row.
pub const GATE_WIDTH: usize = 4;
/// Rows reserved for blinding.
pub const BLINDING_ROWS: usize = 5;
pub const MIN_DEGREE: u32 = 4;
/// Widest lookup domain that still embeds in the signed field range.
pub const MAX_LOOKUP_BITS: u32 = SIGNED_BITS - 1;

/// Whether a rescale by `scale` of a `bits`-wide output has a unique solution:
/// `out·2^scale + rem` must not wrap the field.
pub fn rescale_is_sound(scale: u32, bits: u32) -> bool {
    scale + bits <= MAX_LOOKUP_BITS
}

/// A single constraint over wires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Gate {
    /// `output = Σ coeffs[k] · inputs[k] + constant`.
    Affine {
        inputs: Vec<usize>,
        coeffs: Vec<i64>,
        constant: i64,
        output: usize,
    },
    /// `input + 2^(shift-1) = output · 2^shift + remainder`, remainder in `[0, 2^shift)`.
    Rescale {
        input: usize,
        output: usize,
        remainder: usize,
        shift: u32,
    },
    /// Signed range check.
    Range { wire: usize, bits: u32 },
    /// `(input, output)` is a row of `tables[table]`.
    Lookup {
        table: usize,
        input: usize,
        output: usize,
    },
}

impl Gate {
    pub fn rows(&self) -> usize {
        match self {
            Gate::Affine { inputs, .. } => inputs.len().div_ceil(GATE_WIDTH).max(1),
            Gate::Rescale { .. } | Gate::Range { .. } | Gate::Lookup { .. } => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Gate::Affine { .. } => "affine",
            Gate::Rescale { .. } => "rescale",
            Gate::Range { .. } => "range",
            Gate::Lookup { .. } => "lookup",
        }
    }

    /// Field encoding of the gate's fixed data, as committed by key setup.
    pub fn fixed_cells(&self) -> Vec<M31> {
        let w = |x: usize| M31::from(x as u64);
        match self {
            Gate::Affine {
                inputs,
                coeffs,
                constant,
                output,
            } => {
                let mut cells = Vec::with_capacity(4 + 2 * inputs.len());
                cells.push(M31::from(1u32));
                cells.push(w(inputs.len()));
                for (i, c) in inputs.iter().zip(coeffs) {
                    cells.push(w(*i));
                    cells.push(M31::from_i64(*c));
                }
                cells.push(M31::from_i64(*constant));
                cells.push(w(*output));
                cells
            }
            Gate::Rescale {
                input,
                output,
                remainder,
                shift,
            } => vec![
                M31::from(2u32),
                w(*input),
                w(*output),
                w(*remainder),
                M31::from(*shift),
            ],
            Gate::Range { wire, bits } => vec![M31::from(3u32), w(*wire), M31::from(*bits)],
            Gate::Lookup {
                table,
                input,
                output,
            } => vec![M31::from(4u32), w(*table), w(*input), w(*output)],
        }
    }
}

/// Per-layer footprint, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFootprint {
    pub op: OpKind,
    pub in_dim: usize,
    pub out_dim: usize,
    pub gates: usize,
    pub rows: usize,
}

/// A compiled arithmetic circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledCircuit {
    pub name: String,
    pub descriptor_hash: ContentHash,
    pub settings_hash: ContentHash,
    pub scale: u32,
    pub lookup_bit_width: u32,
    pub num_wires: usize,
    pub input_wires: Vec<usize>,
    pub output_wires: Vec<usize>,
    pub gates: Vec<Gate>,
    pub tables: Vec<LookupTable>,
    pub layers: Vec<LayerFootprint>,
    pub num_rows: usize,
    pub required_degree: u32,
}

/// Index of the first gate an assignment violates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintFailure {
    pub gate: usize,
}

impl CompiledCircuit {
    pub fn wire_count(&self) -> usize {
        self.num_wires
    }

    pub fn num_inputs(&self) -> usize {
        self.input_wires.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.output_wires.len()
    }

    pub fn hash(&self) -> ContentHash {
        hash_json("zkinfer/circuit/v1", self).unwrap_or(ContentHash::ZERO)
    }

    /// Canonical byte encoding. Identical inputs give identical bytes.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// All fixed cells in gate order.
    pub fn fixed_cells(&self) -> Vec<M31> {
        self.gates.iter().flat_map(Gate::fixed_cells).collect()
    }

    /// Check a full assignment against every gate.
    pub fn check_assignment(&self, wires: &[M31]) -> Result<(), ConstraintFailure> {
        if wires.len() != self.num_wires || wires[ONE_WIRE] != M31::from(1u32) {
            return Err(ConstraintFailure { gate: 0 });
        }
        for (idx, gate) in self.gates.iter().enumerate() {
            let ok = match gate {
                Gate::Affine {
                    inputs,
                    coeffs,
                    constant,
                    output,
                } => {
                    let sum: M31 = inputs
                        .iter()
                        .zip(coeffs)
                        .map(|(i, c)| wires[*i] * M31::from_i64(*c))
                        .sum();
                    sum + M31::from_i64(*constant) == wires[*output]
                }
                Gate::Rescale {
                    input,
                    output,
                    remainder,
                    shift,
                } => {
                    let divisor = M31::from(1u64 << shift);
                    let bias = M31::from((1u64 << shift) >> 1);
                    RangeCheckConfig::unsigned(*shift).contains_field(wires[*remainder])
                        && wires[*input] + bias == wires[*output] * divisor + wires[*remainder]
                }
                Gate::Range { wire, bits } => {
                    RangeCheckConfig::signed(*bits).contains_field(wires[*wire])
                }
                Gate::Lookup {
                    table,
                    input,
                    output,
                } => self
                    .tables
                    .get(*table)
                    .is_some_and(|t| t.contains(wires[*input], wires[*output])),
            };
            if !ok {
                return Err(ConstraintFailure { gate: idx });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("incompatible settings: {0}")]
    IncompatibleSettings(String),
    #[error("unsupported op: {0}")]
    UnsupportedOp(OpKind),
    #[error("circuit needs {rows} rows, limit is {max}")]
    RowLimit { rows: usize, max: usize },
    #[error("compilation cancelled")]
    Cancelled,
}

struct CircuitBuilder {
    next_wire: usize,
    gates: Vec<Gate>,
    tables: Vec<LookupTable>,
}

impl CircuitBuilder {
    fn wire(&mut self) -> usize {
        let w = self.next_wire;
        self.next_wire += 1;
        w
    }

    fn table(&mut self, table: LookupTable) -> usize {
        match self.tables.iter().position(|t| *t == table) {
            Some(idx) => idx,
            None => {
                self.tables.push(table);
                self.tables.len() - 1
            }
        }
    }
}

fn ceil_log2(n: usize) -> u32 {
    n.max(1).next_power_of_two().trailing_zeros()
}

/// Lower `descriptor` into a circuit under `settings`.
pub fn compile(
    descriptor: &ModelDescriptor,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<CompiledCircuit, CompileError> {
    let _span = info_span!("compile", model = %descriptor.name).entered();
    let t_start = std::time::Instant::now();

    descriptor.validate()?;
    let descriptor_hash = descriptor.hash();
    if settings.descriptor_hash != descriptor_hash {
        return Err(CompileError::IncompatibleSettings(format!(
            "settings derived from descriptor {}, got {}",
            settings.descriptor_hash.short(),
            descriptor_hash.short()
        )));
    }
    let bits = settings.lookup_bit_width;
    if settings.scale == 0 || settings.scale >= bits {
        return Err(CompileError::IncompatibleSettings(format!(
            "scale {} must be in [1, {bits})",
            settings.scale
        )));
    }
    if bits > MAX_LOOKUP_BITS {
        return Err(CompileError::IncompatibleSettings(format!(
            "lookup bit width {bits} exceeds {MAX_LOOKUP_BITS}"
        )));
    }
    if !rescale_is_sound(settings.scale, bits) {
        return Err(CompileError::IncompatibleSettings(format!(
            "scale {} plus width {bits} wraps the field",
            settings.scale
        )));
    }
    if let Some(op) = descriptor
        .op_kinds()
        .into_iter()
        .find(|op| !settings.supported_ops.contains(op))
    {
        return Err(CompileError::UnsupportedOp(op));
    }

    let fp = settings.fixed_point();
    let mut b = CircuitBuilder {
        next_wire: ONE_WIRE + 1,
        gates: Vec::new(),
        tables: Vec::new(),
    };

    let input_wires: Vec<usize> = (0..descriptor.input_dim).map(|_| b.wire()).collect();
    for &wire in &input_wires {
        b.gates.push(Gate::Range { wire, bits });
    }

    let mut current = input_wires.clone();
    let mut layers = Vec::with_capacity(descriptor.num_layers());

    for layer in &descriptor.layers {
        cancel.check().map_err(|_| CompileError::Cancelled)?;
        let gates_before = b.gates.len();

        match &layer.kind {
            LayerKind::Linear(params) => {
                let (weights, bias) = params.quantize(fp);
                let mut next = Vec::with_capacity(weights.len());
                for (row, constant) in weights.into_iter().zip(bias) {
                    let acc = b.wire();
                    let out = b.wire();
                    let rem = b.wire();
                    b.gates.push(Gate::Affine {
                        inputs: current.clone(),
                        coeffs: row,
                        constant,
                        output: acc,
                    });
                    b.gates.push(Gate::Rescale {
                        input: acc,
                        output: out,
                        remainder: rem,
                        shift: fp.scale,
                    });
                    b.gates.push(Gate::Range { wire: out, bits });
                    next.push(out);
                }
                current = next;
            }
            LayerKind::Activation(act) if act.needs_table() => {
                let table = b.table(LookupTable::new(*act, bits, fp));
                current = current
                    .iter()
                    .map(|&input| {
                        let output = b.wire();
                        b.gates.push(Gate::Lookup {
                            table,
                            input,
                            output,
                        });
                        output
                    })
                    .collect();
            }
            LayerKind::Activation(_) => {}
        }

        let new_gates = &b.gates[gates_before..];
        layers.push(LayerFootprint {
            op: layer.op_kind(),
            in_dim: layer.in_dim,
            out_dim: layer.output_dim(),
            gates: new_gates.len(),
            rows: new_gates.iter().map(Gate::rows).sum(),
        });
    }

    let output_wires = current;
    let gate_rows: usize = b.gates.iter().map(Gate::rows).sum();
    let num_rows = input_wires.len() + output_wires.len() + gate_rows;
    if num_rows > settings.max_rows {
        return Err(CompileError::RowLimit {
            rows: num_rows,
            max: settings.max_rows,
        });
    }

    // Every circuit range-checks its inputs, so the bit-width table always exists.
    let required_degree = ceil_log2(num_rows + BLINDING_ROWS)
        .max(bits)
        .max(MIN_DEGREE);

    let circuit = CompiledCircuit {
        name: descriptor.name.clone(),
        descriptor_hash,
        settings_hash: settings.hash(),
        scale: fp.scale,
        lookup_bit_width: bits,
        num_wires: b.next_wire,
        input_wires,
        output_wires,
        gates: b.gates,
        tables: b.tables,
        layers,
        num_rows,
        required_degree,
    };

    debug!(gates = circuit.gates.len(), tables = circuit.tables.len(), "lowered");
    info!(
        wires = circuit.num_wires,
        rows = circuit.num_rows,
        degree = circuit.required_degree,
        elapsed_ms = t_start.elapsed().as_millis() as u64,
        "compiled circuit"
    );
    Ok(circuit)
}
