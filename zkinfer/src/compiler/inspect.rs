//! Circuit inspection and summarization.
//!
//! Per-layer breakdown of a compiled circuit: gate counts, rows and wires,
//! plus table sizes and the reference-string degree the circuit needs.

use std::fmt;

use crate::compiler::circuit::{CompiledCircuit, Gate};
use crate::compiler::graph::OpKind;

/// Summary of a single layer.
#[derive(Debug, Clone)]
pub struct LayerSummary {
    pub index: usize,
    pub op: OpKind,
    pub in_dim: usize,
    pub out_dim: usize,
    pub gates: usize,
    pub rows: usize,
}

/// Summary of an entire compiled circuit.
#[derive(Debug, Clone)]
pub struct CircuitSummary {
    pub name: String,
    pub hash: String,
    pub scale: u32,
    pub lookup_bit_width: u32,
    pub layers: Vec<LayerSummary>,
    pub num_wires: usize,
    pub num_rows: usize,
    pub required_degree: u32,
    pub num_affine: usize,
    pub num_rescale: usize,
    pub num_range: usize,
    pub num_lookup: usize,
    /// Rows across all declared lookup tables.
    pub table_rows: usize,
    /// Fixed cells committed by key setup.
    pub fixed_cells: usize,
}

impl fmt::Display for CircuitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Circuit: {} ({})", self.name, self.hash)?;
        writeln!(
            f,
            "Scale: {}  Lookup bits: {}  Degree: {}",
            self.scale, self.lookup_bit_width, self.required_degree
        )?;
        writeln!(f, "{:-<60}", "")?;
        writeln!(
            f,
            "{:<6} {:<10} {:<12} {:<10} {:<10}",
            "Layer", "Op", "Shape", "Gates", "Rows"
        )?;
        writeln!(f, "{:-<60}", "")?;

        for layer in &self.layers {
            let shape = format!("{}->{}", layer.in_dim, layer.out_dim);
            writeln!(
                f,
                "{:<6} {:<10} {:<12} {:<10} {:<10}",
                layer.index,
                layer.op.to_string(),
                shape,
                layer.gates,
                layer.rows
            )?;
        }

        writeln!(f, "{:-<60}", "")?;
        writeln!(
            f,
            "Gates: {} affine, {} rescale, {} range, {} lookup",
            self.num_affine, self.num_rescale, self.num_range, self.num_lookup
        )?;
        writeln!(f, "Wires: {}", self.num_wires)?;
        writeln!(f, "Rows:  {}", self.num_rows)?;
        writeln!(f, "Table rows: {}", self.table_rows)?;
        writeln!(f, "Fixed cells: {}", self.fixed_cells)?;

        Ok(())
    }
}

pub fn summarize_circuit(circuit: &CompiledCircuit) -> CircuitSummary {
    let (mut num_affine, mut num_rescale, mut num_range, mut num_lookup) = (0, 0, 0, 0);
    let mut fixed_cells = 0usize;
    for gate in &circuit.gates {
        match gate {
            Gate::Affine { .. } => num_affine += 1,
            Gate::Rescale { .. } => num_rescale += 1,
            Gate::Range { .. } => num_range += 1,
            Gate::Lookup { .. } => num_lookup += 1,
        }
        fixed_cells += gate.fixed_cells().len();
    }

    let layers = circuit
        .layers
        .iter()
        .enumerate()
        .map(|(index, l)| LayerSummary {
            index,
            op: l.op,
            in_dim: l.in_dim,
            out_dim: l.out_dim,
            gates: l.gates,
            rows: l.rows,
        })
        .collect();

    CircuitSummary {
        name: circuit.name.clone(),
        hash: circuit.hash().short(),
        scale: circuit.scale,
        lookup_bit_width: circuit.lookup_bit_width,
        layers,
        num_wires: circuit.num_wires,
        num_rows: circuit.num_rows,
        required_degree: circuit.required_degree,
        num_affine,
        num_rescale,
        num_range,
        num_lookup,
        table_rows: circuit.tables.iter().map(|t| t.size()).sum(),
        fixed_cells,
    }
}
