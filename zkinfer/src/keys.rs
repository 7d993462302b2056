//! Key setup and the binding proof.
//!
//! Setup commits to a circuit's fixed data under a reference string:
//!
//! ```text
//! fixed cells (serialized gates) ─► columns of 2^k ─► Σ col[i]·τ^i   fixed commitments
//! lookup tables (inputs, outputs) ─────────────────► Σ col[i]·τ^i   table commitments
//! ```
//!
//! The verifying key is those commitments plus the circuit and reference
//! string identities, summarized by a digest. The proving key embeds the
//! verifying key, the fixed cells and the reference string.
//!
//! The proof here is a binding transcript, not a succinct argument: it ties
//! a witness commitment and the public outputs to one verifying key digest.
//! It shows which keys pair with each other; it says nothing about whether
//! the witness satisfies the circuit.

use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::cancel::CancellationToken;
use crate::compiler::circuit::CompiledCircuit;
use crate::components::activation::ActivationType;
use crate::fields::m31::M31;
use crate::hash::{ContentHash, ContentHasher};
use crate::srs::ReferenceString;
use crate::witness::Witness;

/// Commitment to one declared lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCommitment {
    pub activation: ActivationType,
    pub bits: u32,
    pub inputs: Vec<M31>,
    pub outputs: Vec<M31>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyingKey {
    pub circuit_hash: ContentHash,
    pub srs_degree: u32,
    pub srs_digest: ContentHash,
    pub fixed_commitments: Vec<M31>,
    pub table_commitments: Vec<TableCommitment>,
    pub num_wires: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub digest: ContentHash,
}

fn field_bytes(values: &[M31]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl VerifyingKey {
    /// Digest over every field except `digest` itself.
    pub fn compute_digest(&self) -> ContentHash {
        let mut h = ContentHasher::new("zkinfer/vk/v1")
            .hash(&self.circuit_hash)
            .u64(self.srs_degree as u64)
            .hash(&self.srs_digest)
            .bytes(&field_bytes(&self.fixed_commitments))
            .u64(self.num_wires as u64)
            .u64(self.num_inputs as u64)
            .u64(self.num_outputs as u64);
        for t in &self.table_commitments {
            h = h
                .u64(t.activation.type_tag() as u64)
                .u64(t.bits as u64)
                .bytes(&field_bytes(&t.inputs))
                .bytes(&field_bytes(&t.outputs));
        }
        h.finish()
    }

    /// Witness columns a proof against this key commits to.
    pub fn witness_columns(&self) -> usize {
        self.num_wires.div_ceil(1usize << self.srs_degree)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvingKey {
    pub vk: VerifyingKey,
    pub fixed_cells: Vec<M31>,
    pub srs: ReferenceString,
}

/// Binding transcript produced by [`prove`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub vk_digest: ContentHash,
    pub circuit_hash: ContentHash,
    pub witness_commitments: Vec<M31>,
    pub public_outputs: Vec<M31>,
    pub binding: ContentHash,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("circuit needs degree {required}, reference string has {available}")]
    DegreeExceeded { required: u32, available: u32 },
    #[error("key setup cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("built for circuit {expected}, got {actual}")]
    CircuitMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("expected {expected} {what}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("proof and key do not pair")]
    KeyMismatch,
    #[error("binding tag does not match")]
    InvalidBinding,
}

fn binding_tag(vk_digest: &ContentHash, commitments: &[M31], outputs: &[M31]) -> ContentHash {
    ContentHasher::new("zkinfer/proof/v1")
        .hash(vk_digest)
        .bytes(&field_bytes(commitments))
        .bytes(&field_bytes(outputs))
        .finish()
}

/// Derive the proving and verifying keys of `circuit` under `srs`.
pub fn setup(
    circuit: &CompiledCircuit,
    srs: &ReferenceString,
    cancel: &CancellationToken,
) -> Result<(ProvingKey, VerifyingKey), SetupError> {
    let _span = info_span!("setup", circuit = %circuit.name, degree = srs.degree()).entered();
    let t_start = std::time::Instant::now();

    if circuit.required_degree > srs.degree() {
        return Err(SetupError::DegreeExceeded {
            required: circuit.required_degree,
            available: srs.degree(),
        });
    }

    let fixed_cells = circuit.fixed_cells();
    let mut fixed_commitments = Vec::new();
    for column in fixed_cells.chunks(srs.size()) {
        cancel.check().map_err(|_| SetupError::Cancelled)?;
        fixed_commitments.extend(srs.commit_columns(column));
    }

    let mut table_commitments = Vec::with_capacity(circuit.tables.len());
    for table in &circuit.tables {
        cancel.check().map_err(|_| SetupError::Cancelled)?;
        let (inputs, outputs): (Vec<M31>, Vec<M31>) = table.rows().into_iter().unzip();
        table_commitments.push(TableCommitment {
            activation: table.activation,
            bits: table.bits,
            inputs: srs.commit_columns(&inputs),
            outputs: srs.commit_columns(&outputs),
        });
    }
    cancel.check().map_err(|_| SetupError::Cancelled)?;

    let mut vk = VerifyingKey {
        circuit_hash: circuit.hash(),
        srs_degree: srs.degree(),
        srs_digest: srs.digest(),
        fixed_commitments,
        table_commitments,
        num_wires: circuit.num_wires,
        num_inputs: circuit.num_inputs(),
        num_outputs: circuit.num_outputs(),
        digest: ContentHash::ZERO,
    };
    vk.digest = vk.compute_digest();

    let pk = ProvingKey {
        vk: vk.clone(),
        fixed_cells,
        srs: srs.clone(),
    };

    info!(
        vk = %vk.digest.short(),
        fixed = pk.fixed_cells.len(),
        tables = vk.table_commitments.len(),
        elapsed_ms = t_start.elapsed().as_millis() as u64,
        "key setup complete"
    );
    Ok((pk, vk))
}

/// Bind `witness` to the verifying key inside `pk`.
pub fn prove(pk: &ProvingKey, witness: &Witness) -> Result<Proof, ProofError> {
    let vk = &pk.vk;
    if witness.circuit_hash != vk.circuit_hash {
        return Err(ProofError::CircuitMismatch {
            expected: vk.circuit_hash,
            actual: witness.circuit_hash,
        });
    }
    if witness.wires.len() != vk.num_wires {
        return Err(ProofError::ShapeMismatch {
            what: "wires",
            expected: vk.num_wires,
            actual: witness.wires.len(),
        });
    }
    if witness.public_outputs.len() != vk.num_outputs {
        return Err(ProofError::ShapeMismatch {
            what: "public outputs",
            expected: vk.num_outputs,
            actual: witness.public_outputs.len(),
        });
    }
    if pk.srs.digest() != vk.srs_digest
        || pk.srs.commit_columns(&pk.fixed_cells) != vk.fixed_commitments
    {
        return Err(ProofError::KeyMismatch);
    }

    let witness_commitments = pk.srs.commit_columns(&witness.wires);
    let binding = binding_tag(&vk.digest, &witness_commitments, &witness.public_outputs);
    Ok(Proof {
        vk_digest: vk.digest,
        circuit_hash: vk.circuit_hash,
        witness_commitments,
        public_outputs: witness.public_outputs.clone(),
        binding,
    })
}

/// Accept `proof` only if it was bound to exactly this verifying key.
pub fn verify(vk: &VerifyingKey, proof: &Proof) -> Result<(), ProofError> {
    if vk.compute_digest() != vk.digest || proof.vk_digest != vk.digest {
        return Err(ProofError::KeyMismatch);
    }
    if proof.circuit_hash != vk.circuit_hash {
        return Err(ProofError::CircuitMismatch {
            expected: vk.circuit_hash,
            actual: proof.circuit_hash,
        });
    }
    if proof.public_outputs.len() != vk.num_outputs {
        return Err(ProofError::ShapeMismatch {
            what: "public outputs",
            expected: vk.num_outputs,
            actual: proof.public_outputs.len(),
        });
    }
    if proof.witness_commitments.len() != vk.witness_columns() {
        return Err(ProofError::ShapeMismatch {
            what: "witness commitments",
            expected: vk.witness_columns(),
            actual: proof.witness_commitments.len(),
        });
    }
    let expected = binding_tag(&vk.digest, &proof.witness_commitments, &proof.public_outputs);
    if expected != proof.binding {
        return Err(ProofError::InvalidBinding);
    }
    Ok(())
}
