//! # zkinfer: proving artifacts for feed-forward network inference
//!
//! Turns a trained, fixed-topology feed-forward network into everything a
//! zero-knowledge prover needs to show correct inference on private input.
//!
//! ```text
//! ModelDescriptor ─► Settings ─► CompiledCircuit ─► ReferenceString ─► Witness ─► Keys
//!  compiler::graph   ::settings   ::circuit          srs                witness     keys
//! ```
//!
//! Every artifact is immutable and content-addressed; changing anything
//! upstream changes every downstream hash. [`pipeline::runner::Pipeline`] runs the
//! stages in order, optionally backed by the on-disk [`cache::ArtifactStore`].
//!
//! ## Feature Flags
//!
//! - `cli` (default): the `zkinfer` binary (clap + tracing-subscriber).

pub mod cache;
pub mod cancel;
pub mod compiler;
pub mod components;
pub mod fields;
pub mod gadgets;
pub mod hash;
pub mod keys;
pub mod pipeline;
pub mod srs;
pub mod witness;

/// Commonly used types.
pub mod prelude {
    pub use crate::fields::m31::M31;
    pub use crate::hash::ContentHash;

    pub use crate::cache::{ArtifactKind, ArtifactStore};
    pub use crate::cancel::CancellationToken;
    pub use crate::compiler::circuit::{compile, CompiledCircuit, Gate};
    pub use crate::compiler::graph::{DescriptorBuilder, LayerKind, ModelDescriptor, OpKind};
    pub use crate::compiler::import::{build_mlp, load_model_json};
    pub use crate::compiler::settings::{
        generate_settings, CalibrationData, Settings, SettingsConfig,
    };
    pub use crate::components::activation::ActivationType;
    pub use crate::keys::{prove, setup, verify, Proof, ProvingKey, VerifyingKey};
    pub use crate::pipeline::config::PipelineConfig;
    pub use crate::pipeline::runner::Pipeline;
    pub use crate::pipeline::types::{PipelineError, RunReport, Stage};
    pub use crate::srs::{global_srs_cache, ReferenceString, SrsConfig, SrsManager};
    pub use crate::witness::{generate_witness, InputData, Witness};
}
