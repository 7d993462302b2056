//! Model → circuit compiler.
//!
//! # Compilation Pipeline
//!
//! ```text
//! model JSON / build_mlp (import.rs)
//!     │
//!     ▼
//! ModelDescriptor (graph.rs)
//!     │  layers, shapes, trained parameters
//!     ▼
//! Settings (settings.rs)
//!     │  scale, lookup bit width, op-support table
//!     ▼
//! CompiledCircuit (circuit.rs)
//!     │  affine / rescale / range / lookup gates, table declarations
//!     ▼
//! Summary (inspect.rs)
//! ```

pub mod circuit;
pub mod graph;
pub mod import;
pub mod inspect;
pub mod settings;
