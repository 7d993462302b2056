//! Per-layer circuit components.

pub mod activation;
