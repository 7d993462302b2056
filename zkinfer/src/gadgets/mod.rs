//! Reusable constraint gadgets.
//!
//! These are lower-level building blocks used by the compiler and the
//! witness generator.

pub mod lookup_table;
pub mod quantize;
pub mod range_check;
