//! Pipeline orchestration: runs the stages in order with content-hash caching.
//!
//! ```text
//! Descriptor ─► Settings ─► Compiled ─► ReferenceString ─► Witness ─► [Keys]
//! ```
//!
//! A failure halts the run at that stage and names the artifact that could
//! not be produced. Nothing from a failed stage is published.

pub mod config;
pub mod runner;
pub mod sweep;
pub mod types;
