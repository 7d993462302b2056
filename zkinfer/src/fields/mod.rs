//! Finite-field arithmetic used by compiled circuits and witnesses.

pub mod m31;
