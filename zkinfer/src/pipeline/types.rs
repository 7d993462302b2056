//! Pipeline types: stages, errors and run reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::CacheError;
use crate::compiler::circuit::CompileError;
use crate::compiler::settings::{Settings, SettingsError};
use crate::hash::ContentHash;
use crate::keys::SetupError;
use crate::srs::SrsError;
use crate::witness::WitnessError;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Settings,
    Compile,
    ReferenceString,
    Witness,
    Setup,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Settings,
        Stage::Compile,
        Stage::ReferenceString,
        Stage::Witness,
        Stage::Setup,
    ];

    /// The artifact this stage produces.
    pub fn artifact(&self) -> &'static str {
        match self {
            Stage::Settings => "settings",
            Stage::Compile => "compiled circuit",
            Stage::ReferenceString => "reference string",
            Stage::Witness => "witness",
            Stage::Setup => "proving/verifying keys",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Settings => "settings",
            Stage::Compile => "compile",
            Stage::ReferenceString => "srs",
            Stage::Witness => "witness",
            Stage::Setup => "setup",
        };
        f.write_str(s)
    }
}

/// The failure behind a [`PipelineError`].
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Srs(#[from] SrsError),
    #[error(transparent)]
    Witness(#[from] WitnessError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A halted run: which stage failed and which artifact is missing.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed, {missing} not produced: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    pub missing: &'static str,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            missing: stage.artifact(),
            source: source.into(),
        }
    }

    /// Advisory bit width for regenerating settings. Never applied automatically.
    pub fn retry_hint(&self) -> Option<u32> {
        match &self.source {
            StageError::Settings(e) => e.required_bits(),
            StageError::Witness(e) => e.required_bits(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.source,
            StageError::Compile(CompileError::Cancelled) | StageError::Setup(SetupError::Cancelled)
        )
    }
}

/// Timing and cache outcome of one completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub elapsed_ms: u64,
    pub cached: bool,
}

/// Outcome of a full pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub model: String,
    pub descriptor_hash: ContentHash,
    pub settings: Settings,
    pub circuit_hash: ContentHash,
    pub num_rows: usize,
    pub required_degree: u32,
    pub srs_degree: u32,
    pub witness_hash: ContentHash,
    pub outputs: Vec<f64>,
    pub vk_digest: Option<ContentHash>,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn total_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.elapsed_ms).sum()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model: {} ({})", self.model, self.descriptor_hash.short())?;
        writeln!(
            f,
            "Scale: {}  Lookup bits: {}  Calibrated: {}  Error bound: {:.3e}",
            self.settings.scale,
            self.settings.lookup_bit_width,
            self.settings.calibrated,
            self.settings.estimated_error
        )?;
        writeln!(
            f,
            "Circuit: {}  rows: {}  degree: {}  srs: {}",
            self.circuit_hash.short(),
            self.num_rows,
            self.required_degree,
            self.srs_degree
        )?;
        writeln!(f, "{:-<40}", "")?;
        for s in &self.stages {
            writeln!(
                f,
                "{:<10} {:>8} ms  {}",
                s.stage.to_string(),
                s.elapsed_ms,
                if s.cached { "cached" } else { "" }
            )?;
        }
        writeln!(f, "{:-<40}", "")?;
        writeln!(f, "Total: {} ms", self.total_ms())?;
        writeln!(f, "Outputs: {:?}", self.outputs)?;
        if let Some(vk) = &self.vk_digest {
            writeln!(f, "Verifying key: {}", vk.short())?;
        }
        Ok(())
    }
}
