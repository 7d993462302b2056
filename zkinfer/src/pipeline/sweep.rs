//! Depth sweeps: independent pipeline runs over one topology at several depths.
//!
//! Runs execute in parallel on the rayon pool. They share the pipeline's
//! reference-string cache and artifact store, nothing else.

use std::fmt;

use rayon::prelude::*;
use tracing::info;

use crate::compiler::graph::ModelDescriptor;
use crate::witness::InputData;

use super::runner::Pipeline;
use super::types::{PipelineError, RunReport};

/// Result of one depth in a sweep.
#[derive(Debug)]
pub struct SweepPoint {
    pub depth: usize,
    pub result: Result<RunReport, PipelineError>,
}

/// All points of a sweep, in the order the depths were given.
#[derive(Debug)]
pub struct SweepReport {
    pub points: Vec<SweepPoint>,
}

impl SweepReport {
    pub fn succeeded(&self) -> usize {
        self.points.iter().filter(|p| p.result.is_ok()).count()
    }

    pub fn all_ok(&self) -> bool {
        self.succeeded() == self.points.len()
    }
}

/// Run the pipeline for `build(depth)` at every depth, in parallel.
///
/// Each run's input comes from `input(&descriptor)`.
pub fn depth_sweep<B, I>(pipeline: &Pipeline, depths: &[usize], build: B, input: I) -> SweepReport
where
    B: Fn(usize) -> ModelDescriptor + Sync,
    I: Fn(&ModelDescriptor) -> InputData + Sync,
{
    let t_start = std::time::Instant::now();
    let points: Vec<SweepPoint> = depths
        .par_iter()
        .map(|&depth| {
            let descriptor = build(depth);
            let data = input(&descriptor);
            SweepPoint {
                depth,
                result: pipeline.run(&descriptor, None, &data),
            }
        })
        .collect();
    let report = SweepReport { points };
    info!(
        depths = depths.len(),
        succeeded = report.succeeded(),
        elapsed_ms = t_start.elapsed().as_millis() as u64,
        "depth sweep complete"
    );
    report
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<8} {:<10} {:<8} {:<8} {:<10} {:<10}",
            "Depth", "Rows", "Degree", "SRS", "Time(ms)", "Status"
        )?;
        writeln!(f, "{:-<60}", "")?;
        for point in &self.points {
            match &point.result {
                Ok(r) => writeln!(
                    f,
                    "{:<8} {:<10} {:<8} {:<8} {:<10} {:<10}",
                    point.depth,
                    r.num_rows,
                    r.required_degree,
                    r.srs_degree,
                    r.total_ms(),
                    "ok"
                )?,
                Err(e) => writeln!(
                    f,
                    "{:<8} {:<10} {:<8} {:<8} {:<10} failed at {}: {}",
                    point.depth, "-", "-", "-", "-", e.stage, e.source
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::import::build_mlp;
    use crate::compiler::settings::SettingsConfig;
    use crate::pipeline::config::PipelineConfig;
    use crate::srs::{SrsCache, SrsConfig, SrsManager};
    use std::sync::Arc;

    #[test]
    fn test_sweep_preserves_order() {
        let base = std::env::temp_dir().join(format!("zkinfer-sweep-unit-{}", std::process::id()));
        let config = PipelineConfig {
            artifact_dir: None,
            srs: SrsConfig {
                dir: base.join("srs"),
                ..SrsConfig::default()
            },
            settings: SettingsConfig {
                tolerance: 0.05,
                ..SettingsConfig::default()
            },
            run_setup: false,
        };
        let srs = SrsManager::with_cache(config.srs.clone(), Arc::new(SrsCache::new()));
        let pipeline = Pipeline::with_srs_manager(config, srs);

        let report = depth_sweep(
            &pipeline,
            &[3, 1, 2],
            |d| build_mlp(d, 4, 0.25, 0.0),
            |desc| InputData::new(vec![0.5; desc.input_dim]),
        );
        let depths: Vec<usize> = report.points.iter().map(|p| p.depth).collect();
        assert_eq!(depths, vec![3, 1, 2]);
        assert!(report.all_ok());
        assert!(report.to_string().contains("Depth"));
        std::fs::remove_dir_all(&base).ok();
    }
}
