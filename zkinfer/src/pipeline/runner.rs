//! Pipeline runner: executes stages in order against an optional artifact store.
//!
//! Cache keys chain the upstream identities, so any change upstream lands on
//! a fresh key downstream:
//!
//! ```text
//! settings  H(descriptor, calibration, settings config)
//! circuit   H(descriptor, settings)
//! witness   H(circuit, input)
//! keys      H(circuit, reference string)
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::cache::{ArtifactKind, ArtifactStore};
use crate::cancel::CancellationToken;
use crate::compiler::circuit::{compile, CompiledCircuit};
use crate::compiler::graph::ModelDescriptor;
use crate::compiler::settings::{generate_settings, CalibrationData, Settings};
use crate::hash::{hash_json, ContentHash, ContentHasher};
use crate::keys::{setup, ProvingKey, VerifyingKey};
use crate::srs::{ReferenceString, SrsManager};
use crate::witness::{generate_witness, InputData, Witness};

use super::config::PipelineConfig;
use super::types::{PipelineError, RunReport, Stage, StageError, StageReport};

pub fn settings_key(
    descriptor_hash: &ContentHash,
    calibration_hash: &ContentHash,
    config_hash: &ContentHash,
) -> ContentHash {
    ContentHasher::new("zkinfer/key/settings")
        .hash(descriptor_hash)
        .hash(calibration_hash)
        .hash(config_hash)
        .finish()
}

pub fn circuit_key(descriptor_hash: &ContentHash, settings_hash: &ContentHash) -> ContentHash {
    ContentHasher::new("zkinfer/key/circuit")
        .hash(descriptor_hash)
        .hash(settings_hash)
        .finish()
}

pub fn witness_key(circuit_hash: &ContentHash, input_hash: &ContentHash) -> ContentHash {
    ContentHasher::new("zkinfer/key/witness")
        .hash(circuit_hash)
        .hash(input_hash)
        .finish()
}

pub fn keys_key(circuit_hash: &ContentHash, srs_digest: &ContentHash) -> ContentHash {
    ContentHasher::new("zkinfer/key/keys")
        .hash(circuit_hash)
        .hash(srs_digest)
        .finish()
}

/// Runs pipeline stages with shared configuration, cache and cancellation.
pub struct Pipeline {
    config: PipelineConfig,
    store: Option<ArtifactStore>,
    srs: SrsManager,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Pipeline over the process-wide reference-string cache.
    pub fn new(config: PipelineConfig) -> Self {
        let srs = SrsManager::new(config.srs.clone());
        Self::with_srs_manager(config, srs)
    }

    pub fn with_srs_manager(config: PipelineConfig, srs: SrsManager) -> Self {
        let store = config.artifact_dir.clone().map(ArtifactStore::new);
        Self {
            config,
            store,
            srs,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&ArtifactStore> {
        self.store.as_ref()
    }

    pub fn srs_manager(&self) -> &SrsManager {
        &self.srs
    }

    /// Token that cancels this pipeline's compile and setup stages.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn cached<T, F>(
        &self,
        stage: Stage,
        kind: ArtifactKind,
        key: &ContentHash,
        compute: F,
    ) -> Result<(T, bool), PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, StageError>,
    {
        let result = match &self.store {
            Some(store) => store.get_or_insert_with(kind, key, compute),
            None => compute().map(|v| (v, false)),
        };
        result.map_err(|e| PipelineError::new(stage, e))
    }

    pub fn gen_settings(
        &self,
        descriptor: &ModelDescriptor,
        calibration: Option<&CalibrationData>,
    ) -> Result<(Settings, bool), PipelineError> {
        let config_hash = hash_json("zkinfer/settings-config/v1", &self.config.settings)
            .unwrap_or(ContentHash::ZERO);
        let calibration_hash = calibration
            .map(CalibrationData::hash)
            .unwrap_or(ContentHash::ZERO);
        let key = settings_key(&descriptor.hash(), &calibration_hash, &config_hash);
        self.cached(Stage::Settings, ArtifactKind::Settings, &key, || {
            Ok(generate_settings(
                descriptor,
                calibration,
                &self.config.settings,
            )?)
        })
    }

    pub fn compile(
        &self,
        descriptor: &ModelDescriptor,
        settings: &Settings,
    ) -> Result<(CompiledCircuit, bool), PipelineError> {
        let key = circuit_key(&descriptor.hash(), &settings.hash());
        self.cached(Stage::Compile, ArtifactKind::Circuit, &key, || {
            Ok(compile(descriptor, settings, &self.cancel)?)
        })
    }

    pub fn acquire_srs(&self, min_degree: u32) -> Result<Arc<ReferenceString>, PipelineError> {
        self.srs
            .acquire(min_degree)
            .map_err(|e| PipelineError::new(Stage::ReferenceString, e))
    }

    pub fn gen_witness(
        &self,
        circuit: &CompiledCircuit,
        input: &InputData,
    ) -> Result<(Witness, bool), PipelineError> {
        let key = witness_key(&circuit.hash(), &input.hash());
        self.cached(Stage::Witness, ArtifactKind::Witness, &key, || {
            Ok(generate_witness(circuit, input)?)
        })
    }

    /// Key setup, cached under the joint (circuit, reference string) hash.
    pub fn setup(
        &self,
        circuit: &CompiledCircuit,
        srs: &ReferenceString,
    ) -> Result<(ProvingKey, VerifyingKey, bool), PipelineError> {
        let key = keys_key(&circuit.hash(), &srs.digest());
        let (pk, cached) = self.cached(Stage::Setup, ArtifactKind::ProvingKey, &key, || {
            let (pk, _) = setup(circuit, srs, &self.cancel)?;
            Ok(pk)
        })?;
        let vk = pk.vk.clone();
        if let Some(store) = &self.store {
            if !store.contains(ArtifactKind::VerifyingKey, &key) {
                store
                    .put(ArtifactKind::VerifyingKey, &key, &vk)
                    .map_err(|e| PipelineError::new(Stage::Setup, e))?;
            }
        }
        Ok((pk, vk, cached))
    }

    /// Run every stage for one descriptor and input.
    pub fn run(
        &self,
        descriptor: &ModelDescriptor,
        calibration: Option<&CalibrationData>,
        input: &InputData,
    ) -> Result<RunReport, PipelineError> {
        let _span = info_span!("pipeline", model = %descriptor.name).entered();
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut record = |stage: Stage, t: Instant, cached: bool| {
            let elapsed_ms = t.elapsed().as_millis() as u64;
            info!(%stage, elapsed_ms, cached, "stage complete");
            stages.push(StageReport {
                stage,
                elapsed_ms,
                cached,
            });
        };

        let result = (|| {
            let t = Instant::now();
            let (settings, cached) = self.gen_settings(descriptor, calibration)?;
            record(Stage::Settings, t, cached);

            let t = Instant::now();
            let (circuit, cached) = self.compile(descriptor, &settings)?;
            record(Stage::Compile, t, cached);

            let t = Instant::now();
            let srs = self.acquire_srs(circuit.required_degree)?;
            record(Stage::ReferenceString, t, false);

            let t = Instant::now();
            let (witness, cached) = self.gen_witness(&circuit, input)?;
            record(Stage::Witness, t, cached);

            let vk_digest = if self.config.run_setup {
                let t = Instant::now();
                let (_, vk, cached) = self.setup(&circuit, &srs)?;
                record(Stage::Setup, t, cached);
                Some(vk.digest)
            } else {
                None
            };

            Ok::<_, PipelineError>((settings, circuit, srs, witness, vk_digest))
        })();

        let (settings, circuit, srs, witness, vk_digest) = result.map_err(|e| {
            warn!(stage = %e.stage, missing = e.missing, error = %e.source, "pipeline halted");
            e
        })?;

        Ok(RunReport {
            model: descriptor.name.clone(),
            descriptor_hash: descriptor.hash(),
            circuit_hash: circuit.hash(),
            num_rows: circuit.num_rows,
            required_degree: circuit.required_degree,
            srs_degree: srs.degree(),
            witness_hash: witness.hash(),
            outputs: witness.outputs,
            vk_digest,
            settings,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::import::build_mlp;
    use crate::compiler::settings::SettingsConfig;
    use crate::srs::{SrsCache, SrsConfig};

    fn pipeline(tag: &str, cached: bool) -> Pipeline {
        let base = std::env::temp_dir().join(format!("zkinfer-runner-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let config = PipelineConfig {
            artifact_dir: cached.then(|| base.join("artifacts")),
            srs: SrsConfig {
                dir: base.join("srs"),
                max_degree: 18,
                ..SrsConfig::default()
            },
            settings: SettingsConfig {
                tolerance: 0.05,
                ..SettingsConfig::default()
            },
            run_setup: true,
        };
        let srs = SrsManager::with_cache(config.srs.clone(), Arc::new(SrsCache::new()));
        Pipeline::with_srs_manager(config, srs)
    }

    #[test]
    fn test_run_reports_every_stage() {
        let p = pipeline("stages", false);
        let desc = build_mlp(2, 5, 0.2, 0.1);
        let report = p.run(&desc, None, &InputData::new(vec![1.0; 5])).unwrap();
        let order: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(order, Stage::ALL.to_vec());
        assert!(report.srs_degree >= report.required_degree);
        assert!(report.vk_digest.is_some());
        assert!(report.stages.iter().all(|s| !s.cached));
    }

    #[test]
    fn test_second_run_hits_cache() {
        let p = pipeline("hits", true);
        let desc = build_mlp(2, 5, 0.2, 0.1);
        let input = InputData::new(vec![0.5; 5]);
        let first = p.run(&desc, None, &input).unwrap();
        let second = p.run(&desc, None, &input).unwrap();
        assert_eq!(first.circuit_hash, second.circuit_hash);
        assert_eq!(first.vk_digest, second.vk_digest);
        for stage in [Stage::Settings, Stage::Compile, Stage::Witness, Stage::Setup] {
            assert!(second.stage(stage).unwrap().cached, "{stage} not cached");
        }
        if let Some(store) = p.store() {
            std::fs::remove_dir_all(store.root()).ok();
        }
    }

    #[test]
    fn test_halt_names_missing_artifact() {
        let p = pipeline("halt", false);
        let desc = build_mlp(2, 5, 0.2, 0.1);
        let err = p.run(&desc, None, &InputData::new(vec![1.0; 3])).unwrap_err();
        assert_eq!(err.stage, Stage::Witness);
        assert_eq!(err.missing, "witness");
    }

    #[test]
    fn test_cancelled_compile_publishes_nothing() {
        let p = pipeline("cancel", true);
        let desc = build_mlp(2, 5, 0.2, 0.1);
        let (settings, _) = p.gen_settings(&desc, None).unwrap();
        p.cancel_token().cancel();
        let err = p.compile(&desc, &settings).unwrap_err();
        assert!(err.is_cancelled());
        let key = circuit_key(&desc.hash(), &settings.hash());
        let store = p.store().unwrap();
        assert!(!store.contains(ArtifactKind::Circuit, &key));
        std::fs::remove_dir_all(store.root()).ok();
    }
}
