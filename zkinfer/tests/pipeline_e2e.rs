//! End-to-end pipeline tests: model document to bound proof.
//!
//! ```text
//! model.json ──► descriptor ──► settings ──► circuit ──► srs ──► witness ──► keys
//!                                                                   │          │
//!                                                                   └── prove ─┴── verify
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use zkinfer::compiler::import::{load_calibration_json, load_input_json};
use zkinfer::prelude::*;
use zkinfer::srs::SrsCache;

const MODEL: &str = r#"{
    "name": "e2e_tiny",
    "input_dim": 3,
    "layers": [
        {"op": "linear", "in_dim": 3, "out_dim": 4,
         "weights": [[0.5, -0.25, 0.1], [0.2, 0.3, -0.4], [-0.6, 0.1, 0.2], [0.05, 0.05, 0.05]],
         "bias": [0.1, 0.0, -0.1, 0.2]},
        {"op": "relu", "dim": 4},
        {"op": "linear", "in_dim": 4, "out_dim": 2,
         "weights": [[0.3, 0.3, -0.2, 0.1], [-0.1, 0.4, 0.2, 0.2]],
         "bias": [0.0, 0.05]},
        {"op": "sigmoid", "dim": 2}
    ]
}"#;

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("zkinfer-e2e-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn pipeline(base: &std::path::Path, cached: bool) -> Pipeline {
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
fn test_model_file_to_verified_proof() {
    let base = temp_dir("full");
    let model_path = base.join("model.json");
    std::fs::write(&model_path, MODEL).unwrap();
    let input_path = base.join("input.json");
    std::fs::write(&input_path, r#"{"input_data": [[0.5, -0.2, 0.8]]}"#).unwrap();

    let desc = load_model_json(&model_path).unwrap();
    let input = load_input_json(&input_path).unwrap();
    let p = pipeline(&base, true);

    let report = p.run(&desc, None, &input).unwrap();
    assert_eq!(report.model, "e2e_tiny");
    assert_eq!(report.outputs.len(), 2);
    assert!(!report.settings.calibrated);
    assert!(report.srs_degree >= report.required_degree);

    // Fixed-point outputs stay within the tolerance of the float forward pass.
    let expected = desc.forward(&input.values);
    for (got, want) in report.outputs.iter().zip(&expected) {
        assert!(
            (got - want).abs() <= 0.05,
            "output {got} too far from {want}"
        );
    }

    // Every stage artifact is reused; proving with the cached keys verifies.
    let (settings, hit) = p.gen_settings(&desc, None).unwrap();
    assert!(hit);
    let (circuit, hit) = p.compile(&desc, &settings).unwrap();
    assert!(hit);
    assert_eq!(circuit.hash(), report.circuit_hash);
    let srs = p.acquire_srs(circuit.required_degree).unwrap();
    let (witness, hit) = p.gen_witness(&circuit, &input).unwrap();
    assert!(hit);
    let (pk, vk, hit) = p.setup(&circuit, &srs).unwrap();
    assert!(hit);
    assert_eq!(Some(vk.digest), report.vk_digest);

    let proof = prove(&pk, &witness).unwrap();
    verify(&vk, &proof).unwrap();

    std::fs::remove_dir_all(&base).ok();
}

#[test]
fn test_independent_runs_are_deterministic() {
    let desc = build_mlp(3, 5, 0.2, 0.1);
    let input = InputData::new(vec![0.3, -0.1, 0.9, 0.0, 0.5]);

    let base_a = temp_dir("det-a");
    let base_b = temp_dir("det-b");
    let a = pipeline(&base_a, false).run(&desc, None, &input).unwrap();
    let b = pipeline(&base_b, false).run(&desc, None, &input).unwrap();

    assert_eq!(a.settings, b.settings);
    assert_eq!(a.circuit_hash, b.circuit_hash);
    assert_eq!(a.witness_hash, b.witness_hash);
    assert_eq!(a.outputs, b.outputs);
    assert_eq!(a.vk_digest, b.vk_digest);

    std::fs::remove_dir_all(&base_a).ok();
    std::fs::remove_dir_all(&base_b).ok();
}

#[test]
fn test_calibrated_run() {
    let base = temp_dir("calib");
    let calib_path = base.join("calibration.json");
    std::fs::write(
        &calib_path,
        r#"{"input_data": [[0.1, 0.2, 0.3, 0.4, 0.5], [0.5, 0.4, 0.3, 0.2, 0.1], [0.0, 0.0, 0.0, 0.0, 0.0]]}"#,
    )
    .unwrap();
    let calib = load_calibration_json(&calib_path).unwrap();

    let desc = build_mlp(4, 5, 0.2, 0.1);
    let p = pipeline(&base, false);
    let input = InputData::new(calib.inputs[0].clone());
    let calibrated = p.run(&desc, Some(&calib), &input).unwrap();
    let uncalibrated = p.run(&desc, None, &input).unwrap();

    assert!(calibrated.settings.calibrated);
    assert!(!uncalibrated.settings.calibrated);
    assert!(calibrated.settings.scale <= uncalibrated.settings.scale);
    assert!(calibrated.settings.lookup_bit_width <= uncalibrated.settings.lookup_bit_width);
    assert_ne!(calibrated.circuit_hash, uncalibrated.circuit_hash);

    let expected = desc.forward(&input.values);
    assert!((calibrated.outputs[0] - expected[0]).abs() <= 0.05);

    std::fs::remove_dir_all(&base).ok();
}

#[test]
fn test_unsupported_op_halts_at_compile() {
    let base = temp_dir("ops");
    let mut config = PipelineConfig {
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
    config.settings.supported_ops.remove(&OpKind::Sigmoid);
    let srs = SrsManager::with_cache(config.srs.clone(), Arc::new(SrsCache::new()));
    let p = Pipeline::with_srs_manager(config, srs);

    let desc = zkinfer::compiler::import::parse_model_json(MODEL).unwrap();
    let err = p
        .run(&desc, None, &InputData::new(vec![0.0; 3]))
        .unwrap_err();
    assert_eq!(err.stage, Stage::Compile);
    assert_eq!(err.missing, "compiled circuit");

    std::fs::remove_dir_all(&base).ok();
}
