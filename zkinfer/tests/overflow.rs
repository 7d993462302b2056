//! Range overflow at depth 64.
//!
//! Hidden activations of `build_mlp(64, 5, 0.2, 0.1)` on an all-ones input
//! grow as `1 + 0.1k`. A lookup width too narrow for that growth must surface
//! as an `OutOfRange` witness error carrying the width that would fit, and
//! never as silently wrapped values.

use std::sync::Arc;

use zkinfer::prelude::*;
use zkinfer::srs::SrsCache;
use zkinfer::witness::WitnessError;

const DEPTH: usize = 64;

fn deep_settings() -> (ModelDescriptor, Settings) {
    let desc = build_mlp(DEPTH, 5, 0.2, 0.1);
    let cfg = SettingsConfig {
        tolerance: 0.5,
        ..SettingsConfig::default()
    };
    let settings = generate_settings(&desc, None, &cfg).unwrap();
    (desc, settings)
}

#[test]
fn test_narrow_width_reports_out_of_range() {
    let (desc, settings) = deep_settings();
    // Room for magnitudes below 2.0 only.
    let narrow = settings.with_lookup_bit_width(settings.scale + 2);
    let circuit = compile(&desc, &narrow, &CancellationToken::new()).unwrap();

    let err = generate_witness(&circuit, &InputData::new(vec![1.0; 5])).unwrap_err();
    match err {
        WitnessError::OutOfRange {
            bits,
            required_bits,
            value,
            ..
        } => {
            assert_eq!(bits, narrow.lookup_bit_width);
            assert!(required_bits > bits);
            assert!(value.unsigned_abs() >= 1 << (bits - 1));
        }
        other => panic!("expected OutOfRange, got {other:?}"),
    }
}

#[test]
fn test_retry_hint_converges() {
    let (desc, settings) = deep_settings();
    let input = InputData::new(vec![1.0; 5]);
    let cancel = CancellationToken::new();

    let mut current = settings.with_lookup_bit_width(settings.scale + 2);
    let mut retries = 0;
    let witness = loop {
        let circuit = compile(&desc, &current, &cancel).unwrap();
        match generate_witness(&circuit, &input) {
            Ok(w) => break w,
            Err(e) => {
                let hint = e.required_bits().expect("range failures carry a hint");
                assert!(hint > current.lookup_bit_width);
                current = current.with_lookup_bit_width(hint);
                retries += 1;
                assert!(retries < 16, "retry hint did not converge");
            }
        }
    };

    assert!(retries >= 1);
    assert!(current.lookup_bit_width <= settings.lookup_bit_width);
    let expected = desc.forward(&input.values);
    assert!((witness.outputs[0] - expected[0]).abs() <= settings.estimated_error + 1e-9);
}

#[test]
fn test_generated_settings_fit_deep_model() {
    let (desc, settings) = deep_settings();
    let circuit = compile(&desc, &settings, &CancellationToken::new()).unwrap();
    let witness = generate_witness(&circuit, &InputData::new(vec![1.0; 5])).unwrap();
    assert_eq!(witness.wires.len(), circuit.wire_count());
}

#[test]
fn test_pipeline_halts_with_retry_hint() {
    let base = std::env::temp_dir().join(format!("zkinfer-overflow-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&base);
    let config = PipelineConfig {
        artifact_dir: Some(base.join("artifacts")),
        srs: SrsConfig {
            dir: base.join("srs"),
            max_degree: 20,
            ..SrsConfig::default()
        },
        settings: SettingsConfig {
            tolerance: 0.5,
            ..SettingsConfig::default()
        },
        run_setup: false,
    };
    let srs = SrsManager::with_cache(config.srs.clone(), Arc::new(SrsCache::new()));
    let p = Pipeline::with_srs_manager(config, srs);

    // Far outside the conservative input range the settings were sized for.
    let desc = build_mlp(DEPTH, 5, 0.2, 0.1);
    let err = p
        .run(&desc, None, &InputData::new(vec![1000.0; 5]))
        .unwrap_err();
    assert_eq!(err.stage, Stage::Witness);
    assert_eq!(err.missing, "witness");
    let hint = err.retry_hint().unwrap();
    assert!(hint > err_bits(&err));

    // Upstream artifacts were published; the witness was not.
    let store = p.store().unwrap();
    let (settings, hit) = p.gen_settings(&desc, None).unwrap();
    assert!(hit);
    let (circuit, hit) = p.compile(&desc, &settings).unwrap();
    assert!(hit);
    let key = zkinfer::pipeline::runner::witness_key(
        &circuit.hash(),
        &InputData::new(vec![1000.0; 5]).hash(),
    );
    assert!(!store.contains(ArtifactKind::Witness, &key));

    std::fs::remove_dir_all(&base).ok();
}

fn err_bits(err: &PipelineError) -> u32 {
    match &err.source {
        zkinfer::pipeline::types::StageError::Witness(WitnessError::OutOfRange { bits, .. }) => {
            *bits
        }
        other => panic!("expected a range failure, got {other:?}"),
    }
}
