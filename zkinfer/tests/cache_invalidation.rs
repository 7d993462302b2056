//! Cascading cache invalidation.
//!
//! Changing one weight or one layer's output dimension must move every
//! downstream identity:
//!
//! ```text
//! descriptor ─► settings key ─► circuit ─► witness
//!                                  └─────► keys
//! ```

use std::sync::Arc;

use zkinfer::compiler::graph::LinearParams;
use zkinfer::pipeline::runner::{circuit_key, settings_key, witness_key};
use zkinfer::prelude::*;
use zkinfer::srs::SrsCache;

fn pipeline(tag: &str) -> (Pipeline, std::path::PathBuf) {
    let base = std::env::temp_dir().join(format!("zkinfer-inval-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&base);
    let config = PipelineConfig {
        artifact_dir: Some(base.join("artifacts")),
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
    (Pipeline::with_srs_manager(config, srs), base)
}

/// Copy of `desc` with one weight of the first linear layer nudged.
fn perturb(desc: &ModelDescriptor) -> ModelDescriptor {
    let mut out = desc.clone();
    for layer in &mut out.layers {
        if let LayerKind::Linear(LinearParams { weights, .. }) = &mut layer.kind {
            weights[0][0] += 0.001;
            break;
        }
    }
    out
}

#[test]
fn test_weight_change_moves_every_downstream_hash() {
    let (p, base) = pipeline("weights");
    let desc = build_mlp(3, 4, 0.2, 0.1);
    let changed = perturb(&desc);
    let input = InputData::new(vec![0.5; 4]);

    assert_ne!(desc.hash(), changed.hash());

    let a = p.run(&desc, None, &input).unwrap();
    let b = p.run(&changed, None, &input).unwrap();

    assert_ne!(a.descriptor_hash, b.descriptor_hash);
    assert_ne!(a.settings.hash(), b.settings.hash());
    assert_ne!(a.circuit_hash, b.circuit_hash);
    assert_ne!(a.witness_hash, b.witness_hash);
    assert_ne!(a.vk_digest, b.vk_digest);

    // Nothing of the first run was reused by the second.
    for stage in [Stage::Settings, Stage::Compile, Stage::Witness, Stage::Setup] {
        assert!(!b.stage(stage).unwrap().cached, "{stage} reused a stale artifact");
    }

    std::fs::remove_dir_all(&base).ok();
}

/// Two-block MLP on 4 inputs whose first hidden layer is `hidden` wide.
fn mlp_with_hidden(hidden: usize) -> ModelDescriptor {
    let mut builder = DescriptorBuilder::new(4);
    builder
        .name("hidden_sweep")
        .linear_constant(hidden, 0.2, 0.1)
        .activation(ActivationType::Relu)
        .linear_constant(4, 0.2, 0.1)
        .activation(ActivationType::Relu)
        .linear_constant(1, 0.2, 0.1);
    builder.build()
}

#[test]
fn test_output_dim_change_moves_every_downstream_hash() {
    let (p, base) = pipeline("outdim");
    let desc = mlp_with_hidden(4);
    let widened = mlp_with_hidden(5);
    let input = InputData::new(vec![0.5; 4]);

    assert_eq!(desc.input_dim, widened.input_dim);
    assert_ne!(desc.hash(), widened.hash());

    let a = p.run(&desc, None, &input).unwrap();
    let b = p.run(&widened, None, &input).unwrap();

    assert_ne!(a.descriptor_hash, b.descriptor_hash);
    assert_ne!(a.settings.hash(), b.settings.hash());
    assert_ne!(a.circuit_hash, b.circuit_hash);
    assert_ne!(a.witness_hash, b.witness_hash);
    assert_ne!(a.vk_digest, b.vk_digest);
    for stage in [Stage::Settings, Stage::Compile, Stage::Witness, Stage::Setup] {
        assert!(!b.stage(stage).unwrap().cached, "{stage} reused a stale artifact");
    }

    assert!(b.num_rows > a.num_rows);
    // Stage keys chain the moved hashes.
    assert_ne!(
        circuit_key(&a.descriptor_hash, &a.settings.hash()),
        circuit_key(&b.descriptor_hash, &b.settings.hash())
    );
    assert_ne!(
        witness_key(&a.circuit_hash, &input.hash()),
        witness_key(&b.circuit_hash, &input.hash())
    );

    // Rerunning the original still hits its own artifacts.
    let again = p.run(&desc, None, &input).unwrap();
    assert!(again.stage(Stage::Witness).unwrap().cached);
    assert_eq!(again.witness_hash, a.witness_hash);

    std::fs::remove_dir_all(&base).ok();
}

#[test]
fn test_keys_chain_upstream_identities() {
    let desc = build_mlp(2, 4, 0.2, 0.1);
    let changed = perturb(&desc);
    let calib = CalibrationData::new(vec![vec![0.1; 4]]);
    let config = ContentHash::ZERO;

    let k1 = settings_key(&desc.hash(), &ContentHash::ZERO, &config);
    let k2 = settings_key(&changed.hash(), &ContentHash::ZERO, &config);
    let k3 = settings_key(&desc.hash(), &calib.hash(), &config);
    assert_ne!(k1, k2);
    assert_ne!(k1, k3);

    let settings = generate_settings(&desc, None, &SettingsConfig::default()).unwrap();
    let c1 = circuit_key(&desc.hash(), &settings.hash());
    let c2 = circuit_key(&changed.hash(), &settings.hash());
    let c3 = circuit_key(
        &desc.hash(),
        &settings
            .with_lookup_bit_width(settings.lookup_bit_width + 1)
            .hash(),
    );
    assert_ne!(c1, c2);
    assert_ne!(c1, c3);

    let w1 = witness_key(&c1, &InputData::new(vec![0.0; 4]).hash());
    let w2 = witness_key(&c1, &InputData::new(vec![0.0, 0.0, 0.0, 0.001]).hash());
    assert_ne!(w1, w2);
}

#[test]
fn test_config_change_regenerates_settings() {
    let (p, base) = pipeline("config");
    let desc = build_mlp(2, 4, 0.2, 0.1);
    let input = InputData::new(vec![0.5; 4]);
    let first = p.run(&desc, None, &input).unwrap();

    let mut config = p.config().clone();
    config.settings.tolerance = 0.005;
    let srs = p.srs_manager().clone();
    let tighter = Pipeline::with_srs_manager(config, srs);
    let second = tighter.run(&desc, None, &input).unwrap();

    assert!(!second.stage(Stage::Settings).unwrap().cached);
    assert!(second.settings.scale > first.settings.scale);
    assert_ne!(first.circuit_hash, second.circuit_hash);

    // The original configuration still hits its own artifacts.
    let again = p.run(&desc, None, &input).unwrap();
    assert!(again.stage(Stage::Settings).unwrap().cached);
    assert_eq!(again.circuit_hash, first.circuit_hash);

    std::fs::remove_dir_all(&base).ok();
}
