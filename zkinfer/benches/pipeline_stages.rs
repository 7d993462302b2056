use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zkinfer::prelude::*;

const DEPTHS: [usize; 4] = [1, 2, 4, 8];
const WIDTH: usize = 5;

fn prepare(depth: usize) -> (ModelDescriptor, Settings) {
    let desc = build_mlp(depth, WIDTH, 0.2, 0.1);
    let settings = generate_settings(&desc, None, &SettingsConfig::default()).unwrap();
    (desc, settings)
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for depth in DEPTHS {
        let (desc, settings) = prepare(depth);
        group.bench_with_input(BenchmarkId::new("mlp", depth), &depth, |bench, _| {
            let cancel = CancellationToken::new();
            bench.iter(|| compile(&desc, &settings, &cancel).unwrap());
        });
    }
    group.finish();
}

fn bench_witness(c: &mut Criterion) {
    let mut group = c.benchmark_group("witness");
    let mut rng = StdRng::seed_from_u64(42);

    for depth in DEPTHS {
        let (desc, settings) = prepare(depth);
        let circuit = compile(&desc, &settings, &CancellationToken::new()).unwrap();
        let input = InputData::new((0..WIDTH).map(|_| rng.gen_range(-1.0..=1.0)).collect());
        group.bench_with_input(BenchmarkId::new("mlp", depth), &depth, |bench, _| {
            bench.iter(|| generate_witness(&circuit, &input).unwrap());
        });
    }
    group.finish();
}

fn bench_setup(c: &mut Criterion) {
    let mut group = c.benchmark_group("setup");
    group.sample_size(10);

    for depth in [1, 4] {
        let (desc, settings) = prepare(depth);
        let circuit = compile(&desc, &settings, &CancellationToken::new()).unwrap();
        let srs = ReferenceString::generate(0x5eed, circuit.required_degree);
        group.bench_with_input(BenchmarkId::new("mlp", depth), &depth, |bench, _| {
            let cancel = CancellationToken::new();
            bench.iter(|| setup(&circuit, &srs, &cancel).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_witness, bench_setup);
criterion_main!(benches);
