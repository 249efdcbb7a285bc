use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ssf_rs::blocks;
use ssf_rs::{filter, DiffuseCollapse, MeasurementNoise, Numerics, SsfConfig, StateSpaceSystem, SystemBuilder};

fn trend_cycle() -> StateSpaceSystem {
    SystemBuilder::new()
        .add(blocks::spline(0.01).unwrap())
        .add(blocks::ar1(0.8, 1.0).unwrap())
        .noise(MeasurementNoise::Constant(0.5))
        .build()
        .unwrap()
}

fn bench_filter(c: &mut Criterion) {
    let sys = trend_cycle();
    let mut group = c.benchmark_group("filter");
    for n in [100usize, 1000, 10_000] {
        let y = sys.random(n, &mut StdRng::seed_from_u64(1)).unwrap();
        let configs = [
            ("standard", SsfConfig::default().without_storage()),
            (
                "square_root",
                SsfConfig::default()
                    .without_storage()
                    .with_numerics(Numerics::SquareRoot),
            ),
            (
                "covariance_collapse",
                SsfConfig::default()
                    .without_storage()
                    .with_collapse(DiffuseCollapse::Covariance),
            ),
        ];
        for (name, cfg) in &configs {
            group.bench_with_input(BenchmarkId::new(*name, n), &y, |b, y| {
                b.iter(|| filter(&sys, std::hint::black_box(y), cfg).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_filter);
criterion_main!(benches);
