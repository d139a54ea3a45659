//! Benchmarks for adaptive and full-ensemble inference.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ea_resnet::layers::Conv2d;
use ea_resnet::{EnsembleConfig, EnsembleNet};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn small_config(force_all: bool) -> EnsembleConfig {
    EnsembleConfig { force_all, ..EnsembleConfig::resnet20() }
}

fn images(batch: usize) -> Array4<f32> {
    Array4::from_shape_fn((batch, 3, 32, 32), |(b, c, h, w)| {
        ((b * 13 + c * 7 + h * 3 + w) % 17) as f32 / 16.0
    })
}

fn bench_conv(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv3x3");
    let mut rng = StdRng::seed_from_u64(0);
    let conv = Conv2d::new(&mut rng, 16, 16, 3, 1, 1);

    for size in [16, 32].iter() {
        let input = Array4::<f32>::ones((1, 16, *size, *size));
        group.throughput(Throughput::Elements((size * size * 16) as u64));
        group.bench_with_input(BenchmarkId::new("forward", size), size, |b, _| {
            b.iter(|| black_box(conv.forward(&input).unwrap()))
        });
    }

    group.finish();
}

fn bench_ensemble_inference(c: &mut Criterion) {
    let mut group = c.benchmark_group("ensemble_inference");
    group.sample_size(10);

    let adaptive = EnsembleNet::new(small_config(false)).unwrap();
    let full = EnsembleNet::new(small_config(true)).unwrap();

    for batch in [1, 8].iter() {
        let input = images(*batch);
        group.throughput(Throughput::Elements(*batch as u64));

        group.bench_with_input(BenchmarkId::new("adaptive", batch), batch, |b, _| {
            b.iter(|| black_box(adaptive.forward_inference(&input).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("all_experts", batch), batch, |b, _| {
            b.iter(|| black_box(full.forward_inference(&input).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_conv, bench_ensemble_inference);
criterion_main!(benches);
