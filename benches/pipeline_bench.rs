//! Benchmarks for the two pure, CPU-bound components that dominate
//! reconfiguration latency: schedule generation (C1) and instantiation
//! (C5). Requires the `mock` feature (teacher's pattern of gating
//! benchmarks that don't need a real transport backend).

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use pipeline_trainer::{Instantiator, PipelineTemplate, Schedule};

fn bench_schedule_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_generate");
    for &(num_stages, num_microbatches) in &[(4usize, 8u32), (8, 32), (16, 64)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{num_stages}x{num_microbatches}")),
            &(num_stages, num_microbatches),
            |b, &(s, m)| {
                b.iter(|| black_box(Schedule::generate(s, m).unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_instantiate(c: &mut Criterion) {
    let mut group = c.benchmark_group("instantiate");
    let pool: BTreeMap<String, PipelineTemplate> = (1..=8)
        .map(|nodes| {
            let t = PipelineTemplate::uniform(format!("t{nodes}"), nodes, 4);
            (t.template_id.clone(), t)
        })
        .collect();
    let instantiator = Instantiator::new(2);

    for &world_size in &[8usize, 16, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(world_size), &world_size, |b, &w| {
            b.iter(|| black_box(instantiator.instantiate(&pool, w, 64).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_schedule_generate, bench_instantiate);
criterion_main!(benches);
