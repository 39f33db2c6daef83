use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sios_core::SourceRegistry;
use sios_perf::{banded_sources, timer_sources};

fn bench_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_add_remove");
    for count in [16usize, 64, 256] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let registry = SourceRegistry::new();
            let sources = banded_sources(count);
            b.iter(|| {
                for source in &sources {
                    registry.add(source).unwrap();
                }
                for source in &sources {
                    registry.remove(source);
                }
            });
        });
    }
    group.finish();
}

fn bench_writer_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("writer_tick");
    for count in [16usize, 64, 256] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let registry = SourceRegistry::new();
            for source in timer_sources(count) {
                registry.add(&source).unwrap();
            }
            b.iter(|| registry.execute_writers());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_add_remove, bench_writer_tick);
criterion_main!(benches);
