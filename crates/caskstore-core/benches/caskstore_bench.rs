//! CaskStore put / get / merge benchmarks.

use caskstore_core::{CaskStore, Config};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

fn value_of(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8 + 1).collect()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for size in [64usize, 1024, 16 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = CaskStore::open(dir.path(), Config::compact()).unwrap();
            let value = value_of(size);
            let mut n = 0u64;

            b.iter(|| {
                n += 1;
                store.put(&n.to_le_bytes(), black_box(&value)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    for size in [64usize, 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = CaskStore::open(dir.path(), Config::default()).unwrap();
            let value = value_of(size);
            for i in 0..1000u32 {
                store.put(&i.to_le_bytes(), &value).unwrap();
            }
            let mut rng = StdRng::seed_from_u64(7);

            b.iter(|| {
                let key = rng.gen_range(0..1000u32).to_le_bytes();
                let bytes = store.get_bytes(black_box(&key)).unwrap();
                black_box(bytes);
            });
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);

    group.bench_function("10k_overwritten_keys", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let config = Config::default().with_max_segment_size(256 * 1024);
                let store = CaskStore::open(dir.path(), config).unwrap();
                let value = value_of(100);
                for round in 0..4u32 {
                    for i in 0..2500u32 {
                        store.put(&(i + round % 2 * 2500).to_le_bytes(), &value).unwrap();
                    }
                }
                (dir, store)
            },
            |(_dir, store)| {
                let stats = store.merge().unwrap();
                black_box(stats);
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_merge);
criterion_main!(benches);
