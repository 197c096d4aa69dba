//! Allocator benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use spanalloc_core::{Allocator, SharedAllocator};

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("spanalloc", size), &size, |b, &sz| {
            let mut alloc = Allocator::new();
            b.iter(|| {
                let ptr = alloc.allocate(sz, false).unwrap();
                criterion::black_box(ptr);
                alloc.free(ptr);
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("spanalloc_1000x64B", |b| {
        let mut alloc = Allocator::new();
        b.iter(|| {
            let ptrs: Vec<*mut u8> = (0..1000)
                .map(|_| alloc.allocate(64, false).unwrap())
                .collect();
            for &ptr in &ptrs {
                alloc.free(ptr);
            }
        });
    });

    group.bench_function("system_1000x64B", |b| {
        b.iter(|| {
            let allocs: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 64]).collect();
            criterion::black_box(allocs);
        });
    });

    group.finish();
}

fn bench_shared_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_alloc");

    group.bench_function("uncontended_64B", |b| {
        let alloc = SharedAllocator::new();
        b.iter(|| {
            let ptr = alloc.allocate(64, false).unwrap();
            criterion::black_box(ptr);
            alloc.free(ptr);
        });
    });

    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");

    group.bench_function("grow_16_to_4096", |b| {
        let mut alloc = Allocator::new();
        b.iter(|| {
            let mut ptr = alloc.allocate(16, false).unwrap();
            let mut size = 16;
            while size < 4096 {
                size *= 2;
                ptr = alloc.reallocate(ptr, size, false).unwrap();
            }
            alloc.free(ptr);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_shared_contention,
    bench_realloc_growth
);
criterion_main!(benches);
