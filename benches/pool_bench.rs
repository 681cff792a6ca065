//! Pool allocator benchmarks.

use binpool::{GlobalPoolAllocator, PoolAllocator};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let alloc = PoolAllocator::new(false).unwrap();
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 16384, 65536];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, &sz| {
            b.iter(|| {
                let p = alloc.allocate(black_box(sz)).unwrap();
                // Safety: p was just allocated.
                unsafe { alloc.free(Some(p)) };
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v: Vec<u8> = Vec::with_capacity(black_box(sz));
                black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let alloc = PoolAllocator::new(false).unwrap();
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000).map(|_| alloc.allocate(64).unwrap()).collect();
            for p in ptrs {
                // Safety: p is live.
                unsafe { alloc.free(Some(p)) };
            }
        });
    });

    group.bench_function("1000xmixed", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000usize)
                .map(|i| alloc.allocate(8 << (i % 12)).unwrap())
                .collect();
            for p in ptrs.into_iter().rev() {
                // Safety: p is live.
                unsafe { alloc.free(Some(p)) };
            }
        });
    });

    group.finish();
}

fn bench_reallocate_growth(c: &mut Criterion) {
    let alloc = PoolAllocator::new(false).unwrap();

    c.bench_function("reallocate_8B_to_64KiB", |b| {
        b.iter(|| {
            // Safety: every pointer fed back in was just returned.
            unsafe {
                let mut p = alloc.allocate(8).unwrap();
                let mut size = 8;
                while size < 64 * 1024 {
                    size *= 2;
                    p = alloc.reallocate(Some(p), size).unwrap().unwrap();
                }
                alloc.free(Some(p));
            }
        });
    });
}

fn bench_contended(c: &mut Criterion) {
    let alloc = Arc::new(PoolAllocator::new(false).unwrap());

    c.bench_function("4_threads_x_1000x128B", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let alloc = alloc.clone();
                    std::thread::spawn(move || {
                        for _ in 0..1000 {
                            let p = alloc.allocate(128).unwrap();
                            // Safety: p was just allocated.
                            unsafe { alloc.free(Some(p)) };
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });
}

fn bench_global(c: &mut Criterion) {
    c.bench_function("global_alloc_free_256B", |b| {
        b.iter(|| {
            let p = GlobalPoolAllocator::allocate(black_box(256)).unwrap();
            // Safety: p was just allocated.
            unsafe { GlobalPoolAllocator::free(Some(p)) };
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_reallocate_growth,
    bench_contended,
    bench_global
);
criterion_main!(benches);
