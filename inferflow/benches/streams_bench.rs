//! Stream pool contention benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};
use inferflow::streams::{StreamGuard, StreamPool};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn bench_uncontended_acquire_release(c: &mut Criterion) {
    let pool = StreamPool::new(4);
    c.bench_function("acquire_release_uncontended", |b| {
        b.iter(|| {
            let id = pool.acquire();
            pool.release(id);
        });
    });
}

fn bench_contended_churn(c: &mut Criterion) {
    c.bench_function("acquire_release_8_threads_pool_4", |b| {
        b.iter(|| {
            let pool = Arc::new(StreamPool::new(4));
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    thread::spawn(move || {
                        for _ in 0..100 {
                            let id = pool.acquire();
                            pool.release(id);
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
        });
    });
}

fn bench_guard_lifecycle(c: &mut Criterion) {
    let pool = Arc::new(StreamPool::new(4));
    c.bench_function("guard_resolve_and_drop", |b| {
        b.iter(|| {
            let mut guard = StreamGuard::new(Arc::clone(&pool));
            let _ = guard.try_get_id(Duration::from_millis(1));
            drop(guard);
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended_acquire_release,
    bench_contended_churn,
    bench_guard_lifecycle
);
criterion_main!(benches);
