//! Throughput benchmarks for transactional reads, writes and contended commits

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::thread;
use vstm::{ClockMode, IsolationLevel, Stm, StmConfig};

fn bench_read_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_only");
    let stm = Stm::new();

    for size in [1usize, 8, 32].iter() {
        let objects: Vec<_> = (0..*size).map(|i| stm.object(i as u64)).collect();
        let factory = stm
            .factory()
            .family(format!("read-{size}"))
            .max_array_size(16)
            .build()
            .unwrap();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let sum = factory
                    .atomically(|tx| {
                        let mut sum = 0;
                        for obj in &objects {
                            sum += tx.read(obj)?;
                        }
                        Ok(sum)
                    })
                    .unwrap();
                black_box(sum);
            });
        });
    }

    group.finish();
}

fn bench_increment(c: &mut Criterion) {
    let mut group = c.benchmark_group("increment");

    for isolation in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
    ] {
        let stm = Stm::new();
        let counter = stm.object(0u64);
        let factory = stm.factory().isolation(isolation).build().unwrap();
        group.bench_function(format!("{isolation:?}"), |b| {
            b.iter(|| {
                factory
                    .atomically(|tx| counter.alter(tx, |n| n + 1))
                    .unwrap()
            });
        });
    }

    let stm = Stm::new();
    let counter = stm.object(0u64);
    group.bench_function("commute", |b| {
        b.iter(|| stm.atomically(|tx| counter.commute(tx, |n| *n += 1)).unwrap());
    });

    group.finish();
}

fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");

    for clock in [ClockMode::Strict, ClockMode::Relaxed] {
        for threads in [2usize, 4, 8].iter() {
            group.bench_with_input(
                BenchmarkId::new(format!("{clock:?}"), threads),
                threads,
                |b, &num_threads| {
                    let stm = Arc::new(Stm::with_config(StmConfig {
                        clock,
                        ..StmConfig::default()
                    }));
                    let objects: Arc<Vec<_>> =
                        Arc::new((0..16).map(|_| stm.object(0i64)).collect());
                    b.iter(|| {
                        let handles: Vec<_> = (0..num_threads)
                            .map(|t| {
                                let stm = stm.clone();
                                let objects = objects.clone();
                                thread::spawn(move || {
                                    for i in 0..200 {
                                        let from = (t * 3 + i) % objects.len();
                                        let to = (from + 1) % objects.len();
                                        stm.atomically(|tx| {
                                            *tx.open_for_write(&objects[from])? -= 1;
                                            *tx.open_for_write(&objects[to])? += 1;
                                            Ok(())
                                        })
                                        .unwrap();
                                    }
                                })
                            })
                            .collect();

                        for handle in handles {
                            handle.join().unwrap();
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_read_only, bench_increment, bench_contention);
criterion_main!(benches);
