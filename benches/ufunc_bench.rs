use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ufunc_rs::{ufuncs, AccumulateOptions, Array, CallOptions, ReduceOptions};

fn values(n: usize) -> Vec<f64> {
    (0..n).map(|i| (i % 97) as f64 * 0.25 + 1.0).collect()
}

fn bench_elementwise_add(c: &mut Criterion) {
    let add = ufuncs::add();
    let mut group = c.benchmark_group("elementwise_add");
    for size in [1_000usize, 100_000, 1_000_000] {
        group.throughput(Throughput::Elements(size as u64));

        let a = Array::from_vec(values(size), &[size]).unwrap();
        let b = Array::from_vec(values(size), &[size]).unwrap();
        let out = Array::zeros(*a.dtype(), &[size], ufunc_rs::MemoryOrder::C).unwrap();

        // Contiguous operands take the trivial single-call path.
        group.bench_with_input(BenchmarkId::new("contiguous", size), &size, |bn, _| {
            bn.iter(|| {
                add.call(
                    &[a.clone(), b.clone()],
                    &CallOptions {
                        out: vec![Some(out.clone())],
                        ..CallOptions::default()
                    },
                )
                .unwrap()
            })
        });

        // A stride-2 view forces the blocked generic loop.
        let big = Array::from_vec(values(size * 2), &[size * 2]).unwrap();
        let view = big.slice_axis(0, 0, size, 2).unwrap();
        group.bench_with_input(BenchmarkId::new("strided", size), &size, |bn, _| {
            bn.iter(|| {
                add.call(
                    &[view.clone(), b.clone()],
                    &CallOptions {
                        out: vec![Some(out.clone())],
                        ..CallOptions::default()
                    },
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_reduce_sum(c: &mut Criterion) {
    let add = ufuncs::add();
    let mut group = c.benchmark_group("reduce_sum");
    for size in [256usize, 1024] {
        let elements = size * size;
        group.throughput(Throughput::Elements(elements as u64));

        let a = Array::from_vec(values(elements), &[size, size]).unwrap();
        for axis in [0isize, 1] {
            group.bench_with_input(
                BenchmarkId::new(format!("axis{axis}"), size),
                &size,
                |bn, _| {
                    bn.iter(|| {
                        add.reduce(
                            &a,
                            &ReduceOptions {
                                axes: vec![axis],
                                ..ReduceOptions::default()
                            },
                        )
                        .unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_accumulate(c: &mut Criterion) {
    let add = ufuncs::add();
    let mut group = c.benchmark_group("accumulate");
    for size in [1_000usize, 100_000] {
        group.throughput(Throughput::Elements(size as u64));
        let a = Array::from_vec(values(size), &[size]).unwrap();
        group.bench_with_input(BenchmarkId::new("running_sum", size), &size, |bn, _| {
            bn.iter(|| add.accumulate(&a, &AccumulateOptions::default()).unwrap())
        });
    }
    group.finish();
}

fn bench_inner1d(c: &mut Criterion) {
    let inner = ufuncs::inner1d();
    let mut group = c.benchmark_group("inner1d");
    for (batch, core) in [(1_000usize, 64usize), (100, 1024)] {
        group.throughput(Throughput::Elements((batch * core) as u64));
        let a = Array::from_vec(values(batch * core), &[batch, core]).unwrap();
        let b = Array::from_vec(values(core), &[core]).unwrap();
        group.bench_with_input(
            BenchmarkId::new("batched", format!("{batch}x{core}")),
            &batch,
            |bn, _| {
                bn.iter(|| {
                    inner
                        .call(&[a.clone(), b.clone()], &CallOptions::default())
                        .unwrap()
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_elementwise_add,
    bench_reduce_sum,
    bench_accumulate,
    bench_inner1d
);
criterion_main!(benches);
