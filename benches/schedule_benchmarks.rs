//! Scheduling performance benchmarks: elementwise chains, fused reduce
//! groups, and many independent kernels.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use std::collections::HashSet;

use lazylayer::{BinaryOp, Config, DType, LazyGraph, LbId, Op, ReduceOp, Scheduler};

fn elementwise_chain(depth: usize) -> (LazyGraph, Vec<LbId>) {
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[64, 64]);
    let b = g.input("CPU", DType::FLOAT32, &[64, 64]);
    let mut cur = a;
    for i in 0..depth {
        let op = if i % 2 == 0 {
            Op::Binary(BinaryOp::Add)
        } else {
            Op::Binary(BinaryOp::Mul)
        };
        cur = g.alu(op, &[cur, b]);
    }
    (g, vec![cur])
}

fn reduce_group(width: usize) -> (LazyGraph, Vec<LbId>) {
    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::FLOAT32, &[32, 128]);
    let y = g.input("CPU", DType::FLOAT32, &[32, 128]);
    let prod = g.alu(Op::Binary(BinaryOp::Mul), &[x, y]);
    let r = g.reduce(ReduceOp::Sum, prod, &[1]);
    let outs = (0..width)
        .map(|_| {
            let c = g.input("CPU", DType::FLOAT32, &[32, 1]);
            g.alu(Op::Binary(BinaryOp::Add), &[r, c])
        })
        .collect();
    (g, outs)
}

fn independent_kernels(count: usize) -> (LazyGraph, Vec<LbId>) {
    let mut g = LazyGraph::new();
    let outs = (0..count)
        .map(|_| {
            let a = g.input("CPU", DType::FLOAT32, &[16, 16]);
            let b = g.input("CPU", DType::FLOAT32, &[16, 16]);
            let m = g.alu(Op::Binary(BinaryOp::Mul), &[a, b]);
            g.contiguous(m)
        })
        .collect();
    (g, outs)
}

fn bench_elementwise_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("elementwise_chain");
    for depth in [8usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || elementwise_chain(depth),
                |(mut g, outs)| {
                    Scheduler::new(Config::default())
                        .create_schedule(&mut g, &outs, &mut HashSet::new())
                        .unwrap()
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_multioutput_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("multioutput_reduce");
    for width in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter_batched(
                || reduce_group(width),
                |(mut g, outs)| {
                    Scheduler::new(Config::default())
                        .create_schedule(&mut g, &outs, &mut HashSet::new())
                        .unwrap()
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_independent_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("independent_kernels");
    for count in [16usize, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || independent_kernels(count),
                |(mut g, outs)| {
                    Scheduler::new(Config::default())
                        .create_schedule(&mut g, &outs, &mut HashSet::new())
                        .unwrap()
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_elementwise_chain,
    bench_multioutput_reduce,
    bench_independent_kernels
);
criterion_main!(benches);
