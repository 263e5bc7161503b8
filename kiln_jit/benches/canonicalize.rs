//! Canonicalization and Compilation Benchmarks
//!
//! Measures the fixed-point canonicalizer on foldable arithmetic chains, the
//! full tier pipeline plus emission for each target, and the array equality
//! tiers on equal inputs.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use kiln_core::{CompilerOptions, ValueKind};
use kiln_jit::backend::{Target, backend_for, compile};
use kiln_jit::ir::{BinaryOp, Graph, GraphBuilder, NodeKind, Stamp};
use kiln_jit::lir::{ArrayEqualsOp, ArrayEqualsTier};
use kiln_jit::opt::{Canonicalizer, Suites};

/// `x + 1 + 2 + ... + n`, alternating with constant-only subterms that fold.
fn arithmetic_chain(length: usize) -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let mut acc = b.parameter(0, Stamp::int(32));
    for i in 0..length {
        let c = b.int(i as i32);
        let term = if i % 2 == 0 {
            let one = b.int(1);
            b.add(NodeKind::Binary(BinaryOp::Mul), &[c, one])
        } else {
            c
        };
        acc = b.add(NodeKind::Binary(BinaryOp::Add), &[acc, term]);
    }
    b.append_return(Some(acc)).unwrap();
    g
}

// =============================================================================
// Canonicalizer
// =============================================================================

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");
    let options = CompilerOptions::default();

    for length in [16, 128, 1024] {
        let graph = arithmetic_chain(length);
        group.bench_with_input(BenchmarkId::from_parameter(length), &graph, |b, graph| {
            b.iter(|| {
                let mut g = graph.clone();
                black_box(Canonicalizer::new(&options).canonicalize(&mut g).unwrap())
            })
        });
    }

    group.finish();
}

// =============================================================================
// Pipeline and Emission
// =============================================================================

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let options = CompilerOptions::default();
    let graph = arithmetic_chain(128);

    for target in Target::ALL {
        let backend = backend_for(target);
        group.bench_function(BenchmarkId::new("chain_128", target), |b| {
            b.iter(|| {
                let mut g = graph.clone();
                Suites::for_target(target, &options).run(&mut g).unwrap();
                black_box(compile(&g, backend.as_ref(), &options).unwrap())
            })
        });
    }

    group.finish();
}

// =============================================================================
// Array Equality
// =============================================================================

fn bench_array_equals(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_equals");
    let length = 4096;
    let a: Vec<u8> = (0..length).map(|i| (i * 31) as u8).collect();
    let b = a.clone();

    for tier in ArrayEqualsTier::ALL {
        let op = ArrayEqualsOp::new(ValueKind::Byte, tier);
        group.bench_function(BenchmarkId::new("byte_4096", op), |bench| {
            bench.iter(|| black_box(op.evaluate(black_box(&a), black_box(&b), length)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_canonicalize, bench_compile, bench_array_equals);
criterion_main!(benches);
