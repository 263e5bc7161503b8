//! Canonicalization keeps behaviour, converges, and leaves a graph that
//! still passes verification.

use kiln_core::{AccessSize, CompilerOptions, KilnResult, RawMemory, RuntimeCalls};
use kiln_jit::ir::{evaluate, BinaryOp, CompareOp, Graph, GraphBuilder, NodeId, NodeKind, Stamp};
use kiln_jit::opt::{verify_graph, Canonicalizer};
use proptest::prelude::*;

struct NoMemory;

impl RawMemory for NoMemory {
    fn read(&self, _: u64, _: AccessSize) -> u64 {
        0
    }
    fn write(&mut self, _: u64, _: AccessSize, _: u64) {}
}

impl RuntimeCalls for NoMemory {
    fn call(&mut self, symbol: &str, _: &[u64]) -> KilnResult<u64> {
        Err(kiln_core::KilnError::internal(format!("unexpected call {symbol}")))
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Param(u32),
    Const(i32),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Select(CompareOp, Box<Expr>, Box<Expr>, Box<Expr>, Box<Expr>),
}

fn binary_op() -> impl Strategy<Value = BinaryOp> {
    prop_oneof![
        Just(BinaryOp::Add),
        Just(BinaryOp::Sub),
        Just(BinaryOp::Mul),
        Just(BinaryOp::And),
        Just(BinaryOp::Or),
        Just(BinaryOp::Xor),
        Just(BinaryOp::Shl),
        Just(BinaryOp::Shr),
        Just(BinaryOp::UShr),
    ]
}

fn compare_op() -> impl Strategy<Value = CompareOp> {
    prop_oneof![
        Just(CompareOp::IntegerEquals),
        Just(CompareOp::IntegerLessThan),
        Just(CompareOp::IntegerBelow),
        Just(CompareOp::IntegerTest),
    ]
}

fn expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (0u32..2).prop_map(Expr::Param),
        prop_oneof![Just(0), Just(1), Just(-1), any::<i32>()].prop_map(Expr::Const),
    ];
    leaf.prop_recursive(4, 24, 4, |inner| {
        prop_oneof![
            3 => (binary_op(), inner.clone(), inner.clone())
                .prop_map(|(op, x, y)| Expr::Binary(op, Box::new(x), Box::new(y))),
            1 => (compare_op(), inner.clone(), inner.clone(), inner.clone(), inner)
                .prop_map(|(op, a, b, x, y)| Expr::Select(op, Box::new(a), Box::new(b), Box::new(x), Box::new(y))),
        ]
    })
}

fn lower(b: &mut GraphBuilder<'_>, params: &[NodeId], e: &Expr) -> NodeId {
    match e {
        Expr::Param(i) => params[*i as usize],
        Expr::Const(c) => b.int(*c),
        Expr::Binary(op, x, y) => {
            let x = lower(b, params, x);
            let y = lower(b, params, y);
            b.add(NodeKind::Binary(*op), &[x, y])
        }
        Expr::Select(op, l, r, x, y) => {
            let l = lower(b, params, l);
            let r = lower(b, params, r);
            let x = lower(b, params, x);
            let y = lower(b, params, y);
            let condition = b.add(NodeKind::Compare(*op), &[l, r]);
            b.add(NodeKind::Conditional, &[condition, x, y])
        }
    }
}

fn graph_of(e: &Expr) -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let params = [b.parameter(0, Stamp::int(32)), b.parameter(1, Stamp::int(32))];
    let value = lower(&mut b, &params, e);
    b.append_return(Some(value)).unwrap();
    g
}

fn run(g: &Graph, x: i32, y: i32) -> Option<u32> {
    evaluate(g, &[x as u32 as u64, y as u32 as u64], &mut NoMemory)
        .unwrap()
        .value()
        .map(|v| v as u32)
}

proptest! {
    #[test]
    fn test_canonicalization_preserves_results(e in expr(), x in any::<i32>(), y in any::<i32>()) {
        let original = graph_of(&e);
        let mut canonical = original.clone();
        Canonicalizer::new(&CompilerOptions::default()).canonicalize(&mut canonical).unwrap();
        verify_graph(&canonical).unwrap();
        prop_assert_eq!(run(&original, x, y), run(&canonical, x, y));
    }

    #[test]
    fn test_canonicalization_is_idempotent(e in expr()) {
        let mut g = graph_of(&e);
        let mut canonicalizer = Canonicalizer::new(&CompilerOptions::default());
        canonicalizer.canonicalize(&mut g).unwrap();
        let live = g.live_count();
        prop_assert!(!canonicalizer.canonicalize(&mut g).unwrap());
        prop_assert_eq!(g.live_count(), live);
    }
}

#[test]
fn test_constant_expression_folds_to_one_node() {
    let e = Expr::Binary(
        BinaryOp::Mul,
        Box::new(Expr::Binary(BinaryOp::Add, Box::new(Expr::Const(3)), Box::new(Expr::Const(4)))),
        Box::new(Expr::Const(6)),
    );
    let mut g = graph_of(&e);
    Canonicalizer::new(&CompilerOptions::default()).canonicalize(&mut g).unwrap();
    let ret = g.iter().find(|(_, n)| matches!(n.kind, NodeKind::Return)).unwrap().1;
    let value = ret.input(0).unwrap();
    assert_eq!(g.as_integer(value), Some(42));
}

#[test]
fn test_shift_by_width_is_identity() {
    let e = Expr::Binary(BinaryOp::Shl, Box::new(Expr::Param(0)), Box::new(Expr::Const(32)));
    let original = graph_of(&e);
    let mut g = original.clone();
    Canonicalizer::new(&CompilerOptions::default()).canonicalize(&mut g).unwrap();
    for x in [0, 1, -7, i32::MAX] {
        assert_eq!(run(&g, x, 0), Some(x as u32));
        assert_eq!(run(&original, x, 0), Some(x as u32));
    }
}
