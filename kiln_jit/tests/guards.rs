//! Guards deoptimize under the same inputs before and after splitting and
//! lowering, and split halves keep the speculation they were created with.

use kiln_core::{AccessSize, CompilerOptions, DeoptAction, DeoptReason, KilnResult, RawMemory, RuntimeCalls, SpeculationReason};
use kiln_jit::backend::Target;
use kiln_jit::ir::{evaluate, CompareOp, EvalOutcome, GuardInfo, Graph, GraphBuilder, NodeKind, Stamp};
use kiln_jit::lowering::speculative_guard;
use kiln_jit::opt::{verify_graph, Canonicalizer, Suites};
use kiln_runtime::SpeculationLog;

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

/// `guard !((p0 == 0) ^ xn || (p1 == 0) ^ yn); return p0`
fn or_guard(info: GuardInfo, x_negated: bool, y_negated: bool) -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let p = b.parameter(0, Stamp::int(32));
    let q = b.parameter(1, Stamp::int(32));
    let zero = b.int(0);
    let a = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[p, zero]);
    let c = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[q, zero]);
    let or = b.add(NodeKind::ShortCircuitOr { x_negated, y_negated }, &[a, c]);
    b.append(NodeKind::FixedGuard(info), &[or]).unwrap();
    b.append_return(Some(p)).unwrap();
    g
}

fn fixed_guards(g: &Graph) -> Vec<GuardInfo> {
    g.iter()
        .filter_map(|(_, n)| match n.kind {
            NodeKind::FixedGuard(info) => Some(info),
            _ => None,
        })
        .collect()
}

fn outcomes(g: &Graph) -> Vec<bool> {
    let mut deopts = Vec::new();
    for p in [0u64, 1] {
        for q in [0u64, 1] {
            deopts.push(evaluate(g, &[p, q], &mut NoMemory).unwrap().is_deopt());
        }
    }
    deopts
}

fn info() -> GuardInfo {
    GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::InvalidateReprofile, true)
}

#[test]
fn test_split_deopts_under_same_inputs() {
    for x_negated in [false, true] {
        for y_negated in [false, true] {
            let original = or_guard(info(), x_negated, y_negated);
            let mut split = original.clone();
            Canonicalizer::new(&CompilerOptions::default()).canonicalize(&mut split).unwrap();
            verify_graph(&split).unwrap();

            assert_eq!(fixed_guards(&split).len(), 2, "xn={x_negated} yn={y_negated}");
            assert!(!split.iter().any(|(_, n)| matches!(n.kind, NodeKind::ShortCircuitOr { .. })));
            assert_eq!(outcomes(&original), outcomes(&split), "xn={x_negated} yn={y_negated}");
        }
    }
}

#[test]
fn test_lowered_guards_deopt_under_same_inputs() {
    let options = CompilerOptions::debug();
    for target in Target::ALL {
        let original = or_guard(info(), false, true);
        let mut lowered = original.clone();
        Suites::for_target(target, &options).run(&mut lowered).unwrap();
        assert!(fixed_guards(&lowered).is_empty(), "{target}");
        assert_eq!(outcomes(&original), outcomes(&lowered), "{target}");
    }
}

#[test]
fn test_split_halves_share_speculation() {
    let log = SpeculationLog::new();
    let info = speculative_guard(
        Some(&log),
        SpeculationReason::new("range_check", 11, 0),
        DeoptReason::NullCheckException,
        DeoptAction::InvalidateReprofile,
        true,
    )
    .unwrap()
    .unwrap();

    let mut g = or_guard(info, false, false);
    Canonicalizer::new(&CompilerOptions::default()).canonicalize(&mut g).unwrap();
    let guards = fixed_guards(&g);
    assert_eq!(guards.len(), 2);
    assert!(guards.iter().all(|guard| guard.speculation == info.speculation));

    // Either half failing reports the original speculation.
    for args in [[0u64, 1], [1, 0]] {
        match evaluate(&g, &args, &mut NoMemory).unwrap() {
            EvalOutcome::Deoptimized(deopt) => assert_eq!(deopt.speculation, info.speculation),
            other => panic!("expected deopt for {args:?}, got {other:?}"),
        }
    }
    assert!(!evaluate(&g, &[1, 1], &mut NoMemory).unwrap().is_deopt());
}
