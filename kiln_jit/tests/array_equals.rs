//! Array equality: every tier agrees with element-wise comparison, and each
//! backend either inlines the operation or calls the runtime routine.

use kiln_core::{CompilerOptions, ValueKind};
use kiln_jit::backend::{backend_for, compile, Target};
use kiln_jit::ir::{Graph, GraphBuilder, NodeKind, Stamp};
use kiln_jit::lir::{ArrayEqualsOp, ArrayEqualsTier};
use proptest::prelude::*;

const LENGTHS: [usize; 8] = [0, 1, 7, 8, 9, 31, 32, 33];

const KINDS: [ValueKind; 6] = [
    ValueKind::Byte,
    ValueKind::Char,
    ValueKind::Int,
    ValueKind::Long,
    ValueKind::Float,
    ValueKind::Double,
];

/// Element-wise reference: equal bits, or two NaNs for float kinds.
fn reference(kind: ValueKind, a: &[u8], b: &[u8], length: usize) -> bool {
    let size = kind.byte_size() as usize;
    let bytes = length * size;
    if a.len() < bytes || b.len() < bytes {
        return false;
    }
    a[..bytes].chunks_exact(size).zip(b[..bytes].chunks_exact(size)).all(|(x, y)| {
        x == y
            || match kind {
                ValueKind::Float => {
                    let p = f32::from_le_bytes([x[0], x[1], x[2], x[3]]);
                    let q = f32::from_le_bytes([y[0], y[1], y[2], y[3]]);
                    p.is_nan() && q.is_nan()
                }
                ValueKind::Double => {
                    let mut p = [0u8; 8];
                    let mut q = [0u8; 8];
                    p.copy_from_slice(x);
                    q.copy_from_slice(y);
                    f64::from_le_bytes(p).is_nan() && f64::from_le_bytes(q).is_nan()
                }
                _ => false,
            }
    })
}

fn ops(kind: ValueKind) -> impl Iterator<Item = ArrayEqualsOp> {
    ArrayEqualsTier::ALL.into_iter().map(move |tier| ArrayEqualsOp::new(kind, tier))
}

#[test]
fn test_tiers_at_width_boundaries() {
    for kind in KINDS {
        let size = kind.byte_size() as usize;
        for length in LENGTHS {
            let a: Vec<u8> = (0..length * size).map(|i| (i * 7 + 1) as u8).collect();
            for op in ops(kind) {
                assert!(op.evaluate(&a, &a, length), "{op} length {length}");
            }
            // Flip one bit in each element in turn.
            for element in 0..length {
                let mut b = a.clone();
                b[element * size] ^= 0x01;
                let expected = reference(kind, &a, &b, length);
                for op in ops(kind) {
                    assert_eq!(op.evaluate(&a, &b, length), expected, "{op} length {length} element {element}");
                }
            }
        }
    }
}

#[test]
fn test_nan_payloads_compare_equal() {
    for length in LENGTHS.into_iter().filter(|&l| l > 0) {
        let a: Vec<u8> = (0..length)
            .flat_map(|i| (if i == length / 2 { f64::NAN } else { i as f64 }).to_le_bytes())
            .collect();
        let mut b = a.clone();
        let at = (length / 2) * 8;
        b[at..at + 8].copy_from_slice(&f64::from_bits(0x7FF8_0000_0000_0042).to_le_bytes());
        for op in ops(ValueKind::Double) {
            assert!(op.evaluate(&a, &b, length), "{op} length {length}");
        }
        // Signed zeros differ bitwise and are not NaN.
        let mut c = a.clone();
        let last = (length - 1) * 8;
        if length / 2 != length - 1 {
            c[last..last + 8].copy_from_slice(&(-0.0f64).to_le_bytes());
            let mut d = a.clone();
            d[last..last + 8].copy_from_slice(&0.0f64.to_le_bytes());
            for op in ops(ValueKind::Double) {
                assert!(!op.evaluate(&c, &d, length), "{op} length {length}");
            }
        }
    }
}

proptest! {
    #[test]
    fn test_tiers_match_reference(
        kind_index in 0usize..KINDS.len(),
        length_index in 0usize..LENGTHS.len(),
        seed in proptest::collection::vec(any::<u8>(), 33 * 8),
        flips in proptest::collection::vec((0usize..33 * 8, any::<u8>()), 0..3),
    ) {
        let kind = KINDS[kind_index];
        let length = LENGTHS[length_index];
        let bytes = length * kind.byte_size() as usize;
        let a = seed[..bytes].to_vec();
        let mut b = a.clone();
        for (at, mask) in flips {
            if bytes > 0 {
                b[at % bytes] ^= mask;
            }
        }
        let expected = reference(kind, &a, &b, length);
        for op in ops(kind) {
            prop_assert_eq!(op.evaluate(&a, &b, length), expected, "{}", op);
        }
    }
}

/// `return ArrayEquals(p0, p1, p2)`
fn array_equals_graph(kind: ValueKind) -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let a = b.parameter(0, Stamp::word());
    let c = b.parameter(1, Stamp::word());
    let length = b.parameter(2, Stamp::int(32));
    let equal = b
        .append_with_stamp(NodeKind::ArrayEquals { kind }, &[a, c, length], Stamp::boolean())
        .unwrap();
    b.append_return(Some(equal)).unwrap();
    g
}

#[test]
fn test_amd64_inlines_every_width() {
    for max_vector_bytes in [8, 16, 32] {
        let options = CompilerOptions {
            max_vector_bytes,
            ..CompilerOptions::debug()
        };
        for kind in [ValueKind::Byte, ValueKind::Float, ValueKind::Double] {
            let result = compile(&array_equals_graph(kind), backend_for(Target::Amd64).as_ref(), &options).unwrap();
            assert_eq!(result.relocations.len(), 0, "{kind} at {max_vector_bytes}");
        }
    }
}

#[test]
fn test_other_targets_call_runtime() {
    for target in [Target::AArch64, Target::Sparc] {
        let result = compile(
            &array_equals_graph(ValueKind::Int),
            backend_for(target).as_ref(),
            &CompilerOptions::debug(),
        )
        .unwrap();
        assert_eq!(result.relocations_to("array_equals_int").count(), 1, "{target}");
    }
}
