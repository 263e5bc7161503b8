//! End-to-end compilation of small graphs on every target.

use kiln_core::{CompilerOptions, DeoptAction, DeoptReason, ValueKind};
use kiln_jit::backend::{backend_for, compile, Target};
use kiln_jit::emit::{InfopointReason, RelocationEntry};
use kiln_jit::ir::{
    BinaryOp, CompareOp, DeoptInfo, Graph, GraphBuilder, LocationIdentity, MemoryAccess, NodeKind, Stamp,
};
use kiln_jit::stubs::{ForeignCallDescriptor, ForeignCallStub, StubCache};
use std::sync::Arc;

fn options() -> CompilerOptions {
    CompilerOptions::debug()
}

/// `return x + 1`
fn increment() -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let x = b.parameter(0, Stamp::int(32));
    let one = b.int(1);
    let sum = b.add(NodeKind::Binary(BinaryOp::Add), &[x, one]);
    b.append_return(Some(sum)).unwrap();
    g
}

/// `return x < y ? x : y` built as a diamond.
fn min() -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let x = b.parameter(0, Stamp::int(64));
    let y = b.parameter(1, Stamp::int(64));
    let less = b.add(NodeKind::Compare(CompareOp::IntegerLessThan), &[x, y]);
    let mut scope = b.begin_if(less, 0.5).unwrap();
    b.else_branch(&mut scope).unwrap();
    let join = b.end_if(scope).unwrap();
    let result = b.merge_value(&join, x, y);
    b.append_return(Some(result)).unwrap();
    g
}

/// `if x == 0 deoptimize; return x`
fn deopt_on_zero() -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let x = b.parameter(0, Stamp::int(32));
    let zero = b.int(0);
    let is_zero = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[x, zero]);
    let mut scope = b.begin_if(is_zero, 0.01).unwrap();
    b.append_deopt(DeoptInfo::new(DeoptReason::ArithmeticException, DeoptAction::InvalidateRecompile))
        .unwrap();
    b.else_branch(&mut scope).unwrap();
    b.end_if(scope).unwrap();
    b.append_return(Some(x)).unwrap();
    g
}

/// `return *(p0 + p1)`
fn indexed_load() -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let base = b.parameter(0, Stamp::word());
    let offset = b.parameter(1, Stamp::word());
    let address = b.add(NodeKind::OffsetAddress, &[base, offset]);
    let value = b.read(LocationIdentity::Any, MemoryAccess::WORD, address).unwrap();
    b.append_return(Some(value)).unwrap();
    g
}

#[test]
fn test_increment_compiles_on_every_target() {
    for target in Target::ALL {
        let backend = backend_for(target);
        let result = compile(&increment(), backend.as_ref(), &options()).unwrap();
        assert_eq!(result.target, target);
        assert!(!result.code.is_empty(), "{target}: no code");
        assert!(result.relocations.is_empty(), "{target}: unexpected relocations");
        assert_eq!(result.frame_size % 16, 0);
    }
}

#[test]
fn test_prologue_shapes() {
    let graph = increment();

    let amd64 = compile(&graph, backend_for(Target::Amd64).as_ref(), &options()).unwrap();
    assert_eq!(amd64.code[0], 0x55, "push rbp");

    let aarch64 = compile(&graph, backend_for(Target::AArch64).as_ref(), &options()).unwrap();
    let first = u32::from_le_bytes([aarch64.code[0], aarch64.code[1], aarch64.code[2], aarch64.code[3]]);
    assert_eq!(first, 0xA9BF_7BFD, "stp x29, x30, [sp, #-16]!");
    assert_eq!(aarch64.code.len() % 4, 0);

    let sparc = compile(&graph, backend_for(Target::Sparc).as_ref(), &options()).unwrap();
    let first = u32::from_be_bytes([sparc.code[0], sparc.code[1], sparc.code[2], sparc.code[3]]);
    assert_eq!(first & 0xFFFF_E000, 0x9DE3_A000, "save %sp, -n, %sp");
    assert_eq!(sparc.code.len() % 4, 0);
}

#[test]
fn test_dynamic_offset_load_compiles_on_every_target() {
    for target in Target::ALL {
        let result = compile(&indexed_load(), backend_for(target).as_ref(), &options()).unwrap();
        assert!(!result.code.is_empty(), "{target}");
    }
}

#[test]
fn test_diamond_compiles_on_every_target() {
    for target in Target::ALL {
        let result = compile(&min(), backend_for(target).as_ref(), &options()).unwrap();
        assert!(!result.code.is_empty());
    }
}

#[test]
fn test_deopt_records_infopoint_and_relocation() {
    for target in Target::ALL {
        let result = compile(&deopt_on_zero(), backend_for(target).as_ref(), &options()).unwrap();
        assert_eq!(result.relocations_to("deoptimize").count(), 1, "{target}");
        assert!(
            result.infopoints.iter().any(|p| p.reason == InfopointReason::Deopt),
            "{target}: no deopt infopoint"
        );
    }
}

#[test]
fn test_relocation_records_serialize_back_to_back() {
    let result = compile(&deopt_on_zero(), backend_for(Target::Amd64).as_ref(), &options()).unwrap();
    let bytes = result.encoded_relocations();
    assert_eq!(bytes.len(), result.relocations.len() * RelocationEntry::ENCODED_SIZE);
    for (i, reloc) in result.relocations.iter().enumerate() {
        let at = i * RelocationEntry::ENCODED_SIZE;
        assert_eq!(RelocationEntry::decode(&bytes[at..]).unwrap(), *reloc);
        assert!((reloc.offset as usize) < result.code.len());
    }
}

#[test]
fn test_stub_graph_compiles_on_every_target() {
    let descriptor = Arc::new(
        ForeignCallDescriptor::new("new_instance", &[ValueKind::Object], ValueKind::Object).with_thread(),
    );
    let graph = ForeignCallStub::new(Arc::clone(&descriptor), options())
        .build_graph()
        .unwrap();
    for target in Target::ALL {
        let result = compile(&graph, backend_for(target).as_ref(), &options()).unwrap();
        assert_eq!(result.relocations_to("new_instance:C").count(), 1, "{target}");
        assert_eq!(result.relocations_to("deoptimize").count(), 1, "{target}");
        assert!(result.infopoints.iter().any(|p| p.reason == InfopointReason::Call));
    }
}

#[test]
fn test_stub_cache_shares_graphs_across_targets() {
    let cache = StubCache::new(options(), kiln_gc::ThreadLayout::default());
    let descriptor = Arc::new(ForeignCallDescriptor::new("identity_hash", &[ValueKind::Object], ValueKind::Int));
    let graph = cache.get_or_build(&descriptor).unwrap();
    for target in Target::ALL {
        let again = cache.get_or_build(&descriptor).unwrap();
        assert!(Arc::ptr_eq(&graph, &again));
        compile(&again, backend_for(target).as_ref(), &options()).unwrap();
    }
    assert_eq!(cache.len(), 1);
}
