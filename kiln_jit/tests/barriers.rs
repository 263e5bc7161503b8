//! Lowered write barriers running against the simulated barrier heap, and
//! barrier-carrying graphs compiled through the full tier pipeline.

use kiln_core::{AccessSize, CompilerOptions, RawMemory};
use kiln_gc::{card_address, BarrierConfig, BarrierHeap, ThreadLayout};
use kiln_jit::backend::{backend_for, compile, Target};
use kiln_jit::ir::{BarrierKind, Evaluator, Graph, GraphBuilder, LocationIdentity, MemoryAccess, NodeId, NodeKind, Stamp};
use kiln_jit::lowering::{BarrierSet, BarrierSnippets, WriteBarrierAdditionPhase};
use kiln_jit::opt::{verify_integrity, Suites};
use kiln_jit::Phase;

/// Two-entry card queue so a handful of stores overflows it.
fn heap() -> BarrierHeap {
    BarrierHeap::new(
        BarrierConfig {
            heap_size: 4 << 20,
            satb_buffer_bytes: 2 * 8,
            card_buffer_bytes: 2 * 8,
            ..Default::default()
        },
        ThreadLayout::default(),
    )
    .unwrap()
}

/// `p0.field16 = p1`
fn store(object_stamp: Stamp) -> Graph {
    let mut g = Graph::new();
    let mut b = GraphBuilder::new(&mut g);
    let object = b.parameter(0, object_stamp);
    let value = b.parameter(1, Stamp::object());
    let offset = b.long(16);
    let field = b.add(NodeKind::OffsetAddress, &[object, offset]);
    b.append(
        NodeKind::Write {
            location: LocationIdentity::Any,
            access: MemoryAccess::OBJECT,
            barrier: BarrierKind::Precise,
        },
        &[field, value],
    )
    .unwrap();
    b.append_return(None).unwrap();
    g
}

fn lowered(barrier_set: BarrierSet, heap: &BarrierHeap) -> Graph {
    let mut g = store(Stamp::word());
    WriteBarrierAdditionPhase::new(barrier_set).run(&mut g).unwrap();
    let snippets = BarrierSnippets::new(heap.config().clone(), heap.layout().clone()).unwrap();
    let barriers: Vec<NodeId> = g
        .iter()
        .filter(|(_, n)| n.kind.is_write_barrier())
        .map(|(id, _)| id)
        .collect();
    for id in barriers {
        assert!(snippets.lower(&mut g, id).unwrap());
    }
    verify_integrity(&g).unwrap();
    g
}

#[test]
fn test_g1_post_flushes_full_card_queue() {
    let mut heap = heap();
    let g = lowered(BarrierSet::G1, &heap);
    let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

    let base = heap.config().heap_base;
    let card_size = heap.config().card_size();
    let value = base + (2 << 20);
    let objects: Vec<u64> = (0..3).map(|i| base + i * card_size).collect();
    let expected: Vec<u64> = objects.iter().map(|&o| card_address(heap.config(), o + 16)).collect();

    // Two stores fill the buffer on the fast path.
    for &object in &objects[..2] {
        eval.run(&[object, value], &mut heap).unwrap();
        assert_eq!(heap.read(object + 16, AccessSize::Quad), value);
    }
    assert_eq!(heap.stats().post_slow_calls, 0);
    assert!(heap.card_queue().is_full(&heap));

    // The third finds it full and calls the runtime once.
    eval.run(&[objects[2], value], &mut heap).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.post_slow_calls, 1, "{stats:?}");
    assert_eq!(stats.cards_enqueued, 1);
    assert_eq!(heap.flush_counts().1, 1);
    assert_eq!(stats.faults, 0);
    for card in &expected {
        let index = heap.cards().index_of_card_address(*card).unwrap();
        assert!(heap.cards().is_dirty(index));
    }

    assert_eq!(heap.drain_dirty_cards(), expected);

    // Cards are already dirty: nothing queued the second time round.
    for &object in &objects {
        eval.run(&[object, value], &mut heap).unwrap();
    }
    assert!(heap.drain_dirty_cards().is_empty());
}

#[test]
fn test_g1_post_skips_null_and_young() {
    let mut heap = heap();
    let g = lowered(BarrierSet::G1, &heap);
    let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

    let base = heap.config().heap_base;
    let object = base + 0x1000;
    eval.run(&[object, 0], &mut heap).unwrap();
    assert!(heap.drain_dirty_cards().is_empty());

    heap.mark_young(base, 1 << 20);
    eval.run(&[object, base + (3 << 20)], &mut heap).unwrap();
    assert!(heap.drain_dirty_cards().is_empty());
    assert_eq!(heap.stats().post_slow_calls, 0);
}

#[test]
fn test_serial_barrier_dirties_without_queueing() {
    let mut heap = heap();
    let g = lowered(BarrierSet::CardTable, &heap);

    let base = heap.config().heap_base;
    let card_size = heap.config().card_size();
    for i in 0..4 {
        let object = base + i * card_size;
        Evaluator::new(&g).unwrap().run(&[object, base + 0x40], &mut heap).unwrap();
        let index = heap.cards().card_index(object + 16).unwrap();
        assert!(heap.cards().is_dirty(index));
    }
    assert_eq!(heap.cards().dirty_count(), 4);
    assert!(heap.drain_dirty_cards().is_empty());
}

#[test]
fn test_pipeline_store_calls_barrier_runtime_on_every_target() {
    let options = CompilerOptions::debug();
    for target in Target::ALL {
        let mut g = store(Stamp::object());
        Suites::for_target(target, &options).run(&mut g).unwrap();
        let result = compile(&g, backend_for(target).as_ref(), &options).unwrap();
        assert!(result.relocations_to("g1_card_enqueue").count() >= 1, "{target}");
        assert!(result.relocations_to("g1_satb_enqueue").count() >= 1, "{target}");
    }
}
