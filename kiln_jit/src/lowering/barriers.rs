//! Garbage collector write barriers.
//!
//! Barrier insertion and barrier lowering are separate steps:
//!
//! - [`WriteBarrierAdditionPhase`] runs at the mid tier and wraps every
//!   reference [`Write`](NodeKind::Write) with the barrier nodes the
//!   configured collector needs.
//! - [`BarrierSnippets`] replaces those nodes at the low tier with snippet
//!   bodies reading the card table and the thread's queues directly.
//!
//! # Card Table (serial)
//!
//! ```text
//! card_start[addr >>> card_shift] = dirty
//! ```
//!
//! # G1
//!
//! The pre barrier logs the overwritten value into the SATB queue while
//! marking is active. The post barrier dirties the card of a cross-region
//! store and logs the card address. Between the young-card check and the
//! dirty check it fences and reloads the card, since the refinement thread
//! may clean it concurrently. Both queues spill into the runtime when the
//! thread-local buffer is full.

use super::snippet::{SnippetArguments, SnippetCache, SnippetParameter, SnippetTemplate};
use crate::ir::builder::GraphBuilder;
use crate::ir::graph::Graph;
use crate::ir::kinds::{
    BarrierKind, BinaryOp, CompareOp, DeoptInfo, LocationIdentity, MemoryAccess, MemoryBarriers, NodeKind,
    RegisterRole,
};
use crate::ir::node::NodeId;
use crate::ir::stamp::Stamp;
use crate::opt::Phase;
use crate::stubs::ForeignCallDescriptor;
use kiln_core::{AccessSize, Constant, DeoptAction, DeoptReason, KilnError, KilnResult, ValueKind};
use kiln_gc::{BarrierConfig, BarrierRuntimeCall, ThreadLayout};
use std::sync::Arc;

/// Probability of taking a barrier's slow path.
const SLOW_PATH_PROBABILITY: f64 = 0.01;
/// Probability that a barrier has nothing to do.
const FAST_EXIT_PROBABILITY: f64 = 0.9;

/// Which collector the compiled code runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BarrierSet {
    /// No write barriers.
    #[default]
    None,
    /// Serial card marking.
    CardTable,
    /// G1: SATB pre barrier and card-queue post barrier.
    G1,
}

// =============================================================================
// Barrier Addition
// =============================================================================

/// Surrounds reference stores with barrier nodes. A processed store's
/// barrier kind is reset to [`BarrierKind::None`], so the phase is
/// idempotent.
#[derive(Debug, Clone, Copy)]
pub struct WriteBarrierAdditionPhase {
    barrier_set: BarrierSet,
}

impl WriteBarrierAdditionPhase {
    pub fn new(barrier_set: BarrierSet) -> Self {
        Self { barrier_set }
    }

    fn add_barriers(&self, graph: &mut Graph, write: NodeId) -> KilnResult<()> {
        let NodeKind::Write { location, access, barrier } = graph.kind(write).clone() else {
            return Ok(());
        };
        let precise = barrier == BarrierKind::Precise;
        let address = input(graph, write, 0)?;
        let value = input(graph, write, 1)?;
        let card_address = if precise { address } else { object_base(graph, address) };
        let position = graph.node(write).position.clone();

        let mut added = Vec::new();
        match self.barrier_set {
            BarrierSet::None => {}
            BarrierSet::CardTable => {
                let post = graph.add_fixed(NodeKind::SerialWriteBarrier { precise }, &[card_address]);
                graph.add_after_fixed(write, post)?;
                added.push(post);
            }
            BarrierSet::G1 => {
                let pre = graph.add_fixed(
                    NodeKind::G1PreWriteBarrier {
                        do_load: true,
                        null_check: false,
                    },
                    &[address],
                );
                graph.add_before_fixed(write, pre)?;
                let post = graph.add_fixed(NodeKind::G1PostWriteBarrier { precise }, &[card_address, value]);
                graph.add_after_fixed(write, post)?;
                added.extend([pre, post]);
            }
        }
        for id in added {
            graph.node_mut(id).position = position.clone();
        }
        graph.node_mut(write).kind = NodeKind::Write {
            location,
            access,
            barrier: BarrierKind::None,
        };
        Ok(())
    }
}

impl Phase for WriteBarrierAdditionPhase {
    fn name(&self) -> &'static str {
        "WriteBarrierAddition"
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        if self.barrier_set == BarrierSet::None {
            return Ok(false);
        }
        let writes: Vec<NodeId> = graph
            .iter()
            .filter(|(_, n)| {
                matches!(
                    n.kind,
                    NodeKind::Write { access, barrier, .. } if access.object && barrier != BarrierKind::None
                )
            })
            .map(|(id, _)| id)
            .collect();
        for &write in &writes {
            self.add_barriers(graph, write)?;
        }
        log::debug!("write barrier addition: {} stores", writes.len());
        Ok(!writes.is_empty())
    }
}

/// Base object of a field address, for imprecise card marks.
fn object_base(graph: &Graph, address: NodeId) -> NodeId {
    match graph.kind(address) {
        NodeKind::OffsetAddress => graph.node(address).input(0).unwrap_or(address),
        _ => address,
    }
}

fn input(graph: &Graph, id: NodeId, index: usize) -> KilnResult<NodeId> {
    graph
        .node(id)
        .input(index)
        .ok_or_else(|| KilnError::internal_at(id.index(), "barrier input missing"))
}

// =============================================================================
// Barrier Snippets
// =============================================================================

const SERIAL: &str = "serial_write_barrier";
const SERIAL_RANGE: &str = "serial_array_range_write_barrier";
const G1_PRE: &str = "g1_pre_write_barrier";
const G1_PRE_NULL_CHECK: &str = "g1_pre_write_barrier_null_check";
const G1_PRE_EXPECTED: &str = "g1_pre_write_barrier_expected";
const G1_POST: &str = "g1_post_write_barrier";
const G1_RANGE_PRE: &str = "g1_array_range_pre_write_barrier";
const G1_RANGE_POST: &str = "g1_array_range_post_write_barrier";

/// Foreign call descriptor of a barrier runtime entry.
pub fn runtime_descriptor(call: BarrierRuntimeCall) -> Arc<ForeignCallDescriptor> {
    let params: &[ValueKind] = match call {
        BarrierRuntimeCall::SatbEnqueue => &[ValueKind::Object],
        BarrierRuntimeCall::CardEnqueue => &[ValueKind::Long],
    };
    Arc::new(ForeignCallDescriptor::new(call.symbol(), params, ValueKind::Void).reexecutable())
}

/// Lowers barrier nodes by instantiating cached snippet templates.
#[derive(Debug)]
pub struct BarrierSnippets {
    config: BarrierConfig,
    layout: ThreadLayout,
    cache: SnippetCache,
}

impl BarrierSnippets {
    pub fn new(config: BarrierConfig, layout: ThreadLayout) -> KilnResult<Self> {
        config
            .validate()
            .map_err(|e| KilnError::config(format!("barrier config: {e}")))?;
        layout
            .validate(config.word_size)
            .map_err(|e| KilnError::config(format!("thread layout: {e}")))?;
        Ok(Self {
            config,
            layout,
            cache: SnippetCache::new(),
        })
    }

    /// Snippets for the default heap geometry and thread layout.
    pub fn with_defaults() -> Self {
        Self {
            config: BarrierConfig::default(),
            layout: ThreadLayout::default(),
            cache: SnippetCache::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// Templates built so far.
    pub fn cache(&self) -> &SnippetCache {
        &self.cache
    }

    /// Replace barrier node `node` with its snippet. Returns false for
    /// other kinds.
    pub fn lower(&self, graph: &mut Graph, node: NodeId) -> KilnResult<bool> {
        let mut args = SnippetArguments::new();
        let name = match *graph.kind(node) {
            NodeKind::SerialWriteBarrier { .. } => {
                args.bind_value("address", input(graph, node, 0)?);
                SERIAL
            }
            NodeKind::SerialArrayRangeWriteBarrier { element_stride } => {
                self.bind_range(graph, node, element_stride, &mut args)?;
                SERIAL_RANGE
            }
            NodeKind::G1PreWriteBarrier { do_load, null_check } => {
                args.bind_value("address", input(graph, node, 0)?);
                if !do_load {
                    args.bind_value("expected", input(graph, node, 1)?);
                    G1_PRE_EXPECTED
                } else if null_check {
                    G1_PRE_NULL_CHECK
                } else {
                    G1_PRE
                }
            }
            NodeKind::G1PostWriteBarrier { .. } => {
                args.bind_value("address", input(graph, node, 0)?)
                    .bind_value("value", input(graph, node, 1)?);
                G1_POST
            }
            NodeKind::G1ArrayRangePreWriteBarrier { element_stride } => {
                self.bind_range(graph, node, element_stride, &mut args)?;
                G1_RANGE_PRE
            }
            NodeKind::G1ArrayRangePostWriteBarrier { element_stride } => {
                self.bind_range(graph, node, element_stride, &mut args)?;
                G1_RANGE_POST
            }
            _ => return Ok(false),
        };
        let template = self.cache.get_or_build(name, || self.build(name))?;
        template.instantiate(graph, node, &args)?;
        Ok(true)
    }

    fn bind_range(
        &self,
        graph: &Graph,
        node: NodeId,
        stride: i32,
        args: &mut SnippetArguments,
    ) -> KilnResult<()> {
        args.bind_value("address", input(graph, node, 0)?)
            .bind_value("length", input(graph, node, 1)?)
            .bind_constant("stride", Constant::Long(i64::from(stride)));
        Ok(())
    }

    fn build(&self, name: &'static str) -> KilnResult<SnippetTemplate> {
        let address = SnippetParameter::value("address", Stamp::word());
        let value = SnippetParameter::value("value", Stamp::object());
        let expected = SnippetParameter::value("expected", Stamp::object());
        let length = SnippetParameter::value("length", Stamp::int(32));
        let stride = SnippetParameter::constant("stride", Stamp::word());
        let cx = SnippetContext {
            config: &self.config,
            layout: &self.layout,
        };
        match name {
            SERIAL => SnippetTemplate::build(name, &[address], |b, p| {
                cx.mark_card(b, p[0])?;
                b.append_return(None)?;
                Ok(())
            }),
            SERIAL_RANGE => SnippetTemplate::build(name, &[address, length, stride], |b, p| cx.serial_range(b, p)),
            G1_PRE => SnippetTemplate::build(name, &[address], |b, p| cx.g1_pre(b, p[0], None, false)),
            G1_PRE_NULL_CHECK => SnippetTemplate::build(name, &[address], |b, p| cx.g1_pre(b, p[0], None, true)),
            G1_PRE_EXPECTED => {
                SnippetTemplate::build(name, &[address, expected], |b, p| cx.g1_pre(b, p[0], Some(p[1]), false))
            }
            G1_POST => SnippetTemplate::build(name, &[address, value], |b, p| cx.g1_post(b, p[0], p[1])),
            G1_RANGE_PRE => SnippetTemplate::build(name, &[address, length, stride], |b, p| cx.g1_range_pre(b, p)),
            G1_RANGE_POST => SnippetTemplate::build(name, &[address, length, stride], |b, p| cx.g1_range_post(b, p)),
            other => Err(KilnError::snippet(other, "unknown barrier snippet")),
        }
    }
}

/// Shared pieces of the barrier snippet bodies.
struct SnippetContext<'a> {
    config: &'a BarrierConfig,
    layout: &'a ThreadLayout,
}

impl SnippetContext<'_> {
    fn word(&self) -> MemoryAccess {
        MemoryAccess {
            size: if self.config.word_size == 4 {
                AccessSize::Word
            } else {
                AccessSize::Quad
            },
            signed: false,
            object: false,
        }
    }

    fn thread(&self, b: &mut GraphBuilder<'_>) -> KilnResult<NodeId> {
        b.append_with_stamp(NodeKind::ReadRegister(RegisterRole::Thread), &[], Stamp::word())
    }

    fn thread_field(&self, b: &mut GraphBuilder<'_>, thread: NodeId, offset: i32) -> NodeId {
        let offset = b.long(i64::from(offset));
        b.add(NodeKind::OffsetAddress, &[thread, offset])
    }

    fn equals(&self, b: &mut GraphBuilder<'_>, x: NodeId, y: NodeId) -> NodeId {
        b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[x, y])
    }

    /// `card_start + (address >>> card_shift)`
    fn card_address(&self, b: &mut GraphBuilder<'_>, address: NodeId) -> NodeId {
        let shift = b.int(self.config.card_shift as i32);
        let card = b.add(NodeKind::Binary(BinaryOp::UShr), &[address, shift]);
        let start = b.long(self.config.card_start() as i64);
        b.add(NodeKind::Binary(BinaryOp::Add), &[card, start])
    }

    fn mark_card(&self, b: &mut GraphBuilder<'_>, address: NodeId) -> KilnResult<()> {
        let card = self.card_address(b, address);
        let dirty = b.int(i32::from(self.config.dirty_card));
        b.write(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card, dirty)?;
        Ok(())
    }

    /// First and last element addresses of `length` elements spaced
    /// `stride` bytes apart. With a negative stride `address` is one
    /// element past the range and the elements lie below it.
    fn range_bounds(&self, b: &mut GraphBuilder<'_>, address: NodeId, length: NodeId, stride: NodeId) -> (NodeId, NodeId) {
        let one = b.long(1);
        let wide = b.add(NodeKind::SignExtend { from: 32, to: 64 }, &[length]);
        let count = b.add(NodeKind::Binary(BinaryOp::Sub), &[wide, one]);
        let span = b.add(NodeKind::Binary(BinaryOp::Mul), &[count, stride]);
        let upper_last = b.add(NodeKind::Binary(BinaryOp::Add), &[address, span]);
        let full_span = b.add(NodeKind::Binary(BinaryOp::Mul), &[wide, stride]);
        let lower_first = b.add(NodeKind::Binary(BinaryOp::Add), &[address, full_span]);
        let lower_last = b.add(NodeKind::Binary(BinaryOp::Add), &[address, stride]);
        let zero = b.long(0);
        let downwards = b.add(NodeKind::Compare(CompareOp::IntegerLessThan), &[stride, zero]);
        let first = b.add(NodeKind::Conditional, &[downwards, lower_first, address]);
        let last = b.add(NodeKind::Conditional, &[downwards, lower_last, upper_last]);
        (first, last)
    }

    /// `|stride|`
    fn step(&self, b: &mut GraphBuilder<'_>, stride: NodeId) -> NodeId {
        let zero = b.long(0);
        let downwards = b.add(NodeKind::Compare(CompareOp::IntegerLessThan), &[stride, zero]);
        let negated = b.add(NodeKind::Negate, &[stride]);
        b.add(NodeKind::Conditional, &[downwards, negated, stride])
    }

    /// Push `value` on the queue whose index and buffer live at the given
    /// thread offsets, calling `slow` when the buffer is full.
    fn enqueue(
        &self,
        b: &mut GraphBuilder<'_>,
        thread: NodeId,
        index_offset: i32,
        buffer_offset: i32,
        value: NodeId,
        slow: BarrierRuntimeCall,
    ) -> KilnResult<()> {
        let word = self.word();
        let index_address = self.thread_field(b, thread, index_offset);
        let index = b.read(LocationIdentity::GC_INDEX, word, index_address)?;
        let zero = b.long(0);
        let full = self.equals(b, index, zero);
        let mut scope = b.begin_if(full, SLOW_PATH_PROBABILITY)?;
        b.append(
            NodeKind::ForeignCall {
                descriptor: runtime_descriptor(slow),
            },
            &[value],
        )?;
        b.else_branch(&mut scope)?;
        let step = b.long(i64::from(self.config.word_size));
        let next = b.add(NodeKind::Binary(BinaryOp::Sub), &[index, step]);
        let buffer_address = self.thread_field(b, thread, buffer_offset);
        let buffer = b.read(LocationIdentity::GC_LOG, word, buffer_address)?;
        let slot = b.add(NodeKind::OffsetAddress, &[buffer, next]);
        b.write(LocationIdentity::GC_LOG, word, slot, value)?;
        b.write(LocationIdentity::GC_INDEX, word, index_address, next)?;
        b.end_if(scope)?;
        Ok(())
    }

    /// Condition that holds while concurrent marking is inactive.
    fn marking_inactive(&self, b: &mut GraphBuilder<'_>, thread: NodeId) -> KilnResult<NodeId> {
        let flag_address = self.thread_field(b, thread, self.layout.satb_marking_offset);
        let marking = b.read(LocationIdentity::THREAD, MemoryAccess::BYTE, flag_address)?;
        let zero = b.int(0);
        Ok(self.equals(b, marking, zero))
    }

    fn serial_range(&self, b: &mut GraphBuilder<'_>, p: &[NodeId]) -> KilnResult<()> {
        let (address, length, stride) = (p[0], p[1], p[2]);
        let zero = b.int(0);
        let empty = self.equals(b, length, zero);
        let mut scope = b.begin_if(empty, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut scope)?;

        let (first, last) = self.range_bounds(b, address, length, stride);
        let shift = b.int(self.config.card_shift as i32);
        let first_card = b.add(NodeKind::Binary(BinaryOp::UShr), &[first, shift]);
        let last_card = b.add(NodeKind::Binary(BinaryOp::UShr), &[last, shift]);
        let one = b.long(1);
        let end_card = b.add(NodeKind::Binary(BinaryOp::Add), &[last_card, one]);
        let start = b.long(self.config.card_start() as i64);
        let dirty = b.int(i32::from(self.config.dirty_card));

        let mut lp = b.begin_loop()?;
        let card = b.loop_phi(&mut lp, first_card, Stamp::word());
        let more = b.add(NodeKind::Compare(CompareOp::IntegerBelow), &[card, end_card]);
        b.loop_exit_unless(&mut lp, more, FAST_EXIT_PROBABILITY)?;
        let card_address = b.add(NodeKind::Binary(BinaryOp::Add), &[card, start]);
        b.write(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card_address, dirty)?;
        let next = b.add(NodeKind::Binary(BinaryOp::Add), &[card, one]);
        b.end_loop(lp, &[(card, next)])?;

        b.end_if(scope)?;
        b.append_return(None)?;
        Ok(())
    }

    fn g1_pre(
        &self,
        b: &mut GraphBuilder<'_>,
        address: NodeId,
        expected: Option<NodeId>,
        null_check: bool,
    ) -> KilnResult<()> {
        if null_check {
            let is_null = b.add(NodeKind::IsNull, &[address]);
            let mut scope = b.begin_if(is_null, SLOW_PATH_PROBABILITY)?;
            b.append_deopt(DeoptInfo::new(
                DeoptReason::NullCheckException,
                DeoptAction::InvalidateReprofile,
            ))?;
            b.else_branch(&mut scope)?;
            b.end_if(scope)?;
        }
        let thread = self.thread(b)?;
        let inactive = self.marking_inactive(b, thread)?;
        let mut marking = b.begin_if(inactive, FAST_EXIT_PROBABILITY)?;
        b.else_branch(&mut marking)?;

        let previous = match expected {
            Some(value) => value,
            None => b.read(LocationIdentity::Any, MemoryAccess::OBJECT, address)?,
        };
        let is_null = b.add(NodeKind::IsNull, &[previous]);
        let mut non_null = b.begin_if(is_null, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut non_null)?;
        self.enqueue(
            b,
            thread,
            self.layout.satb_index_offset,
            self.layout.satb_buffer_offset,
            previous,
            BarrierRuntimeCall::SatbEnqueue,
        )?;
        b.end_if(non_null)?;

        b.end_if(marking)?;
        b.append_return(None)?;
        Ok(())
    }

    fn g1_post(&self, b: &mut GraphBuilder<'_>, address: NodeId, value: NodeId) -> KilnResult<()> {
        let region_shift = b.int(self.config.log_region_size as i32);
        let xor = b.add(NodeKind::Binary(BinaryOp::Xor), &[address, value]);
        let crossing = b.add(NodeKind::Binary(BinaryOp::UShr), &[xor, region_shift]);
        let card = self.card_address(b, address);
        let zero = b.long(0);
        let same_region = self.equals(b, crossing, zero);
        let mut cross = b.begin_if(same_region, FAST_EXIT_PROBABILITY)?;
        b.else_branch(&mut cross)?;

        let is_null = b.add(NodeKind::IsNull, &[value]);
        let mut non_null = b.begin_if(is_null, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut non_null)?;

        let card_value = b.read(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card)?;
        let young = b.int(i32::from(self.config.young_card));
        let is_young = self.equals(b, card_value, young);
        let mut old = b.begin_if(is_young, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut old)?;

        // The card may have been cleaned since the first load.
        b.append(
            NodeKind::Membar {
                barriers: MemoryBarriers::STORE_LOAD,
            },
            &[],
        )?;
        let reloaded = b.read(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card)?;
        let dirty = b.int(i32::from(self.config.dirty_card));
        let is_dirty = self.equals(b, reloaded, dirty);
        let mut clean = b.begin_if(is_dirty, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut clean)?;
        b.write(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card, dirty)?;
        let thread = self.thread(b)?;
        self.enqueue(
            b,
            thread,
            self.layout.card_index_offset,
            self.layout.card_buffer_offset,
            card,
            BarrierRuntimeCall::CardEnqueue,
        )?;
        b.end_if(clean)?;

        b.end_if(old)?;
        b.end_if(non_null)?;
        b.end_if(cross)?;
        b.append_return(None)?;
        Ok(())
    }

    /// Log every non-null element of the range while marking.
    fn g1_range_pre(&self, b: &mut GraphBuilder<'_>, p: &[NodeId]) -> KilnResult<()> {
        let (address, length, stride) = (p[0], p[1], p[2]);
        let thread = self.thread(b)?;
        let inactive = self.marking_inactive(b, thread)?;
        let mut marking = b.begin_if(inactive, FAST_EXIT_PROBABILITY)?;
        b.else_branch(&mut marking)?;

        let zero = b.int(0);
        let empty = self.equals(b, length, zero);
        let mut scope = b.begin_if(empty, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut scope)?;

        let (first, last) = self.range_bounds(b, address, length, stride);
        let step = self.step(b, stride);
        let end = b.add(NodeKind::Binary(BinaryOp::Add), &[last, step]);
        let mut lp = b.begin_loop()?;
        let element = b.loop_phi(&mut lp, first, Stamp::word());
        let more = b.add(NodeKind::Compare(CompareOp::IntegerBelow), &[element, end]);
        b.loop_exit_unless(&mut lp, more, FAST_EXIT_PROBABILITY)?;
        let previous = b.read(LocationIdentity::Any, MemoryAccess::OBJECT, element)?;
        let is_null = b.add(NodeKind::IsNull, &[previous]);
        let mut non_null = b.begin_if(is_null, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut non_null)?;
        self.enqueue(
            b,
            thread,
            self.layout.satb_index_offset,
            self.layout.satb_buffer_offset,
            previous,
            BarrierRuntimeCall::SatbEnqueue,
        )?;
        b.end_if(non_null)?;
        let next = b.add(NodeKind::Binary(BinaryOp::Add), &[element, step]);
        b.end_loop(lp, &[(element, next)])?;

        b.end_if(scope)?;
        b.end_if(marking)?;
        b.append_return(None)?;
        Ok(())
    }

    /// Dirty and enqueue every old, clean card covering the range.
    fn g1_range_post(&self, b: &mut GraphBuilder<'_>, p: &[NodeId]) -> KilnResult<()> {
        let (address, length, stride) = (p[0], p[1], p[2]);
        let zero = b.int(0);
        let empty = self.equals(b, length, zero);
        let mut scope = b.begin_if(empty, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut scope)?;

        let (first, last) = self.range_bounds(b, address, length, stride);
        let shift = b.int(self.config.card_shift as i32);
        let first_card = b.add(NodeKind::Binary(BinaryOp::UShr), &[first, shift]);
        let last_card = b.add(NodeKind::Binary(BinaryOp::UShr), &[last, shift]);
        let one = b.long(1);
        let end_card = b.add(NodeKind::Binary(BinaryOp::Add), &[last_card, one]);
        let start = b.long(self.config.card_start() as i64);
        let young = b.int(i32::from(self.config.young_card));
        let dirty = b.int(i32::from(self.config.dirty_card));
        let thread = self.thread(b)?;

        let mut lp = b.begin_loop()?;
        let index = b.loop_phi(&mut lp, first_card, Stamp::word());
        let more = b.add(NodeKind::Compare(CompareOp::IntegerBelow), &[index, end_card]);
        b.loop_exit_unless(&mut lp, more, FAST_EXIT_PROBABILITY)?;
        let card = b.add(NodeKind::Binary(BinaryOp::Add), &[index, start]);
        let card_value = b.read(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card)?;
        let is_young = self.equals(b, card_value, young);
        let mut old = b.begin_if(is_young, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut old)?;
        b.append(
            NodeKind::Membar {
                barriers: MemoryBarriers::STORE_LOAD,
            },
            &[],
        )?;
        let reloaded = b.read(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card)?;
        let is_dirty = self.equals(b, reloaded, dirty);
        let mut clean = b.begin_if(is_dirty, SLOW_PATH_PROBABILITY)?;
        b.else_branch(&mut clean)?;
        b.write(LocationIdentity::GC_CARD, MemoryAccess::BYTE, card, dirty)?;
        self.enqueue(
            b,
            thread,
            self.layout.card_index_offset,
            self.layout.card_buffer_offset,
            card,
            BarrierRuntimeCall::CardEnqueue,
        )?;
        b.end_if(clean)?;
        b.end_if(old)?;
        let next = b.add(NodeKind::Binary(BinaryOp::Add), &[index, one]);
        b.end_loop(lp, &[(index, next)])?;

        b.end_if(scope)?;
        b.append_return(None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::Evaluator;
    use crate::opt::verify::verify_integrity;
    use kiln_core::RawMemory;
    use kiln_gc::{crosses_regions, BarrierHeap};

    fn heap() -> BarrierHeap {
        BarrierHeap::new(
            BarrierConfig {
                heap_size: 4 << 20,
                satb_buffer_bytes: 4 * 8,
                card_buffer_bytes: 2 * 8,
                ..Default::default()
            },
            ThreadLayout::default(),
        )
        .unwrap()
    }

    fn snippets(heap: &BarrierHeap) -> BarrierSnippets {
        BarrierSnippets::new(heap.config().clone(), heap.layout().clone()).unwrap()
    }

    /// store(p0 + 16, p1) with a precise reference write barrier.
    fn reference_store() -> (Graph, NodeId) {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let object = b.parameter(0, Stamp::word());
        let value = b.parameter(1, Stamp::object());
        let offset = b.long(16);
        let field = b.add(NodeKind::OffsetAddress, &[object, offset]);
        let write = b
            .append(
                NodeKind::Write {
                    location: LocationIdentity::Any,
                    access: MemoryAccess::OBJECT,
                    barrier: BarrierKind::Precise,
                },
                &[field, value],
            )
            .unwrap();
        b.append_return(None).unwrap();
        (g, write)
    }

    fn lower_all(g: &mut Graph, snippets: &BarrierSnippets) {
        let barriers: Vec<NodeId> = g
            .iter()
            .filter(|(_, n)| n.kind.is_write_barrier())
            .map(|(id, _)| id)
            .collect();
        for id in barriers {
            assert!(snippets.lower(g, id).unwrap());
        }
        verify_integrity(g).unwrap();
    }

    #[test]
    fn test_addition_wraps_write() {
        let (mut g, write) = reference_store();
        assert!(WriteBarrierAdditionPhase::new(BarrierSet::G1).run(&mut g).unwrap());
        let pre = g.predecessor(write).unwrap();
        let post = g.next(write).unwrap();
        assert!(matches!(g.kind(pre), NodeKind::G1PreWriteBarrier { do_load: true, .. }));
        assert!(matches!(g.kind(post), NodeKind::G1PostWriteBarrier { precise: true }));
        assert!(!WriteBarrierAdditionPhase::new(BarrierSet::G1).run(&mut g).unwrap());
    }

    #[test]
    fn test_imprecise_card_uses_object() {
        let (mut g, write) = reference_store();
        if let NodeKind::Write { barrier, .. } = &mut g.node_mut(write).kind {
            *barrier = BarrierKind::Imprecise;
        }
        WriteBarrierAdditionPhase::new(BarrierSet::CardTable).run(&mut g).unwrap();
        let post = g.next(write).unwrap();
        let card_input = g.node(post).input(0).unwrap();
        assert!(matches!(g.kind(card_input), NodeKind::Parameter(0)));
    }

    #[test]
    fn test_serial_barrier_marks_card() {
        let mut heap = heap();
        let (mut g, _) = reference_store();
        WriteBarrierAdditionPhase::new(BarrierSet::CardTable).run(&mut g).unwrap();
        lower_all(&mut g, &snippets(&heap));

        let object = heap.config().heap_base + 0x2000;
        let value = heap.config().heap_base + 0x100;
        Evaluator::new(&g).unwrap().run(&[object, value], &mut heap).unwrap();
        let index = heap.cards().card_index(object + 16).unwrap();
        assert!(heap.cards().is_dirty(index));
        assert_eq!(heap.read(object + 16, AccessSize::Quad), value);
    }

    #[test]
    fn test_g1_post_enqueues_cross_region_card() {
        let mut heap = heap();
        let (mut g, _) = reference_store();
        WriteBarrierAdditionPhase::new(BarrierSet::G1).run(&mut g).unwrap();
        lower_all(&mut g, &snippets(&heap));
        let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

        let base = heap.config().heap_base;
        let (object, value) = (base + 0x40, base + (2 << 20));
        assert!(crosses_regions(heap.config(), object + 16, value));
        eval.run(&[object, value], &mut heap).unwrap();
        let card = kiln_gc::card_address(heap.config(), object + 16);
        assert_eq!(heap.drain_dirty_cards(), vec![card]);

        // Same region: nothing queued.
        eval.run(&[object, base + 0x80], &mut heap).unwrap();
        assert!(heap.drain_dirty_cards().is_empty());
    }

    #[test]
    fn test_g1_pre_logs_previous_while_marking() {
        let mut heap = heap();
        let (mut g, _) = reference_store();
        WriteBarrierAdditionPhase::new(BarrierSet::G1).run(&mut g).unwrap();
        lower_all(&mut g, &snippets(&heap));
        let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

        let base = heap.config().heap_base;
        let object = base + 0x200;
        heap.write(object + 16, AccessSize::Quad, base + 0x999_0);
        eval.run(&[object, base + 0x300], &mut heap).unwrap();
        assert!(heap.drain_satb().is_empty());

        heap.set_marking(true);
        eval.run(&[object, base + 0x400], &mut heap).unwrap();
        assert_eq!(heap.drain_satb(), vec![base + 0x300]);
    }

    #[test]
    fn test_serial_range_handles_negative_stride_and_empty() {
        let mut heap = heap();
        let snippets = snippets(&heap);
        for stride in [8, -8] {
            let mut g = Graph::new();
            let mut b = GraphBuilder::new(&mut g);
            let address = b.parameter(0, Stamp::word());
            let length = b.parameter(1, Stamp::int(32));
            b.append(
                NodeKind::SerialArrayRangeWriteBarrier { element_stride: stride },
                &[address, length],
            )
            .unwrap();
            b.append_return(None).unwrap();
            lower_all(&mut g, &snippets);

            let card_size = heap.config().card_size();
            let base = heap.config().heap_base + 16 * card_size;
            let start = if stride > 0 { base } else { base + 3 * card_size };
            let count = (3 * card_size / 8) as u64;
            Evaluator::new(&g).unwrap().run(&[start, 0], &mut heap).unwrap();
            assert_eq!(heap.cards().dirty_count(), 0);
            Evaluator::new(&g).unwrap().run(&[start, count], &mut heap).unwrap();
            let first = heap.cards().card_index(base).unwrap();
            assert_eq!(heap.cards().dirty_count(), 3);
            for i in first..first + 3 {
                assert!(heap.cards().is_dirty(i));
                heap.cards().clean(i);
            }
        }
    }

    /// One range barrier of `kind` over `(p0, p1)`, lowered.
    fn range_barrier(kind: NodeKind, snippets: &BarrierSnippets) -> Graph {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let address = b.parameter(0, Stamp::word());
        let length = b.parameter(1, Stamp::int(32));
        b.append(kind, &[address, length]).unwrap();
        b.append_return(None).unwrap();
        lower_all(&mut g, snippets);
        g
    }

    #[test]
    fn test_serial_range_descending_stops_below_address() {
        let mut heap = heap();
        let g = range_barrier(
            NodeKind::SerialArrayRangeWriteBarrier { element_stride: -8 },
            &snippets(&heap),
        );
        let card_size = heap.config().card_size();
        let base = heap.config().heap_base + 8 * card_size;
        // Two elements just below a card boundary.
        let end = base + card_size;
        Evaluator::new(&g).unwrap().run(&[end, 2], &mut heap).unwrap();
        let low = heap.cards().card_index(end - 16).unwrap();
        let past = heap.cards().card_index(end).unwrap();
        assert!(heap.cards().is_dirty(low));
        assert!(!heap.cards().is_dirty(past));
        assert_eq!(heap.cards().dirty_count(), 1);
    }

    #[test]
    fn test_g1_range_pre_logs_elements_while_marking() {
        let mut heap = heap();
        let snippets = snippets(&heap);
        let base = heap.config().heap_base + 0x400;
        heap.write(base, AccessSize::Quad, 0x11);
        heap.write(base + 16, AccessSize::Quad, 0x22);
        heap.write(base + 24, AccessSize::Quad, 0x33);

        for (stride, address) in [(8, base), (-8, base + 24)] {
            let g = range_barrier(
                NodeKind::G1ArrayRangePreWriteBarrier { element_stride: stride },
                &snippets,
            );
            let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

            heap.set_marking(false);
            eval.run(&[address, 3], &mut heap).unwrap();
            assert!(heap.drain_satb().is_empty());

            heap.set_marking(true);
            eval.run(&[address, 0], &mut heap).unwrap();
            assert!(heap.drain_satb().is_empty());
            // Null slots are skipped; the element past the range is not read.
            eval.run(&[address, 3], &mut heap).unwrap();
            assert_eq!(heap.drain_satb(), vec![0x11, 0x22], "stride {stride}");
        }
        assert_eq!(heap.stats().pre_slow_calls, 0);
        assert_eq!(heap.stats().faults, 0);
    }

    #[test]
    fn test_g1_range_post_queues_old_clean_cards() {
        let mut heap = heap();
        let g = range_barrier(
            NodeKind::G1ArrayRangePostWriteBarrier { element_stride: 8 },
            &snippets(&heap),
        );
        let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

        let card_size = heap.config().card_size();
        let base = heap.config().heap_base + 32 * card_size;
        let first = heap.cards().card_index(base).unwrap();
        heap.mark_young(base + card_size, card_size);
        heap.cards().set(first + 2, heap.config().dirty_card);
        let slots = (4 * card_size / 8) as u64;

        eval.run(&[base, 0], &mut heap).unwrap();
        assert!(heap.drain_dirty_cards().is_empty());

        eval.run(&[base, slots], &mut heap).unwrap();
        let expected = vec![heap.cards().card_address(first), heap.cards().card_address(first + 3)];
        assert_eq!(heap.drain_dirty_cards(), expected);
        assert!(heap.cards().is_young(first + 1));
        assert!(heap.cards().is_dirty(first + 3));
        assert_eq!(heap.stats().post_slow_calls, 0);
    }

    #[test]
    fn test_g1_range_post_flushes_full_card_queue() {
        let mut heap = heap();
        let g = range_barrier(
            NodeKind::G1ArrayRangePostWriteBarrier { element_stride: -8 },
            &snippets(&heap),
        );
        let eval = Evaluator::new(&g).unwrap().with_thread(heap.thread_address());

        let card_size = heap.config().card_size();
        let base = heap.config().heap_base + 64 * card_size;
        let slots = (3 * card_size / 8) as u64;
        eval.run(&[base + 3 * card_size, slots], &mut heap).unwrap();

        // Two cards fit the buffer; the third goes through the runtime.
        let stats = heap.stats();
        assert_eq!(stats.post_slow_calls, 1, "{stats:?}");
        let first = heap.cards().card_index(base).unwrap();
        let expected: Vec<u64> = (first..first + 3).map(|i| heap.cards().card_address(i)).collect();
        assert_eq!(heap.drain_dirty_cards(), expected);
        assert_eq!(heap.cards().dirty_count(), 3);
    }

    #[test]
    fn test_snippets_are_cached() {
        let heap = heap();
        let snippets = snippets(&heap);
        for _ in 0..2 {
            let (mut g, _) = reference_store();
            WriteBarrierAdditionPhase::new(BarrierSet::G1).run(&mut g).unwrap();
            lower_all(&mut g, &snippets);
        }
        assert_eq!(snippets.cache().len(), 2);
    }
}
