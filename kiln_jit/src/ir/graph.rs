//! The node graph.
//!
//! The graph provides:
//! - **Arena-based storage**: nodes are never freed, only marked dead
//! - **Usage index**: for each node, which nodes consume it through data,
//!   guard or memory edges
//! - **Control surgery**: splicing fixed nodes in and out of control paths
//! - **Stage metadata**: guard stage and lowering tier
//!
//! The usage index is derived state. Every edge mutation goes through the
//! graph and updates it incrementally; [`Graph::rebuild_usages`] recomputes
//! it from scratch and [`Graph::usage_index_consistent`] compares the two.

use super::arena::{Arena, SecondaryMap};
use super::kinds::{BinaryOp, NodeKind};
use super::node::{InputList, Node, NodeId};
use super::source_position::NodeSourcePosition;
use super::stamp::Stamp;
use crate::lowering::LoweringTier;
use kiln_core::{Constant, KilnError, KilnResult, MethodRef};
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Guards Stage
// =============================================================================

/// How guards are represented in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GuardsStage {
    /// Guards may float, anchored on a begin.
    FloatingGuards,
    /// Guards are `If` + `Deoptimize` on the control path.
    FixedDeopts,
    /// Deopt states are attached; no more guards are created.
    AfterFrameStateAssignment,
}

impl GuardsStage {
    #[inline]
    pub fn allows_floating_guards(self) -> bool {
        self == GuardsStage::FloatingGuards
    }

    #[inline]
    pub fn are_deopts_fixed(self) -> bool {
        self >= GuardsStage::FixedDeopts
    }
}

// =============================================================================
// Graph Structure
// =============================================================================

/// A graph of IR nodes.
#[derive(Clone)]
pub struct Graph {
    /// Arena for node storage.
    nodes: Arena<Node>,

    /// Usage index: one entry per consuming edge.
    uses: SecondaryMap<Node, Vec<NodeId>>,

    /// The start node (control entry).
    start: NodeId,

    /// Method the graph was built for.
    method: Option<MethodRef>,

    guards_stage: GuardsStage,
    lowered_tier: Option<LoweringTier>,

    /// Position attached to every node created while set.
    current_position: Option<Arc<NodeSourcePosition>>,
}

impl Graph {
    /// Create a graph holding only its start node.
    pub fn new() -> Self {
        let mut nodes = Arena::with_capacity(64);
        let start = nodes.alloc(Node::new(NodeKind::Start, InputList::Empty, Stamp::Void));
        Graph {
            nodes,
            uses: SecondaryMap::new(),
            start,
            method: None,
            guards_stage: GuardsStage::FloatingGuards,
            lowered_tier: None,
            current_position: None,
        }
    }

    /// Create a graph for `method`.
    pub fn for_method(method: MethodRef) -> Self {
        let mut graph = Self::new();
        graph.method = Some(method);
        graph
    }

    /// The start node.
    #[inline]
    pub fn start(&self) -> NodeId {
        self.start
    }

    /// Method the graph was built for.
    #[inline]
    pub fn method(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }

    #[inline]
    pub fn guards_stage(&self) -> GuardsStage {
        self.guards_stage
    }

    /// Advance the guard stage. Stages never move backwards.
    pub fn set_guards_stage(&mut self, stage: GuardsStage) -> KilnResult<()> {
        if stage < self.guards_stage {
            return Err(KilnError::lowering_order(format!(
                "guards stage cannot go back from {:?} to {:?}",
                self.guards_stage, stage
            )));
        }
        self.guards_stage = stage;
        Ok(())
    }

    /// Highest tier the graph has been lowered to.
    #[inline]
    pub fn lowered_tier(&self) -> Option<LoweringTier> {
        self.lowered_tier
    }

    pub(crate) fn set_lowered_tier(&mut self, tier: LoweringTier) {
        self.lowered_tier = Some(tier);
    }

    // =========================================================================
    // Source Positions
    // =========================================================================

    /// Position attached to newly created nodes.
    #[inline]
    pub fn current_position(&self) -> Option<&Arc<NodeSourcePosition>> {
        self.current_position.as_ref()
    }

    /// Replace the current position, returning the previous one.
    pub fn set_current_position(
        &mut self,
        position: Option<Arc<NodeSourcePosition>>,
    ) -> Option<Arc<NodeSourcePosition>> {
        std::mem::replace(&mut self.current_position, position)
    }

    /// Run `f` with `position` as the current position.
    pub fn with_position<R>(
        &mut self,
        position: Option<Arc<NodeSourcePosition>>,
        f: impl FnOnce(&mut Graph) -> R,
    ) -> R {
        let saved = self.set_current_position(position);
        let result = f(self);
        self.current_position = saved;
        result
    }

    // =========================================================================
    // Node Access
    // =========================================================================

    /// Get a reference to a node.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Get a mutable reference to a node. Edges stay read-only.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Get a node by ID (optional).
    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[inline]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    #[inline]
    pub fn stamp(&self, id: NodeId) -> Stamp {
        self.nodes[id].stamp
    }

    /// Whether `id` names a node that has not been killed.
    #[inline]
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| !n.is_dead())
    }

    /// Total number of node slots, dead ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Ids of live nodes in creation order.
    pub fn live_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.is_dead())
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of live nodes.
    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|(_, n)| !n.is_dead()).count()
    }

    /// Live nodes with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().filter(|(_, n)| !n.is_dead())
    }

    /// Constant value of `id`, if it is a constant node.
    pub fn as_constant(&self, id: NodeId) -> Option<Constant> {
        match self.nodes.get(id).map(|n| &n.kind) {
            Some(NodeKind::Constant(c)) => Some(*c),
            _ => None,
        }
    }

    /// Integer value of `id`, from a constant or an exact stamp.
    pub fn as_integer(&self, id: NodeId) -> Option<i64> {
        match self.as_constant(id) {
            Some(c) => c.as_integer(),
            None => self.nodes.get(id).and_then(|n| n.stamp.as_integer_constant()),
        }
    }

    // =========================================================================
    // Usage Index
    // =========================================================================

    /// Consumers of `id`, one entry per edge.
    pub fn usages(&self, id: NodeId) -> &[NodeId] {
        self.uses.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct consumers of `id`.
    pub fn distinct_usages(&self, id: NodeId) -> Vec<NodeId> {
        let mut users = self.usages(id).to_vec();
        users.sort_unstable();
        users.dedup();
        users
    }

    #[inline]
    pub fn usage_count(&self, id: NodeId) -> usize {
        self.usages(id).len()
    }

    #[inline]
    pub fn has_usages(&self, id: NodeId) -> bool {
        !self.usages(id).is_empty()
    }

    /// Nodes whose guard edge names `id`.
    pub fn guard_usages(&self, id: NodeId) -> Vec<NodeId> {
        self.distinct_usages(id)
            .into_iter()
            .filter(|&u| self.nodes[u].guard == Some(id))
            .collect()
    }

    fn add_use(&mut self, def: NodeId, user: NodeId) {
        if def.is_valid() {
            self.uses.entry(def).push(user);
        }
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        if let Some(list) = self.uses.get_mut(def) {
            if let Some(pos) = list.iter().position(|&u| u == user) {
                list.swap_remove(pos);
            }
        }
    }

    // =========================================================================
    // Node Creation
    // =========================================================================

    /// Add a node, inferring its stamp from the kind and inputs.
    pub fn add_node(&mut self, kind: NodeKind, inputs: &[NodeId]) -> NodeId {
        let stamp = self.infer_stamp(&kind, inputs);
        self.add_with_stamp(kind, inputs, stamp)
    }

    /// Add a fixed node. It is not linked into control flow yet.
    pub fn add_fixed(&mut self, kind: NodeKind, inputs: &[NodeId]) -> NodeId {
        debug_assert!(kind.is_fixed(), "{} is not fixed", kind.name());
        self.add_node(kind, inputs)
    }

    /// Add a floating node.
    pub fn add_floating(&mut self, kind: NodeKind, inputs: &[NodeId]) -> NodeId {
        debug_assert!(kind.is_floating(), "{} is not floating", kind.name());
        self.add_node(kind, inputs)
    }

    /// Add a node with an explicit stamp.
    pub fn add_with_stamp(&mut self, kind: NodeKind, inputs: &[NodeId], stamp: Stamp) -> NodeId {
        let mut node = Node::new(kind, InputList::from_slice(inputs), stamp);
        node.position = self.current_position.clone();
        self.add_raw(node)
    }

    /// Add a node with a guard edge.
    pub fn add_guarded(
        &mut self,
        kind: NodeKind,
        inputs: &[NodeId],
        stamp: Stamp,
        guard: Option<NodeId>,
    ) -> NodeId {
        let id = self.add_with_stamp(kind, inputs, stamp);
        self.set_guard(id, guard);
        id
    }

    /// Allocate a prepared node and register its def edges. Control edges
    /// are left for the caller to wire.
    pub(crate) fn add_raw(&mut self, mut node: Node) -> NodeId {
        node.predecessor = None;
        for slot in node.successors.iter_mut() {
            *slot = NodeId::INVALID;
        }
        let defs: Vec<NodeId> = node.def_edges().collect();
        let id = self.nodes.alloc(node);
        for def in defs {
            self.add_use(def, id);
        }
        log::trace!("add {:?} {}", id, self.nodes[id].kind);
        id
    }

    /// A constant node.
    pub fn constant(&mut self, value: Constant) -> NodeId {
        self.add_node(NodeKind::Constant(value), &[])
    }

    /// A 32-bit integer constant.
    pub fn int(&mut self, value: i32) -> NodeId {
        self.constant(Constant::Int(value))
    }

    /// A 64-bit integer constant.
    pub fn long(&mut self, value: i64) -> NodeId {
        self.constant(Constant::Long(value))
    }

    /// The null constant.
    pub fn null(&mut self) -> NodeId {
        self.constant(Constant::Null)
    }

    /// A constant condition.
    pub fn logic_constant(&mut self, value: bool) -> NodeId {
        self.add_node(NodeKind::LogicConstant(value), &[])
    }

    /// An incoming argument.
    pub fn parameter(&mut self, index: u32, stamp: Stamp) -> NodeId {
        self.add_with_stamp(NodeKind::Parameter(index), &[], stamp)
    }

    /// A phi on `merge`.
    pub fn add_phi(&mut self, merge: NodeId, values: &[NodeId], stamp: Stamp) -> NodeId {
        let mut inputs = Vec::with_capacity(values.len() + 1);
        inputs.push(merge);
        inputs.extend_from_slice(values);
        self.add_with_stamp(NodeKind::Phi, &inputs, stamp)
    }

    /// Stamp a node of `kind` over `inputs` would get.
    pub fn infer_stamp(&self, kind: &NodeKind, inputs: &[NodeId]) -> Stamp {
        let stamp_of = |i: usize| {
            inputs
                .get(i)
                .and_then(|&id| self.nodes.get(id))
                .map(|n| n.stamp)
                .unwrap_or(Stamp::Void)
        };
        match kind {
            NodeKind::Constant(c) => Stamp::for_constant(*c),
            NodeKind::Binary(op) => {
                let (x, y) = (stamp_of(0), stamp_of(1));
                let bits = x.bits().max(if matches!(op, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr) {
                    0
                } else {
                    y.bits()
                });
                match (x.as_integer_constant(), y.as_integer_constant()) {
                    (Some(a), Some(b)) => Stamp::int_constant(bits, op.fold(bits, a, b)),
                    _ => Stamp::int(bits.max(1)),
                }
            }
            NodeKind::Negate | NodeKind::Not => Stamp::int(stamp_of(0).bits().max(1)),
            NodeKind::Narrow { bits } => Stamp::int(*bits),
            NodeKind::SignExtend { from, to } => {
                let (lo, hi) = super::stamp::signed_range(*from);
                Stamp::int_range(*to, lo, hi)
            }
            NodeKind::ZeroExtend { from, to } => {
                let hi = if *from >= 63 { i64::MAX } else { (1i64 << from) - 1 };
                Stamp::int_range(*to, 0, hi)
            }
            NodeKind::OffsetAddress | NodeKind::ReadRegister(_) | NodeKind::Alloca { .. } => {
                Stamp::word()
            }
            NodeKind::Phi => inputs
                .iter()
                .skip(1)
                .filter_map(|&id| self.nodes.get(id))
                .map(|n| n.stamp)
                .reduce(|a, b| a.meet(&b))
                .unwrap_or(Stamp::Void),
            NodeKind::Conditional => stamp_of(1).meet(&stamp_of(2)),
            NodeKind::Read { access, .. } => {
                if access.object {
                    Stamp::object()
                } else {
                    let bits = (access.size.bytes() * 8) as u32;
                    if access.signed || bits == 64 {
                        Stamp::int(bits.max(32))
                    } else {
                        Stamp::int_range(32.max(bits), 0, access.size.mask() as i64)
                    }
                }
            }
            NodeKind::ForeignCall { descriptor } => Stamp::for_kind(descriptor.result()),
            NodeKind::ArrayEquals { .. } => Stamp::boolean(),
            _ => Stamp::Void,
        }
    }

    // =========================================================================
    // Edge Mutation
    // =========================================================================

    /// Replace data input `index` of `node`.
    pub fn set_input(&mut self, node: NodeId, index: usize, value: NodeId) {
        let Some(old) = self.nodes[node].inputs.get(index) else {
            return;
        };
        if old == value {
            return;
        }
        self.remove_use(old, node);
        self.nodes[node].inputs.set(index, value);
        self.add_use(value, node);
    }

    /// Append a data input.
    pub fn push_input(&mut self, node: NodeId, value: NodeId) {
        self.nodes[node].inputs.push(value);
        self.add_use(value, node);
    }

    /// Remove data input `index`, shifting later inputs down.
    pub fn remove_input(&mut self, node: NodeId, index: usize) -> Option<NodeId> {
        let removed = self.nodes[node].inputs.remove(index)?;
        self.remove_use(removed, node);
        Some(removed)
    }

    /// Replace all data inputs.
    pub fn set_inputs(&mut self, node: NodeId, inputs: &[NodeId]) {
        let old = self.nodes[node].inputs.to_vec();
        for def in old {
            self.remove_use(def, node);
        }
        self.nodes[node].inputs = InputList::from_slice(inputs);
        for &def in inputs {
            self.add_use(def, node);
        }
    }

    /// Set or clear the guard edge.
    pub fn set_guard(&mut self, node: NodeId, guard: Option<NodeId>) {
        let old = self.nodes[node].guard;
        if old == guard {
            return;
        }
        if let Some(old) = old {
            self.remove_use(old, node);
        }
        self.nodes[node].guard = guard;
        if let Some(new) = guard {
            self.add_use(new, node);
        }
    }

    /// Set or clear the memory edge.
    pub fn set_memory(&mut self, node: NodeId, memory: Option<NodeId>) {
        let old = self.nodes[node].memory;
        if old == memory {
            return;
        }
        if let Some(old) = old {
            self.remove_use(old, node);
        }
        self.nodes[node].memory = memory;
        if let Some(new) = memory {
            self.add_use(new, node);
        }
    }

    // =========================================================================
    // Control Edges
    // =========================================================================

    /// Control successors of `id`. Unset slots hold `NodeId::INVALID`.
    #[inline]
    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].successors
    }

    #[inline]
    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].predecessor
    }

    #[inline]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].next()
    }

    /// Point successor `slot` of `node` at `target`, maintaining
    /// predecessor back edges.
    pub fn set_successor(&mut self, node: NodeId, slot: usize, target: Option<NodeId>) {
        let Some(&old) = self.nodes[node].successors.get(slot) else {
            return;
        };
        if old.is_valid() && self.nodes.get(old).is_some_and(|n| n.predecessor == Some(node)) {
            self.nodes[old].predecessor = None;
        }
        let new = target.unwrap_or(NodeId::INVALID);
        self.nodes[node].successors[slot] = new;
        if new.is_valid() {
            debug_assert!(
                self.nodes[new].predecessor.is_none(),
                "{:?} already has a predecessor",
                new
            );
            self.nodes[new].predecessor = Some(node);
        }
    }

    /// Set `next` of a fixed-with-next node.
    pub fn set_next(&mut self, node: NodeId, next: Option<NodeId>) {
        self.set_successor(node, 0, next);
    }

    fn successor_slot(&self, pred: NodeId, node: NodeId) -> KilnResult<usize> {
        self.nodes[pred]
            .successors
            .iter()
            .position(|&s| s == node)
            .ok_or_else(|| {
                KilnError::internal_at(
                    node.index(),
                    format!("predecessor {:?} does not list {:?} as successor", pred, node),
                )
            })
    }

    /// Link `node` directly after `anchor`.
    pub fn add_after_fixed(&mut self, anchor: NodeId, node: NodeId) -> KilnResult<()> {
        if !self.nodes[anchor].kind.has_next() || !self.nodes[node].kind.has_next() {
            return Err(KilnError::internal_at(
                node.index(),
                format!(
                    "cannot link {} after {}",
                    self.nodes[node].kind.name(),
                    self.nodes[anchor].kind.name()
                ),
            ));
        }
        let next = self.next(anchor);
        self.set_next(anchor, None);
        self.set_next(anchor, Some(node));
        self.set_next(node, next);
        Ok(())
    }

    /// Link `node` directly before `anchor`.
    pub fn add_before_fixed(&mut self, anchor: NodeId, node: NodeId) -> KilnResult<()> {
        let pred = self.predecessor(anchor).ok_or_else(|| {
            KilnError::internal_at(anchor.index(), "cannot insert before a node without predecessor")
        })?;
        if !self.nodes[node].kind.has_next() {
            return Err(KilnError::internal_at(
                node.index(),
                format!("{} has no next to link", self.nodes[node].kind.name()),
            ));
        }
        let slot = self.successor_slot(pred, anchor)?;
        self.set_successor(pred, slot, Some(node));
        self.set_next(node, Some(anchor));
        Ok(())
    }

    /// Nearest begin at or above `node` on its control path.
    pub fn prev_begin(&self, node: NodeId) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.nodes[id].kind.is_begin() {
                return Some(id);
            }
            current = self.nodes[id].predecessor;
        }
        None
    }

    /// Forward ends of a merge, or forward end and loop ends of a loop.
    pub fn merge_ends(&self, merge: NodeId) -> Vec<NodeId> {
        self.nodes[merge].inputs.to_vec()
    }

    /// Phis attached to `merge`.
    pub fn phis(&self, merge: NodeId) -> Vec<NodeId> {
        self.distinct_usages(merge)
            .into_iter()
            .filter(|&u| {
                matches!(self.nodes[u].kind, NodeKind::Phi) && self.nodes[u].inputs.get(0) == Some(merge)
            })
            .collect()
    }

    /// Merge or loop begin an end flows into.
    pub fn merge_of(&self, end: NodeId) -> Option<NodeId> {
        self.usages(end)
            .iter()
            .copied()
            .find(|&u| self.nodes[u].kind.is_merge())
    }

    // =========================================================================
    // Replacement
    // =========================================================================

    /// Redirect every usage of `old` to `new`. With `new == None` only guard
    /// and memory usages may exist; a data usage is an internal error and
    /// nothing is changed.
    pub fn replace_at_usages(&mut self, old: NodeId, new: Option<NodeId>) -> KilnResult<()> {
        let users: Vec<NodeId> = self
            .distinct_usages(old)
            .into_iter()
            .filter(|&u| Some(u) != new)
            .collect();
        if new.is_none() {
            if let Some(&user) = users.iter().find(|&&u| self.nodes[u].inputs.iter().any(|d| d == old)) {
                return Err(KilnError::internal_at(
                    old.index(),
                    format!("cannot clear data usage by {:?}", user),
                ));
            }
        }
        for user in users {
            if let Some(new) = new {
                let hits: Vec<usize> = self.nodes[user]
                    .inputs
                    .iter()
                    .enumerate()
                    .filter(|&(_, d)| d == old)
                    .map(|(i, _)| i)
                    .collect();
                for index in hits {
                    self.set_input(user, index, new);
                }
            }
            if self.nodes[user].guard == Some(old) {
                self.set_guard(user, new);
            }
            if self.nodes[user].memory == Some(old) {
                self.set_memory(user, new);
            }
        }
        Ok(())
    }

    /// Replace `old` by `new` everywhere and remove `old`. Fixed nodes also
    /// hand over their control position.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> KilnResult<()> {
        if self.nodes[old].kind.is_fixed() {
            return self.replace_fixed(old, new);
        }
        self.replace_at_usages(old, Some(new))?;
        if !self.has_usages(old) {
            self.kill_with_unused_inputs(old);
        }
        Ok(())
    }

    /// Replace fixed-with-next `old` by `new`. A fixed `new` that is not
    /// yet linked takes over `old`'s control position; a floating `new`
    /// only takes the usages and `old` is spliced out.
    pub fn replace_fixed(&mut self, old: NodeId, new: NodeId) -> KilnResult<()> {
        self.replace_at_usages(old, Some(new))?;
        if self.nodes[new].kind.is_floating() || self.nodes[new].predecessor.is_some() {
            return self.remove_fixed(old);
        }
        if !self.nodes[old].kind.has_next() || !self.nodes[new].kind.has_next() {
            return Err(KilnError::internal_at(
                old.index(),
                format!(
                    "cannot replace {} by {}",
                    self.nodes[old].kind.name(),
                    self.nodes[new].kind.name()
                ),
            ));
        }
        let pred = self.predecessor(old);
        let next = self.next(old);
        self.set_next(old, None);
        if let Some(pred) = pred {
            let slot = self.successor_slot(pred, old)?;
            self.set_successor(pred, slot, Some(new));
        }
        self.set_next(new, next);
        self.kill_with_unused_inputs(old);
        Ok(())
    }

    /// Splice fixed-with-next `node` out of its control path and kill it.
    pub fn remove_fixed(&mut self, node: NodeId) -> KilnResult<()> {
        if self.has_usages(node) {
            return Err(KilnError::internal_at(
                node.index(),
                format!(
                    "cannot remove {} with {} usages",
                    self.nodes[node].kind.name(),
                    self.usage_count(node)
                ),
            ));
        }
        if !self.nodes[node].kind.has_next() || node == self.start {
            return Err(KilnError::internal_at(
                node.index(),
                format!("{} cannot be spliced out", self.nodes[node].kind.name()),
            ));
        }
        let pred = self
            .predecessor(node)
            .ok_or_else(|| KilnError::internal_at(node.index(), "removing an unlinked node"))?;
        let slot = self.successor_slot(pred, node)?;
        let next = self.next(node);
        self.set_next(node, None);
        self.set_successor(pred, slot, next);
        self.kill_with_unused_inputs(node);
        Ok(())
    }

    /// Move guard usages of `begin` to the begin preceding it.
    pub fn evacuate_guards(&mut self, begin: NodeId) -> KilnResult<()> {
        let guarded = self.guard_usages(begin);
        if guarded.is_empty() {
            return Ok(());
        }
        let target = self
            .predecessor(begin)
            .and_then(|pred| self.prev_begin(pred))
            .ok_or_else(|| {
                KilnError::internal_at(begin.index(), "no preceding begin to take anchored guards")
            })?;
        for user in guarded {
            self.set_guard(user, Some(target));
        }
        Ok(())
    }

    // =========================================================================
    // Killing
    // =========================================================================

    /// Mark `node` dead, dropping its def edges and control links.
    pub fn kill(&mut self, node: NodeId) {
        if !self.is_alive(node) {
            return;
        }
        let defs: Vec<NodeId> = self.nodes[node].def_edges().collect();
        for def in defs {
            self.remove_use(def, node);
        }
        if let Some(pred) = self.nodes[node].predecessor.take() {
            if let Some(slot) = self.nodes[pred].successors.iter_mut().find(|s| **s == node) {
                *slot = NodeId::INVALID;
            }
        }
        let succs: Vec<NodeId> = self.nodes[node].successors.iter().copied().collect();
        for s in succs.into_iter().filter(|s| s.is_valid()) {
            if self.nodes[s].predecessor == Some(node) {
                self.nodes[s].predecessor = None;
            }
        }
        let n = &mut self.nodes[node];
        n.inputs = InputList::Empty;
        n.guard = None;
        n.memory = None;
        for slot in n.successors.iter_mut() {
            *slot = NodeId::INVALID;
        }
        n.mark_dead();
        log::trace!("kill {:?} {}", node, n.kind);
    }

    /// Kill `node`, then every floating input left without usages.
    pub fn kill_with_unused_inputs(&mut self, node: NodeId) {
        let mut worklist = vec![node];
        while let Some(id) = worklist.pop() {
            if !self.is_alive(id) {
                continue;
            }
            let defs: Vec<NodeId> = self.nodes[id].def_edges().collect();
            self.kill(id);
            for def in defs {
                if self.is_alive(def) && self.is_unused_floating(def) {
                    worklist.push(def);
                }
            }
        }
    }

    /// Whether `id` is a floating node nothing needs any more.
    pub fn is_unused_floating(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        node.kind.is_floating()
            && !node.kind.is_anchored_floating()
            && !node.flags.contains(super::node::NodeFlags::PINNED)
            && !self.has_usages(id)
    }

    /// Kill `node` and all control flow only reachable through it, together
    /// with floating nodes that lose every usage. Merges reached from the
    /// dead region lose the corresponding end and phi values.
    pub fn kill_cfg(&mut self, node: NodeId) {
        let mut stack = vec![node];
        let mut seen = FxHashSet::default();
        let mut dead = Vec::new();
        while let Some(id) = stack.pop() {
            if !self.is_alive(id) || !seen.insert(id) {
                continue;
            }
            if matches!(self.nodes[id].kind, NodeKind::End | NodeKind::LoopEnd) {
                if let Some(merge) = self.merge_of(id) {
                    if self.remove_end(merge, id) {
                        stack.push(merge);
                    }
                }
            }
            dead.push(id);
            stack.extend(self.nodes[id].successors.iter().copied().filter(|s| s.is_valid()));
        }
        for &id in &dead {
            self.kill_floating_users(id);
        }
        for id in dead {
            self.kill_with_unused_inputs(id);
        }
    }

    /// Detach `end` from `merge` along with the matching phi values. Returns
    /// true when the merge has become unreachable.
    fn remove_end(&mut self, merge: NodeId, end: NodeId) -> bool {
        let Some(index) = self.nodes[merge].inputs.iter().position(|e| e == end) else {
            return false;
        };
        for phi in self.phis(merge) {
            if let Some(value) = self.remove_input(phi, index + 1) {
                if self.is_alive(value) && self.is_unused_floating(value) {
                    self.kill_with_unused_inputs(value);
                }
            }
        }
        self.remove_input(merge, index);
        match self.nodes[merge].kind {
            NodeKind::LoopBegin => index == 0,
            _ => self.nodes[merge].inputs.is_empty(),
        }
    }

    fn kill_floating_users(&mut self, node: NodeId) {
        let mut worklist = self.distinct_usages(node);
        while let Some(user) = worklist.pop() {
            if self.is_alive(user) && self.nodes[user].kind.is_floating() {
                worklist.extend(self.distinct_usages(user));
                self.kill_with_unused_inputs(user);
            }
        }
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Live nodes with an edge to a dead or missing node, as `(user, def)`.
    pub fn dangling_inputs(&self) -> Vec<(NodeId, NodeId)> {
        let mut dangling = Vec::new();
        for (id, node) in self.iter() {
            for def in node.def_edges() {
                if !self.is_alive(def) {
                    dangling.push((id, def));
                }
            }
        }
        dangling
    }

    fn computed_usages(&self) -> SecondaryMap<Node, Vec<NodeId>> {
        let mut uses: SecondaryMap<Node, Vec<NodeId>> = SecondaryMap::with_len(self.nodes.len());
        for (id, node) in self.iter() {
            for def in node.def_edges() {
                uses.entry(def).push(id);
            }
        }
        uses
    }

    /// Whether the incremental usage index matches a full rescan.
    pub fn usage_index_consistent(&self) -> bool {
        let expected = self.computed_usages();
        self.nodes.ids().all(|id| {
            let mut have = self.usages(id).to_vec();
            let mut want = expected.get(id).cloned().unwrap_or_default();
            have.sort_unstable();
            want.sort_unstable();
            have == want
        })
    }

    /// Recompute the usage index from scratch.
    pub fn rebuild_usages(&mut self) {
        self.uses = self.computed_usages();
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph ({} live nodes, {:?})", self.live_count(), self.guards_stage)?;
        for (id, node) in self.iter() {
            writeln!(f, "  {:?}: {:?}", id, node)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::kinds::{CompareOp, GuardInfo};
    use kiln_core::{DeoptAction, DeoptReason, ValueKind};

    fn guard_info() -> GuardInfo {
        GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::InvalidateReprofile, true)
    }

    /// start -> g1 -> g2 -> return
    fn chain() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let p = g.parameter(0, Stamp::object());
        let c = g.add_node(NodeKind::IsNull, &[p]);
        let g1 = g.add_fixed(NodeKind::FixedGuard(guard_info()), &[c]);
        let g2 = g.add_fixed(NodeKind::FixedGuard(guard_info()), &[c]);
        let ret = g.add_fixed(NodeKind::Return, &[]);
        g.set_next(g.start(), Some(g1));
        g.set_next(g1, Some(g2));
        g.set_next(g2, Some(ret));
        (g, g1, g2, ret)
    }

    #[test]
    fn test_new_graph_has_start() {
        let g = Graph::new();
        assert_eq!(g.live_count(), 1);
        assert!(matches!(g.kind(g.start()), NodeKind::Start));
        assert_eq!(g.guards_stage(), GuardsStage::FloatingGuards);
    }

    #[test]
    fn test_usages_tracked_per_edge() {
        let mut g = Graph::new();
        let a = g.int(1);
        let add = g.add_node(NodeKind::Binary(BinaryOp::Add), &[a, a]);
        assert_eq!(g.usage_count(a), 2);
        assert_eq!(g.distinct_usages(a), vec![add]);
        let b = g.int(2);
        g.set_input(add, 1, b);
        assert_eq!(g.usage_count(a), 1);
        assert!(g.usage_index_consistent());
    }

    #[test]
    fn test_binary_stamp_folds_constants() {
        let mut g = Graph::new();
        let a = g.int(40);
        let b = g.int(2);
        let add = g.add_node(NodeKind::Binary(BinaryOp::Add), &[a, b]);
        assert_eq!(g.as_integer(add), Some(42));
    }

    #[test]
    fn test_remove_fixed_splices() {
        let (mut g, g1, g2, _ret) = chain();
        g.remove_fixed(g1).unwrap();
        assert_eq!(g.next(g.start()), Some(g2));
        assert_eq!(g.predecessor(g2), Some(g.start()));
        assert!(!g.is_alive(g1));
        assert!(g.dangling_inputs().is_empty());
        assert!(g.usage_index_consistent());
    }

    #[test]
    fn test_remove_fixed_with_usages_fails() {
        let (mut g, g1, _g2, _ret) = chain();
        let p = g.parameter(1, Stamp::object());
        let read = g.add_guarded(
            NodeKind::Read {
                location: crate::ir::kinds::LocationIdentity::Any,
                access: crate::ir::kinds::MemoryAccess::OBJECT,
            },
            &[p],
            Stamp::object(),
            Some(g1),
        );
        assert!(g.remove_fixed(g1).is_err());
        assert!(g.is_alive(g1));
        g.set_guard(read, None);
        assert!(g.remove_fixed(g1).is_ok());
    }

    #[test]
    fn test_remove_unlinked_fixed_keeps_next() {
        let mut g = Graph::new();
        let first = g.add_fixed(NodeKind::Membar { barriers: Default::default() }, &[]);
        let second = g.add_fixed(NodeKind::Membar { barriers: Default::default() }, &[]);
        g.set_next(first, Some(second));
        assert!(g.remove_fixed(first).is_err());
        assert!(g.is_alive(first));
        assert_eq!(g.next(first), Some(second));
        assert_eq!(g.predecessor(second), Some(first));
    }

    #[test]
    fn test_add_before_and_after_fixed() {
        let (mut g, g1, g2, _ret) = chain();
        let m = g.add_fixed(NodeKind::Membar { barriers: Default::default() }, &[]);
        g.add_after_fixed(g1, m).unwrap();
        assert_eq!(g.next(g1), Some(m));
        assert_eq!(g.next(m), Some(g2));
        let m2 = g.add_fixed(NodeKind::Membar { barriers: Default::default() }, &[]);
        g.add_before_fixed(g1, m2).unwrap();
        assert_eq!(g.next(g.start()), Some(m2));
        assert_eq!(g.predecessor(g1), Some(m2));
    }

    #[test]
    fn test_replace_at_usages_none_rejects_data() {
        let mut g = Graph::new();
        let a = g.int(1);
        let _neg = g.add_node(NodeKind::Negate, &[a]);
        assert!(g.replace_at_usages(a, None).is_err());
        assert_eq!(g.usage_count(a), 1);
    }

    #[test]
    fn test_evacuate_guards_moves_to_previous_begin() {
        let mut g = Graph::new();
        let begin = g.add_fixed(NodeKind::Begin, &[]);
        let ret = g.add_fixed(NodeKind::Return, &[]);
        g.set_next(g.start(), Some(begin));
        g.set_next(begin, Some(ret));
        let cond = g.logic_constant(false);
        let guard = g.add_guarded(NodeKind::Guard(guard_info()), &[cond], Stamp::Void, Some(begin));
        g.evacuate_guards(begin).unwrap();
        assert_eq!(g.node(guard).guard(), Some(g.start()));
        g.remove_fixed(begin).unwrap();
        assert!(g.dangling_inputs().is_empty());
    }

    #[test]
    fn test_evacuate_without_previous_begin_fails() {
        let mut g = Graph::new();
        let cond = g.logic_constant(false);
        let start = g.start();
        g.add_guarded(NodeKind::Guard(guard_info()), &[cond], Stamp::Void, Some(start));
        assert!(g.evacuate_guards(start).is_err());
    }

    #[test]
    fn test_kill_cfg_updates_merge_and_phis() {
        let mut g = Graph::new();
        let x = g.parameter(0, Stamp::int(32));
        let zero = g.int(0);
        let cond = g.add_node(NodeKind::Compare(CompareOp::IntegerLessThan), &[x, zero]);
        let iff = g.add_fixed(NodeKind::If { probability: 0.5 }, &[cond]);
        g.set_next(g.start(), Some(iff));
        let t = g.add_fixed(NodeKind::Begin, &[]);
        let f = g.add_fixed(NodeKind::Begin, &[]);
        g.set_successor(iff, 0, Some(t));
        g.set_successor(iff, 1, Some(f));
        let te = g.add_fixed(NodeKind::End, &[]);
        let fe = g.add_fixed(NodeKind::End, &[]);
        g.set_next(t, Some(te));
        g.set_next(f, Some(fe));
        let merge = g.add_fixed(NodeKind::Merge, &[te, fe]);
        let one = g.int(1);
        let neg = g.add_node(NodeKind::Negate, &[x]);
        let phi = g.add_phi(merge, &[one, neg], Stamp::int(32));
        let ret = g.add_fixed(NodeKind::Return, &[phi]);
        g.set_next(merge, Some(ret));

        g.set_successor(iff, 1, None);
        g.kill_cfg(f);
        assert_eq!(g.merge_ends(merge), vec![te]);
        assert_eq!(g.node(phi).inputs().to_vec(), vec![merge, one]);
        assert!(!g.is_alive(neg), "unused floating input dies with its user");
        assert!(g.dangling_inputs().is_empty());
        assert!(g.usage_index_consistent());
    }

    #[test]
    fn test_rebuild_usages_matches_incremental() {
        let (mut g, _, _, _) = chain();
        let before: Vec<usize> = g.live_ids().iter().map(|&id| g.usage_count(id)).collect();
        g.rebuild_usages();
        let after: Vec<usize> = g.live_ids().iter().map(|&id| g.usage_count(id)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_guards_stage_is_monotonic() {
        let mut g = Graph::new();
        g.set_guards_stage(GuardsStage::FixedDeopts).unwrap();
        assert!(g.set_guards_stage(GuardsStage::FloatingGuards).is_err());
        assert!(g.guards_stage().are_deopts_fixed());
    }

    #[test]
    fn test_read_stamp_zero_extends_bytes() {
        let mut g = Graph::new();
        let a = g.parameter(0, Stamp::word());
        let r = g.add_fixed(
            NodeKind::Read {
                location: crate::ir::kinds::LocationIdentity::GC_CARD,
                access: crate::ir::kinds::MemoryAccess::BYTE,
            },
            &[a],
        );
        assert!(g.stamp(r).contains(255));
        assert_eq!(g.stamp(r).kind(), ValueKind::Int);
    }
}
