//! Canonicalization.
//!
//! Runs a worklist over the graph until no rule applies. Every rule either
//! removes nodes, replaces a node by a simpler one, or moves the graph
//! towards a normal form (constants on the right of commutative operators,
//! no negated conditions on `If` and guards), so a second run over the
//! result finds nothing to do.

use super::worklist::NodeWorklist;
use super::Phase;
use crate::ir::graph::Graph;
use crate::ir::kinds::{BinaryOp, CompareOp, GuardInfo, NodeKind};
use crate::ir::node::NodeId;
use crate::ir::stamp::{sign_normalize, zero_normalize};
use kiln_core::{CompilerOptions, KilnError, KilnResult};

// =============================================================================
// Statistics
// =============================================================================

/// Counters from the last canonicalizer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanonicalizerStats {
    /// Worklist pops.
    pub steps: usize,
    /// Nodes replaced by a simpler node.
    pub folded: usize,
    /// Unused floating nodes deleted.
    pub removed: usize,
    /// Guards, branches and merges simplified.
    pub control: usize,
}

/// Result of a floating rewrite rule.
enum Rewrite {
    None,
    /// Replace the node by this one.
    Replace(NodeId),
    /// The node was changed in place.
    InPlace,
}

// =============================================================================
// Canonicalizer
// =============================================================================

/// Fixed-point simplifier.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    max_steps: usize,
    stats: CanonicalizerStats,
}

impl Canonicalizer {
    pub fn new(options: &CompilerOptions) -> Self {
        Self::with_max_steps(options.max_canonicalizer_steps)
    }

    pub fn with_max_steps(max_steps: usize) -> Self {
        Self {
            max_steps,
            stats: CanonicalizerStats::default(),
        }
    }

    /// Counters from the last run.
    #[inline]
    pub fn stats(&self) -> CanonicalizerStats {
        self.stats
    }

    /// Canonicalize the whole graph. Returns whether anything changed.
    pub fn canonicalize(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        let worklist = NodeWorklist::with_all(graph);
        self.run_worklist(graph, worklist)
    }

    /// Canonicalize starting from `nodes` only; rewrites still propagate to
    /// neighbours.
    pub fn canonicalize_nodes(&mut self, graph: &mut Graph, nodes: &[NodeId]) -> KilnResult<bool> {
        let mut worklist = NodeWorklist::new();
        for &id in nodes {
            worklist.push(id);
        }
        self.run_worklist(graph, worklist)
    }

    fn run_worklist(&mut self, graph: &mut Graph, mut worklist: NodeWorklist) -> KilnResult<bool> {
        self.stats = CanonicalizerStats::default();
        let mut changed = false;
        while let Some(id) = worklist.pop() {
            self.stats.steps += 1;
            if self.stats.steps > self.max_steps {
                return Err(KilnError::internal(format!(
                    "canonicalizer did not converge within {} steps",
                    self.max_steps
                )));
            }
            if !graph.is_alive(id) {
                continue;
            }
            let neighbours = neighbours(graph, id);
            if self.simplify(graph, id, &mut worklist)? {
                changed = true;
                for n in neighbours {
                    if graph.is_alive(n) {
                        worklist.push(n);
                    }
                }
                if graph.is_alive(id) {
                    worklist.push(id);
                    worklist.push_usages(graph, id);
                }
            }
        }
        log::debug!(
            "canonicalizer: {} steps, {} folded, {} removed, {} control",
            self.stats.steps,
            self.stats.folded,
            self.stats.removed,
            self.stats.control
        );
        Ok(changed)
    }

    fn simplify(&mut self, graph: &mut Graph, id: NodeId, worklist: &mut NodeWorklist) -> KilnResult<bool> {
        let kind = graph.kind(id).clone();
        match kind {
            NodeKind::FixedGuard(info) => self.simplify_fixed_guard(graph, id, info, worklist),
            NodeKind::Guard(info) => self.simplify_guard(graph, id, info),
            NodeKind::If { probability } => self.simplify_if(graph, id, probability, worklist),
            NodeKind::Begin => self.simplify_begin(graph, id),
            NodeKind::Merge | NodeKind::LoopBegin => self.simplify_merge(graph, id, worklist),
            k if k.is_floating() => {
                if graph.is_unused_floating(id) {
                    log::trace!("remove unused {:?} {}", id, k);
                    graph.kill_with_unused_inputs(id);
                    self.stats.removed += 1;
                    return Ok(true);
                }
                match fold_floating(graph, id)? {
                    Rewrite::None => Ok(false),
                    Rewrite::InPlace => {
                        self.stats.folded += 1;
                        Ok(true)
                    }
                    Rewrite::Replace(replacement) => {
                        log::trace!("fold {:?} {} -> {:?}", id, k, replacement);
                        graph.replace_node(id, replacement)?;
                        worklist.push(replacement);
                        self.stats.folded += 1;
                        Ok(true)
                    }
                }
            }
            _ => Ok(false),
        }
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn simplify_fixed_guard(
        &mut self,
        graph: &mut Graph,
        id: NodeId,
        info: GuardInfo,
        worklist: &mut NodeWorklist,
    ) -> KilnResult<bool> {
        let Some(condition) = graph.node(id).input(0) else {
            return Ok(false);
        };
        match graph.kind(condition).clone() {
            NodeKind::LogicConstant(value) => {
                if !info.passes(value) {
                    log::trace!("fixed guard {:?} always fails", id);
                    if let Some(next) = graph.next(id) {
                        graph.set_next(id, None);
                        graph.kill_cfg(next);
                    }
                    let deopt = graph.add_fixed(NodeKind::Deoptimize(info.deopt()), &[]);
                    graph.node_mut(deopt).position = graph.node(id).position.clone();
                    graph.set_next(id, Some(deopt));
                    revisit_merges(graph, worklist);
                }
                graph.replace_at_usages(id, None)?;
                graph.remove_fixed(id)?;
                self.stats.control += 1;
                Ok(true)
            }
            NodeKind::LogicNegation => {
                let Some(inner) = graph.node(condition).input(0) else {
                    return Ok(false);
                };
                graph.node_mut(id).kind = NodeKind::FixedGuard(info.with_negated(!info.negated));
                graph.set_input(id, 0, inner);
                self.stats.control += 1;
                Ok(true)
            }
            NodeKind::ShortCircuitOr { x_negated, y_negated }
                if info.negated && !graph.has_usages(id) =>
            {
                let (Some(x), Some(y)) = (graph.node(condition).input(0), graph.node(condition).input(1)) else {
                    return Ok(false);
                };
                // !(x' || y') holds exactly when both !x' and !y' hold.
                let position = graph.node(id).position.clone();
                let second = graph.add_fixed(NodeKind::FixedGuard(info.with_negated(!y_negated)), &[y]);
                graph.node_mut(second).position = position.clone();
                graph.add_after_fixed(id, second)?;
                let first = graph.add_fixed(NodeKind::FixedGuard(info.with_negated(!x_negated)), &[x]);
                graph.node_mut(first).position = position;
                graph.replace_fixed(id, first)?;
                worklist.push(first);
                worklist.push(second);
                self.stats.control += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn simplify_guard(&mut self, graph: &mut Graph, id: NodeId, info: GuardInfo) -> KilnResult<bool> {
        let Some(condition) = graph.node(id).input(0) else {
            return Ok(false);
        };
        match *graph.kind(condition) {
            NodeKind::LogicConstant(value) if info.passes(value) => {
                let anchor = graph.node(id).guard();
                graph.replace_at_usages(id, anchor)?;
                graph.kill_with_unused_inputs(id);
                self.stats.control += 1;
                Ok(true)
            }
            NodeKind::LogicNegation => {
                let Some(inner) = graph.node(condition).input(0) else {
                    return Ok(false);
                };
                graph.node_mut(id).kind = NodeKind::Guard(info.with_negated(!info.negated));
                graph.set_input(id, 0, inner);
                self.stats.control += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    fn simplify_if(
        &mut self,
        graph: &mut Graph,
        id: NodeId,
        probability: f64,
        worklist: &mut NodeWorklist,
    ) -> KilnResult<bool> {
        let Some(condition) = graph.node(id).input(0) else {
            return Ok(false);
        };
        match *graph.kind(condition) {
            NodeKind::LogicConstant(value) => {
                let (live_slot, dead_slot) = if value { (0, 1) } else { (1, 0) };
                let live = graph.successors(id)[live_slot];
                let dead = graph.successors(id)[dead_slot];
                let pred = graph
                    .predecessor(id)
                    .ok_or_else(|| KilnError::internal_at(id.index(), "If without predecessor"))?;
                let slot = graph
                    .successors(pred)
                    .iter()
                    .position(|&s| s == id)
                    .ok_or_else(|| KilnError::internal_at(id.index(), "If not linked from predecessor"))?;
                log::trace!("If {:?} always takes {:?}", id, live);
                graph.set_successor(id, dead_slot, None);
                if dead.is_valid() {
                    graph.kill_cfg(dead);
                }
                graph.set_successor(id, live_slot, None);
                graph.set_successor(pred, slot, Some(live));
                graph.kill_with_unused_inputs(id);
                worklist.push(live);
                revisit_merges(graph, worklist);
                self.stats.control += 1;
                Ok(true)
            }
            NodeKind::LogicNegation => {
                let Some(inner) = graph.node(condition).input(0) else {
                    return Ok(false);
                };
                let (t, f) = (graph.successors(id)[0], graph.successors(id)[1]);
                graph.set_successor(id, 0, None);
                graph.set_successor(id, 1, None);
                graph.set_successor(id, 0, Some(f).filter(|s| s.is_valid()));
                graph.set_successor(id, 1, Some(t).filter(|s| s.is_valid()));
                graph.node_mut(id).kind = NodeKind::If {
                    probability: 1.0 - probability,
                };
                graph.set_input(id, 0, inner);
                self.stats.control += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// A plain begin that does not follow a split is redundant.
    fn simplify_begin(&mut self, graph: &mut Graph, id: NodeId) -> KilnResult<bool> {
        let Some(pred) = graph.predecessor(id) else {
            return Ok(false);
        };
        if matches!(graph.kind(pred), NodeKind::If { .. }) {
            return Ok(false);
        }
        graph.evacuate_guards(id)?;
        if graph.has_usages(id) {
            return Ok(false);
        }
        graph.remove_fixed(id)?;
        self.stats.control += 1;
        Ok(true)
    }

    fn simplify_merge(&mut self, graph: &mut Graph, id: NodeId, worklist: &mut NodeWorklist) -> KilnResult<bool> {
        let ends = graph.merge_ends(id);
        match ends.len() {
            0 => {
                graph.kill_cfg(id);
                self.stats.control += 1;
                Ok(true)
            }
            1 => {
                if matches!(graph.kind(id), NodeKind::LoopBegin) {
                    self.degenerate_loop(graph, id, worklist)?;
                }
                reduce_trivial_merge(graph, id, ends[0], worklist)?;
                self.stats.control += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Turn the exits of a loop without back edges into plain begins.
    fn degenerate_loop(&mut self, graph: &mut Graph, loop_begin: NodeId, worklist: &mut NodeWorklist) -> KilnResult<()> {
        let exits: Vec<NodeId> = graph
            .distinct_usages(loop_begin)
            .into_iter()
            .filter(|&u| matches!(graph.kind(u), NodeKind::LoopExit))
            .collect();
        for exit in exits {
            let begin = graph.add_fixed(NodeKind::Begin, &[]);
            graph.node_mut(begin).position = graph.node(exit).position.clone();
            let pred = graph.predecessor(exit);
            let next = graph.next(exit);
            graph.set_next(exit, None);
            if let Some(pred) = pred {
                let slot = graph
                    .successors(pred)
                    .iter()
                    .position(|&s| s == exit)
                    .ok_or_else(|| KilnError::internal_at(exit.index(), "loop exit not linked"))?;
                graph.set_successor(pred, slot, Some(begin));
            }
            graph.set_next(begin, next);
            for user in graph.guard_usages(exit) {
                graph.set_guard(user, Some(begin));
            }
            graph.replace_at_usages(exit, Some(begin))?;
            graph.kill(exit);
            worklist.push(begin);
        }
        Ok(())
    }
}

impl Phase for Canonicalizer {
    fn name(&self) -> &'static str {
        "Canonicalizer"
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        self.canonicalize(graph)
    }
}

// =============================================================================
// Floating Rules
// =============================================================================

fn fold_floating(graph: &mut Graph, id: NodeId) -> KilnResult<Rewrite> {
    let kind = graph.kind(id).clone();
    let inputs = graph.node(id).inputs().to_vec();
    let input = |i: usize| -> KilnResult<NodeId> {
        inputs
            .get(i)
            .copied()
            .ok_or_else(|| KilnError::internal_at(id.index(), "input missing"))
    };
    let bits = graph.stamp(id).bits().max(1);

    Ok(match kind {
        NodeKind::Binary(op) => {
            let (x, y) = (input(0)?, input(1)?);
            let (cx, cy) = (graph.as_integer(x), graph.as_integer(y));
            if let (Some(a), Some(b)) = (cx, cy) {
                Rewrite::Replace(int_node(graph, bits, op.fold(bits, a, b)))
            } else if op.is_commutative() && cx.is_some() {
                graph.set_input(id, 0, y);
                graph.set_input(id, 1, x);
                Rewrite::InPlace
            } else if cy.is_some() && cy == op.right_identity() && graph.stamp(x).bits() == bits {
                Rewrite::Replace(x)
            } else if cy == Some(0) && matches!(op, BinaryOp::Mul | BinaryOp::And) {
                Rewrite::Replace(int_node(graph, bits, 0))
            } else if x == y {
                match op {
                    BinaryOp::Sub | BinaryOp::Xor => Rewrite::Replace(int_node(graph, bits, 0)),
                    BinaryOp::And | BinaryOp::Or => Rewrite::Replace(x),
                    _ => Rewrite::None,
                }
            } else {
                Rewrite::None
            }
        }
        NodeKind::Negate => {
            let x = input(0)?;
            if let Some(a) = graph.as_integer(x) {
                Rewrite::Replace(int_node(graph, bits, BinaryOp::Sub.fold(bits, 0, a)))
            } else if matches!(graph.kind(x), NodeKind::Negate) {
                Rewrite::Replace(input_of(graph, x, 0)?)
            } else {
                Rewrite::None
            }
        }
        NodeKind::Not => {
            let x = input(0)?;
            if let Some(a) = graph.as_integer(x) {
                Rewrite::Replace(int_node(graph, bits, sign_normalize(bits, !a)))
            } else if matches!(graph.kind(x), NodeKind::Not) {
                Rewrite::Replace(input_of(graph, x, 0)?)
            } else {
                Rewrite::None
            }
        }
        NodeKind::Narrow { bits: to } => match graph.as_integer(input(0)?) {
            Some(a) => Rewrite::Replace(int_node(graph, to, sign_normalize(to, a))),
            None => Rewrite::None,
        },
        NodeKind::SignExtend { from, to } => match graph.as_integer(input(0)?) {
            Some(a) => Rewrite::Replace(int_node(graph, to, sign_normalize(from, a))),
            None => Rewrite::None,
        },
        NodeKind::ZeroExtend { from, to } => match graph.as_integer(input(0)?) {
            Some(a) => Rewrite::Replace(int_node(graph, to, zero_normalize(from, a) as i64)),
            None => Rewrite::None,
        },
        NodeKind::OffsetAddress => {
            let (x, y) = (input(0)?, input(1)?);
            match (graph.as_integer(x), graph.as_integer(y)) {
                (Some(a), Some(b)) => Rewrite::Replace(graph.long(a.wrapping_add(b))),
                (_, Some(0)) => Rewrite::Replace(x),
                _ => Rewrite::None,
            }
        }
        NodeKind::Compare(op) => fold_compare(graph, op, input(0)?, input(1)?),
        NodeKind::IsNull => {
            let x = input(0)?;
            let stamp = graph.stamp(x);
            match graph.as_constant(x) {
                Some(c) => Rewrite::Replace(graph.logic_constant(c.is_null())),
                None if stamp.is_non_null() => Rewrite::Replace(graph.logic_constant(false)),
                None if stamp.is_always_null() => Rewrite::Replace(graph.logic_constant(true)),
                None => Rewrite::None,
            }
        }
        NodeKind::LogicNegation => {
            let x = input(0)?;
            match *graph.kind(x) {
                NodeKind::LogicConstant(v) => Rewrite::Replace(graph.logic_constant(!v)),
                NodeKind::LogicNegation => Rewrite::Replace(input_of(graph, x, 0)?),
                _ => Rewrite::None,
            }
        }
        NodeKind::ShortCircuitOr { x_negated, y_negated } => {
            let (x, y) = (input(0)?, input(1)?);
            match (graph.kind(x).clone(), graph.kind(y).clone()) {
                (NodeKind::LogicConstant(a), _) => {
                    if a != x_negated {
                        Rewrite::Replace(graph.logic_constant(true))
                    } else {
                        Rewrite::Replace(negate_if(graph, y, y_negated))
                    }
                }
                (_, NodeKind::LogicConstant(b)) => {
                    if b != y_negated {
                        Rewrite::Replace(graph.logic_constant(true))
                    } else {
                        Rewrite::Replace(negate_if(graph, x, x_negated))
                    }
                }
                _ => Rewrite::None,
            }
        }
        NodeKind::Conditional => {
            let (c, a, b) = (input(0)?, input(1)?, input(2)?);
            match *graph.kind(c) {
                NodeKind::LogicConstant(v) => Rewrite::Replace(if v { a } else { b }),
                _ if a == b => Rewrite::Replace(a),
                _ => Rewrite::None,
            }
        }
        NodeKind::Phi => {
            let mut unique = None;
            for &value in &inputs[1..] {
                if value == id || Some(value) == unique {
                    continue;
                }
                if unique.is_some() {
                    return Ok(Rewrite::None);
                }
                unique = Some(value);
            }
            match unique {
                Some(v) => Rewrite::Replace(v),
                None => Rewrite::None,
            }
        }
        _ => Rewrite::None,
    })
}

fn fold_compare(graph: &mut Graph, op: CompareOp, x: NodeId, y: NodeId) -> Rewrite {
    let (cx, cy) = (graph.as_constant(x), graph.as_constant(y));
    if op.is_float() {
        return match (cx.and_then(|c| c.as_f64()), cy.and_then(|c| c.as_f64())) {
            (Some(a), Some(b)) => Rewrite::Replace(graph.logic_constant(op.fold_float(a, b))),
            _ => Rewrite::None,
        };
    }
    if op == CompareOp::ObjectEquals {
        return match (cx, cy) {
            (Some(a), Some(b)) => Rewrite::Replace(graph.logic_constant(a.as_i64() == b.as_i64())),
            (Some(c), None) if c.is_null() => Rewrite::Replace(graph.add_floating(NodeKind::IsNull, &[y])),
            (None, Some(c)) if c.is_null() => Rewrite::Replace(graph.add_floating(NodeKind::IsNull, &[x])),
            _ if x == y => Rewrite::Replace(graph.logic_constant(true)),
            _ => Rewrite::None,
        };
    }
    let bits = graph.stamp(x).bits().max(graph.stamp(y).bits()).max(1);
    match (graph.as_integer(x), graph.as_integer(y)) {
        (Some(a), Some(b)) => Rewrite::Replace(graph.logic_constant(op.fold_integer(bits, a, b))),
        _ if x == y => match op {
            CompareOp::IntegerEquals => Rewrite::Replace(graph.logic_constant(true)),
            CompareOp::IntegerLessThan | CompareOp::IntegerBelow => {
                Rewrite::Replace(graph.logic_constant(false))
            }
            _ => Rewrite::None,
        },
        _ => Rewrite::None,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Inputs, usages and control neighbours of `id`.
fn neighbours(graph: &Graph, id: NodeId) -> Vec<NodeId> {
    let node = graph.node(id);
    let mut out: Vec<NodeId> = node.def_edges().collect();
    out.extend(graph.distinct_usages(id));
    out.extend(node.predecessor());
    out.extend(node.successors().iter().copied().filter(|s| s.is_valid()));
    out
}

/// Queue every merge and its phis; used after control flow was cut.
fn revisit_merges(graph: &Graph, worklist: &mut NodeWorklist) {
    let merges: Vec<NodeId> = graph
        .iter()
        .filter(|(_, n)| n.kind.is_merge())
        .map(|(id, _)| id)
        .collect();
    for merge in merges {
        worklist.push(merge);
        for phi in graph.phis(merge) {
            worklist.push(phi);
        }
    }
}

/// Replace a merge with a single end by a direct control link.
fn reduce_trivial_merge(graph: &mut Graph, merge: NodeId, end: NodeId, worklist: &mut NodeWorklist) -> KilnResult<()> {
    for phi in graph.phis(merge) {
        let value = input_of(graph, phi, 1)?;
        let replacement = if value == phi {
            return Err(KilnError::internal_at(phi.index(), "phi only refers to itself"));
        } else {
            value
        };
        graph.replace_node(phi, replacement)?;
        worklist.push(replacement);
    }
    let pred = graph
        .predecessor(end)
        .ok_or_else(|| KilnError::internal_at(end.index(), "end without predecessor"))?;
    let anchor = graph
        .prev_begin(pred)
        .ok_or_else(|| KilnError::internal_at(merge.index(), "no begin above merge"))?;
    for user in graph.guard_usages(merge) {
        graph.set_guard(user, Some(anchor));
    }
    let next = graph.next(merge);
    graph.set_next(merge, None);
    graph.remove_input(merge, 0);
    let slot = graph
        .successors(pred)
        .iter()
        .position(|&s| s == end)
        .ok_or_else(|| KilnError::internal_at(end.index(), "end not linked from predecessor"))?;
    graph.set_successor(pred, slot, next);
    if graph.has_usages(merge) {
        return Err(KilnError::internal_at(merge.index(), "merge still used after reduction"));
    }
    graph.kill(end);
    graph.kill(merge);
    worklist.push(pred);
    worklist.push(anchor);
    Ok(())
}

fn input_of(graph: &Graph, id: NodeId, index: usize) -> KilnResult<NodeId> {
    graph
        .node(id)
        .input(index)
        .ok_or_else(|| KilnError::internal_at(id.index(), "input missing"))
}

fn int_node(graph: &mut Graph, bits: u32, value: i64) -> NodeId {
    if bits > 32 {
        graph.long(value)
    } else {
        graph.int(sign_normalize(32, value) as i32)
    }
}

fn negate_if(graph: &mut Graph, condition: NodeId, negate: bool) -> NodeId {
    if negate {
        graph.add_floating(NodeKind::LogicNegation, &[condition])
    } else {
        condition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::stamp::Stamp;
    use kiln_core::{DeoptAction, DeoptReason};

    fn canon(graph: &mut Graph) -> bool {
        Canonicalizer::with_max_steps(10_000).canonicalize(graph).unwrap()
    }

    #[test]
    fn test_fold_arithmetic() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let two = b.int(2);
        let three = b.int(3);
        let sum = b.add(NodeKind::Binary(BinaryOp::Add), &[two, three]);
        let ret = b.append_return(Some(sum)).unwrap();
        assert!(canon(&mut g));
        let value = g.node(ret).input(0).unwrap();
        assert_eq!(g.as_integer(value), Some(5));
        assert!(g.dangling_inputs().is_empty());
    }

    #[test]
    fn test_constant_moves_right() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let seven = b.int(7);
        let mul = b.add(NodeKind::Binary(BinaryOp::Mul), &[seven, x]);
        b.append_return(Some(mul)).unwrap();
        assert!(canon(&mut g));
        assert_eq!(g.node(mul).input(0), Some(x));
        assert_eq!(g.node(mul).input(1), Some(seven));
        assert!(!canon(&mut g));
    }

    #[test]
    fn test_identity_removed() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let zero = b.int(0);
        let add = b.add(NodeKind::Binary(BinaryOp::Add), &[x, zero]);
        let ret = b.append_return(Some(add)).unwrap();
        canon(&mut g);
        assert_eq!(g.node(ret).input(0), Some(x));
        assert!(!g.is_alive(add));
        assert!(!g.is_alive(zero));
    }

    #[test]
    fn test_double_negation() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::object());
        let c = b.add(NodeKind::IsNull, &[p]);
        let n1 = b.add(NodeKind::LogicNegation, &[c]);
        let n2 = b.add(NodeKind::LogicNegation, &[n1]);
        let info = GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::None, true);
        let guard = b.append(NodeKind::FixedGuard(info), &[n2]).unwrap();
        b.append_return(None).unwrap();
        canon(&mut g);
        assert_eq!(g.node(guard).input(0), Some(c));
        assert_eq!(g.kind(guard), &NodeKind::FixedGuard(info));
    }

    #[test]
    fn test_if_constant_true_kills_false_branch() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let t = b.graph().logic_constant(true);
        let one = b.int(1);
        let two = b.int(2);
        let mut scope = b.begin_if(t, 0.5).unwrap();
        b.else_branch(&mut scope).unwrap();
        let join = b.end_if(scope).unwrap();
        let v = b.merge_value(&join, one, two);
        let ret = b.append_return(Some(v)).unwrap();

        assert!(canon(&mut g));
        assert_eq!(g.as_integer(g.node(ret).input(0).unwrap()), Some(1));
        assert!(!g.iter().any(|(_, n)| matches!(n.kind, NodeKind::If { .. } | NodeKind::Merge)));
        assert!(g.dangling_inputs().is_empty());
        assert!(g.usage_index_consistent());
        assert_eq!(g.next(g.start()), Some(ret));
        assert!(!canon(&mut g));
    }

    #[test]
    fn test_fixed_guard_always_failing_becomes_deopt() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let f = b.graph().logic_constant(false);
        let info = GuardInfo::new(DeoptReason::TransferToInterpreter, DeoptAction::InvalidateRecompile, false);
        b.append(NodeKind::FixedGuard(info), &[f]).unwrap();
        let ret = b.append_return(None).unwrap();
        canon(&mut g);
        assert!(!g.is_alive(ret));
        let next = g.next(g.start()).unwrap();
        assert_eq!(g.kind(next), &NodeKind::Deoptimize(info.deopt()));
    }

    #[test]
    fn test_fixed_guard_always_passing_removed() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let t = b.graph().logic_constant(true);
        let info = GuardInfo::new(DeoptReason::TransferToInterpreter, DeoptAction::None, false);
        let guard = b.append(NodeKind::FixedGuard(info), &[t]).unwrap();
        let ret = b.append_return(None).unwrap();
        canon(&mut g);
        assert!(!g.is_alive(guard));
        assert_eq!(g.next(g.start()), Some(ret));
    }

    #[test]
    fn test_split_short_circuit_guard() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::object());
        let q = b.parameter(1, Stamp::object());
        let a = b.add(NodeKind::IsNull, &[p]);
        let c = b.add(NodeKind::IsNull, &[q]);
        let or = b.add(
            NodeKind::ShortCircuitOr {
                x_negated: false,
                y_negated: true,
            },
            &[a, c],
        );
        let info = GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::InvalidateReprofile, true);
        b.append(NodeKind::FixedGuard(info), &[or]).unwrap();
        b.append_return(None).unwrap();
        canon(&mut g);

        let first = g.next(g.start()).unwrap();
        let second = g.next(first).unwrap();
        assert_eq!(g.kind(first), &NodeKind::FixedGuard(info.with_negated(true)));
        assert_eq!(g.node(first).input(0), Some(a));
        assert_eq!(g.kind(second), &NodeKind::FixedGuard(info.with_negated(false)));
        assert_eq!(g.node(second).input(0), Some(c));
        assert!(!g.is_alive(or));
    }

    #[test]
    fn test_step_limit_reports_internal() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let two = b.int(2);
        let three = b.int(3);
        let sum = b.add(NodeKind::Binary(BinaryOp::Add), &[two, three]);
        b.append_return(Some(sum)).unwrap();
        let err = Canonicalizer::with_max_steps(1).canonicalize(&mut g).unwrap_err();
        assert!(err.is_internal());
    }
}
