//! Short-circuit expansion.
//!
//! Instruction selection only understands simple conditions, so at the low
//! tier every `ShortCircuitOr` consumed by control flow becomes nested
//! branches:
//!
//! ```text
//! if (x' || y') T else F
//!   =>
//! if (x') goto M else { if (y') goto M else F }
//! M: merge -> T
//! ```
//!
//! where `x'` is `x` with the or's negation applied. Conditionals select
//! through a nested conditional instead. Fixed guards are first turned into
//! their `If`/`Deoptimize` shape.

use super::Phase;
use crate::ir::graph::Graph;
use crate::ir::kinds::NodeKind;
use crate::ir::node::NodeId;
use crate::lowering::guards::fixed_guard_to_if;
use kiln_core::{KilnError, KilnResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandLogicPhase;

impl ExpandLogicPhase {
    pub fn new() -> Self {
        Self
    }

    fn is_or(graph: &Graph, id: Option<NodeId>) -> bool {
        id.is_some_and(|c| matches!(graph.kind(c), NodeKind::ShortCircuitOr { .. }))
    }

    fn expand_if(graph: &mut Graph, if_node: NodeId, probability: f64) -> KilnResult<Vec<NodeId>> {
        let or = input(graph, if_node, 0)?;
        let NodeKind::ShortCircuitOr { x_negated, y_negated } = *graph.kind(or) else {
            return Ok(Vec::new());
        };
        let (x, y) = (input(graph, or, 0)?, input(graph, or, 1)?);
        let true_target = graph.successors(if_node)[0];
        let false_target = graph.successors(if_node)[1];
        let pred = graph
            .predecessor(if_node)
            .ok_or_else(|| KilnError::internal_at(if_node.index(), "If without predecessor"))?;
        let slot = graph
            .successors(pred)
            .iter()
            .position(|&s| s == if_node)
            .ok_or_else(|| KilnError::internal_at(if_node.index(), "If not linked"))?;
        let position = graph.node(if_node).position.clone();

        graph.set_successor(if_node, 0, None);
        graph.set_successor(if_node, 1, None);

        let first_end = graph.add_fixed(NodeKind::End, &[]);
        let second_end = graph.add_fixed(NodeKind::End, &[]);
        let merge = graph.add_fixed(NodeKind::Merge, &[first_end, second_end]);
        graph.set_next(merge, Some(true_target));

        let first_true = begin_to(graph, first_end);
        let second_true = begin_to(graph, second_end);
        let second = graph.add_fixed(NodeKind::If { probability }, &[y]);
        let first_false = begin_to(graph, second);
        let first = graph.add_fixed(NodeKind::If { probability }, &[x]);

        link_branches(graph, first, first_true, first_false, x_negated);
        link_branches(graph, second, second_true, false_target, y_negated);

        for id in [first, second, merge, first_true, second_true, first_false, first_end, second_end] {
            graph.node_mut(id).position = position.clone();
        }
        graph.set_successor(pred, slot, Some(first));
        for user in graph.guard_usages(if_node) {
            graph.set_guard(user, Some(first_false));
        }
        graph.kill_with_unused_inputs(if_node);
        Ok(vec![first, second])
    }

    fn expand_conditional(graph: &mut Graph, conditional: NodeId) -> KilnResult<Vec<NodeId>> {
        let or = input(graph, conditional, 0)?;
        let NodeKind::ShortCircuitOr { x_negated, y_negated } = *graph.kind(or) else {
            return Ok(Vec::new());
        };
        let (x, y) = (input(graph, or, 0)?, input(graph, or, 1)?);
        let (a, b) = (input(graph, conditional, 1)?, input(graph, conditional, 2)?);
        let stamp = graph.stamp(conditional);
        let inner_inputs = if y_negated { [y, b, a] } else { [y, a, b] };
        let inner = graph.add_with_stamp(NodeKind::Conditional, &inner_inputs, stamp);
        let outer_inputs = if x_negated { [x, inner, a] } else { [x, a, inner] };
        let outer = graph.add_with_stamp(NodeKind::Conditional, &outer_inputs, stamp);
        graph.replace_node(conditional, outer)?;
        Ok(vec![inner, outer])
    }
}

impl Phase for ExpandLogicPhase {
    fn name(&self) -> &'static str {
        "ExpandLogic"
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        let guards: Vec<NodeId> = graph
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::FixedGuard(_)) && Self::is_or(graph, n.input(0)))
            .map(|(id, _)| id)
            .collect();
        let mut worklist = Vec::new();
        for guard in guards {
            worklist.push(fixed_guard_to_if(graph, guard)?);
        }
        worklist.extend(
            graph
                .iter()
                .filter(|(_, n)| {
                    matches!(n.kind, NodeKind::If { .. } | NodeKind::Conditional) && Self::is_or(graph, n.input(0))
                })
                .map(|(id, _)| id),
        );

        let mut expanded = 0;
        while let Some(id) = worklist.pop() {
            if !graph.is_alive(id) || !Self::is_or(graph, graph.node(id).input(0)) {
                continue;
            }
            let created = match *graph.kind(id) {
                NodeKind::If { probability } => Self::expand_if(graph, id, probability)?,
                NodeKind::Conditional => Self::expand_conditional(graph, id)?,
                _ => continue,
            };
            expanded += 1;
            worklist.extend(created);
        }
        log::debug!("expand logic: {} conditions expanded", expanded);
        Ok(expanded > 0)
    }
}

fn input(graph: &Graph, id: NodeId, index: usize) -> KilnResult<NodeId> {
    graph
        .node(id)
        .input(index)
        .ok_or_else(|| KilnError::internal_at(id.index(), "input missing"))
}

/// A fresh begin whose next is `target`.
fn begin_to(graph: &mut Graph, target: NodeId) -> NodeId {
    let begin = graph.add_fixed(NodeKind::Begin, &[]);
    graph.set_next(begin, Some(target));
    begin
}

/// Wire `if_node` so that `taken` runs when its condition, after applying
/// `negated`, holds.
fn link_branches(graph: &mut Graph, if_node: NodeId, taken: NodeId, other: NodeId, negated: bool) {
    let (t, f) = if negated { (other, taken) } else { (taken, other) };
    graph.set_successor(if_node, 0, Some(t));
    graph.set_successor(if_node, 1, Some(f));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::eval::evaluate;
    use crate::ir::kinds::CompareOp;
    use crate::ir::stamp::Stamp;
    use crate::opt::verify::verify_integrity;
    use kiln_core::{AccessSize, KilnResult, RawMemory, RuntimeCalls};

    struct Nothing;
    impl RawMemory for Nothing {
        fn read(&self, _: u64, _: AccessSize) -> u64 {
            0
        }
        fn write(&mut self, _: u64, _: AccessSize, _: u64) {}
    }
    impl RuntimeCalls for Nothing {
        fn call(&mut self, _: &str, _: &[u64]) -> KilnResult<u64> {
            Ok(0)
        }
    }

    /// return (a == 0 || !(b == 0)) ? 1 : 2, as a branch.
    fn or_branch() -> Graph {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let pa = b.parameter(0, Stamp::int(32));
        let pb = b.parameter(1, Stamp::int(32));
        let zero = b.int(0);
        let ca = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[pa, zero]);
        let cb = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[pb, zero]);
        let or = b.add(
            NodeKind::ShortCircuitOr {
                x_negated: false,
                y_negated: true,
            },
            &[ca, cb],
        );
        let one = b.int(1);
        let two = b.int(2);
        let mut scope = b.begin_if(or, 0.5).unwrap();
        b.else_branch(&mut scope).unwrap();
        let join = b.end_if(scope).unwrap();
        let v = b.merge_value(&join, one, two);
        b.append_return(Some(v)).unwrap();
        g
    }

    #[test]
    fn test_expand_if_preserves_behaviour() {
        let mut g = or_branch();
        let cases = [(0u64, 0u64), (0, 1), (1, 0), (1, 1)];
        let before: Vec<_> = cases.iter().map(|&(a, b)| evaluate(&g, &[a, b], &mut Nothing).unwrap()).collect();

        assert!(ExpandLogicPhase::new().run(&mut g).unwrap());
        assert!(!g.iter().any(|(_, n)| matches!(n.kind, NodeKind::ShortCircuitOr { .. })));
        verify_integrity(&g).unwrap();

        let after: Vec<_> = cases.iter().map(|&(a, b)| evaluate(&g, &[a, b], &mut Nothing).unwrap()).collect();
        assert_eq!(before, after);
        assert_eq!(after[2].value(), Some(2));
    }

    #[test]
    fn test_expand_conditional() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::object());
        let q = b.parameter(1, Stamp::object());
        let x = b.add(NodeKind::IsNull, &[p]);
        let y = b.add(NodeKind::IsNull, &[q]);
        let or = b.add(
            NodeKind::ShortCircuitOr {
                x_negated: true,
                y_negated: false,
            },
            &[x, y],
        );
        let one = b.int(1);
        let two = b.int(2);
        let sel = b.add(NodeKind::Conditional, &[or, one, two]);
        b.append_return(Some(sel)).unwrap();

        let cases = [(0u64, 0u64), (0, 8), (8, 0), (8, 8)];
        let before: Vec<_> = cases.iter().map(|&(a, b)| evaluate(&g, &[a, b], &mut Nothing).unwrap()).collect();
        assert!(ExpandLogicPhase::new().run(&mut g).unwrap());
        let after: Vec<_> = cases.iter().map(|&(a, b)| evaluate(&g, &[a, b], &mut Nothing).unwrap()).collect();
        assert_eq!(before, after);
        assert!(!g.is_alive(or));
    }
}
