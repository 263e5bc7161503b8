//! Integer compare widening.
//!
//! SPARC compares only 32- and 64-bit registers. Sub-word operands of an
//! integer comparison are extended to 32 bits first: sign extension for
//! signed and equality tests, zero extension for unsigned `below`.

use super::Phase;
use crate::ir::graph::Graph;
use crate::ir::kinds::{CompareOp, NodeKind};
use crate::ir::node::NodeId;
use kiln_core::KilnResult;

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCompareWidening;

impl IntegerCompareWidening {
    pub fn new() -> Self {
        Self
    }

    fn widen(graph: &mut Graph, compare: NodeId, op: CompareOp) -> bool {
        let mut changed = false;
        for index in 0..2 {
            let Some(input) = graph.node(compare).input(index) else {
                continue;
            };
            let stamp = graph.stamp(input);
            if !stamp.is_integer() || stamp.bits() >= 32 {
                continue;
            }
            let from = stamp.bits();
            let kind = if op == CompareOp::IntegerBelow {
                NodeKind::ZeroExtend { from, to: 32 }
            } else {
                NodeKind::SignExtend { from, to: 32 }
            };
            let wide = graph.add_floating(kind, &[input]);
            graph.set_input(compare, index, wide);
            changed = true;
        }
        changed
    }
}

impl Phase for IntegerCompareWidening {
    fn name(&self) -> &'static str {
        "IntegerCompareWidening"
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        let compares: Vec<(NodeId, CompareOp)> = graph
            .iter()
            .filter_map(|(id, n)| match n.kind {
                NodeKind::Compare(op) if !op.is_float() && op != CompareOp::ObjectEquals => Some((id, op)),
                _ => None,
            })
            .collect();
        let mut widened = 0;
        for (id, op) in compares {
            if Self::widen(graph, id, op) {
                widened += 1;
            }
        }
        log::debug!("compare widening: {} compares widened", widened);
        Ok(widened > 0)
    }
}
