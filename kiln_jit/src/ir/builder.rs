//! Structured graph construction.
//!
//! [`GraphBuilder`] appends fixed nodes at a moving control tail and builds
//! the control shapes the graph expects (If with begins, merges with ends,
//! loops with loop ends and exits), so callers never wire successors by
//! hand.
//!
//! ```ignore
//! let mut b = GraphBuilder::new(&mut graph);
//! let x = b.parameter(0, Stamp::int(32));
//! let mut scope = b.begin_if(cond, 0.5)?;
//! // ... then branch ...
//! b.else_branch(&mut scope)?;
//! // ... else branch ...
//! let join = b.end_if(scope)?;
//! let v = b.merge_value(&join, a, c);
//! b.append_return(Some(v))?;
//! ```

use super::graph::Graph;
use super::kinds::{DeoptInfo, LocationIdentity, MemoryAccess, NodeKind};
use super::node::NodeId;
use super::stamp::Stamp;
use crate::ir::kinds::BarrierKind;
use kiln_core::{KilnError, KilnResult};

/// An open `If` created by [`GraphBuilder::begin_if`].
#[derive(Debug)]
pub struct IfScope {
    pub if_node: NodeId,
    pub true_begin: NodeId,
    pub false_begin: NodeId,
    /// Tail of the true branch once `else_branch` was called.
    true_tail: Option<Option<NodeId>>,
}

/// Result of closing an [`IfScope`].
#[derive(Debug, Clone, Copy)]
pub struct Join {
    /// Merge of both branches, when both fall through.
    pub merge: Option<NodeId>,
    pub true_live: bool,
    pub false_live: bool,
}

/// An open loop created by [`GraphBuilder::begin_loop`].
#[derive(Debug)]
pub struct LoopScope {
    pub loop_begin: NodeId,
    phis: Vec<NodeId>,
    exits: Vec<NodeId>,
}

/// Appends nodes at a control tail.
pub struct GraphBuilder<'g> {
    graph: &'g mut Graph,
    last: Option<NodeId>,
}

impl<'g> GraphBuilder<'g> {
    /// Start building after the graph's start node.
    pub fn new(graph: &'g mut Graph) -> Self {
        let start = graph.start();
        GraphBuilder {
            graph,
            last: Some(start),
        }
    }

    /// Continue building after `tail`.
    pub fn at(graph: &'g mut Graph, tail: Option<NodeId>) -> Self {
        GraphBuilder { graph, last: tail }
    }

    /// The graph under construction.
    #[inline]
    pub fn graph(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    /// Current control tail; `None` after a control sink.
    #[inline]
    pub fn current(&self) -> Option<NodeId> {
        self.last
    }

    /// Whether control still falls through to the tail.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.last.is_some()
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn parameter(&mut self, index: u32, stamp: Stamp) -> NodeId {
        self.graph.parameter(index, stamp)
    }

    /// Add a floating node.
    pub fn add(&mut self, kind: NodeKind, inputs: &[NodeId]) -> NodeId {
        self.graph.add_node(kind, inputs)
    }

    pub fn int(&mut self, value: i32) -> NodeId {
        self.graph.int(value)
    }

    pub fn long(&mut self, value: i64) -> NodeId {
        self.graph.long(value)
    }

    // =========================================================================
    // Fixed Nodes
    // =========================================================================

    fn link(&mut self, node: NodeId) -> KilnResult<()> {
        let last = self.last.ok_or_else(|| {
            KilnError::internal_at(node.index(), "appending after a control sink")
        })?;
        self.graph.set_next(last, Some(node));
        self.last = if self.graph.kind(node).has_next() {
            Some(node)
        } else {
            None
        };
        Ok(())
    }

    /// Append a fixed node at the tail.
    pub fn append(&mut self, kind: NodeKind, inputs: &[NodeId]) -> KilnResult<NodeId> {
        let id = self.graph.add_fixed(kind, inputs);
        self.link(id)?;
        Ok(id)
    }

    /// Append a fixed node with an explicit stamp.
    pub fn append_with_stamp(
        &mut self,
        kind: NodeKind,
        inputs: &[NodeId],
        stamp: Stamp,
    ) -> KilnResult<NodeId> {
        let id = self.graph.add_with_stamp(kind, inputs, stamp);
        self.link(id)?;
        Ok(id)
    }

    /// Append an already created, unlinked fixed node.
    pub fn append_existing(&mut self, node: NodeId) -> KilnResult<()> {
        self.link(node)
    }

    pub fn append_return(&mut self, value: Option<NodeId>) -> KilnResult<NodeId> {
        let inputs: Vec<NodeId> = value.into_iter().collect();
        self.append(NodeKind::Return, &inputs)
    }

    pub fn append_deopt(&mut self, info: DeoptInfo) -> KilnResult<NodeId> {
        self.append(NodeKind::Deoptimize(info), &[])
    }

    /// Append a load of `address`.
    pub fn read(
        &mut self,
        location: LocationIdentity,
        access: MemoryAccess,
        address: NodeId,
    ) -> KilnResult<NodeId> {
        self.append(NodeKind::Read { location, access }, &[address])
    }

    /// Append a barrier-free store.
    pub fn write(
        &mut self,
        location: LocationIdentity,
        access: MemoryAccess,
        address: NodeId,
        value: NodeId,
    ) -> KilnResult<NodeId> {
        self.append(
            NodeKind::Write {
                location,
                access,
                barrier: BarrierKind::None,
            },
            &[address, value],
        )
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// Append `If(condition)` and continue in its true branch.
    pub fn begin_if(&mut self, condition: NodeId, probability: f64) -> KilnResult<IfScope> {
        let if_node = self.append(NodeKind::If { probability }, &[condition])?;
        let true_begin = self.graph.add_fixed(NodeKind::Begin, &[]);
        let false_begin = self.graph.add_fixed(NodeKind::Begin, &[]);
        self.graph.set_successor(if_node, 0, Some(true_begin));
        self.graph.set_successor(if_node, 1, Some(false_begin));
        self.last = Some(true_begin);
        Ok(IfScope {
            if_node,
            true_begin,
            false_begin,
            true_tail: None,
        })
    }

    /// Close the true branch and continue in the false branch.
    pub fn else_branch(&mut self, scope: &mut IfScope) -> KilnResult<()> {
        if scope.true_tail.is_some() {
            return Err(KilnError::internal_at(scope.if_node.index(), "else branch opened twice"));
        }
        scope.true_tail = Some(self.last);
        self.last = Some(scope.false_begin);
        Ok(())
    }

    /// Close both branches, merging the ones that fall through.
    pub fn end_if(&mut self, scope: IfScope) -> KilnResult<Join> {
        let (true_tail, false_tail) = match scope.true_tail {
            Some(true_tail) => (true_tail, self.last),
            None => (self.last, Some(scope.false_begin)),
        };
        let join = match (true_tail, false_tail) {
            (Some(t), Some(f)) => {
                let merge = self.merge_tails(&[t, f])?;
                Join {
                    merge: Some(merge),
                    true_live: true,
                    false_live: true,
                }
            }
            (Some(t), None) => {
                self.last = Some(t);
                Join {
                    merge: None,
                    true_live: true,
                    false_live: false,
                }
            }
            (None, Some(f)) => {
                self.last = Some(f);
                Join {
                    merge: None,
                    true_live: false,
                    false_live: true,
                }
            }
            (None, None) => {
                self.last = None;
                Join {
                    merge: None,
                    true_live: false,
                    false_live: false,
                }
            }
        };
        Ok(join)
    }

    /// End each tail and merge them; continue after the merge.
    pub fn merge_tails(&mut self, tails: &[NodeId]) -> KilnResult<NodeId> {
        let mut ends = Vec::with_capacity(tails.len());
        for &tail in tails {
            self.last = Some(tail);
            ends.push(self.append(NodeKind::End, &[])?);
        }
        let merge = self.graph.add_fixed(NodeKind::Merge, &ends);
        self.last = Some(merge);
        Ok(merge)
    }

    /// Value flowing out of a join: a phi when both branches merged,
    /// otherwise the live branch's value.
    pub fn merge_value(&mut self, join: &Join, if_true: NodeId, if_false: NodeId) -> NodeId {
        match join.merge {
            Some(merge) => {
                let stamp = self.graph.stamp(if_true).meet(&self.graph.stamp(if_false));
                self.graph.add_phi(merge, &[if_true, if_false], stamp)
            }
            None if join.true_live => if_true,
            None => if_false,
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// End the current block and open a loop header.
    pub fn begin_loop(&mut self) -> KilnResult<LoopScope> {
        let forward = self.append(NodeKind::End, &[])?;
        let loop_begin = self.graph.add_fixed(NodeKind::LoopBegin, &[forward]);
        self.last = Some(loop_begin);
        Ok(LoopScope {
            loop_begin,
            phis: Vec::new(),
            exits: Vec::new(),
        })
    }

    /// Loop phi with entry value `init`; its back edge value is given to
    /// [`end_loop`](Self::end_loop).
    pub fn loop_phi(&mut self, scope: &mut LoopScope, init: NodeId, stamp: Stamp) -> NodeId {
        let phi = self.graph.add_phi(scope.loop_begin, &[init], stamp);
        scope.phis.push(phi);
        phi
    }

    /// Leave the loop when `condition` is false; stay in it otherwise.
    /// `probability` is the chance of staying.
    pub fn loop_exit_unless(
        &mut self,
        scope: &mut LoopScope,
        condition: NodeId,
        probability: f64,
    ) -> KilnResult<()> {
        let if_node = self.append(NodeKind::If { probability }, &[condition])?;
        let stay = self.graph.add_fixed(NodeKind::Begin, &[]);
        let exit = self.graph.add_fixed(NodeKind::LoopExit, &[scope.loop_begin]);
        self.graph.set_successor(if_node, 0, Some(stay));
        self.graph.set_successor(if_node, 1, Some(exit));
        scope.exits.push(exit);
        self.last = Some(stay);
        Ok(())
    }

    /// Close the loop body with a back edge and continue after the exits.
    pub fn end_loop(&mut self, scope: LoopScope, backedges: &[(NodeId, NodeId)]) -> KilnResult<()> {
        if let Some(&phi) = scope.phis.iter().find(|p| !backedges.iter().any(|(q, _)| q == *p)) {
            return Err(KilnError::internal_at(phi.index(), "loop phi without back edge value"));
        }
        if self.is_live() {
            let loop_end = self.append(NodeKind::LoopEnd, &[])?;
            self.graph.push_input(scope.loop_begin, loop_end);
            for &(phi, value) in backedges {
                self.graph.push_input(phi, value);
            }
        }
        match scope.exits.as_slice() {
            [] => self.last = None,
            [exit] => self.last = Some(*exit),
            exits => {
                let exits = exits.to_vec();
                self.merge_tails(&exits)?;
            }
        }
        Ok(())
    }
}
