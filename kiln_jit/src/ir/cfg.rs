//! Control flow graph analysis.
//!
//! The node graph keeps control flow implicit in the successor edges of
//! fixed nodes. Code generation and some phases need explicit structure:
//! - **Basic blocks**: maximal runs of fixed nodes from a begin to a control
//!   sink or split
//! - **Dominator tree**: guard anchoring checks, floating node placement
//! - **Loop depth**: spill weights in the register allocator
//!
//! The CFG is a snapshot. Any control mutation invalidates it.

use super::arena::{BitSet, Id, SecondaryMap};
use super::graph::Graph;
use super::kinds::NodeKind;
use super::node::{Node, NodeId};
use kiln_core::{KilnError, KilnResult};
use rustc_hash::FxHashMap;

// =============================================================================
// Basic Block
// =============================================================================

/// A basic block in the CFG.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// The begin node that opens this block.
    pub begin: NodeId,

    /// Fixed nodes in control order, `begin` first.
    pub nodes: Vec<NodeId>,

    /// Predecessor blocks. For merges, in merge input order.
    pub predecessors: Vec<BlockId>,

    /// Successor blocks. For `If`, `[true, false]`.
    pub successors: Vec<BlockId>,

    /// Loop depth (0 = not in loop).
    pub loop_depth: u32,
}

impl BasicBlock {
    fn new(begin: NodeId) -> Self {
        BasicBlock {
            begin,
            nodes: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            loop_depth: 0,
        }
    }

    /// The last fixed node of the block.
    pub fn end(&self) -> NodeId {
        self.nodes.last().copied().unwrap_or(self.begin)
    }
}

/// Block identifier.
pub type BlockId = Id<BasicBlock>;

// =============================================================================
// CFG
// =============================================================================

/// Control flow graph extracted from a node graph.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,

    /// Block of every fixed node.
    block_of: SecondaryMap<Node, BlockId>,

    /// Position of every fixed node within its block.
    index_in_block: SecondaryMap<Node, u32>,

    /// Entry block (holds Start).
    pub entry: BlockId,

    /// Reverse postorder.
    pub rpo: Vec<BlockId>,

    /// Postorder number of each block.
    postorder: SecondaryMap<BasicBlock, u32>,

    dominators: DominatorTree,
}

impl Cfg {
    /// Build the CFG of every block reachable from start.
    pub fn build(graph: &Graph) -> KilnResult<Self> {
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut begin_to_block: FxHashMap<NodeId, BlockId> = FxHashMap::default();
        let mut block_of = SecondaryMap::with_len(graph.len());
        let mut index_in_block = SecondaryMap::with_len(graph.len());
        let mut worklist = vec![graph.start()];

        while let Some(begin) = worklist.pop() {
            if begin_to_block.contains_key(&begin) {
                continue;
            }
            let id = BlockId::from_usize(blocks.len());
            begin_to_block.insert(begin, id);
            let mut block = BasicBlock::new(begin);
            let mut current = begin;
            loop {
                block_of.set(current, id);
                index_in_block.set(current, block.nodes.len() as u32);
                block.nodes.push(current);
                let kind = graph.kind(current);
                match kind {
                    NodeKind::If { .. } => {
                        for &s in graph.successors(current) {
                            if !s.is_valid() {
                                return Err(KilnError::internal_at(current.index(), "If with unset successor"));
                            }
                            worklist.push(s);
                        }
                        break;
                    }
                    NodeKind::End | NodeKind::LoopEnd => {
                        let merge = graph.merge_of(current).ok_or_else(|| {
                            KilnError::internal_at(current.index(), "end without merge")
                        })?;
                        worklist.push(merge);
                        break;
                    }
                    k if k.is_control_sink() => break,
                    _ => {
                        let next = graph.next(current).ok_or_else(|| {
                            KilnError::internal_at(
                                current.index(),
                                format!("{} has no next", graph.kind(current).name()),
                            )
                        })?;
                        if graph.kind(next).is_begin() {
                            worklist.push(next);
                            break;
                        }
                        current = next;
                    }
                }
            }
            blocks.push(block);
        }

        let lookup = |begin: NodeId| {
            begin_to_block.get(&begin).copied().ok_or_else(|| {
                KilnError::internal_at(begin.index(), "begin not reached from start")
            })
        };

        // Edges. Merge predecessors follow the merge's end order so phi
        // value i belongs to predecessor i.
        for i in 0..blocks.len() {
            let begin = blocks[i].begin;
            let preds: Vec<BlockId> = if graph.kind(begin).is_merge() {
                graph
                    .merge_ends(begin)
                    .into_iter()
                    .map(|end| block_of.get(end).copied().unwrap_or(BlockId::INVALID))
                    .collect()
            } else {
                graph
                    .predecessor(begin)
                    .map(|p| block_of.get(p).copied().unwrap_or(BlockId::INVALID))
                    .into_iter()
                    .collect()
            };
            if preds.iter().any(|p| !p.is_valid()) {
                return Err(KilnError::internal_at(begin.index(), "predecessor outside the CFG"));
            }
            blocks[i].predecessors = preds;

            let last = blocks[i].end();
            let succs = match graph.kind(last) {
                NodeKind::If { .. } => graph
                    .successors(last)
                    .iter()
                    .map(|&s| lookup(s))
                    .collect::<KilnResult<Vec<_>>>()?,
                NodeKind::End | NodeKind::LoopEnd => match graph.merge_of(last) {
                    Some(merge) => vec![lookup(merge)?],
                    None => Vec::new(),
                },
                k if k.is_control_sink() => Vec::new(),
                _ => match graph.next(last) {
                    Some(next) => vec![lookup(next)?],
                    None => Vec::new(),
                },
            };
            blocks[i].successors = succs;
        }

        let entry = BlockId::new(0);
        let mut cfg = Cfg {
            blocks,
            block_of,
            index_in_block,
            entry,
            rpo: Vec::new(),
            postorder: SecondaryMap::new(),
            dominators: DominatorTree::default(),
        };
        cfg.compute_rpo();
        cfg.dominators = DominatorTree::build(&cfg);
        cfg.compute_loop_depths(graph);
        Ok(cfg)
    }

    /// Compute reverse postorder without recursion.
    fn compute_rpo(&mut self) {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry.as_usize());
        while let Some((block, child)) = stack.pop() {
            let succs = &self.blocks[block.as_usize()].successors;
            if let Some(&succ) = succs.get(child) {
                stack.push((block, child + 1));
                if visited.insert(succ.as_usize()) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
            }
        }
        for (i, &block) in postorder.iter().enumerate() {
            self.postorder.set(block, i as u32);
        }
        postorder.reverse();
        self.rpo = postorder;
    }

    fn compute_loop_depths(&mut self, graph: &Graph) {
        for header in 0..self.blocks.len() {
            let begin = self.blocks[header].begin;
            if !matches!(graph.kind(begin), NodeKind::LoopBegin) {
                continue;
            }
            let header_id = BlockId::from_usize(header);
            // Backedge sources are every predecessor after the forward one.
            let mut body = BitSet::with_capacity(self.blocks.len());
            body.insert(header);
            let mut stack: Vec<BlockId> = self.blocks[header].predecessors.iter().skip(1).copied().collect();
            while let Some(b) = stack.pop() {
                if body.insert(b.as_usize()) {
                    stack.extend(self.blocks[b.as_usize()].predecessors.iter().copied());
                }
            }
            for b in body.iter() {
                if self.dominators.dominates(header_id, BlockId::from_usize(b)) {
                    self.blocks[b].loop_depth += 1;
                }
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a block by ID.
    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.as_usize()]
    }

    /// Block holding fixed node `node`.
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.block_of.get(node).copied().filter(|b| b.is_valid())
    }

    /// Get the number of blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate over blocks in reverse postorder.
    pub fn iter_rpo(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.rpo
            .iter()
            .copied()
            .map(move |id| (id, &self.blocks[id.as_usize()]))
    }

    /// Iterate over all blocks.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId::from_usize(i), b))
    }

    #[inline]
    pub fn dominators(&self) -> &DominatorTree {
        &self.dominators
    }

    /// Whether fixed node `a` executes before `b` on every path to `b`
    /// (or is `b`).
    pub fn fixed_dominates(&self, a: NodeId, b: NodeId) -> bool {
        match (self.block_of(a), self.block_of(b)) {
            (Some(ba), Some(bb)) if ba == bb => {
                let ia = self.index_in_block.get(a).copied().unwrap_or(0);
                let ib = self.index_in_block.get(b).copied().unwrap_or(0);
                ia <= ib
            }
            (Some(ba), Some(bb)) => self.dominators.dominates(ba, bb),
            _ => false,
        }
    }

    /// Fixed node after which a floating guard is checked: the latest of
    /// its anchor and the fixed definitions its condition depends on.
    pub fn guard_position(&self, graph: &Graph, guard: NodeId) -> KilnResult<NodeId> {
        let anchor = graph
            .node(guard)
            .guard()
            .ok_or_else(|| KilnError::internal_at(guard.index(), "floating guard without anchor"))?;
        let mut best = anchor;
        let mut stack: Vec<NodeId> = graph.node(guard).inputs().to_vec();
        let mut seen = BitSet::with_capacity(graph.len());
        while let Some(id) = stack.pop() {
            if !seen.insert(id.as_usize()) {
                continue;
            }
            let node = graph.node(id);
            let candidate = match node.kind {
                NodeKind::Phi => node.input(0),
                ref k if k.is_fixed() => Some(id),
                _ => {
                    stack.extend(node.def_edges());
                    None
                }
            };
            let Some(candidate) = candidate else { continue };
            if self.fixed_dominates(best, candidate) {
                best = candidate;
            } else if !self.fixed_dominates(candidate, best) {
                return Err(KilnError::internal_at(
                    guard.index(),
                    format!("guard inputs {:?} and {:?} are not ordered", best, candidate),
                ));
            }
        }
        Ok(best)
    }
}

// =============================================================================
// Dominator Tree
// =============================================================================

/// Dominator tree over CFG blocks.
#[derive(Debug, Clone, Default)]
pub struct DominatorTree {
    /// Immediate dominator for each block (the entry maps to itself).
    idom: SecondaryMap<BasicBlock, BlockId>,

    /// Dominator tree depth.
    depth: SecondaryMap<BasicBlock, u32>,
}

impl DominatorTree {
    /// Build with the Cooper-Harvey-Kennedy iteration over reverse
    /// postorder.
    pub fn build(cfg: &Cfg) -> Self {
        let n = cfg.len();
        let mut dom = DominatorTree {
            idom: SecondaryMap::with_len(n),
            depth: SecondaryMap::with_len(n),
        };
        if n == 0 {
            return dom;
        }
        for i in 0..n {
            dom.idom.set(BlockId::from_usize(i), BlockId::INVALID);
        }
        dom.idom.set(cfg.entry, cfg.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in cfg.rpo.iter().skip(1) {
                let mut new_idom = BlockId::INVALID;
                for &pred in &cfg.block(block).predecessors {
                    if !dom.idom[pred].is_valid() {
                        continue;
                    }
                    new_idom = if new_idom.is_valid() {
                        dom.intersect(cfg, pred, new_idom)
                    } else {
                        pred
                    };
                }
                if new_idom.is_valid() && dom.idom[block] != new_idom {
                    dom.idom.set(block, new_idom);
                    changed = true;
                }
            }
        }

        for &block in &cfg.rpo {
            let depth = match dom.idom(block) {
                Some(parent) => dom.depth[parent] + 1,
                None => 0,
            };
            dom.depth.set(block, depth);
        }
        dom
    }

    fn intersect(&self, cfg: &Cfg, mut a: BlockId, mut b: BlockId) -> BlockId {
        let po = |x: BlockId| cfg.postorder.get(x).copied().unwrap_or(0);
        while a != b {
            while po(a) < po(b) {
                a = self.idom[a];
            }
            while po(b) < po(a) {
                b = self.idom[b];
            }
        }
        a
    }

    /// Get immediate dominator.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let idom = self.idom.get(block).copied().unwrap_or(BlockId::INVALID);
        if idom.is_valid() && idom != block {
            Some(idom)
        } else {
            None
        }
    }

    /// Get dominator depth.
    pub fn depth(&self, block: BlockId) -> u32 {
        self.depth.get(block).copied().unwrap_or(0)
    }

    /// Check if `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let target_depth = self.depth(a);
        let mut current = b;
        while self.depth(current) > target_depth {
            match self.idom(current) {
                Some(idom) => current = idom,
                None => return false,
            }
        }
        current == a
    }

    /// Check if `a` strictly dominates `b`.
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::kinds::CompareOp;
    use crate::ir::stamp::Stamp;

    /// if (x < 0) { a } else { b }; return phi
    fn diamond() -> Graph {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let zero = b.graph().int(0);
        let cond = b.graph().add_node(NodeKind::Compare(CompareOp::IntegerLessThan), &[x, zero]);
        let mut scope = b.begin_if(cond, 0.5).unwrap();
        let one = b.graph().int(1);
        b.else_branch(&mut scope).unwrap();
        let two = b.graph().int(2);
        let join = b.end_if(scope).unwrap();
        let v = b.merge_value(&join, one, two);
        b.append_return(Some(v)).unwrap();
        g
    }

    #[test]
    fn test_diamond_blocks() {
        let g = diamond();
        let cfg = Cfg::build(&g).unwrap();
        assert_eq!(cfg.len(), 4);
        let entry = cfg.block(cfg.entry);
        assert_eq!(entry.successors.len(), 2);
        let merge = cfg
            .iter()
            .find(|(_, b)| b.predecessors.len() == 2)
            .map(|(id, _)| id)
            .unwrap();
        assert_eq!(cfg.dominators().idom(merge), Some(cfg.entry));
        for succ in &entry.successors {
            assert!(!cfg.dominators().dominates(*succ, merge));
        }
    }

    #[test]
    fn test_rpo_starts_at_entry() {
        let g = diamond();
        let cfg = Cfg::build(&g).unwrap();
        assert_eq!(cfg.rpo.first(), Some(&cfg.entry));
        assert_eq!(cfg.rpo.len(), cfg.len());
    }

    #[test]
    fn test_loop_depth() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let n = b.parameter(0, Stamp::int(32));
        let zero = b.graph().int(0);
        let mut lp = b.begin_loop().unwrap();
        let i = b.loop_phi(&mut lp, zero, Stamp::int(32));
        let cond = b.graph().add_node(NodeKind::Compare(CompareOp::IntegerLessThan), &[i, n]);
        b.loop_exit_unless(&mut lp, cond, 0.9).unwrap();
        let one = b.graph().int(1);
        let next = b.graph().add_node(NodeKind::Binary(crate::ir::kinds::BinaryOp::Add), &[i, one]);
        b.end_loop(lp, &[(i, next)]).unwrap();
        b.append_return(None).unwrap();

        let cfg = Cfg::build(&g).unwrap();
        let depths: Vec<u32> = cfg.iter().map(|(_, blk)| blk.loop_depth).collect();
        assert!(depths.contains(&1));
        assert!(depths.contains(&0));
        assert_eq!(cfg.block(cfg.entry).loop_depth, 0);
    }

    #[test]
    fn test_fixed_dominance_within_block() {
        let g = diamond();
        let cfg = Cfg::build(&g).unwrap();
        let entry = cfg.block(cfg.entry);
        let first = entry.nodes[0];
        let last = entry.end();
        assert!(cfg.fixed_dominates(first, last));
        assert!(!cfg.fixed_dominates(last, first) || first == last);
    }
}
