//! Deduplicating node worklist.

use crate::ir::arena::BitSet;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use std::collections::VecDeque;

/// FIFO of nodes; a node is queued at most once at a time.
#[derive(Debug, Default)]
pub struct NodeWorklist {
    queue: VecDeque<NodeId>,
    queued: BitSet,
}

impl NodeWorklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worklist holding every live node in id order.
    pub fn with_all(graph: &Graph) -> Self {
        let mut list = Self::new();
        for id in graph.live_ids() {
            list.push(id);
        }
        list
    }

    /// Queue `id` unless it is already queued.
    pub fn push(&mut self, id: NodeId) {
        if id.is_valid() && self.queued.insert(id.as_usize()) {
            self.queue.push_back(id);
        }
    }

    /// Queue every usage of `id`.
    pub fn push_usages(&mut self, graph: &Graph, id: NodeId) {
        for user in graph.distinct_usages(id) {
            self.push(user);
        }
    }

    /// Queue the inputs of `id`.
    pub fn push_inputs(&mut self, graph: &Graph, id: NodeId) {
        let defs: Vec<NodeId> = graph.node(id).def_edges().collect();
        for def in defs {
            self.push(def);
        }
    }

    pub fn pop(&mut self) -> Option<NodeId> {
        let id = self.queue.pop_front()?;
        self.queued.remove(id.as_usize());
        Some(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worklist_dedup() {
        let mut list = NodeWorklist::new();
        let a = NodeId::new(3);
        let b = NodeId::new(5);
        list.push(a);
        list.push(b);
        list.push(a);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(), Some(a));
        list.push(a);
        assert_eq!(list.pop(), Some(b));
        assert_eq!(list.pop(), Some(a));
        assert!(list.is_empty());
    }

    #[test]
    fn test_worklist_ignores_invalid() {
        let mut list = NodeWorklist::new();
        list.push(NodeId::INVALID);
        assert!(list.is_empty());
    }
}
