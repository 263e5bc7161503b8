//! IR node definitions.
//!
//! A node is a [`NodeKind`] plus its edges. Edges come in four flavours:
//!
//! - **Data inputs**: the values a node consumes (`inputs`)
//! - **Guard input**: the guard or begin node that must hold before the node
//!   may execute (`guard`)
//! - **Memory input**: the last write the node is ordered after (`memory`)
//! - **Control**: `successors` of fixed nodes, with a `predecessor` back edge
//!
//! The first three are owned by the consuming node and mirrored by the
//! graph's usage index. Control edges are mirrored by `predecessor`.
//!
//! # Fixed vs Floating
//!
//! - **Fixed nodes**: Start, Begin, If, Write, calls, guards, ... - sit on a
//!   control path and execute in order
//! - **Floating nodes**: constants, arithmetic, comparisons, phis - are
//!   placed by their uses
//! - **Floating guards**: anchored on a begin through their guard input

use super::arena::Id;
use super::kinds::NodeKind;
use super::source_position::NodeSourcePosition;
use super::stamp::Stamp;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Node ID Type Alias
// =============================================================================

/// Unique identifier for a node in the graph.
pub type NodeId = Id<Node>;

// =============================================================================
// Input List
// =============================================================================

/// Compact input list optimized for small node arity.
///
/// Most nodes have 0-4 inputs, so we store them inline to avoid allocation.
/// Larger input lists (merges with many ends, their phis) use a Vec.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum InputList {
    /// No inputs.
    #[default]
    Empty,
    /// Single input (very common).
    Single(NodeId),
    /// Two inputs (binary ops).
    Pair(NodeId, NodeId),
    /// Three inputs.
    Triple(NodeId, NodeId, NodeId),
    /// Four inputs (inline limit).
    Quad(NodeId, NodeId, NodeId, NodeId),
    /// Many inputs (heap allocated).
    Many(Vec<NodeId>),
}

impl InputList {
    /// Create empty input list.
    pub const fn empty() -> Self {
        InputList::Empty
    }

    /// Create from a slice.
    pub fn from_slice(inputs: &[NodeId]) -> Self {
        match *inputs {
            [] => InputList::Empty,
            [a] => InputList::Single(a),
            [a, b] => InputList::Pair(a, b),
            [a, b, c] => InputList::Triple(a, b, c),
            [a, b, c, d] => InputList::Quad(a, b, c, d),
            _ => InputList::Many(inputs.to_vec()),
        }
    }

    /// Get the number of inputs.
    pub fn len(&self) -> usize {
        match self {
            InputList::Empty => 0,
            InputList::Single(_) => 1,
            InputList::Pair(..) => 2,
            InputList::Triple(..) => 3,
            InputList::Quad(..) => 4,
            InputList::Many(v) => v.len(),
        }
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get input at index.
    pub fn get(&self, index: usize) -> Option<NodeId> {
        match (self, index) {
            (InputList::Single(a), 0)
            | (InputList::Pair(a, _), 0)
            | (InputList::Triple(a, _, _), 0)
            | (InputList::Quad(a, _, _, _), 0) => Some(*a),
            (InputList::Pair(_, b), 1)
            | (InputList::Triple(_, b, _), 1)
            | (InputList::Quad(_, b, _, _), 1) => Some(*b),
            (InputList::Triple(_, _, c), 2) | (InputList::Quad(_, _, c, _), 2) => Some(*c),
            (InputList::Quad(_, _, _, d), 3) => Some(*d),
            (InputList::Many(v), i) => v.get(i).copied(),
            _ => None,
        }
    }

    /// Set input at index. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, value: NodeId) {
        let slot = match (self, index) {
            (InputList::Single(a), 0)
            | (InputList::Pair(a, _), 0)
            | (InputList::Triple(a, _, _), 0)
            | (InputList::Quad(a, _, _, _), 0) => a,
            (InputList::Pair(_, b), 1)
            | (InputList::Triple(_, b, _), 1)
            | (InputList::Quad(_, b, _, _), 1) => b,
            (InputList::Triple(_, _, c), 2) | (InputList::Quad(_, _, c, _), 2) => c,
            (InputList::Quad(_, _, _, d), 3) => d,
            (InputList::Many(v), i) => match v.get_mut(i) {
                Some(slot) => slot,
                None => return,
            },
            _ => return,
        };
        *slot = value;
    }

    /// Push a new input.
    pub fn push(&mut self, value: NodeId) {
        *self = match std::mem::take(self) {
            InputList::Empty => InputList::Single(value),
            InputList::Single(a) => InputList::Pair(a, value),
            InputList::Pair(a, b) => InputList::Triple(a, b, value),
            InputList::Triple(a, b, c) => InputList::Quad(a, b, c, value),
            InputList::Quad(a, b, c, d) => InputList::Many(vec![a, b, c, d, value]),
            InputList::Many(mut v) => {
                v.push(value);
                InputList::Many(v)
            }
        };
    }

    /// Remove the input at `index`, shifting later inputs down.
    pub fn remove(&mut self, index: usize) -> Option<NodeId> {
        let mut all = self.to_vec();
        if index >= all.len() {
            return None;
        }
        let removed = all.remove(index);
        *self = InputList::from_slice(&all);
        Some(removed)
    }

    /// Iterate over inputs.
    pub fn iter(&self) -> InputIter<'_> {
        InputIter {
            list: self,
            index: 0,
        }
    }

    /// Convert to Vec.
    pub fn to_vec(&self) -> Vec<NodeId> {
        self.iter().collect()
    }
}

impl std::fmt::Debug for InputList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over input list.
pub struct InputIter<'a> {
    list: &'a InputList,
    index: usize,
}

impl Iterator for InputIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.list.get(self.index);
        self.index += 1;
        result
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.list.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for InputIter<'_> {}

// =============================================================================
// Node
// =============================================================================

/// Control successors: `next` for fixed-with-next nodes, `[true, false]`
/// for `If`. Unset slots hold [`NodeId::INVALID`].
pub type Successors = SmallVec<[NodeId; 2]>;

/// A node in the IR graph.
///
/// Edge fields are crate-private: they may only change through [`Graph`]
/// so the usage index stays in sync.
///
/// [`Graph`]: super::graph::Graph
#[derive(Clone)]
pub struct Node {
    /// The operation this node performs.
    pub kind: NodeKind,

    /// Abstract value of the node's result.
    pub stamp: Stamp,

    /// Source position, when position tracking is on.
    pub position: Option<Arc<NodeSourcePosition>>,

    /// Flags for various node properties.
    pub flags: NodeFlags,

    pub(crate) inputs: InputList,
    pub(crate) guard: Option<NodeId>,
    pub(crate) memory: Option<NodeId>,
    pub(crate) successors: Successors,
    pub(crate) predecessor: Option<NodeId>,
}

impl Node {
    /// Create a detached node. The successor slots match the kind's arity.
    pub fn new(kind: NodeKind, inputs: InputList, stamp: Stamp) -> Self {
        let successors = std::iter::repeat(NodeId::INVALID)
            .take(kind.successor_count())
            .collect();
        Node {
            kind,
            stamp,
            position: None,
            flags: NodeFlags::empty(),
            inputs,
            guard: None,
            memory: None,
            successors,
            predecessor: None,
        }
    }

    /// Data inputs.
    #[inline]
    pub fn inputs(&self) -> &InputList {
        &self.inputs
    }

    /// Data input at `index`.
    #[inline]
    pub fn input(&self, index: usize) -> Option<NodeId> {
        self.inputs.get(index)
    }

    /// Guard (or anchor) input.
    #[inline]
    pub fn guard(&self) -> Option<NodeId> {
        self.guard
    }

    /// Memory input.
    #[inline]
    pub fn memory(&self) -> Option<NodeId> {
        self.memory
    }

    /// Control successors, including unset slots.
    #[inline]
    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    /// Control predecessor.
    #[inline]
    pub fn predecessor(&self) -> Option<NodeId> {
        self.predecessor
    }

    /// `next` of a fixed-with-next node, if set.
    #[inline]
    pub fn next(&self) -> Option<NodeId> {
        if self.kind.has_next() {
            self.successors.first().copied().filter(|id| id.is_valid())
        } else {
            None
        }
    }

    /// Every def this node refers to through data, guard and memory edges,
    /// one entry per edge.
    pub fn def_edges(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs
            .iter()
            .chain(self.guard)
            .chain(self.memory)
            .filter(|id| id.is_valid())
    }

    /// Check if this node has been marked dead.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags.contains(NodeFlags::DEAD)
    }

    /// Mark this node as dead.
    #[inline]
    pub fn mark_dead(&mut self) {
        self.flags.insert(NodeFlags::DEAD);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if !self.inputs.is_empty() {
            write!(f, " {:?}", self.inputs)?;
        }
        if let Some(guard) = self.guard {
            write!(f, " guard={:?}", guard)?;
        }
        if !self.successors.is_empty() {
            write!(f, " -> {:?}", self.successors.as_slice())?;
        }
        write!(f, " : {}", self.stamp)
    }
}

// =============================================================================
// Node Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags for node properties.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Node has been killed; its slot is never reused.
        const DEAD = 0b0000_0001;
        /// Node was created by a snippet instantiation.
        const FROM_SNIPPET = 0b0000_0010;
        /// Floating node must not be removed even without usages.
        const PINNED = 0b0000_0100;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_list_empty() {
        let list = InputList::empty();
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_input_list_single() {
        let id = NodeId::new(42);
        let list = InputList::Single(id);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0), Some(id));
        assert_eq!(list.get(1), None);
    }

    #[test]
    fn test_input_list_from_slice() {
        let ids: Vec<NodeId> = (0..5).map(NodeId::new).collect();
        let list = InputList::from_slice(&ids);
        assert_eq!(list.len(), 5);
        for (i, id) in list.iter().enumerate() {
            assert_eq!(id.as_usize(), i);
        }
    }

    #[test]
    fn test_input_list_push_spills() {
        let mut list = InputList::empty();
        for i in 1..=5 {
            list.push(NodeId::new(i));
        }
        assert_eq!(list.len(), 5);
        assert!(matches!(list, InputList::Many(_)));
    }

    #[test]
    fn test_input_list_set_and_remove() {
        let mut list = InputList::from_slice(&[NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
        list.set(1, NodeId::new(9));
        assert_eq!(list.get(1), Some(NodeId::new(9)));
        list.set(7, NodeId::new(0));
        assert_eq!(list.len(), 3);
        assert_eq!(list.remove(0), Some(NodeId::new(1)));
        assert_eq!(list.to_vec(), vec![NodeId::new(9), NodeId::new(3)]);
        assert_eq!(list.remove(4), None);
    }

    #[test]
    fn test_node_successor_slots_follow_kind() {
        let node = Node::new(NodeKind::If { probability: 0.5 }, InputList::empty(), Stamp::Void);
        assert_eq!(node.successors().len(), 2);
        assert!(node.next().is_none());

        let begin = Node::new(NodeKind::Begin, InputList::empty(), Stamp::Void);
        assert_eq!(begin.successors().len(), 1);
        assert!(begin.next().is_none());
    }

    #[test]
    fn test_node_flags() {
        let mut node = Node::new(NodeKind::Begin, InputList::empty(), Stamp::Void);
        assert!(!node.is_dead());
        node.mark_dead();
        assert!(node.is_dead());
    }
}
