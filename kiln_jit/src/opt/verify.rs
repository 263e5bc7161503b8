//! Structural graph verification.
//!
//! Three checks, each returning the first violation found:
//!
//! - **Integrity**: control edges are symmetric, every fixed node except
//!   start and merges has one predecessor, no input names a dead node, the
//!   usage index matches a rescan, data cycles pass through a phi.
//! - **Guard anchoring**: every floating guard hangs off a live, reachable
//!   begin that dominates the fixed nodes depending on the guard.
//! - **Tier conformance**: no node kind that the graph's lowering tier has
//!   not introduced yet, or has already removed.

use super::Phase;
use crate::ir::arena::BitSet;
use crate::ir::cfg::Cfg;
use crate::ir::graph::Graph;
use crate::ir::kinds::NodeKind;
use crate::ir::node::NodeId;
use crate::lowering::tier::{introduced_at, removed_by};
use kiln_core::{CompilerOptions, KilnResult, VerificationError};

const INTEGRITY: &str = "GraphIntegrity";
const ANCHORING: &str = "GuardAnchoring";
const TIERS: &str = "TierConformance";

/// Run every check.
pub fn verify_graph(graph: &Graph) -> Result<(), VerificationError> {
    verify_integrity(graph)?;
    verify_guard_anchoring(graph)?;
    verify_tier_conformance(graph)
}

// =============================================================================
// Integrity
// =============================================================================

pub fn verify_integrity(graph: &Graph) -> Result<(), VerificationError> {
    let start = graph.start();
    for (id, node) in graph.iter() {
        let kind = &node.kind;

        if kind.is_fixed() && id != start && !kind.is_merge() {
            let pred = node.predecessor().ok_or_else(|| {
                VerificationError::at(INTEGRITY, id.index(), format!("{} has no predecessor", kind.name()))
            })?;
            if !graph.is_alive(pred) || !graph.successors(pred).contains(&id) {
                return Err(VerificationError::at(
                    INTEGRITY,
                    id.index(),
                    format!("predecessor {:?} does not list {:?}", pred, id),
                ));
            }
        }
        if kind.is_merge() && node.predecessor().is_some() {
            return Err(VerificationError::at(INTEGRITY, id.index(), "merge with a predecessor"));
        }

        for (slot, &succ) in node.successors().iter().enumerate() {
            if !succ.is_valid() {
                return Err(VerificationError::at(
                    INTEGRITY,
                    id.index(),
                    format!("{} successor {} unset", kind.name(), slot),
                ));
            }
            if !graph.is_alive(succ) || graph.predecessor(succ) != Some(id) {
                return Err(VerificationError::at(
                    INTEGRITY,
                    id.index(),
                    format!("successor {:?} does not point back", succ),
                ));
            }
        }

        match kind {
            NodeKind::Merge | NodeKind::LoopBegin => {
                for (i, end) in node.inputs().iter().enumerate() {
                    let ok = match (kind, graph.kind(end)) {
                        (NodeKind::LoopBegin, NodeKind::LoopEnd) => i > 0,
                        (_, NodeKind::End) => !matches!(kind, NodeKind::LoopBegin) || i == 0,
                        _ => false,
                    };
                    if !ok {
                        return Err(VerificationError::at(
                            INTEGRITY,
                            id.index(),
                            format!("merge input {} is {}", i, graph.kind(end).name()),
                        ));
                    }
                }
            }
            NodeKind::Phi => {
                let merge = node.input(0).filter(|&m| graph.kind(m).is_merge()).ok_or_else(|| {
                    VerificationError::at(INTEGRITY, id.index(), "phi without merge")
                })?;
                let ends = graph.node(merge).inputs().len();
                if node.inputs().len() != ends + 1 {
                    return Err(VerificationError::at(
                        INTEGRITY,
                        id.index(),
                        format!("phi has {} values for {} ends", node.inputs().len() - 1, ends),
                    ));
                }
            }
            NodeKind::LoopExit => {
                if !node.input(0).is_some_and(|l| matches!(graph.kind(l), NodeKind::LoopBegin)) {
                    return Err(VerificationError::at(INTEGRITY, id.index(), "loop exit without loop"));
                }
            }
            _ => {}
        }
    }

    if let Some(&(user, def)) = graph.dangling_inputs().first() {
        return Err(VerificationError::at(
            INTEGRITY,
            user.index(),
            format!("input {:?} is dead", def),
        ));
    }
    if !graph.usage_index_consistent() {
        return Err(VerificationError::new(INTEGRITY, "usage index differs from a rescan"));
    }
    check_data_cycles(graph)
}

/// Floating nodes may only form cycles through phis.
fn check_data_cycles(graph: &Graph) -> Result<(), VerificationError> {
    let mut done = BitSet::with_capacity(graph.len());
    let mut on_stack = BitSet::with_capacity(graph.len());
    let through = |id: NodeId| {
        let kind = graph.kind(id);
        kind.is_floating() && !matches!(kind, NodeKind::Phi)
    };
    for root in graph.live_ids() {
        if !through(root) || done.contains(root.as_usize()) {
            continue;
        }
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        on_stack.insert(root.as_usize());
        while let Some(top) = stack.last_mut() {
            let (id, index) = *top;
            top.1 += 1;
            let input = graph.node(id).inputs().get(index);
            match input {
                Some(def) if through(def) => {
                    if on_stack.contains(def.as_usize()) {
                        return Err(VerificationError::at(
                            INTEGRITY,
                            def.index(),
                            "data cycle without a phi",
                        ));
                    }
                    if !done.contains(def.as_usize()) {
                        on_stack.insert(def.as_usize());
                        stack.push((def, 0));
                    }
                }
                Some(_) => {}
                None => {
                    on_stack.remove(id.as_usize());
                    done.insert(id.as_usize());
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Guard Anchoring
// =============================================================================

pub fn verify_guard_anchoring(graph: &Graph) -> Result<(), VerificationError> {
    let guards: Vec<NodeId> = graph
        .iter()
        .filter(|(_, n)| matches!(n.kind, NodeKind::Guard(_)))
        .map(|(id, _)| id)
        .collect();
    if guards.is_empty() {
        return Ok(());
    }
    let cfg = Cfg::build(graph).map_err(|e| VerificationError::new(ANCHORING, e.to_string()))?;

    for guard in guards {
        let anchor = graph
            .node(guard)
            .guard()
            .ok_or_else(|| VerificationError::at(ANCHORING, guard.index(), "floating guard without anchor"))?;
        if !graph.is_alive(anchor) || !graph.kind(anchor).is_begin() {
            return Err(VerificationError::at(
                ANCHORING,
                guard.index(),
                format!("anchor {:?} is not a live begin", anchor),
            ));
        }
        if cfg.block_of(anchor).is_none() {
            return Err(VerificationError::at(ANCHORING, guard.index(), "anchor unreachable"));
        }

        // Fixed nodes depending on the guard, directly or through floating
        // nodes.
        let mut seen = BitSet::with_capacity(graph.len());
        let mut stack = graph.distinct_usages(guard);
        while let Some(user) = stack.pop() {
            if !seen.insert(user.as_usize()) {
                continue;
            }
            let kind = graph.kind(user);
            if kind.is_fixed() {
                if kind.is_merge() {
                    continue;
                }
                if cfg.block_of(user).is_some() && !cfg.fixed_dominates(anchor, user) {
                    return Err(VerificationError::at(
                        ANCHORING,
                        guard.index(),
                        format!("anchor {:?} does not dominate user {:?}", anchor, user),
                    ));
                }
            } else if !matches!(kind, NodeKind::Phi) {
                stack.extend(graph.distinct_usages(user));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tier Conformance
// =============================================================================

pub fn verify_tier_conformance(graph: &Graph) -> Result<(), VerificationError> {
    let tier = graph.lowered_tier();
    for (id, node) in graph.iter() {
        if let Some(first) = introduced_at(&node.kind) {
            if tier.map_or(true, |t| t < first) {
                return Err(VerificationError::at(
                    TIERS,
                    id.index(),
                    format!("{} appears before the {:?} tier", node.kind.name(), first),
                ));
            }
        }
        if let (Some(gone), Some(t)) = (removed_by(&node.kind), tier) {
            if t >= gone {
                return Err(VerificationError::at(
                    TIERS,
                    id.index(),
                    format!("{} survives the {:?} tier", node.kind.name(), gone),
                ));
            }
        }
    }
    if !graph.guards_stage().allows_floating_guards()
        && graph.iter().any(|(_, n)| matches!(n.kind, NodeKind::Guard(_)))
    {
        return Err(VerificationError::new(TIERS, "floating guard after guard lowering"));
    }
    Ok(())
}

// =============================================================================
// Phase
// =============================================================================

/// Runs [`verify_graph`] when graph verification is enabled.
#[derive(Debug, Clone)]
pub struct VerificationPhase {
    enabled: bool,
    label: &'static str,
}

impl VerificationPhase {
    pub fn new(options: &CompilerOptions, label: &'static str) -> Self {
        Self {
            enabled: options.verify_graphs,
            label,
        }
    }

    /// Whether the checks actually run.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Phase for VerificationPhase {
    fn name(&self) -> &'static str {
        self.label
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        if self.enabled {
            verify_graph(graph)?;
            log::trace!("{}: graph verified", self.label);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::kinds::GuardInfo;
    use crate::ir::stamp::Stamp;
    use kiln_core::{DeoptAction, DeoptReason, KilnError};

    fn diamond() -> Graph {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::object());
        let c = b.add(NodeKind::IsNull, &[p]);
        let mut scope = b.begin_if(c, 0.1).unwrap();
        b.else_branch(&mut scope).unwrap();
        b.end_if(scope).unwrap();
        b.append_return(None).unwrap();
        g
    }

    #[test]
    fn test_well_formed_graph_passes() {
        let g = diamond();
        assert_eq!(verify_graph(&g), Ok(()));
    }

    #[test]
    fn test_unlinked_fixed_node_fails() {
        let mut g = diamond();
        g.add_fixed(NodeKind::Begin, &[]);
        let err = verify_integrity(&g).unwrap_err();
        assert_eq!(err.phase, INTEGRITY);
    }

    #[test]
    fn test_data_cycle_without_phi_fails() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let a = b.add(NodeKind::Negate, &[x]);
        let n = b.add(NodeKind::Negate, &[a]);
        b.append_return(Some(n)).unwrap();
        g.set_input(a, 0, n);
        let err = verify_integrity(&g).unwrap_err();
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn test_guard_before_high_tier_fails() {
        let mut g = Graph::new();
        let start = g.start();
        let p = g.parameter(0, Stamp::object());
        let c = g.add_floating(NodeKind::IsNull, &[p]);
        let info = GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::InvalidateReprofile, true);
        g.add_guarded(NodeKind::Guard(info), &[c], Stamp::Void, Some(start));
        let ret = g.add_fixed(NodeKind::Return, &[]);
        g.set_next(start, Some(ret));
        let err = verify_tier_conformance(&g).unwrap_err();
        assert_eq!(err.phase, TIERS);
        assert_eq!(verify_guard_anchoring(&g), Ok(()));
    }

    #[test]
    fn test_phase_wraps_error() {
        let mut g = diamond();
        g.add_fixed(NodeKind::Begin, &[]);
        let mut phase = VerificationPhase::new(&CompilerOptions::debug(), "VerifyHigh");
        assert!(matches!(phase.run(&mut g), Err(KilnError::Verification(_))));
        let mut off = VerificationPhase::new(&CompilerOptions::production(), "VerifyHigh");
        assert!(!off.is_enabled());
        assert_eq!(off.run(&mut g), Ok(false));
    }
}
