//! Lowering tiers.
//!
//! A graph is lowered in three steps. Each tier replaces the node kinds
//! that are too abstract for the next one and may introduce kinds of its
//! own, so which kinds a graph may hold depends on the last tier it went
//! through ([`Graph::lowered_tier`]).

use super::LoweringProvider;
use crate::ir::graph::Graph;
use crate::ir::kinds::NodeKind;
use crate::ir::node::NodeId;
use crate::opt::Phase;
use kiln_core::{KilnError, KilnResult};
use std::sync::Arc;

/// Lowering tier, in the order tiers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoweringTier {
    /// Guards start floating; intrinsics are substituted.
    High,
    /// Guards become explicit deopt branches; barriers are added.
    Mid,
    /// Barriers expand into snippets; memory and runtime calls are explicit.
    Low,
}

impl LoweringTier {
    pub const ALL: [LoweringTier; 3] = [LoweringTier::High, LoweringTier::Mid, LoweringTier::Low];

    pub const fn name(self) -> &'static str {
        match self {
            LoweringTier::High => "high",
            LoweringTier::Mid => "mid",
            LoweringTier::Low => "low",
        }
    }
}

/// First tier whose graphs may contain `kind`, if it is not allowed from
/// the start.
pub fn introduced_at(kind: &NodeKind) -> Option<LoweringTier> {
    match kind {
        NodeKind::Guard(_) => Some(LoweringTier::High),
        k if k.is_write_barrier() => Some(LoweringTier::Mid),
        NodeKind::ReadRegister(_)
        | NodeKind::Membar { .. }
        | NodeKind::Alloca { .. }
        | NodeKind::ForeignCall { .. } => Some(LoweringTier::Low),
        _ => None,
    }
}

/// Tier after which `kind` may no longer appear.
pub fn removed_by(kind: &NodeKind) -> Option<LoweringTier> {
    match kind {
        NodeKind::Guard(_) | NodeKind::Invoke { .. } => Some(LoweringTier::Mid),
        k if k.is_write_barrier() => Some(LoweringTier::Low),
        _ => None,
    }
}

// =============================================================================
// Lowering Phase
// =============================================================================

/// Lowers every node the given tier is responsible for.
pub struct LoweringPhase {
    tier: LoweringTier,
    provider: Arc<LoweringProvider>,
}

impl LoweringPhase {
    pub fn new(tier: LoweringTier, provider: Arc<LoweringProvider>) -> Self {
        Self { tier, provider }
    }

    #[inline]
    pub fn tier(&self) -> LoweringTier {
        self.tier
    }

    /// Reject running out of order.
    fn check_order(&self, graph: &Graph) -> KilnResult<()> {
        if let Some(done) = graph.lowered_tier() {
            if self.tier <= done {
                return Err(KilnError::lowering_order(format!(
                    "{} tier lowering on a graph already lowered to the {} tier",
                    self.tier.name(),
                    done.name()
                )));
            }
        }
        if let Some((id, node)) = graph
            .iter()
            .find(|(_, n)| introduced_at(&n.kind).is_some_and(|t| t > self.tier))
        {
            return Err(KilnError::lowering_order(format!(
                "{:?} {} belongs to a tier after {}",
                id,
                node.kind.name(),
                self.tier.name()
            )));
        }
        Ok(())
    }
}

impl Phase for LoweringPhase {
    fn name(&self) -> &'static str {
        match self.tier {
            LoweringTier::High => "HighTierLowering",
            LoweringTier::Mid => "MidTierLowering",
            LoweringTier::Low => "LowTierLowering",
        }
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        self.check_order(graph)?;
        let candidates: Vec<NodeId> = graph.live_ids();
        let mut lowered = 0;
        for id in candidates {
            if graph.is_alive(id) && self.provider.lower(graph, id, self.tier)? {
                lowered += 1;
            }
        }
        graph.set_lowered_tier(self.tier);
        log::debug!("{} tier lowering: {} nodes lowered", self.tier.name(), lowered);
        Ok(lowered > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::kinds::MemoryBarriers;
    use crate::lowering::barriers::BarrierSet;
    use kiln_core::CompilerOptions;

    fn provider() -> Arc<LoweringProvider> {
        Arc::new(LoweringProvider::new(CompilerOptions::debug(), BarrierSet::None))
    }

    fn trivial() -> Graph {
        let mut g = Graph::new();
        GraphBuilder::new(&mut g).append_return(None).unwrap();
        g
    }

    #[test]
    fn test_tiers_are_ordered() {
        assert!(LoweringTier::High < LoweringTier::Mid);
        assert!(LoweringTier::Mid < LoweringTier::Low);
    }

    #[test]
    fn test_rerunning_a_tier_is_rejected() {
        let mut g = trivial();
        let p = provider();
        LoweringPhase::new(LoweringTier::High, p.clone()).run(&mut g).unwrap();
        assert_eq!(g.lowered_tier(), Some(LoweringTier::High));
        let err = LoweringPhase::new(LoweringTier::High, p).run(&mut g).unwrap_err();
        assert!(matches!(err, KilnError::LoweringOrder { .. }));
    }

    #[test]
    fn test_later_tier_kind_rejected() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        b.append(
            NodeKind::Membar {
                barriers: MemoryBarriers::STORE_LOAD,
            },
            &[],
        )
        .unwrap();
        b.append_return(None).unwrap();
        let err = LoweringPhase::new(LoweringTier::High, provider()).run(&mut g).unwrap_err();
        assert!(matches!(err, KilnError::LoweringOrder { .. }));
        assert_eq!(g.lowered_tier(), None);
    }

    #[test]
    fn test_kind_tables() {
        assert_eq!(introduced_at(&NodeKind::Return), None);
        assert_eq!(
            introduced_at(&NodeKind::SerialWriteBarrier { precise: true }),
            Some(LoweringTier::Mid)
        );
        assert_eq!(
            removed_by(&NodeKind::SerialWriteBarrier { precise: true }),
            Some(LoweringTier::Low)
        );
    }
}
