//! Lowering: guards, write barriers, snippets and intrinsic substitutions.
//!
//! [`LoweringProvider`] decides, per node and tier, what replaces a node.
//! [`LoweringPhase`] drives it over a whole graph and records the tier on
//! the graph.

pub mod barriers;
pub mod guards;
pub mod snippet;
pub mod substitutions;
pub mod tier;

pub use barriers::{BarrierSet, BarrierSnippets, WriteBarrierAdditionPhase};
pub use guards::{fixed_guard_to_if, lower_fixed_guard, speculative_guard, GuardLoweringPhase};
pub use snippet::{ParameterKind, SnippetArguments, SnippetCache, SnippetParameter, SnippetTemplate};
pub use substitutions::{ArrayLayout, SubstitutionPhase, SubstitutionTable};
pub use tier::{LoweringPhase, LoweringTier};

use crate::ir::graph::Graph;
use crate::ir::kinds::NodeKind;
use crate::ir::node::NodeId;
use kiln_core::{CompilerOptions, KilnResult};
use kiln_gc::{BarrierConfig, ThreadLayout};

/// Per-node lowering rules for every tier.
#[derive(Debug)]
pub struct LoweringProvider {
    options: CompilerOptions,
    barrier_set: BarrierSet,
    barriers: BarrierSnippets,
}

impl LoweringProvider {
    /// Provider for the default heap geometry.
    pub fn new(options: CompilerOptions, barrier_set: BarrierSet) -> Self {
        Self {
            options,
            barrier_set,
            barriers: BarrierSnippets::with_defaults(),
        }
    }

    /// Provider whose barrier snippets target the given heap.
    pub fn with_heap(
        options: CompilerOptions,
        barrier_set: BarrierSet,
        config: BarrierConfig,
        layout: ThreadLayout,
    ) -> KilnResult<Self> {
        Ok(Self {
            options,
            barrier_set,
            barriers: BarrierSnippets::new(config, layout)?,
        })
    }

    #[inline]
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    #[inline]
    pub fn barrier_set(&self) -> BarrierSet {
        self.barrier_set
    }

    #[inline]
    pub fn barriers(&self) -> &BarrierSnippets {
        &self.barriers
    }

    /// Lower `node` for `tier`. Returns whether the graph changed.
    pub fn lower(&self, graph: &mut Graph, node: NodeId, tier: LoweringTier) -> KilnResult<bool> {
        let kind = graph.kind(node);
        match tier {
            LoweringTier::High => match kind {
                NodeKind::FixedGuard(_) => lower_fixed_guard(graph, node, self.options.floating_guards),
                _ => Ok(false),
            },
            LoweringTier::Mid => match kind {
                NodeKind::FixedGuard(_) => {
                    fixed_guard_to_if(graph, node)?;
                    Ok(true)
                }
                _ => Ok(false),
            },
            LoweringTier::Low => {
                if kind.is_write_barrier() {
                    self.barriers.lower(graph, node)
                } else {
                    Ok(false)
                }
            }
        }
    }
}
