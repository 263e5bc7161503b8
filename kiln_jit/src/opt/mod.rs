//! Graph phases: canonicalization, verification, logic expansion and the
//! tiered phase suites that drive them.

pub mod canonicalize;
pub mod compare_width;
pub mod expand_logic;
pub mod pipeline;
pub mod verify;
pub mod worklist;

pub use canonicalize::{Canonicalizer, CanonicalizerStats};
pub use compare_width::IntegerCompareWidening;
pub use expand_logic::ExpandLogicPhase;
pub use pipeline::{PhaseSuite, PipelineConfig, PipelineStats, Suites, Target};
pub use verify::{verify_graph, verify_guard_anchoring, verify_integrity, verify_tier_conformance, VerificationPhase};
pub use worklist::NodeWorklist;

use crate::ir::graph::Graph;
use kiln_core::KilnResult;

/// A transformation or check over a whole graph.
pub trait Phase: Send {
    /// Name used in logs and statistics.
    fn name(&self) -> &'static str;

    /// Run on `graph`. Returns whether the graph changed.
    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool>;
}
