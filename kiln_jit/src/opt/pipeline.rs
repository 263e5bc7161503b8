//! Tiered phase suites.
//!
//! A compilation runs three suites in order, one per lowering tier:
//!
//! 1. **High**: canonicalize, substitute intrinsics, let guards float.
//! 2. **Mid**: fix guards as deopt branches, add write barriers.
//! 3. **Low**: expand barriers into snippets, expand short-circuit logic.
//!
//! Each suite ends with a canonicalization and a verification phase. The
//! verification phases are no-ops unless `CompilerOptions::verify_graphs`
//! is set.

use super::canonicalize::Canonicalizer;
use super::compare_width::IntegerCompareWidening;
use super::expand_logic::ExpandLogicPhase;
use super::verify::VerificationPhase;
use super::Phase;
use crate::ir::graph::Graph;
use crate::lowering::{
    BarrierSet, GuardLoweringPhase, LoweringPhase, LoweringProvider, LoweringTier, SubstitutionPhase,
    WriteBarrierAdditionPhase,
};
use kiln_core::{CompilerOptions, KilnResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use crate::backend::Target;

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Which optional phases the suites contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Substitute intrinsics at the high tier.
    pub enable_substitutions: bool,

    /// Canonicalize at the start of the high tier, before lowering.
    pub enable_early_canonicalization: bool,

    /// Collector the write barriers are added for.
    pub barrier_set: BarrierSet,

    /// Collect per-phase timing.
    pub collect_timing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_substitutions: true,
            enable_early_canonicalization: true,
            barrier_set: BarrierSet::G1,
            collect_timing: true,
        }
    }
}

impl PipelineConfig {
    /// Only the phases lowering needs.
    pub fn minimal() -> Self {
        Self {
            enable_substitutions: false,
            enable_early_canonicalization: false,
            barrier_set: BarrierSet::CardTable,
            collect_timing: false,
        }
    }

    /// Every phase.
    pub fn full() -> Self {
        Self::default()
    }
}

// =============================================================================
// Phase Suite
// =============================================================================

struct PhaseEntry {
    phase: Box<dyn Phase>,
    runs: usize,
    changes: usize,
    time: Duration,
}

/// Ordered phases of one tier.
pub struct PhaseSuite {
    tier: LoweringTier,
    entries: Vec<PhaseEntry>,
    collect_timing: bool,
}

impl PhaseSuite {
    pub fn new(tier: LoweringTier) -> Self {
        Self {
            tier,
            entries: Vec::new(),
            collect_timing: false,
        }
    }

    #[inline]
    pub fn tier(&self) -> LoweringTier {
        self.tier
    }

    /// Append a phase.
    pub fn append<P: Phase + 'static>(&mut self, phase: P) -> &mut Self {
        self.entries.push(PhaseEntry {
            phase: Box::new(phase),
            runs: 0,
            changes: 0,
            time: Duration::ZERO,
        });
        self
    }

    /// Insert `phase` right after the last phase named `anchor`. Returns
    /// false, without inserting, when no such phase exists.
    pub fn insert_after_last<P: Phase + 'static>(&mut self, anchor: &str, phase: P) -> bool {
        let Some(at) = self.entries.iter().rposition(|e| e.phase.name() == anchor) else {
            return false;
        };
        self.entries.insert(
            at + 1,
            PhaseEntry {
                phase: Box::new(phase),
                runs: 0,
                changes: 0,
                time: Duration::ZERO,
            },
        );
        true
    }

    /// Phase names in run order.
    pub fn phase_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.phase.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every phase once, in order. Stops at the first error.
    pub fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        let mut changed = false;
        for entry in &mut self.entries {
            let start = self.collect_timing.then(Instant::now);
            let result = entry.phase.run(graph);
            if let Some(start) = start {
                entry.time += start.elapsed();
            }
            entry.runs += 1;
            if result? {
                entry.changes += 1;
                changed = true;
            }
            log::trace!("{} tier: {} done, {} nodes", self.tier.name(), entry.phase.name(), graph.live_count());
        }
        Ok(changed)
    }

    /// Per-phase statistics.
    pub fn stats(&self) -> Vec<PassStat> {
        self.entries
            .iter()
            .map(|e| PassStat {
                name: e.phase.name(),
                tier: self.tier,
                runs: e.runs,
                changes: e.changes,
                time: e.time,
            })
            .collect()
    }
}

impl std::fmt::Debug for PhaseSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseSuite")
            .field("tier", &self.tier)
            .field("phases", &self.phase_names())
            .finish()
    }
}

// =============================================================================
// Suites
// =============================================================================

/// The three tier suites for one target.
#[derive(Debug)]
pub struct Suites {
    pub high: PhaseSuite,
    pub mid: PhaseSuite,
    pub low: PhaseSuite,
    target: Target,
}

impl Suites {
    /// Default suites for `target`.
    pub fn for_target(target: Target, options: &CompilerOptions) -> Self {
        let config = PipelineConfig::default();
        let provider = Arc::new(LoweringProvider::new(options.clone(), config.barrier_set));
        Self::with_config(target, options, &config, provider)
    }

    /// Suites built from `config`, lowering through `provider`.
    pub fn with_config(
        target: Target,
        options: &CompilerOptions,
        config: &PipelineConfig,
        provider: Arc<LoweringProvider>,
    ) -> Self {
        let mut high = PhaseSuite::new(LoweringTier::High);
        if config.enable_early_canonicalization {
            high.append(Canonicalizer::new(options));
        }
        if config.enable_substitutions {
            high.append(SubstitutionPhase::default());
        }
        high.append(LoweringPhase::new(LoweringTier::High, Arc::clone(&provider)))
            .append(Canonicalizer::new(options))
            .append(VerificationPhase::new(options, "after high tier"));

        let mut mid = PhaseSuite::new(LoweringTier::Mid);
        mid.append(GuardLoweringPhase::new())
            .append(WriteBarrierAdditionPhase::new(config.barrier_set))
            .append(LoweringPhase::new(LoweringTier::Mid, Arc::clone(&provider)))
            .append(Canonicalizer::new(options))
            .append(VerificationPhase::new(options, "after mid tier"));

        let mut low = PhaseSuite::new(LoweringTier::Low);
        low.append(LoweringPhase::new(LoweringTier::Low, provider))
            .append(ExpandLogicPhase::new())
            .append(Canonicalizer::new(options))
            .append(VerificationPhase::new(options, "after low tier"));

        // Instruction selection on SPARC compares full registers.
        if target == Target::Sparc {
            low.insert_after_last("ExpandLogic", IntegerCompareWidening::new());
        }

        for suite in [&mut high, &mut mid, &mut low] {
            suite.collect_timing = config.collect_timing;
        }
        Self { high, mid, low, target }
    }

    #[inline]
    pub fn target(&self) -> Target {
        self.target
    }

    /// Run high, mid and low suites on `graph`.
    pub fn run(&mut self, graph: &mut Graph) -> KilnResult<PipelineStats> {
        let start = Instant::now();
        let initial_size = graph.live_count();
        self.high.run(graph)?;
        self.mid.run(graph)?;
        self.low.run(graph)?;
        let stats = PipelineStats {
            phases_run: self.high.len() + self.mid.len() + self.low.len(),
            total_time: start.elapsed(),
            initial_size,
            final_size: graph.live_count(),
        };
        log::debug!(
            "suites for {:?}: {} -> {} nodes in {:?}",
            self.target,
            stats.initial_size,
            stats.final_size,
            stats.total_time
        );
        Ok(stats)
    }

    /// Per-phase statistics over all three suites.
    pub fn pass_stats(&self) -> Vec<PassStat> {
        let mut stats = self.high.stats();
        stats.extend(self.mid.stats());
        stats.extend(self.low.stats());
        stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics of one phase.
#[derive(Debug, Clone)]
pub struct PassStat {
    pub name: &'static str,
    pub tier: LoweringTier,
    pub runs: usize,
    /// Runs that changed the graph.
    pub changes: usize,
    pub time: Duration,
}

/// Statistics of a full suites run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub phases_run: usize,
    pub total_time: Duration,
    /// Live nodes before.
    pub initial_size: usize,
    /// Live nodes after.
    pub final_size: usize,
}

impl PipelineStats {
    /// `final_size / initial_size`.
    pub fn size_ratio(&self) -> f64 {
        if self.initial_size == 0 {
            1.0
        } else {
            self.final_size as f64 / self.initial_size as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::kinds::{BarrierKind, GuardInfo, LocationIdentity, MemoryAccess, NodeKind};
    use crate::ir::stamp::Stamp;
    use kiln_core::{DeoptAction, DeoptReason};

    #[test]
    fn test_sparc_widens_after_expand_logic() {
        let options = CompilerOptions::debug();
        let sparc = Suites::for_target(Target::Sparc, &options);
        let names = sparc.low.phase_names();
        let expand = names.iter().rposition(|n| *n == "ExpandLogic").unwrap();
        assert_eq!(names[expand + 1], "IntegerCompareWidening");

        let amd64 = Suites::for_target(Target::Amd64, &options);
        assert!(!amd64.low.phase_names().contains(&"IntegerCompareWidening"));
    }

    #[test]
    fn test_insert_after_missing_anchor() {
        let mut suite = PhaseSuite::new(LoweringTier::Low);
        assert!(!suite.insert_after_last("ExpandLogic", IntegerCompareWidening::new()));
        assert!(suite.is_empty());
    }

    #[test]
    fn test_suites_lower_store_and_guard() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let object = b.parameter(0, Stamp::object());
        let value = b.parameter(1, Stamp::object());
        let is_null = b.add(NodeKind::IsNull, &[object]);
        b.append(
            NodeKind::FixedGuard(GuardInfo::new(
                DeoptReason::NullCheckException,
                DeoptAction::InvalidateReprofile,
                true,
            )),
            &[is_null],
        )
        .unwrap();
        let offset = b.long(16);
        let field = b.add(NodeKind::OffsetAddress, &[object, offset]);
        b.append(
            NodeKind::Write {
                location: LocationIdentity::Any,
                access: MemoryAccess::OBJECT,
                barrier: BarrierKind::Precise,
            },
            &[field, value],
        )
        .unwrap();
        b.append_return(None).unwrap();

        let mut suites = Suites::for_target(Target::Amd64, &CompilerOptions::debug());
        let stats = suites.run(&mut g).unwrap();
        assert_eq!(g.lowered_tier(), Some(LoweringTier::Low));
        assert!(stats.final_size > stats.initial_size);
        assert!(!g.iter().any(|(_, n)| n.kind.is_write_barrier()
            || matches!(n.kind, NodeKind::Guard(_) | NodeKind::FixedGuard(_))));
        assert!(g.iter().any(|(_, n)| matches!(n.kind, NodeKind::Deoptimize(_))));
        assert!(suites.pass_stats().iter().all(|s| s.runs == 1));
    }
}
