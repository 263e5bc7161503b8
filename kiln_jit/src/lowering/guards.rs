//! Guard lowering.
//!
//! Guards move through three shapes:
//!
//! 1. `FixedGuard` on the control path, as built.
//! 2. `Guard`, floating and anchored on the nearest begin, while the graph
//!    is in the [`GuardsStage::FloatingGuards`] stage. This lets later
//!    phases schedule the check as early as its inputs allow.
//! 3. `If` with a `Begin -> Deoptimize` branch on the failing edge once
//!    deopts are fixed.

use crate::ir::cfg::Cfg;
use crate::ir::graph::{Graph, GuardsStage};
use crate::ir::kinds::{GuardInfo, NodeKind};
use crate::ir::node::NodeId;
use crate::ir::stamp::Stamp;
use crate::opt::Phase;
use kiln_core::{DeoptAction, DeoptReason, KilnError, KilnResult, SpeculationReason};
use kiln_runtime::SpeculationLog;

/// Branch probability given to the deoptimizing edge.
pub const DEOPT_PROBABILITY: f64 = 0.000_01;

fn guard_parts(graph: &Graph, guard: NodeId) -> KilnResult<(GuardInfo, NodeId)> {
    let info = match graph.kind(guard) {
        NodeKind::FixedGuard(info) | NodeKind::Guard(info) => *info,
        other => {
            return Err(KilnError::internal_at(
                guard.index(),
                format!("{} is not a guard", other.name()),
            ))
        }
    };
    let condition = graph
        .node(guard)
        .input(0)
        .ok_or_else(|| KilnError::internal_at(guard.index(), "guard without condition"))?;
    Ok((info, condition))
}

/// Guard info for a speculative check on `speculation`.
///
/// Returns `None` when the log records that this speculation already
/// failed; the caller then emits the general path instead of a guard.
/// Without a log the guard is built non-speculatively.
pub fn speculative_guard(
    speculation_log: Option<&SpeculationLog>,
    speculation: SpeculationReason,
    reason: DeoptReason,
    action: DeoptAction,
    negated: bool,
) -> KilnResult<Option<GuardInfo>> {
    let mut info = GuardInfo::new(reason, action, negated);
    if let Some(speculation_log) = speculation_log {
        if !speculation_log.may_speculate(&speculation) {
            log::debug!("not speculating on {}@{}", speculation.group, speculation.bci);
            return Ok(None);
        }
        info.speculation = speculation_log.speculate(speculation)?;
    }
    Ok(Some(info))
}

/// Lower one fixed guard for the current guards stage. Returns whether the
/// graph changed; a guard with `DeoptAction::None` stays fixed while
/// guards may float.
pub fn lower_fixed_guard(graph: &mut Graph, guard: NodeId, floating_allowed: bool) -> KilnResult<bool> {
    let (info, condition) = guard_parts(graph, guard)?;
    if !graph.guards_stage().allows_floating_guards() {
        fixed_guard_to_if(graph, guard)?;
        return Ok(true);
    }
    if !floating_allowed || info.action == DeoptAction::None {
        return Ok(false);
    }
    let anchor = graph
        .prev_begin(guard)
        .ok_or_else(|| KilnError::internal_at(guard.index(), "no begin above fixed guard"))?;
    let floating = graph.add_guarded(NodeKind::Guard(info), &[condition], Stamp::Void, Some(anchor));
    graph.node_mut(floating).position = graph.node(guard).position.clone();
    graph.replace_at_usages(guard, Some(floating))?;
    graph.remove_fixed(guard)?;
    log::trace!("fixed guard {:?} floats as {:?} on {:?}", guard, floating, anchor);
    Ok(true)
}

/// Replace a fixed guard by `If(condition)` with the failing edge going to
/// `Begin -> Deoptimize`. Guard usages move to the passing begin. Returns
/// the new `If`.
pub fn fixed_guard_to_if(graph: &mut Graph, guard: NodeId) -> KilnResult<NodeId> {
    let (info, condition) = guard_parts(graph, guard)?;
    let pred = graph
        .predecessor(guard)
        .ok_or_else(|| KilnError::internal_at(guard.index(), "fixed guard not linked"))?;
    let slot = graph
        .successors(pred)
        .iter()
        .position(|&s| s == guard)
        .ok_or_else(|| KilnError::internal_at(guard.index(), "predecessor does not list guard"))?;
    let next = graph.next(guard);
    let position = graph.node(guard).position.clone();

    let probability = if info.negated {
        DEOPT_PROBABILITY
    } else {
        1.0 - DEOPT_PROBABILITY
    };
    let if_node = graph.add_fixed(NodeKind::If { probability }, &[condition]);
    let pass = graph.add_fixed(NodeKind::Begin, &[]);
    let fail = graph.add_fixed(NodeKind::Begin, &[]);
    let deopt = graph.add_fixed(NodeKind::Deoptimize(info.deopt()), &[]);
    for id in [if_node, pass, fail, deopt] {
        graph.node_mut(id).position = position.clone();
    }

    graph.set_next(guard, None);
    graph.set_next(pass, next);
    graph.set_next(fail, Some(deopt));
    let (t, f) = if info.negated { (fail, pass) } else { (pass, fail) };
    graph.set_successor(if_node, 0, Some(t));
    graph.set_successor(if_node, 1, Some(f));
    graph.replace_at_usages(guard, Some(pass))?;
    graph.set_successor(pred, slot, Some(if_node));
    graph.kill_with_unused_inputs(guard);
    log::trace!("fixed guard {:?} lowered to {:?}", guard, if_node);
    Ok(if_node)
}

// =============================================================================
// Guard Lowering Phase
// =============================================================================

/// Turns every floating guard into an explicit deopt branch, placed after
/// the latest of its anchor and its inputs, and moves the graph to the
/// [`GuardsStage::FixedDeopts`] stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardLoweringPhase;

impl GuardLoweringPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for GuardLoweringPhase {
    fn name(&self) -> &'static str {
        "GuardLowering"
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        let guards: Vec<NodeId> = graph
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Guard(_)))
            .map(|(id, _)| id)
            .collect();
        if guards.is_empty() {
            if graph.guards_stage().allows_floating_guards() {
                graph.set_guards_stage(GuardsStage::FixedDeopts)?;
            }
            return Ok(false);
        }

        let cfg = Cfg::build(graph)?;
        let mut placed = Vec::with_capacity(guards.len());
        for &guard in &guards {
            placed.push((guard, cfg.guard_position(graph, guard)?));
        }

        // add_after_fixed pushes earlier insertions down, so walk backwards
        // to keep guards at one position in creation order.
        for &(guard, position) in placed.iter().rev() {
            let (info, condition) = guard_parts(graph, guard)?;
            let fixed = graph.add_fixed(NodeKind::FixedGuard(info), &[condition]);
            graph.node_mut(fixed).position = graph.node(guard).position.clone();
            graph.add_after_fixed(position, fixed)?;
            graph.replace_at_usages(guard, Some(fixed))?;
            graph.kill_with_unused_inputs(guard);
            fixed_guard_to_if(graph, fixed)?;
        }
        graph.set_guards_stage(GuardsStage::FixedDeopts)?;
        log::debug!("guard lowering: {} guards fixed", placed.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::eval::{evaluate, EvalOutcome};
    use crate::opt::verify::verify_integrity;
    use kiln_core::{AccessSize, RawMemory, RuntimeCalls};

    struct Nothing;
    impl RawMemory for Nothing {
        fn read(&self, _: u64, _: AccessSize) -> u64 {
            0
        }
        fn write(&mut self, _: u64, _: AccessSize, _: u64) {}
    }
    impl RuntimeCalls for Nothing {
        fn call(&mut self, _: &str, _: &[u64]) -> KilnResult<u64> {
            Ok(0)
        }
    }

    fn null_checked(action: DeoptAction) -> (Graph, NodeId, GuardInfo) {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::object());
        let c = b.add(NodeKind::IsNull, &[p]);
        let info = GuardInfo::new(DeoptReason::NullCheckException, action, true);
        let guard = b.append(NodeKind::FixedGuard(info), &[c]).unwrap();
        b.append_return(Some(p)).unwrap();
        (g, guard, info)
    }

    #[test]
    fn test_fixed_guard_floats() {
        let (mut g, guard, info) = null_checked(DeoptAction::InvalidateReprofile);
        assert!(lower_fixed_guard(&mut g, guard, true).unwrap());
        assert!(!g.is_alive(guard));
        let floating: Vec<_> = g.iter().filter(|(_, n)| matches!(n.kind, NodeKind::Guard(_))).collect();
        assert_eq!(floating.len(), 1);
        assert_eq!(floating[0].1.guard(), Some(g.start()));
        assert_eq!(evaluate(&g, &[0], &mut Nothing).unwrap(), EvalOutcome::Deoptimized(info.deopt()));
        assert_eq!(evaluate(&g, &[16], &mut Nothing).unwrap().value(), Some(16));
    }

    #[test]
    fn test_action_none_stays_fixed() {
        let (mut g, guard, _) = null_checked(DeoptAction::None);
        assert!(!lower_fixed_guard(&mut g, guard, true).unwrap());
        assert!(g.is_alive(guard));
    }

    #[test]
    fn test_fixed_deopts_stage_builds_branch() {
        let (mut g, guard, info) = null_checked(DeoptAction::None);
        g.set_guards_stage(GuardsStage::FixedDeopts).unwrap();
        assert!(lower_fixed_guard(&mut g, guard, true).unwrap());
        verify_integrity(&g).unwrap();
        let if_node = g.next(g.start()).unwrap();
        assert!(matches!(g.kind(if_node), NodeKind::If { .. }));
        let fail = g.successors(if_node)[0];
        assert_eq!(g.kind(g.next(fail).unwrap()), &NodeKind::Deoptimize(info.deopt()));
        assert_eq!(evaluate(&g, &[0], &mut Nothing).unwrap(), EvalOutcome::Deoptimized(info.deopt()));
    }

    #[test]
    fn test_guard_lowering_phase_round_trip() {
        let (mut g, guard, info) = null_checked(DeoptAction::InvalidateRecompile);
        lower_fixed_guard(&mut g, guard, true).unwrap();
        assert!(GuardLoweringPhase::new().run(&mut g).unwrap());
        assert_eq!(g.guards_stage(), GuardsStage::FixedDeopts);
        assert!(!g.iter().any(|(_, n)| matches!(n.kind, NodeKind::Guard(_) | NodeKind::FixedGuard(_))));
        verify_integrity(&g).unwrap();
        assert_eq!(evaluate(&g, &[0], &mut Nothing).unwrap(), EvalOutcome::Deoptimized(info.deopt()));
        assert_eq!(evaluate(&g, &[24], &mut Nothing).unwrap().value(), Some(24));
    }

    #[test]
    fn test_failed_speculation_is_not_retried() {
        let log = SpeculationLog::new();
        let reason = SpeculationReason::new("null_check", 7, 0);
        let info = speculative_guard(
            Some(&log),
            reason.clone(),
            DeoptReason::NullCheckException,
            DeoptAction::InvalidateReprofile,
            true,
        )
        .unwrap()
        .unwrap();
        assert!(info.speculation.is_speculative());
        assert_eq!(info.deopt().speculation, info.speculation);

        assert!(log.record_failure(info.speculation));
        log.collect_failed_speculations();
        let retry = speculative_guard(
            Some(&log),
            reason.clone(),
            DeoptReason::NullCheckException,
            DeoptAction::InvalidateReprofile,
            true,
        )
        .unwrap();
        assert!(retry.is_none());

        let plain = speculative_guard(None, reason, DeoptReason::NullCheckException, DeoptAction::None, false)
            .unwrap()
            .unwrap();
        assert!(!plain.speculation.is_speculative());
    }
}
