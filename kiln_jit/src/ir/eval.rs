//! Graph interpreter.
//!
//! Executes a graph against a [`RuntimeCalls`] memory. Used to check that
//! rewrites preserve behaviour: canonicalization, guard lowering, barrier
//! snippets and stubs are all run before and after and the outcomes
//! compared.
//!
//! Values are raw 64-bit words. Integers narrower than 64 bits are kept
//! sign-extended; narrow unsigned loads are zero-extended; floats are their
//! IEEE bits; objects are addresses with null as zero.
//!
//! Floating guards are checked at the position guard lowering would give
//! them (see [`Cfg::guard_position`]).

use super::cfg::Cfg;
use super::graph::Graph;
use super::kinds::{BinaryOp, DeoptInfo, NodeKind, RegisterRole};
use super::node::NodeId;
use super::stamp::{sign_normalize, zero_normalize, Stamp};
use crate::lir::array_equals::ArrayEqualsOp;
use kiln_core::{AccessSize, Constant, KilnError, KilnResult, RuntimeCalls};
use rustc_hash::FxHashMap;

/// How an evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Reached a `Return`, with its value if any.
    Returned(Option<u64>),
    /// Reached a `Deoptimize` or a failing guard.
    Deoptimized(DeoptInfo),
}

impl EvalOutcome {
    /// The returned value, if the graph returned one.
    pub fn value(&self) -> Option<u64> {
        match self {
            EvalOutcome::Returned(v) => *v,
            EvalOutcome::Deoptimized(_) => None,
        }
    }

    pub fn is_deopt(&self) -> bool {
        matches!(self, EvalOutcome::Deoptimized(_))
    }
}

/// Executes one graph, possibly many times.
pub struct Evaluator<'g> {
    graph: &'g Graph,
    /// Floating guards to check after each fixed node.
    guard_checks: FxHashMap<NodeId, Vec<NodeId>>,
    thread: u64,
    stack_top: u64,
    max_steps: usize,
}

struct Frame<'a> {
    args: &'a [u64],
    values: FxHashMap<NodeId, u64>,
    phis: FxHashMap<NodeId, u64>,
    stack: u64,
}

impl<'g> Evaluator<'g> {
    /// Prepare `graph` for evaluation.
    pub fn new(graph: &'g Graph) -> KilnResult<Self> {
        let cfg = Cfg::build(graph)?;
        let mut guard_checks: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for (id, node) in graph.iter() {
            if matches!(node.kind, NodeKind::Guard(_)) {
                let position = cfg.guard_position(graph, id)?;
                guard_checks.entry(position).or_default().push(id);
            }
        }
        Ok(Evaluator {
            graph,
            guard_checks,
            thread: 0,
            stack_top: 0,
            max_steps: 1_000_000,
        })
    }

    /// Value of `ReadRegister(Thread)`.
    pub fn with_thread(mut self, thread: u64) -> Self {
        self.thread = thread;
        self
    }

    /// Initial stack pointer; `Alloca` carves words below it.
    pub fn with_stack(mut self, stack_top: u64) -> Self {
        self.stack_top = stack_top;
        self
    }

    /// Bail out after this many fixed nodes.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Run the graph on `args`.
    pub fn run<M: RuntimeCalls + ?Sized>(&self, args: &[u64], memory: &mut M) -> KilnResult<EvalOutcome> {
        let graph = self.graph;
        let mut frame = Frame {
            args,
            values: FxHashMap::default(),
            phis: FxHashMap::default(),
            stack: self.stack_top,
        };
        let mut current = graph.start();
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > self.max_steps {
                return Err(KilnError::bailout(format!(
                    "evaluation exceeded {} steps",
                    self.max_steps
                )));
            }
            let node = graph.node(current);
            match &node.kind {
                NodeKind::Start | NodeKind::Begin | NodeKind::LoopExit | NodeKind::Merge | NodeKind::LoopBegin => {}
                NodeKind::If { .. } => {
                    let taken = self.logic(&frame, node.input(0))?;
                    current = node.successors()[if taken { 0 } else { 1 }];
                    continue;
                }
                NodeKind::End | NodeKind::LoopEnd => {
                    let merge = graph
                        .merge_of(current)
                        .ok_or_else(|| KilnError::internal_at(current.index(), "end without merge"))?;
                    self.enter_merge(&mut frame, merge, current)?;
                    current = merge;
                    continue;
                }
                NodeKind::Return => {
                    let value = match node.input(0) {
                        Some(v) => Some(self.value(&frame, v)?),
                        None => None,
                    };
                    return Ok(EvalOutcome::Returned(value));
                }
                NodeKind::Deoptimize(info) => return Ok(EvalOutcome::Deoptimized(*info)),
                NodeKind::Unreachable => {
                    return Err(KilnError::internal_at(current.index(), "reached Unreachable"));
                }
                NodeKind::FixedGuard(info) => {
                    if !info.passes(self.logic(&frame, node.input(0))?) {
                        return Ok(EvalOutcome::Deoptimized(info.deopt()));
                    }
                }
                NodeKind::Invoke { target } => {
                    return Err(KilnError::internal_at(
                        current.index(),
                        format!("invoke of {target} was not inlined"),
                    ));
                }
                NodeKind::ForeignCall { descriptor } => {
                    let mut call_args = Vec::with_capacity(node.inputs().len());
                    for arg in node.inputs().iter() {
                        call_args.push(self.value(&frame, arg)?);
                    }
                    let result = memory.call(descriptor.name(), &call_args)?;
                    frame.values.insert(current, normalize(node.stamp, result));
                }
                NodeKind::Read { access, .. } => {
                    let address = self.value(&frame, input(node.input(0), current)?)?;
                    let raw = memory.read(address, access.size);
                    let bits = (access.size.bytes() * 8) as u32;
                    let value = if access.signed {
                        sign_normalize(bits, raw as i64) as u64
                    } else {
                        raw
                    };
                    frame.values.insert(current, value);
                }
                NodeKind::Write { access, .. } => {
                    let address = self.value(&frame, input(node.input(0), current)?)?;
                    let value = self.value(&frame, input(node.input(1), current)?)?;
                    memory.write(address, access.size, value);
                }
                NodeKind::Membar { .. } => memory.fence(),
                NodeKind::ReadRegister(role) => {
                    let value = match role {
                        RegisterRole::Thread => self.thread,
                        RegisterRole::StackPointer => frame.stack,
                    };
                    frame.values.insert(current, value);
                }
                NodeKind::Alloca { slots } => {
                    frame.stack = frame.stack.wrapping_sub(u64::from(*slots) * 8);
                    frame.values.insert(current, frame.stack);
                }
                NodeKind::ArrayEquals { kind } => {
                    let a = self.value(&frame, input(node.input(0), current)?)?;
                    let b = self.value(&frame, input(node.input(1), current)?)?;
                    let length = self.value(&frame, input(node.input(2), current)?)? as usize;
                    let bytes = length * kind.byte_size() as usize;
                    let read = |base: u64| -> Vec<u8> {
                        (0..bytes as u64)
                            .map(|i| memory.read(base + i, AccessSize::Byte) as u8)
                            .collect()
                    };
                    let (left, right) = (read(a), read(b));
                    let equal = ArrayEqualsOp::for_host(*kind).evaluate(&left, &right, length);
                    frame.values.insert(current, u64::from(equal));
                }
                k if k.is_write_barrier() => {
                    return Err(KilnError::internal_at(
                        current.index(),
                        format!("{} must be lowered before evaluation", k.name()),
                    ));
                }
                k => {
                    return Err(KilnError::internal_at(
                        current.index(),
                        format!("{} on the control path", k.name()),
                    ));
                }
            }

            if let Some(guards) = self.guard_checks.get(&current) {
                for &guard in guards {
                    if let NodeKind::Guard(info) = graph.kind(guard) {
                        if !info.passes(self.logic(&frame, graph.node(guard).input(0))?) {
                            return Ok(EvalOutcome::Deoptimized(info.deopt()));
                        }
                    }
                }
            }

            current = graph.next(current).ok_or_else(|| {
                KilnError::internal_at(current.index(), "fell off the control path")
            })?;
        }
    }

    /// Assign phi values for control arriving at `merge` through `end`.
    /// All phis read their inputs before any is written.
    fn enter_merge(&self, frame: &mut Frame<'_>, merge: NodeId, end: NodeId) -> KilnResult<()> {
        let graph = self.graph;
        let index = graph
            .node(merge)
            .inputs()
            .iter()
            .position(|e| e == end)
            .ok_or_else(|| KilnError::internal_at(merge.index(), "end not listed by merge"))?;
        let mut updates = Vec::new();
        for phi in graph.phis(merge) {
            let value = graph
                .node(phi)
                .input(index + 1)
                .ok_or_else(|| KilnError::internal_at(phi.index(), "phi value missing"))?;
            updates.push((phi, self.value(frame, value)?));
        }
        frame.phis.extend(updates);
        Ok(())
    }

    fn value(&self, frame: &Frame<'_>, id: NodeId) -> KilnResult<u64> {
        let node = self.graph.node(id);
        let operand = |i: usize| -> KilnResult<u64> { self.value(frame, input(node.input(i), id)?) };
        let bits = node.stamp.bits();
        Ok(match &node.kind {
            NodeKind::Constant(c) => constant_bits(*c),
            NodeKind::Parameter(i) => *frame.args.get(*i as usize).ok_or_else(|| {
                KilnError::internal_at(id.index(), format!("missing argument {i}"))
            })?,
            NodeKind::Binary(op) => op.fold(bits, operand(0)? as i64, operand(1)? as i64) as u64,
            NodeKind::Negate => BinaryOp::Sub.fold(bits, 0, operand(0)? as i64) as u64,
            NodeKind::Not => sign_normalize(bits, !(operand(0)? as i64)) as u64,
            NodeKind::Narrow { bits } => sign_normalize(*bits, operand(0)? as i64) as u64,
            NodeKind::SignExtend { from, .. } => sign_normalize(*from, operand(0)? as i64) as u64,
            NodeKind::ZeroExtend { from, .. } => zero_normalize(*from, operand(0)? as i64),
            NodeKind::OffsetAddress => operand(0)?.wrapping_add(operand(1)?),
            NodeKind::Phi => *frame.phis.get(&id).ok_or_else(|| {
                KilnError::internal_at(id.index(), "phi read before its merge was entered")
            })?,
            NodeKind::Conditional => {
                if self.logic(frame, node.input(0))? {
                    operand(1)?
                } else {
                    operand(2)?
                }
            }
            k if k.is_logic() => u64::from(self.logic(frame, Some(id))?),
            k if k.is_fixed() => *frame.values.get(&id).ok_or_else(|| {
                KilnError::internal_at(id.index(), format!("{} used before it executed", k.name()))
            })?,
            k => {
                return Err(KilnError::internal_at(
                    id.index(),
                    format!("{} has no value", k.name()),
                ))
            }
        })
    }

    fn logic(&self, frame: &Frame<'_>, id: Option<NodeId>) -> KilnResult<bool> {
        let id = id.ok_or_else(|| KilnError::internal("condition input missing"))?;
        let node = self.graph.node(id);
        let operand = |i: usize| -> KilnResult<NodeId> { input(node.input(i), id) };
        Ok(match node.kind {
            NodeKind::LogicConstant(v) => v,
            NodeKind::IsNull => self.value(frame, operand(0)?)? == 0,
            NodeKind::LogicNegation => !self.logic(frame, node.input(0))?,
            NodeKind::ShortCircuitOr { x_negated, y_negated } => {
                self.logic(frame, node.input(0))? != x_negated
                    || self.logic(frame, node.input(1))? != y_negated
            }
            NodeKind::Compare(op) => {
                let (x, y) = (operand(0)?, operand(1)?);
                let (vx, vy) = (self.value(frame, x)?, self.value(frame, y)?);
                if op.is_float() {
                    let double = matches!(self.graph.stamp(x), Stamp::Float { double: true, .. });
                    op.fold_float(float_value(vx, double), float_value(vy, double))
                } else {
                    let bits = self.graph.stamp(x).bits().max(self.graph.stamp(y).bits()).max(1);
                    op.fold_integer(bits, vx as i64, vy as i64)
                }
            }
            _ => self.value(frame, id)? != 0,
        })
    }
}

/// Run `graph` once with no thread and a zero stack.
pub fn evaluate<M: RuntimeCalls + ?Sized>(graph: &Graph, args: &[u64], memory: &mut M) -> KilnResult<EvalOutcome> {
    Evaluator::new(graph)?.run(args, memory)
}

fn input(id: Option<NodeId>, user: NodeId) -> KilnResult<NodeId> {
    id.ok_or_else(|| KilnError::internal_at(user.index(), "input missing"))
}

/// Raw word of a constant.
pub fn constant_bits(c: Constant) -> u64 {
    match c {
        Constant::Null => 0,
        Constant::Int(v) => v as i64 as u64,
        Constant::Long(v) => v as u64,
        Constant::Float(bits) => u64::from(bits),
        Constant::Double(bits) => bits,
        Constant::Object(address) => address,
    }
}

fn float_value(raw: u64, double: bool) -> f64 {
    if double {
        f64::from_bits(raw)
    } else {
        f64::from(f32::from_bits(raw as u32))
    }
}

fn normalize(stamp: Stamp, raw: u64) -> u64 {
    match stamp {
        Stamp::Int { bits, .. } => sign_normalize(bits, raw as i64) as u64,
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::kinds::{CompareOp, GuardInfo};
    use kiln_core::{DeoptAction, DeoptReason, RawMemory};

    #[derive(Default)]
    struct NoMemory;

    impl RawMemory for NoMemory {
        fn read(&self, _address: u64, _size: AccessSize) -> u64 {
            0
        }
        fn write(&mut self, _address: u64, _size: AccessSize, _value: u64) {}
    }

    impl RuntimeCalls for NoMemory {
        fn call(&mut self, symbol: &str, _args: &[u64]) -> KilnResult<u64> {
            Err(KilnError::internal(format!("no runtime for {symbol}")))
        }
    }

    /// return x < 0 ? -x : x
    fn abs_graph() -> Graph {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let zero = b.int(0);
        let cond = b.add(NodeKind::Compare(CompareOp::IntegerLessThan), &[x, zero]);
        let mut scope = b.begin_if(cond, 0.5).unwrap();
        let neg = b.add(NodeKind::Negate, &[x]);
        b.else_branch(&mut scope).unwrap();
        let join = b.end_if(scope).unwrap();
        let v = b.merge_value(&join, neg, x);
        b.append_return(Some(v)).unwrap();
        g
    }

    #[test]
    fn test_eval_diamond() {
        let g = abs_graph();
        let mut mem = NoMemory;
        let r = evaluate(&g, &[(-7i64) as u64], &mut mem).unwrap();
        assert_eq!(r.value(), Some(7));
        let r = evaluate(&g, &[5], &mut mem).unwrap();
        assert_eq!(r.value(), Some(5));
    }

    #[test]
    fn test_eval_loop_sums() {
        // sum = 0; for i in 0..n { sum += i }; return sum
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let n = b.parameter(0, Stamp::int(32));
        let zero = b.int(0);
        let one = b.int(1);
        let mut lp = b.begin_loop().unwrap();
        let i = b.loop_phi(&mut lp, zero, Stamp::int(32));
        let sum = b.loop_phi(&mut lp, zero, Stamp::int(32));
        let cond = b.add(NodeKind::Compare(CompareOp::IntegerLessThan), &[i, n]);
        b.loop_exit_unless(&mut lp, cond, 0.9).unwrap();
        let next_sum = b.add(NodeKind::Binary(BinaryOp::Add), &[sum, i]);
        let next_i = b.add(NodeKind::Binary(BinaryOp::Add), &[i, one]);
        b.end_loop(lp, &[(i, next_i), (sum, next_sum)]).unwrap();
        b.append_return(Some(sum)).unwrap();

        let r = evaluate(&g, &[10], &mut NoMemory).unwrap();
        assert_eq!(r.value(), Some(45));
    }

    #[test]
    fn test_eval_fixed_guard_deopts() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::object());
        let is_null = b.add(NodeKind::IsNull, &[p]);
        let info = GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::InvalidateReprofile, true);
        b.append(NodeKind::FixedGuard(info), &[is_null]).unwrap();
        b.append_return(Some(p)).unwrap();

        assert_eq!(evaluate(&g, &[0x40], &mut NoMemory).unwrap().value(), Some(0x40));
        let r = evaluate(&g, &[0], &mut NoMemory).unwrap();
        assert_eq!(r, EvalOutcome::Deoptimized(info.deopt()));
    }

    #[test]
    fn test_eval_step_limit() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let t = b.graph().logic_constant(true);
        let mut lp = b.begin_loop().unwrap();
        b.loop_exit_unless(&mut lp, t, 1.0).unwrap();
        b.end_loop(lp, &[]).unwrap();
        b.append_return(None).unwrap();
        let ev = Evaluator::new(&g).unwrap().with_max_steps(100);
        assert!(ev.run(&[], &mut NoMemory).is_err());
    }

    #[test]
    fn test_eval_unlowered_barrier_is_error() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let p = b.parameter(0, Stamp::word());
        b.append(NodeKind::SerialWriteBarrier { precise: true }, &[p]).unwrap();
        b.append_return(None).unwrap();
        assert!(evaluate(&g, &[0], &mut NoMemory).is_err());
    }
}
