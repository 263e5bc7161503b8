//! Live intervals.
//!
//! Instructions are numbered in code order. Every instruction `i` has two
//! program points: `before(i)`, where its inputs are read, and `after(i)`,
//! where its results are written. A `Use` operand is live up to
//! `before(i)`, so a result may take the register of an input that dies.
//! `Alive` and `Temp` operands stay live through `after(i)` and never share
//! a register with a result; a `Temp` also never shares one with an input.
//!
//! An interval is the hull of all points where its variable is live. Holes
//! are not tracked; a variable keeps one location for its whole life, so no
//! resolution moves are needed at block boundaries.

use crate::ir::arena::BitSet;
use crate::lir::instruction::{LirInstruction, OperandFlags, OperandMode};
use crate::lir::value::{category_of, AddressBase, RegisterCategory, Value, Variable};
use crate::lir::Lir;
use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Program Point
// =============================================================================

/// A position in the numbered instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgPoint(u32);

impl ProgPoint {
    /// Where instruction `index` reads its inputs.
    #[inline]
    pub const fn before(index: u32) -> Self {
        ProgPoint(index * 2)
    }

    /// Where instruction `index` writes its results.
    #[inline]
    pub const fn after(index: u32) -> Self {
        ProgPoint(index * 2 + 1)
    }

    #[inline]
    pub const fn inst_index(self) -> u32 {
        self.0 / 2
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        ProgPoint(self.0 + 1)
    }
}

impl fmt::Display for ProgPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 2 == 0 {
            write!(f, "{}b", self.inst_index())
        } else {
            write!(f, "{}a", self.inst_index())
        }
    }
}

// =============================================================================
// Live Range
// =============================================================================

/// Half-open span `[start, end)` of program points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: ProgPoint,
    pub end: ProgPoint,
}

impl LiveRange {
    /// The range holding only `point`.
    #[inline]
    pub const fn at(point: ProgPoint) -> Self {
        LiveRange {
            start: point,
            end: point.next(),
        }
    }

    #[inline]
    pub const fn contains(&self, point: ProgPoint) -> bool {
        point.raw() >= self.start.raw() && point.raw() < self.end.raw()
    }

    #[inline]
    pub const fn overlaps(&self, other: &LiveRange) -> bool {
        self.start.raw() < other.end.raw() && other.start.raw() < self.end.raw()
    }

    /// Grow to include `point`.
    pub fn extend_to(&mut self, point: ProgPoint) {
        if point < self.start {
            self.start = point;
        }
        if point >= self.end {
            self.end = point.next();
        }
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// =============================================================================
// Live Interval
// =============================================================================

/// Lifetime of one variable.
#[derive(Debug, Clone)]
pub struct LiveInterval {
    pub variable: Variable,
    pub category: RegisterCategory,
    pub range: LiveRange,
    /// Live across an instruction that destroys caller-saved registers.
    pub crosses_call: bool,
    /// Some instruction cannot take this variable from a stack slot even
    /// through a scratch register.
    pub must_have_register: bool,
}

impl LiveInterval {
    fn new(variable: Variable, point: ProgPoint) -> Self {
        LiveInterval {
            variable,
            category: category_of(variable.kind),
            range: LiveRange::at(point),
            crosses_call: false,
            must_have_register: false,
        }
    }

    #[inline]
    pub fn start(&self) -> ProgPoint {
        self.range.start
    }

    #[inline]
    pub fn end(&self) -> ProgPoint {
        self.range.end
    }

    #[inline]
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.range.overlaps(&other.range)
    }
}

impl fmt::Display for LiveInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.variable, self.range)?;
        if self.crosses_call {
            f.write_str(" call")?;
        }
        if self.must_have_register {
            f.write_str(" reg")?;
        }
        Ok(())
    }
}

// =============================================================================
// Operand Walking
// =============================================================================

/// A variable reference inside an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VariableRef {
    pub variable: Variable,
    pub mode: OperandMode,
    /// Whether the operand can name a stack slot directly.
    pub stack_ok: bool,
}

/// Every variable an instruction touches, address bases included.
pub(crate) fn variable_refs(inst: &LirInstruction) -> impl Iterator<Item = VariableRef> + '_ {
    inst.operands.iter().filter_map(|operand| match operand.value {
        Value::Variable(variable) => Some(VariableRef {
            variable,
            mode: operand.mode,
            stack_ok: operand.flags.contains(OperandFlags::STACK),
        }),
        Value::Address(address) => match address.base {
            AddressBase::Variable(variable) => Some(VariableRef {
                variable,
                mode: if operand.mode == OperandMode::Alive {
                    OperandMode::Alive
                } else {
                    OperandMode::Use
                },
                stack_ok: false,
            }),
            AddressBase::Register(_) => None,
        },
        _ => None,
    })
}

/// Program point a reference occupies.
fn point_of(mode: OperandMode, index: u32) -> ProgPoint {
    match mode {
        OperandMode::Use => ProgPoint::before(index),
        OperandMode::Alive | OperandMode::Temp | OperandMode::Def => ProgPoint::after(index),
    }
}

// =============================================================================
// Interval Construction
// =============================================================================

/// Live intervals of `lir`, sorted by start.
pub fn build_intervals(lir: &Lir) -> Vec<LiveInterval> {
    let blocks = lir.blocks();
    let mut first_index = Vec::with_capacity(blocks.len());
    let mut next = 0u32;
    for block in blocks {
        first_index.push(next);
        next += block.instructions.len() as u32;
    }

    // Local gen/kill sets.
    let mut gen = vec![BitSet::new(); blocks.len()];
    let mut kill = vec![BitSet::new(); blocks.len()];
    for (b, block) in blocks.iter().enumerate() {
        for inst in &block.instructions {
            let refs: Vec<VariableRef> = variable_refs(inst).collect();
            for r in refs.iter().filter(|r| r.mode.is_input()) {
                let v = r.variable.index as usize;
                if !kill[b].contains(v) {
                    gen[b].insert(v);
                }
            }
            for r in refs.iter().filter(|r| !r.mode.is_input()) {
                kill[b].insert(r.variable.index as usize);
            }
        }
    }

    // Backward dataflow to a fixed point.
    let mut live_in = vec![BitSet::new(); blocks.len()];
    let mut live_out = vec![BitSet::new(); blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..blocks.len()).rev() {
            let mut out = BitSet::new();
            for succ in &blocks[b].successors {
                if let Some(s) = lir.code_index(*succ) {
                    out.union_with(&live_in[s]);
                }
            }
            let mut inn = gen[b].clone();
            for v in out.iter() {
                if !kill[b].contains(v) {
                    inn.insert(v);
                }
            }
            if inn != live_in[b] {
                live_in[b] = inn;
                changed = true;
            }
            live_out[b] = out;
        }
    }

    let mut kinds: FxHashMap<u32, Variable> = FxHashMap::default();
    for inst in lir.instructions() {
        for r in variable_refs(inst) {
            kinds.insert(r.variable.index, r.variable);
        }
    }

    let mut intervals: FxHashMap<u32, LiveInterval> = FxHashMap::default();
    let mut calls = Vec::new();
    for (b, block) in blocks.iter().enumerate() {
        let first = first_index[b];
        for (offset, inst) in block.instructions.iter().enumerate() {
            let index = first + offset as u32;
            if inst.op.destroys_caller_saved() {
                calls.push(index);
            }
            for r in variable_refs(inst) {
                if r.mode == OperandMode::Temp {
                    extend(&mut intervals, r.variable, ProgPoint::before(index));
                }
                extend(&mut intervals, r.variable, point_of(r.mode, index));
            }
        }
        let last = first + block.instructions.len().saturating_sub(1) as u32;
        for v in live_in[b].iter() {
            if let Some(&variable) = kinds.get(&(v as u32)) {
                extend(&mut intervals, variable, ProgPoint::before(first));
            }
        }
        for v in live_out[b].iter() {
            if let Some(&variable) = kinds.get(&(v as u32)) {
                extend(&mut intervals, variable, ProgPoint::after(last));
            }
        }
    }

    let mut result: Vec<LiveInterval> = intervals.into_values().collect();
    for interval in &mut result {
        interval.crosses_call = calls.iter().any(|&c| {
            interval.range.contains(ProgPoint::before(c)) && interval.range.contains(ProgPoint::after(c))
        });
    }
    mark_register_operands(lir, &mut result);
    result.sort_by_key(|i| (i.start(), i.variable.index));
    result
}

fn extend(intervals: &mut FxHashMap<u32, LiveInterval>, variable: Variable, point: ProgPoint) {
    intervals
        .entry(variable.index)
        .and_modify(|i| i.range.extend_to(point))
        .or_insert_with(|| LiveInterval::new(variable, point));
}

/// Scratch registers available per register category when rewriting
/// spilled operands.
pub const SCRATCH_PER_CATEGORY: usize = 2;

/// Flag variables that must never be spilled: temporaries, and operands of
/// instructions that would need more scratch registers than exist.
fn mark_register_operands(lir: &Lir, intervals: &mut [LiveInterval]) {
    let mut must = BitSet::new();
    for inst in lir.instructions() {
        for category in [RegisterCategory::General, RegisterCategory::Float] {
            let refs: Vec<VariableRef> = variable_refs(inst)
                .filter(|r| !r.stack_ok && category_of(r.variable.kind) == category)
                .collect();
            let inputs = refs.iter().filter(|r| r.mode.is_input()).count();
            let alive = refs.iter().filter(|r| r.mode == OperandMode::Alive).count();
            let defs = refs.iter().filter(|r| r.mode == OperandMode::Def).count();
            let over = inputs > SCRATCH_PER_CATEGORY || alive + defs > SCRATCH_PER_CATEGORY;
            for r in &refs {
                if over || r.mode == OperandMode::Temp {
                    must.insert(r.variable.index as usize);
                }
            }
        }
    }
    for interval in intervals {
        interval.must_have_register = must.contains(interval.variable.index as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;
    use crate::ir::cfg::BlockId;
    use crate::ir::kinds::BinaryOp;
    use crate::lir::instruction::{LirOp, Operand};
    use crate::lir::LirBlock;
    use kiln_core::{Constant, ValueKind};

    fn var(index: u32) -> Variable {
        Variable {
            index,
            kind: ValueKind::Int,
        }
    }

    #[test]
    fn test_prog_points() {
        assert!(ProgPoint::before(3) < ProgPoint::after(3));
        assert_eq!(ProgPoint::after(3).inst_index(), 3);
        assert_eq!(ProgPoint::before(2).to_string(), "2b");
    }

    #[test]
    fn test_live_range_extend() {
        let mut r = LiveRange::at(ProgPoint::before(4));
        r.extend_to(ProgPoint::after(1));
        r.extend_to(ProgPoint::before(9));
        assert_eq!(r.start, ProgPoint::after(1));
        assert!(r.contains(ProgPoint::before(9)));
        assert!(!r.contains(ProgPoint::after(9)));
    }

    #[test]
    fn test_use_and_def_do_not_overlap() {
        let mut lir = Lir::new(Target::Amd64);
        let id = BlockId::new(0);
        let mut block = LirBlock::new(id);
        block.instructions.push(LirInstruction::label(id));
        block.instructions.push(LirInstruction::new(
            LirOp::LoadConstant(Constant::Int(1)),
            &[Operand::def(Value::Variable(var(0)), OperandFlags::REG)],
        ));
        block.instructions.push(LirInstruction::binary(
            BinaryOp::Add,
            32,
            Value::Variable(var(1)),
            Value::Variable(var(0)),
            Value::Constant(Constant::Int(2)),
        ));
        block.instructions.push(LirInstruction::ret(Value::Variable(var(1))));
        lir.add_block(block).unwrap();

        let intervals = build_intervals(&lir);
        assert_eq!(intervals.len(), 2);
        let (a, b) = (&intervals[0], &intervals[1]);
        assert_eq!(a.range.start, ProgPoint::after(1));
        assert_eq!(a.range.end, ProgPoint::after(2));
        assert!(!a.overlaps(b));
        assert!(!a.must_have_register);
    }
}
