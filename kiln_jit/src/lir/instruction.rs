//! LIR instructions.
//!
//! An instruction is an opcode ([`LirOp`]) plus a flat operand list. Each
//! operand declares how the instruction touches it ([`OperandMode`]) and
//! which value classes it accepts ([`OperandFlags`]). The allocator reads
//! modes to build live intervals, the verifier checks flags, and emitters
//! read operands positionally in the order documented on each opcode.

use super::array_equals::ArrayEqualsOp;
use super::value::{Register, Value};
use crate::ir::cfg::BlockId;
use crate::ir::kinds::{BinaryOp, CompareOp, DeoptInfo, MemoryAccess, MemoryBarriers};
use crate::ir::source_position::NodeSourcePosition;
use crate::stubs::ForeignCallDescriptor;
use kiln_core::{Constant, ValueKind};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Operand Modes and Flags
// =============================================================================

/// How an instruction accesses an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandMode {
    /// Read at the start of the instruction; may share a register with a
    /// def.
    Use,
    /// Read, and must stay intact for the whole instruction.
    Alive,
    /// Clobbered scratch; holds nothing before or after.
    Temp,
    /// Written at the end of the instruction.
    Def,
}

impl OperandMode {
    #[inline]
    pub const fn is_input(self) -> bool {
        matches!(self, OperandMode::Use | OperandMode::Alive)
    }
}

bitflags::bitflags! {
    /// Value classes an operand slot accepts.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OperandFlags: u8 {
        /// Variable or physical register.
        const REG = 1 << 0;
        /// Stack slot.
        const STACK = 1 << 1;
        /// Composite address.
        const COMPOSITE = 1 << 2;
        /// Inline constant.
        const CONST = 1 << 3;
        /// The operand may be absent.
        const ILLEGAL = 1 << 4;
        /// The allocator should try to give the operand the location of the
        /// other side of a move.
        const HINT = 1 << 5;
        /// Stack memory read before anything was written to it.
        const UNINITIALIZED = 1 << 6;
    }
}

impl OperandFlags {
    /// Whether a value of this class may occupy the operand.
    pub fn allows(self, value: &Value) -> bool {
        match value {
            Value::Illegal => self.contains(OperandFlags::ILLEGAL),
            Value::Variable(_) => self.intersects(OperandFlags::REG | OperandFlags::STACK),
            Value::Register(..) => self.contains(OperandFlags::REG),
            Value::StackSlot(_) | Value::VirtualStack(_) => self.contains(OperandFlags::STACK),
            Value::Constant(_) => self.contains(OperandFlags::CONST),
            Value::Address(_) => self.contains(OperandFlags::COMPOSITE),
        }
    }
}

/// One operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub value: Value,
    pub mode: OperandMode,
    pub flags: OperandFlags,
}

impl Operand {
    #[inline]
    pub const fn new(value: Value, mode: OperandMode, flags: OperandFlags) -> Self {
        Operand { value, mode, flags }
    }

    #[inline]
    pub const fn def(value: Value, flags: OperandFlags) -> Self {
        Self::new(value, OperandMode::Def, flags)
    }

    #[inline]
    pub const fn use_(value: Value, flags: OperandFlags) -> Self {
        Self::new(value, OperandMode::Use, flags)
    }

    #[inline]
    pub const fn alive(value: Value, flags: OperandFlags) -> Self {
        Self::new(value, OperandMode::Alive, flags)
    }

    #[inline]
    pub const fn temp(value: Value, flags: OperandFlags) -> Self {
        Self::new(value, OperandMode::Temp, flags)
    }
}

// =============================================================================
// Frame State
// =============================================================================

/// Deoptimization metadata attached to an instruction that can trap, call
/// out or deoptimize.
#[derive(Debug, Clone, PartialEq)]
pub struct LirFrameState {
    pub position: Option<Arc<NodeSourcePosition>>,
    pub deopt: DeoptInfo,
}

impl LirFrameState {
    pub fn new(position: Option<Arc<NodeSourcePosition>>, deopt: DeoptInfo) -> Self {
        LirFrameState { position, deopt }
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// Integer unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// Width conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertOp {
    Narrow { bits: u32 },
    SignExtend { from: u32, to: u32 },
    ZeroExtend { from: u32, to: u32 },
}

/// What an instruction does. The operand layout of each opcode is listed
/// on its variant; `?` marks operands that may be illegal.
#[derive(Debug, Clone, PartialEq)]
pub enum LirOp {
    /// Block entry. No operands.
    Label(BlockId),
    /// Incoming arguments. `Def` one operand per parameter.
    Incoming,
    /// No operands.
    Jump(BlockId),
    /// `Use x [REG]`, `Use y [REG, CONST]`.
    Branch {
        op: CompareOp,
        bits: u32,
        true_target: BlockId,
        false_target: BlockId,
        probability: f64,
    },
    /// Branch on the flags set by a preceding [`LirOp::FloatCompare`]. No
    /// operands.
    FloatBranch {
        op: CompareOp,
        true_target: BlockId,
        false_target: BlockId,
        probability: f64,
    },
    /// `Def dst [REG, STACK, HINT]`, `Use src [REG, STACK]`.
    Move,
    /// `Def dst [STACK]`, `Use src [STACK]`, `Temp scratch [REG]`.
    StackMove,
    /// `Def dst [REG, STACK]`.
    LoadConstant(Constant),
    /// `Def dst [REG]`, `Alive table_base? [REG, ILLEGAL]`.
    LoadConstantFromTable(Constant),
    /// `Def base [REG]`.
    LoadConstantTableBase,
    /// `Def dst [REG]`, `Use address [COMPOSITE]`.
    LoadAddress,
    /// `Def dst [REG]`, `Alive block [STACK, UNINITIALIZED]`.
    StackBlockAddress,
    /// `Def dst [REG]`, `Use address [COMPOSITE]`.
    Load(MemoryAccess),
    /// `Use address [COMPOSITE]`, `Use value [REG, CONST]`.
    Store(MemoryAccess),
    /// `Def dst [REG]`, `Use x [REG]`, `Alive y [REG, CONST]`. The
    /// destination never shares a register with `y`, so two-address targets
    /// can copy `x` into it first.
    Binary { op: BinaryOp, bits: u32 },
    /// `Def dst [REG]`, `Use x [REG]`.
    Unary { op: UnaryOp, bits: u32 },
    /// `Def dst [REG]`, `Use x [REG]`.
    Convert(ConvertOp),
    /// `Def dst [REG]`, `Use x [REG]`, `Use y [REG, CONST]`.
    CompareSet { op: CompareOp, bits: u32 },
    /// `Use a [REG]`, `Use b [REG]`. Both of the same float kind.
    FloatCompare,
    /// `Def dst [REG]`, `Alive condition, if_true, if_false [REG]`.
    Select,
    /// No operands.
    Membar(MemoryBarriers),
    /// `Use address [COMPOSITE]`. Carries a frame state.
    NullCheck,
    /// `Def result? [REG, ILLEGAL]`, then `Use arg [REG, STACK, CONST]` per
    /// argument.
    ForeignCall(Arc<ForeignCallDescriptor>),
    /// `Use saved_thread [REG, STACK]`.
    RuntimeCallEpilogue,
    /// `Def result [REG]`, `Alive array1, array2, length [REG]`,
    /// `Temp t1..t4 [REG]`, `Temp vector1?, vector2? [REG, ILLEGAL]`.
    ArrayEquals(ArrayEqualsOp),
    /// No operands. Carries a frame state.
    Deoptimize(DeoptInfo),
    /// `Use value? [REG, STACK, CONST, ILLEGAL]`.
    Return,
}

impl LirOp {
    /// Mnemonic for dumps and errors.
    pub fn name(&self) -> &'static str {
        match self {
            LirOp::Label(_) => "label",
            LirOp::Incoming => "incoming",
            LirOp::Jump(_) => "jump",
            LirOp::Branch { .. } => "branch",
            LirOp::FloatBranch { .. } => "fbranch",
            LirOp::Move => "move",
            LirOp::StackMove => "stackmove",
            LirOp::LoadConstant(_) => "loadconst",
            LirOp::LoadConstantFromTable(_) => "loadconst_table",
            LirOp::LoadConstantTableBase => "load_table_base",
            LirOp::LoadAddress => "lea",
            LirOp::StackBlockAddress => "stack_block_address",
            LirOp::Load(_) => "load",
            LirOp::Store(_) => "store",
            LirOp::Binary { .. } => "binary",
            LirOp::Unary { .. } => "unary",
            LirOp::Convert(_) => "convert",
            LirOp::CompareSet { .. } => "cmpset",
            LirOp::FloatCompare => "fcmp",
            LirOp::Select => "select",
            LirOp::Membar(_) => "membar",
            LirOp::NullCheck => "nullcheck",
            LirOp::ForeignCall(_) => "call",
            LirOp::RuntimeCallEpilogue => "cruntime_call_epilogue",
            LirOp::ArrayEquals(_) => "array_equals",
            LirOp::Deoptimize(_) => "deopt",
            LirOp::Return => "return",
        }
    }

    /// Whether the instruction ends a block.
    #[inline]
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            LirOp::Jump(_)
                | LirOp::Branch { .. }
                | LirOp::FloatBranch { .. }
                | LirOp::Return
                | LirOp::Deoptimize(_)
        )
    }

    /// Whether caller-saved registers are clobbered.
    #[inline]
    pub fn destroys_caller_saved(&self) -> bool {
        matches!(self, LirOp::ForeignCall(_) | LirOp::Deoptimize(_))
    }
}

// =============================================================================
// Instruction
// =============================================================================

/// Operand storage; four covers all but calls and array compares.
pub type Operands = SmallVec<[Operand; 4]>;

/// One LIR instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct LirInstruction {
    pub op: LirOp,
    pub operands: Operands,
    pub state: Option<LirFrameState>,
}

impl LirInstruction {
    pub fn new(op: LirOp, operands: &[Operand]) -> Self {
        LirInstruction {
            op,
            operands: SmallVec::from_slice(operands),
            state: None,
        }
    }

    /// Attach a frame state.
    pub fn with_state(mut self, state: LirFrameState) -> Self {
        self.state = Some(state);
        self
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.op.name()
    }

    /// Value of operand `index`, or illegal.
    #[inline]
    pub fn value(&self, index: usize) -> Value {
        self.operands.get(index).map_or(Value::Illegal, |o| o.value)
    }

    /// Register of operand `index` once allocated.
    #[inline]
    pub fn register(&self, index: usize) -> Option<Register> {
        self.value(index).as_register()
    }

    /// Operands with the given mode.
    pub fn operands_with(&self, mode: OperandMode) -> impl Iterator<Item = &Operand> + '_ {
        self.operands.iter().filter(move |o| o.mode == mode)
    }

    /// The move destination and source, for `Move` and `StackMove`.
    pub fn move_operands(&self) -> Option<(Value, Value)> {
        match self.op {
            LirOp::Move | LirOp::StackMove => Some((self.value(0), self.value(1))),
            _ => None,
        }
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    /// Unconditional jump.
    pub fn jump(target: BlockId) -> Self {
        Self::new(LirOp::Jump(target), &[])
    }

    /// Block label.
    pub fn label(block: BlockId) -> Self {
        Self::new(LirOp::Label(block), &[])
    }

    /// Memory fence.
    pub fn membar(barriers: MemoryBarriers) -> Self {
        Self::new(LirOp::Membar(barriers), &[])
    }

    /// Return of `value` (illegal for void).
    pub fn ret(value: Value) -> Self {
        Self::new(
            LirOp::Return,
            &[Operand::use_(
                value,
                OperandFlags::REG | OperandFlags::STACK | OperandFlags::CONST | OperandFlags::ILLEGAL,
            )],
        )
    }

    /// Unconditional deoptimization.
    pub fn deoptimize(state: LirFrameState) -> Self {
        Self::new(LirOp::Deoptimize(state.deopt), &[]).with_state(state)
    }

    /// Two-operand instruction `dst = x op y`.
    pub fn binary(op: BinaryOp, bits: u32, dst: Value, x: Value, y: Value) -> Self {
        Self::new(
            LirOp::Binary { op, bits },
            &[
                Operand::def(dst, OperandFlags::REG),
                Operand::use_(x, OperandFlags::REG),
                Operand::alive(y, OperandFlags::REG | OperandFlags::CONST),
            ],
        )
    }
}

impl fmt::Display for LirInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            LirOp::Label(b) => return write!(f, "{b}:"),
            LirOp::Jump(b) => return write!(f, "jump {b}"),
            LirOp::Branch {
                op,
                true_target,
                false_target,
                ..
            } => write!(f, "branch {op:?} ? {true_target} : {false_target}")?,
            other => f.write_str(other.name())?,
        }
        for (i, operand) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            if operand.mode == OperandMode::Def {
                f.write_str("=")?;
            }
            write!(f, "{}", operand.value)?;
        }
        Ok(())
    }
}

/// Kind shared by a float compare's operands, if they agree.
pub fn float_compare_kind(inst: &LirInstruction) -> Option<ValueKind> {
    let a = inst.value(0).kind();
    let b = inst.value(1).kind();
    (a == b && a.is_float()).then_some(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::value::{StackSlot, Variable};

    #[test]
    fn test_flags_allow_classes() {
        let v = Value::Variable(Variable {
            index: 0,
            kind: ValueKind::Int,
        });
        let slot = Value::StackSlot(StackSlot {
            offset: 0,
            kind: ValueKind::Int,
        });
        assert!(OperandFlags::REG.allows(&v));
        assert!(OperandFlags::STACK.allows(&v));
        assert!(!OperandFlags::REG.allows(&slot));
        assert!(!OperandFlags::REG.allows(&Value::Constant(Constant::Int(1))));
        assert!(OperandFlags::ILLEGAL.allows(&Value::Illegal));
        assert!(!OperandFlags::REG.allows(&Value::Illegal));
    }

    #[test]
    fn test_display() {
        let dst = Value::Variable(Variable {
            index: 1,
            kind: ValueKind::Int,
        });
        let x = Value::Variable(Variable {
            index: 0,
            kind: ValueKind::Int,
        });
        let inst = LirInstruction::binary(BinaryOp::Add, 32, dst, x, Value::Constant(Constant::Int(4)));
        assert_eq!(inst.to_string(), "binary =v1|int, v0|int, 4i");
    }
}
