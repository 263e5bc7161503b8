//! Node kinds.
//!
//! Every operation the IR can express is one variant of [`NodeKind`].
//! Passes dispatch with exhaustive `match`es, so adding a kind makes the
//! compiler point at every place that has to learn about it.
//!
//! # Kind Categories
//!
//! | Category | Kinds |
//! |----------|-------|
//! | Begins | Start, Begin, Merge, LoopBegin, LoopExit |
//! | Control ends | End, LoopEnd, Return, Deoptimize, Unreachable |
//! | Splits | If |
//! | Fixed with next | FixedGuard, Invoke, ForeignCall, Read, Write, Membar, barriers, ... |
//! | Floating | constants, arithmetic, comparisons, logic, Phi, Guard |

use crate::stubs::ForeignCallDescriptor;
use kiln_core::{Constant, DeoptAction, DeoptReason, MethodRef, SpeculationHandle, ValueKind};
use kiln_core::AccessSize;
use std::fmt;
use std::sync::Arc;

use super::stamp::{sign_normalize, zero_normalize};

// =============================================================================
// Operators
// =============================================================================

/// Integer binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    /// Left shift; the count is masked to the width.
    Shl,
    /// Arithmetic right shift.
    Shr,
    /// Logical right shift.
    UShr,
}

impl BinaryOp {
    /// Evaluate on `bits`-wide two's complement values. The result is
    /// sign-normalized to the width.
    pub fn fold(self, bits: u32, x: i64, y: i64) -> i64 {
        let width = bits.clamp(1, 64);
        let count = (y as u32) & (width.max(32) - 1);
        let raw = match self {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::And => x & y,
            BinaryOp::Or => x | y,
            BinaryOp::Xor => x ^ y,
            BinaryOp::Shl => x.wrapping_shl(count),
            BinaryOp::Shr => sign_normalize(width, x).wrapping_shr(count),
            BinaryOp::UShr => (zero_normalize(width, x) >> count) as i64,
        };
        sign_normalize(width, raw)
    }

    /// Whether `x op y == y op x`.
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor
        )
    }

    /// Right operand that leaves the left unchanged.
    pub const fn right_identity(self) -> Option<i64> {
        match self {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Or
            | BinaryOp::Xor
            | BinaryOp::Shl
            | BinaryOp::Shr
            | BinaryOp::UShr => Some(0),
            BinaryOp::Mul => Some(1),
            BinaryOp::And => Some(-1),
        }
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "sar",
            BinaryOp::UShr => "shr",
        }
    }
}

/// Comparison operators producing a logic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    IntegerEquals,
    /// Signed `<`.
    IntegerLessThan,
    /// Unsigned `<`.
    IntegerBelow,
    /// `(x & y) == 0`.
    IntegerTest,
    ObjectEquals,
    FloatEquals,
    FloatLessThan,
}

impl CompareOp {
    /// Compare two integer (or object) values of width `bits`.
    pub fn fold_integer(self, bits: u32, x: i64, y: i64) -> bool {
        let sx = sign_normalize(bits, x);
        let sy = sign_normalize(bits, y);
        match self {
            CompareOp::IntegerEquals | CompareOp::ObjectEquals => sx == sy,
            CompareOp::IntegerLessThan => sx < sy,
            CompareOp::IntegerBelow => zero_normalize(bits, x) < zero_normalize(bits, y),
            CompareOp::IntegerTest => sx & sy == 0,
            CompareOp::FloatEquals => sx == sy,
            CompareOp::FloatLessThan => sx < sy,
        }
    }

    /// Compare two floating-point values. Unordered comparisons are false.
    pub fn fold_float(self, x: f64, y: f64) -> bool {
        match self {
            CompareOp::FloatEquals | CompareOp::IntegerEquals | CompareOp::ObjectEquals => x == y,
            CompareOp::FloatLessThan | CompareOp::IntegerLessThan | CompareOp::IntegerBelow => x < y,
            CompareOp::IntegerTest => false,
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, CompareOp::FloatEquals | CompareOp::FloatLessThan)
    }

    /// Whether swapping operands keeps the result.
    pub const fn is_symmetric(self) -> bool {
        matches!(
            self,
            CompareOp::IntegerEquals
                | CompareOp::IntegerTest
                | CompareOp::ObjectEquals
                | CompareOp::FloatEquals
        )
    }
}

// =============================================================================
// Guards and Deoptimization
// =============================================================================

/// What a guard does when its condition does not hold.
///
/// A guard passes when `condition != negated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardInfo {
    pub reason: DeoptReason,
    pub action: DeoptAction,
    pub negated: bool,
    pub speculation: SpeculationHandle,
}

impl GuardInfo {
    pub const fn new(reason: DeoptReason, action: DeoptAction, negated: bool) -> Self {
        GuardInfo {
            reason,
            action,
            negated,
            speculation: SpeculationHandle::NO_SPECULATION,
        }
    }

    /// Same guard with a different polarity.
    pub const fn with_negated(self, negated: bool) -> Self {
        GuardInfo { negated, ..self }
    }

    /// Deopt performed when the guard fails.
    pub const fn deopt(&self) -> DeoptInfo {
        DeoptInfo {
            reason: self.reason,
            action: self.action,
            speculation: self.speculation,
        }
    }

    /// Whether a guard with this polarity passes for `condition`.
    #[inline]
    pub const fn passes(&self, condition: bool) -> bool {
        condition != self.negated
    }
}

/// Operands of an unconditional deoptimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptInfo {
    pub reason: DeoptReason,
    pub action: DeoptAction,
    pub speculation: SpeculationHandle,
}

impl DeoptInfo {
    pub const fn new(reason: DeoptReason, action: DeoptAction) -> Self {
        DeoptInfo {
            reason,
            action,
            speculation: SpeculationHandle::NO_SPECULATION,
        }
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Abstract memory location a read or write touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocationIdentity {
    /// Any location; orders against everything.
    Any,
    /// An instance field.
    Field(Arc<str>),
    /// Elements of arrays of this kind.
    ArrayElement(ValueKind),
    /// Runtime-private locations (card table, queue slots, thread fields).
    Named(&'static str),
}

impl LocationIdentity {
    pub const GC_CARD: LocationIdentity = LocationIdentity::Named("GC-Card");
    pub const GC_LOG: LocationIdentity = LocationIdentity::Named("GC-Log");
    pub const GC_INDEX: LocationIdentity = LocationIdentity::Named("GC-Index");
    pub const THREAD: LocationIdentity = LocationIdentity::Named("Thread");

    /// Whether two accesses may touch the same memory.
    pub fn overlaps(&self, other: &LocationIdentity) -> bool {
        matches!(self, LocationIdentity::Any) || matches!(other, LocationIdentity::Any) || self == other
    }
}

/// Width and interpretation of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAccess {
    pub size: AccessSize,
    /// Sign-extend narrow loads instead of zero-extending.
    pub signed: bool,
    /// The value is an object reference.
    pub object: bool,
}

impl MemoryAccess {
    pub const BYTE: MemoryAccess = MemoryAccess {
        size: AccessSize::Byte,
        signed: false,
        object: false,
    };
    pub const WORD: MemoryAccess = MemoryAccess {
        size: AccessSize::Quad,
        signed: false,
        object: false,
    };
    pub const OBJECT: MemoryAccess = MemoryAccess {
        size: AccessSize::Quad,
        signed: false,
        object: true,
    };

    /// Access for an array element or field of `kind`.
    pub fn for_kind(kind: ValueKind) -> Self {
        let size = AccessSize::from_bytes(kind.byte_size()).unwrap_or(AccessSize::Quad);
        MemoryAccess {
            size,
            signed: matches!(kind, ValueKind::Byte | ValueKind::Short | ValueKind::Int | ValueKind::Long),
            object: kind.is_object(),
        }
    }
}

/// Write barrier a reference store needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// Not a reference store, or the collector needs nothing.
    None,
    /// Card of the object header is enough.
    Imprecise,
    /// Card of the written field itself.
    Precise,
}

bitflags::bitflags! {
    /// Orderings a memory barrier enforces.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryBarriers: u8 {
        const LOAD_LOAD = 0b0001;
        const LOAD_STORE = 0b0010;
        const STORE_LOAD = 0b0100;
        const STORE_STORE = 0b1000;
    }
}

/// Registers with a fixed runtime role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRole {
    /// Current thread pointer.
    Thread,
    /// Stack pointer.
    StackPointer,
}

// =============================================================================
// Node Kind
// =============================================================================

/// What a node computes.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // ---- Control --------------------------------------------------------
    /// Graph entry.
    Start,
    /// Begin of a branch target.
    Begin,
    /// Forward end flowing into a merge.
    End,
    /// Control-flow join. Inputs: forward ends.
    Merge,
    /// Loop header. Inputs: the forward end, then loop ends.
    LoopBegin,
    /// Loop back edge. Owned by the loop begin that lists it.
    LoopEnd,
    /// Control leaving a loop. Inputs: `[loop_begin]`.
    LoopExit,
    /// Two-way split. Inputs: `[condition]`. Successors: `[true, false]`.
    If { probability: f64 },
    /// Method return. Inputs: `[]` or `[value]`.
    Return,
    /// Unconditional deoptimization.
    Deoptimize(DeoptInfo),
    /// Control never reaches here.
    Unreachable,

    // ---- Guards ---------------------------------------------------------
    /// Guard on the control path. Inputs: `[condition]`.
    FixedGuard(GuardInfo),
    /// Floating guard. Inputs: `[condition]`; guard edge: its anchor.
    Guard(GuardInfo),

    // ---- Calls ----------------------------------------------------------
    /// Call of a helper method; must be inlined before code generation.
    Invoke { target: MethodRef },
    /// Call into the runtime. Inputs: the arguments.
    ForeignCall { descriptor: Arc<ForeignCallDescriptor> },

    // ---- Memory ---------------------------------------------------------
    /// Load. Inputs: `[address]`.
    Read {
        location: LocationIdentity,
        access: MemoryAccess,
    },
    /// Store. Inputs: `[address, value]`.
    Write {
        location: LocationIdentity,
        access: MemoryAccess,
        barrier: BarrierKind,
    },
    /// Memory fence.
    Membar { barriers: MemoryBarriers },
    /// Value of a fixed-role register.
    ReadRegister(RegisterRole),
    /// Reserve `slots` words of stack; yields their address.
    Alloca { slots: u32 },

    // ---- Write Barriers -------------------------------------------------
    /// Card mark. Inputs: `[address]`.
    SerialWriteBarrier { precise: bool },
    /// Card marks for a range. Inputs: `[address, length]`.
    SerialArrayRangeWriteBarrier { element_stride: i32 },
    /// SATB pre barrier. Inputs: `[address]` or `[address, expected]`.
    G1PreWriteBarrier { do_load: bool, null_check: bool },
    /// G1 post barrier. Inputs: `[address, value]`.
    G1PostWriteBarrier { precise: bool },
    /// SATB pre barrier for a range. Inputs: `[address, length]`.
    G1ArrayRangePreWriteBarrier { element_stride: i32 },
    /// G1 post barrier for a range. Inputs: `[address, length]`.
    G1ArrayRangePostWriteBarrier { element_stride: i32 },

    // ---- Intrinsics -----------------------------------------------------
    /// Element-wise array comparison. Inputs: `[first1, first2, length]`
    /// where the first two are element addresses.
    ArrayEquals { kind: ValueKind },

    // ---- Floating Values ------------------------------------------------
    /// Incoming argument.
    Parameter(u32),
    Constant(Constant),
    Binary(BinaryOp),
    Negate,
    Not,
    /// Truncate to `bits`.
    Narrow { bits: u32 },
    /// Sign-extend from `from` bits.
    SignExtend { from: u32, to: u32 },
    /// Zero-extend from `from` bits.
    ZeroExtend { from: u32, to: u32 },
    /// `base + offset`. Inputs: `[base, offset]`.
    OffsetAddress,
    /// Inputs: `[merge, values...]`, one value per merge input.
    Phi,

    // ---- Logic ----------------------------------------------------------
    /// Inputs: `[x, y]`.
    Compare(CompareOp),
    /// Inputs: `[object]`.
    IsNull,
    /// Inputs: `[condition]`.
    LogicNegation,
    /// `(x ^ x_negated) || (y ^ y_negated)`. Inputs: `[x, y]`.
    ShortCircuitOr { x_negated: bool, y_negated: bool },
    LogicConstant(bool),
    /// Inputs: `[condition, true_value, false_value]`.
    Conditional,
}

impl NodeKind {
    /// Short name for dumps and errors.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::Begin => "Begin",
            NodeKind::End => "End",
            NodeKind::Merge => "Merge",
            NodeKind::LoopBegin => "LoopBegin",
            NodeKind::LoopEnd => "LoopEnd",
            NodeKind::LoopExit => "LoopExit",
            NodeKind::If { .. } => "If",
            NodeKind::Return => "Return",
            NodeKind::Deoptimize(_) => "Deoptimize",
            NodeKind::Unreachable => "Unreachable",
            NodeKind::FixedGuard(_) => "FixedGuard",
            NodeKind::Guard(_) => "Guard",
            NodeKind::Invoke { .. } => "Invoke",
            NodeKind::ForeignCall { .. } => "ForeignCall",
            NodeKind::Read { .. } => "Read",
            NodeKind::Write { .. } => "Write",
            NodeKind::Membar { .. } => "Membar",
            NodeKind::ReadRegister(_) => "ReadRegister",
            NodeKind::Alloca { .. } => "Alloca",
            NodeKind::SerialWriteBarrier { .. } => "SerialWriteBarrier",
            NodeKind::SerialArrayRangeWriteBarrier { .. } => "SerialArrayRangeWriteBarrier",
            NodeKind::G1PreWriteBarrier { .. } => "G1PreWriteBarrier",
            NodeKind::G1PostWriteBarrier { .. } => "G1PostWriteBarrier",
            NodeKind::G1ArrayRangePreWriteBarrier { .. } => "G1ArrayRangePreWriteBarrier",
            NodeKind::G1ArrayRangePostWriteBarrier { .. } => "G1ArrayRangePostWriteBarrier",
            NodeKind::ArrayEquals { .. } => "ArrayEquals",
            NodeKind::Parameter(_) => "Parameter",
            NodeKind::Constant(_) => "Constant",
            NodeKind::Binary(_) => "Binary",
            NodeKind::Negate => "Negate",
            NodeKind::Not => "Not",
            NodeKind::Narrow { .. } => "Narrow",
            NodeKind::SignExtend { .. } => "SignExtend",
            NodeKind::ZeroExtend { .. } => "ZeroExtend",
            NodeKind::OffsetAddress => "OffsetAddress",
            NodeKind::Phi => "Phi",
            NodeKind::Compare(_) => "Compare",
            NodeKind::IsNull => "IsNull",
            NodeKind::LogicNegation => "LogicNegation",
            NodeKind::ShortCircuitOr { .. } => "ShortCircuitOr",
            NodeKind::LogicConstant(_) => "LogicConstant",
            NodeKind::Conditional => "Conditional",
        }
    }

    /// Nodes that start a block and may anchor guards.
    #[inline]
    pub fn is_begin(&self) -> bool {
        matches!(
            self,
            NodeKind::Start | NodeKind::Begin | NodeKind::Merge | NodeKind::LoopBegin | NodeKind::LoopExit
        )
    }

    /// Joins whose inputs are forward (and loop) ends.
    #[inline]
    pub fn is_merge(&self) -> bool {
        matches!(self, NodeKind::Merge | NodeKind::LoopBegin)
    }

    /// Fixed nodes without a `next`.
    #[inline]
    pub fn is_control_sink(&self) -> bool {
        matches!(
            self,
            NodeKind::End
                | NodeKind::LoopEnd
                | NodeKind::Return
                | NodeKind::Deoptimize(_)
                | NodeKind::Unreachable
        )
    }

    /// Fixed nodes with a single `next` successor.
    #[inline]
    pub fn has_next(&self) -> bool {
        self.is_fixed() && !self.is_control_sink() && !matches!(self, NodeKind::If { .. })
    }

    /// Number of control successor slots.
    #[inline]
    pub fn successor_count(&self) -> usize {
        match self {
            NodeKind::If { .. } => 2,
            k if k.has_next() => 1,
            _ => 0,
        }
    }

    /// Whether the node sits on a control path.
    pub fn is_fixed(&self) -> bool {
        match self {
            NodeKind::Start
            | NodeKind::Begin
            | NodeKind::End
            | NodeKind::Merge
            | NodeKind::LoopBegin
            | NodeKind::LoopEnd
            | NodeKind::LoopExit
            | NodeKind::If { .. }
            | NodeKind::Return
            | NodeKind::Deoptimize(_)
            | NodeKind::Unreachable
            | NodeKind::FixedGuard(_)
            | NodeKind::Invoke { .. }
            | NodeKind::ForeignCall { .. }
            | NodeKind::Read { .. }
            | NodeKind::Write { .. }
            | NodeKind::Membar { .. }
            | NodeKind::ReadRegister(_)
            | NodeKind::Alloca { .. }
            | NodeKind::SerialWriteBarrier { .. }
            | NodeKind::SerialArrayRangeWriteBarrier { .. }
            | NodeKind::G1PreWriteBarrier { .. }
            | NodeKind::G1PostWriteBarrier { .. }
            | NodeKind::G1ArrayRangePreWriteBarrier { .. }
            | NodeKind::G1ArrayRangePostWriteBarrier { .. }
            | NodeKind::ArrayEquals { .. } => true,
            NodeKind::Guard(_)
            | NodeKind::Parameter(_)
            | NodeKind::Constant(_)
            | NodeKind::Binary(_)
            | NodeKind::Negate
            | NodeKind::Not
            | NodeKind::Narrow { .. }
            | NodeKind::SignExtend { .. }
            | NodeKind::ZeroExtend { .. }
            | NodeKind::OffsetAddress
            | NodeKind::Phi
            | NodeKind::Compare(_)
            | NodeKind::IsNull
            | NodeKind::LogicNegation
            | NodeKind::ShortCircuitOr { .. }
            | NodeKind::LogicConstant(_)
            | NodeKind::Conditional => false,
        }
    }

    #[inline]
    pub fn is_floating(&self) -> bool {
        !self.is_fixed()
    }

    /// Nodes producing a condition rather than a value.
    #[inline]
    pub fn is_logic(&self) -> bool {
        matches!(
            self,
            NodeKind::Compare(_)
                | NodeKind::IsNull
                | NodeKind::LogicNegation
                | NodeKind::ShortCircuitOr { .. }
                | NodeKind::LogicConstant(_)
        )
    }

    /// Nodes other nodes may name as their guard input.
    #[inline]
    pub fn is_guarding(&self) -> bool {
        self.is_begin() || matches!(self, NodeKind::Guard(_) | NodeKind::FixedGuard(_))
    }

    /// Write barrier nodes of either collector.
    #[inline]
    pub fn is_write_barrier(&self) -> bool {
        matches!(
            self,
            NodeKind::SerialWriteBarrier { .. }
                | NodeKind::SerialArrayRangeWriteBarrier { .. }
                | NodeKind::G1PreWriteBarrier { .. }
                | NodeKind::G1PostWriteBarrier { .. }
                | NodeKind::G1ArrayRangePreWriteBarrier { .. }
                | NodeKind::G1ArrayRangePostWriteBarrier { .. }
        )
    }

    /// Fixed nodes that may write memory or call out.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            NodeKind::Write { .. }
                | NodeKind::Invoke { .. }
                | NodeKind::ForeignCall { .. }
                | NodeKind::Membar { .. }
        ) || self.is_write_barrier()
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self, NodeKind::Constant(_))
    }

    /// Floating nodes that are kept even without usages.
    #[inline]
    pub fn is_anchored_floating(&self) -> bool {
        matches!(self, NodeKind::Guard(_) | NodeKind::Parameter(_))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Constant(c) => write!(f, "Constant({c})"),
            NodeKind::Binary(op) => write!(f, "{}", op.mnemonic()),
            NodeKind::Compare(op) => write!(f, "{op:?}"),
            NodeKind::Parameter(i) => write!(f, "Parameter({i})"),
            NodeKind::Invoke { target } => write!(f, "Invoke({target})"),
            NodeKind::ForeignCall { descriptor } => write!(f, "ForeignCall({})", descriptor.name()),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_fold_wraps_at_width() {
        assert_eq!(BinaryOp::Add.fold(32, i32::MAX as i64, 1), i32::MIN as i64);
        assert_eq!(BinaryOp::Add.fold(64, i64::MAX, 1), i64::MIN);
        assert_eq!(BinaryOp::Mul.fold(32, 0x10000, 0x10000), 0);
    }

    #[test]
    fn test_shift_counts_are_masked() {
        assert_eq!(BinaryOp::Shl.fold(32, 1, 33), 2);
        assert_eq!(BinaryOp::Shl.fold(64, 1, 65), 2);
        assert_eq!(BinaryOp::Shr.fold(32, -8, 1), -4);
        assert_eq!(BinaryOp::UShr.fold(32, -8, 28), 0xf);
        assert_eq!(BinaryOp::UShr.fold(64, -1, 63), 1);
    }

    #[test]
    fn test_compare_fold() {
        assert!(CompareOp::IntegerLessThan.fold_integer(32, -1, 0));
        assert!(!CompareOp::IntegerBelow.fold_integer(32, -1, 0));
        assert!(CompareOp::IntegerTest.fold_integer(32, 0b1010, 0b0101));
        assert!(!CompareOp::FloatEquals.fold_float(f64::NAN, f64::NAN));
        assert!(!CompareOp::FloatLessThan.fold_float(f64::NAN, 1.0));
    }

    #[test]
    fn test_guard_polarity() {
        let info = GuardInfo::new(DeoptReason::NullCheckException, DeoptAction::InvalidateReprofile, true);
        assert!(info.passes(false));
        assert!(!info.passes(true));
        assert!(info.with_negated(false).passes(true));
    }

    #[test]
    fn test_kind_classification() {
        assert!(NodeKind::Begin.is_begin());
        assert!(NodeKind::Begin.has_next());
        assert!(!NodeKind::End.has_next());
        assert_eq!(NodeKind::If { probability: 0.5 }.successor_count(), 2);
        assert!(NodeKind::Guard(GuardInfo::new(
            DeoptReason::None,
            DeoptAction::None,
            false
        ))
        .is_floating());
        assert!(NodeKind::Compare(CompareOp::IntegerEquals).is_logic());
        assert!(NodeKind::G1PostWriteBarrier { precise: true }.has_side_effect());
    }
}
