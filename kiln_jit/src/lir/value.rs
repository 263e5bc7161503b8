//! LIR operand values.
//!
//! A value is where an operand lives: an unallocated [`Variable`], a
//! physical [`Register`], a frame slot, an inline constant or a composite
//! address. Register allocation replaces every variable with a register or
//! a stack slot; nothing else changes after instruction selection.

use kiln_core::{Constant, ValueKind};
use std::fmt;

// =============================================================================
// Registers
// =============================================================================

/// Register file a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterCategory {
    /// Integer and pointer registers.
    General,
    /// Floating-point and vector registers.
    Float,
}

/// A physical register, identified by its hardware encoding within its
/// register file. Targets map the encoding back to their own register enums.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub category: RegisterCategory,
    pub encoding: u8,
}

impl Register {
    #[inline]
    pub const fn general(encoding: u8) -> Self {
        Register {
            category: RegisterCategory::General,
            encoding,
        }
    }

    #[inline]
    pub const fn float(encoding: u8) -> Self {
        Register {
            category: RegisterCategory::Float,
            encoding,
        }
    }

    #[inline]
    pub const fn is_general(self) -> bool {
        matches!(self.category, RegisterCategory::General)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self.category, RegisterCategory::Float)
    }

    /// Same register viewed as a value of `kind`.
    #[inline]
    pub const fn as_value(self, kind: ValueKind) -> Value {
        Value::Register(self, kind)
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            RegisterCategory::General => write!(f, "r{}", self.encoding),
            RegisterCategory::Float => write!(f, "f{}", self.encoding),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Register file a value of `kind` is allocated in.
#[inline]
pub fn category_of(kind: ValueKind) -> RegisterCategory {
    if kind.is_float() {
        RegisterCategory::Float
    } else {
        RegisterCategory::General
    }
}

// =============================================================================
// Variables and Stack Slots
// =============================================================================

/// A virtual register awaiting allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    pub index: u32,
    pub kind: ValueKind,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}|{}", self.index, self.kind)
    }
}

/// A slot at a fixed byte offset from the stack pointer after the prologue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub offset: i32,
    pub kind: ValueKind,
}

/// Stack memory whose offset the frame map decides later: spill slots and
/// `Alloca` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualStackSlot {
    pub id: u32,
    /// Size in bytes; a multiple of the word size.
    pub size: u32,
    pub kind: ValueKind,
}

// =============================================================================
// Addresses
// =============================================================================

/// Base of a composite address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressBase {
    Variable(Variable),
    Register(Register),
}

impl AddressBase {
    /// The base as a standalone word value.
    pub fn as_value(self) -> Value {
        match self {
            AddressBase::Variable(v) => Value::Variable(v),
            AddressBase::Register(r) => Value::Register(r, ValueKind::Long),
        }
    }
}

/// `[base + displacement]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressValue {
    pub base: AddressBase,
    pub displacement: i32,
}

impl AddressValue {
    pub fn new(base: AddressBase, displacement: i32) -> Self {
        AddressValue { base, displacement }
    }

    /// Register holding the base, once allocated.
    pub fn base_register(&self) -> Option<Register> {
        match self.base {
            AddressBase::Register(r) => Some(r),
            AddressBase::Variable(_) => None,
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// Location of an LIR operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// No value; only where the operand's flags allow `ILLEGAL`.
    Illegal,
    Variable(Variable),
    Register(Register, ValueKind),
    StackSlot(StackSlot),
    VirtualStack(VirtualStackSlot),
    Constant(Constant),
    Address(AddressValue),
}

impl Value {
    pub const ILLEGAL: Value = Value::Illegal;

    /// Kind of the value; addresses are words.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Illegal => ValueKind::Void,
            Value::Variable(v) => v.kind,
            Value::Register(_, kind) => *kind,
            Value::StackSlot(s) => s.kind,
            Value::VirtualStack(s) => s.kind,
            Value::Constant(c) => c.kind(),
            Value::Address(_) => ValueKind::Long,
        }
    }

    #[inline]
    pub fn is_illegal(&self) -> bool {
        matches!(self, Value::Illegal)
    }

    #[inline]
    pub fn is_variable(&self) -> bool {
        matches!(self, Value::Variable(_))
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        matches!(self, Value::Register(..))
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self, Value::Constant(_))
    }

    /// Stack slot, allocated or virtual.
    #[inline]
    pub fn is_stack(&self) -> bool {
        matches!(self, Value::StackSlot(_) | Value::VirtualStack(_))
    }

    /// Values that can be a move destination.
    #[inline]
    pub fn is_allocatable(&self) -> bool {
        matches!(
            self,
            Value::Variable(_) | Value::Register(..) | Value::StackSlot(_) | Value::VirtualStack(_)
        )
    }

    #[inline]
    pub fn as_register(&self) -> Option<Register> {
        match self {
            Value::Register(r, _) => Some(*r),
            _ => None,
        }
    }

    #[inline]
    pub fn as_variable(&self) -> Option<Variable> {
        match self {
            Value::Variable(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_constant(&self) -> Option<Constant> {
        match self {
            Value::Constant(c) => Some(*c),
            _ => None,
        }
    }

    #[inline]
    pub fn as_stack_slot(&self) -> Option<StackSlot> {
        match self {
            Value::StackSlot(s) => Some(*s),
            _ => None,
        }
    }

    /// Same location with a different kind. Constants and addresses are
    /// returned unchanged.
    pub fn with_kind(self, kind: ValueKind) -> Value {
        match self {
            Value::Variable(v) => Value::Variable(Variable { kind, ..v }),
            Value::Register(r, _) => Value::Register(r, kind),
            Value::StackSlot(s) => Value::StackSlot(StackSlot { kind, ..s }),
            Value::VirtualStack(s) => Value::VirtualStack(VirtualStackSlot { kind, ..s }),
            other => other,
        }
    }
}

impl From<Variable> for Value {
    fn from(v: Variable) -> Self {
        Value::Variable(v)
    }
}

impl From<Constant> for Value {
    fn from(c: Constant) -> Self {
        Value::Constant(c)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Illegal => f.write_str("-"),
            Value::Variable(v) => write!(f, "{v}"),
            Value::Register(r, kind) => write!(f, "{r}|{kind}"),
            Value::StackSlot(s) => write!(f, "stack:{}|{}", s.offset, s.kind),
            Value::VirtualStack(s) => write!(f, "vstack:{}[{}]", s.id, s.size),
            Value::Constant(c) => write!(f, "{c}"),
            Value::Address(a) => write!(f, "[{} + {}]", a.base.as_value(), a.displacement),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_classes() {
        let v = Value::Variable(Variable {
            index: 3,
            kind: ValueKind::Int,
        });
        assert!(v.is_variable() && v.is_allocatable());
        assert_eq!(v.kind(), ValueKind::Int);
        assert!(Value::Constant(Constant::Int(1)).is_constant());
        assert!(!Value::Constant(Constant::Int(1)).is_allocatable());
        let slot = Value::StackSlot(StackSlot {
            offset: 8,
            kind: ValueKind::Long,
        });
        assert!(slot.is_stack());
        assert_eq!(slot.with_kind(ValueKind::Object).kind(), ValueKind::Object);
    }

    #[test]
    fn test_register_category_follows_kind() {
        assert_eq!(category_of(ValueKind::Double), RegisterCategory::Float);
        assert_eq!(category_of(ValueKind::Object), RegisterCategory::General);
        assert_eq!(format!("{:?}", Register::float(2)), "f2");
    }
}
