//! Move construction.
//!
//! Every data transfer the instruction selector or the register allocator
//! creates goes through a target's [`MoveFactory`], which knows which
//! constants fit an instruction encoding and which memory-to-memory
//! transfers the target can do directly.

use super::instruction::{LirInstruction, LirOp, Operand, OperandFlags};
use super::value::{Register, Value};
use kiln_core::{Constant, KilnError, KilnResult};

/// Creates moves, constant loads and stack-to-stack transfers for one
/// target.
pub trait MoveFactory: Send + Sync {
    /// Whether `constant` can be an immediate operand. Decided once, when
    /// the instruction is built.
    fn can_inline_constant(&self, constant: &Constant) -> bool;

    /// Whether `constant` can be stored to a stack slot without going
    /// through a register.
    fn allow_constant_to_stack_move(&self, constant: &Constant) -> bool;

    /// Register holding the constant table base, or illegal when table
    /// loads are PC-relative.
    fn constant_table_base(&self) -> Value {
        Value::Illegal
    }

    /// Load `constant` into `dst`.
    fn create_load(&self, dst: Value, constant: Constant) -> KilnResult<LirInstruction> {
        if dst.is_stack() {
            if !self.allow_constant_to_stack_move(&constant) {
                return Err(KilnError::illegal_lir(
                    "LoadConstant",
                    format!("constant {constant} cannot be stored to {dst} directly"),
                ));
            }
            return Ok(LirInstruction::new(
                LirOp::LoadConstant(constant),
                &[Operand::def(dst, OperandFlags::STACK)],
            ));
        }
        if !dst.is_allocatable() {
            return Err(KilnError::illegal_lir("LoadConstant", format!("cannot load into {dst}")));
        }
        if self.can_inline_constant(&constant) {
            Ok(LirInstruction::new(
                LirOp::LoadConstant(constant),
                &[Operand::def(dst, OperandFlags::REG | OperandFlags::STACK)],
            ))
        } else {
            Ok(LirInstruction::new(
                LirOp::LoadConstantFromTable(constant),
                &[
                    Operand::def(dst, OperandFlags::REG),
                    Operand::alive(self.constant_table_base(), OperandFlags::REG | OperandFlags::ILLEGAL),
                ],
            ))
        }
    }

    /// Transfer `src` into `dst`.
    fn create_move(&self, dst: Value, src: Value) -> KilnResult<LirInstruction> {
        match src {
            Value::Constant(constant) => return self.create_load(dst, constant),
            Value::Address(_) => {
                return Ok(LirInstruction::new(
                    LirOp::LoadAddress,
                    &[
                        Operand::def(dst, OperandFlags::REG),
                        Operand::use_(src, OperandFlags::COMPOSITE),
                    ],
                ))
            }
            _ => {}
        }
        if !dst.is_allocatable() || !src.is_allocatable() {
            return Err(KilnError::illegal_lir("Move", format!("cannot move {src} to {dst}")));
        }
        if dst.is_stack() && src.is_stack() {
            return Err(KilnError::illegal_lir(
                "Move",
                format!("stack-to-stack move {dst} <- {src} needs create_stack_move"),
            ));
        }
        Ok(LirInstruction::new(
            LirOp::Move,
            &[
                Operand::def(dst, OperandFlags::REG | OperandFlags::STACK | OperandFlags::HINT),
                Operand::use_(src, OperandFlags::REG | OperandFlags::STACK),
            ],
        ))
    }

    /// Transfer between two stack slots through `scratch`.
    fn create_stack_move(&self, dst: Value, src: Value, scratch: Register) -> KilnResult<LirInstruction> {
        if !dst.is_stack() || !src.is_stack() {
            return Err(KilnError::illegal_lir(
                "StackMove",
                format!("{dst} <- {src} is not a stack-to-stack transfer"),
            ));
        }
        Ok(LirInstruction::new(
            LirOp::StackMove,
            &[
                Operand::def(dst, OperandFlags::STACK),
                Operand::use_(src, OperandFlags::STACK),
                Operand::temp(scratch.as_value(src.kind()), OperandFlags::REG),
            ],
        ))
    }
}

/// Whether `value` fits a `bits`-wide signed immediate.
#[inline]
pub const fn is_simm(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    value >= min && value <= max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simm_ranges() {
        assert!(is_simm(4095, 13));
        assert!(!is_simm(4096, 13));
        assert!(is_simm(-4096, 13));
        assert!(!is_simm(-4097, 13));
        assert!(is_simm(i32::MIN as i64, 32));
        assert!(!is_simm(i32::MAX as i64 + 1, 32));
    }
}
