//! AArch64 instruction selection hooks.

use super::moves::AArch64MoveFactory;
use super::registers::THREAD;
use crate::backend::Target;
use crate::ir::kinds::BinaryOp;
use crate::lir::value::Register;
use crate::lir::{LirGeneratorTool, MoveFactory};
use kiln_core::Constant;

/// Instruction selection for ARMv8-A.
///
/// Array equality is not inlined; it calls the runtime routine.
#[derive(Debug, Clone, Default)]
pub struct AArch64LirGenerator {
    moves: AArch64MoveFactory,
}

impl LirGeneratorTool for AArch64LirGenerator {
    fn target(&self) -> Target {
        Target::AArch64
    }

    fn move_factory(&self) -> &dyn MoveFactory {
        &self.moves
    }

    fn thread_register(&self) -> Register {
        THREAD.reg()
    }

    /// Encoding 31 addresses `sp` in address operands.
    fn stack_pointer(&self) -> Register {
        Register::general(31)
    }

    /// Logical immediates use a bitmask encoding, so only add, subtract and
    /// shifts take constants.
    fn can_inline_binary(&self, op: BinaryOp, constant: &Constant) -> bool {
        match op {
            BinaryOp::Add | BinaryOp::Sub => self.moves.can_inline_constant(constant),
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => constant.as_integer().is_some(),
            BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => false,
        }
    }
}
