//! SPARC instruction selection hooks.
//!
//! Three things differ from the other targets: the constant table base is
//! computed once in the entry block, float branches are a separate compare
//! and branch on `%fcc0`, and calls into C code restore the thread register
//! and clear the frame anchor afterwards.

use super::moves::SparcMoveFactory;
use super::registers::{CONSTANT_TABLE_BASE, THREAD};
use crate::backend::Target;
use crate::ir::cfg::BlockId;
use crate::ir::kinds::CompareOp;
use crate::lir::value::{Register, Value};
use crate::lir::{
    foreign_call, LirFrameState, LirGeneratorTool, LirInstruction, LirOp, MoveFactory, NodeLirBuilder, Operand,
    OperandFlags,
};
use crate::stubs::ForeignCallDescriptor;
use kiln_core::{KilnResult, ValueKind};
use std::sync::Arc;

/// Suffix of runtime entry points that run as C code.
const C_CALL_SUFFIX: &str = ":C";

/// Instruction selection for SPARC V9.
#[derive(Debug, Clone, Default)]
pub struct SparcLirGenerator {
    moves: SparcMoveFactory,
}

impl LirGeneratorTool for SparcLirGenerator {
    fn target(&self) -> Target {
        Target::Sparc
    }

    fn move_factory(&self) -> &dyn MoveFactory {
        &self.moves
    }

    fn thread_register(&self) -> Register {
        THREAD.reg()
    }

    fn stack_pointer(&self) -> Register {
        super::registers::SReg::SP.reg()
    }

    fn emit_prologue(&self, gen: &mut NodeLirBuilder<'_>) -> KilnResult<()> {
        gen.append(LirInstruction::new(
            LirOp::LoadConstantTableBase,
            &[Operand::def(CONSTANT_TABLE_BASE.reg().as_value(ValueKind::Long), OperandFlags::REG)],
        ));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_float_branch(
        &self,
        gen: &mut NodeLirBuilder<'_>,
        op: CompareOp,
        x: Value,
        y: Value,
        true_target: BlockId,
        false_target: BlockId,
        probability: f64,
    ) -> KilnResult<()> {
        gen.append(LirInstruction::new(
            LirOp::FloatCompare,
            &[Operand::use_(x, OperandFlags::REG), Operand::use_(y, OperandFlags::REG)],
        ));
        gen.append(LirInstruction::new(
            LirOp::FloatBranch {
                op,
                true_target,
                false_target,
                probability,
            },
            &[],
        ));
        Ok(())
    }

    fn emit_foreign_call(
        &self,
        gen: &mut NodeLirBuilder<'_>,
        descriptor: &Arc<ForeignCallDescriptor>,
        args: &[Value],
        result: Value,
        state: LirFrameState,
    ) -> KilnResult<()> {
        if !descriptor.name().ends_with(C_CALL_SUFFIX) {
            gen.append(foreign_call(descriptor, args, result, state));
            return Ok(());
        }
        let saved = Value::Variable(gen.new_variable(ValueKind::Long));
        gen.emit_move(saved, THREAD.reg().as_value(ValueKind::Long))?;
        gen.append(foreign_call(descriptor, args, result, state));
        gen.append(LirInstruction::new(
            LirOp::RuntimeCallEpilogue,
            &[Operand::use_(saved, OperandFlags::REG | OperandFlags::STACK)],
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::CompilerOptions;

    #[test]
    fn test_no_inline_array_equals() {
        let g = SparcLirGenerator::default();
        assert!(g.array_equals_op(ValueKind::Int, &CompilerOptions::default()).is_none());
        assert_eq!(g.thread_register(), Register::general(2));
        assert!(g.move_factory().constant_table_base().is_register());
    }
}
