//! LIR verification.
//!
//! Checks block structure and that every operand's value class is allowed
//! by its flags. Violations are [`KilnError::IllegalLir`] naming the
//! offending instruction.

use super::instruction::{float_compare_kind, LirInstruction, LirOp, OperandMode};
use super::value::{AddressBase, Value};
use super::Lir;
use crate::ir::cfg::BlockId;
use kiln_core::{KilnError, KilnResult};

/// Verify structure and operand flags of `lir`.
pub fn verify_lir(lir: &Lir) -> KilnResult<()> {
    for block in lir.blocks() {
        match block.instructions.first() {
            Some(LirInstruction {
                op: LirOp::Label(id), ..
            }) if *id == block.id => {}
            _ => {
                return Err(KilnError::illegal_lir(
                    "label",
                    format!("block {} does not start with its label", block.id),
                ))
            }
        }
        let last = block.instructions.len() - 1;
        for (i, inst) in block.instructions.iter().enumerate() {
            if inst.op.is_block_end() != (i == last) {
                return Err(KilnError::illegal_lir(
                    inst.name(),
                    format!("block {} has a misplaced block end at {i}", block.id),
                ));
            }
            verify_instruction(lir, inst)?;
        }
    }
    log::trace!("lir verified: {} instructions", lir.instruction_count());
    Ok(())
}

/// Additionally check that no variables or virtual slots survived register
/// allocation and frame layout.
pub fn verify_allocated(lir: &Lir) -> KilnResult<()> {
    verify_lir(lir)?;
    for inst in lir.instructions() {
        for operand in &inst.operands {
            let unresolved = match operand.value {
                Value::Variable(_) | Value::VirtualStack(_) => true,
                Value::Address(address) => matches!(address.base, AddressBase::Variable(_)),
                _ => false,
            };
            if unresolved {
                return Err(KilnError::illegal_lir(
                    inst.name(),
                    format!("{} left unallocated in `{inst}`", operand.value),
                ));
            }
        }
    }
    Ok(())
}

fn verify_instruction(lir: &Lir, inst: &LirInstruction) -> KilnResult<()> {
    for operand in &inst.operands {
        if !operand.flags.allows(&operand.value) {
            return Err(KilnError::illegal_lir(
                inst.name(),
                format!("{} not allowed by {:?} in `{inst}`", operand.value, operand.flags),
            ));
        }
        if operand.mode == OperandMode::Def && !operand.value.is_illegal() && !operand.value.is_allocatable() {
            return Err(KilnError::illegal_lir(
                inst.name(),
                format!("cannot define {} in `{inst}`", operand.value),
            ));
        }
    }
    let target_exists = |id: &BlockId| -> KilnResult<()> {
        if lir.block(*id).is_none() {
            return Err(KilnError::illegal_lir(inst.name(), format!("jump to missing block {id}")));
        }
        Ok(())
    };
    match &inst.op {
        LirOp::Jump(target) => target_exists(target)?,
        LirOp::Branch {
            true_target,
            false_target,
            ..
        }
        | LirOp::FloatBranch {
            true_target,
            false_target,
            ..
        } => {
            target_exists(true_target)?;
            target_exists(false_target)?;
        }
        LirOp::FloatCompare => {
            if float_compare_kind(inst).is_none() {
                return Err(KilnError::illegal_lir(
                    "fcmp",
                    format!("operands must share a float kind in `{inst}`"),
                ));
            }
        }
        LirOp::Deoptimize(_) | LirOp::NullCheck if inst.state.is_none() => {
            return Err(KilnError::illegal_lir(inst.name(), "missing frame state"));
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;
    use crate::lir::instruction::{Operand, OperandFlags};
    use crate::lir::value::{StackSlot, Variable};
    use crate::lir::LirBlock;
    use kiln_core::{Constant, ValueKind};

    fn single_block(body: Vec<LirInstruction>) -> Lir {
        let mut lir = Lir::new(Target::Amd64);
        let id = BlockId::new(0);
        let mut block = LirBlock::new(id);
        block.instructions.push(LirInstruction::label(id));
        block.instructions.extend(body);
        block.instructions.push(LirInstruction::ret(Value::Illegal));
        lir.add_block(block).unwrap();
        lir
    }

    #[test]
    fn test_constant_in_register_slot_rejected() {
        let dst = Value::Variable(Variable {
            index: 0,
            kind: ValueKind::Int,
        });
        let bad = LirInstruction::new(
            LirOp::Convert(crate::lir::ConvertOp::Narrow { bits: 8 }),
            &[
                Operand::def(dst, OperandFlags::REG),
                Operand::use_(Value::Constant(Constant::Int(3)), OperandFlags::REG),
            ],
        );
        let err = verify_lir(&single_block(vec![bad])).unwrap_err();
        assert!(matches!(err, KilnError::IllegalLir { instruction: "convert", .. }));
    }

    #[test]
    fn test_float_compare_kinds_must_match() {
        let f = Value::Variable(Variable {
            index: 0,
            kind: ValueKind::Float,
        });
        let d = Value::Variable(Variable {
            index: 1,
            kind: ValueKind::Double,
        });
        let fcmp = LirInstruction::new(
            LirOp::FloatCompare,
            &[Operand::use_(f, OperandFlags::REG), Operand::use_(d, OperandFlags::REG)],
        );
        assert!(verify_lir(&single_block(vec![fcmp])).is_err());
    }

    #[test]
    fn test_stack_def_needs_stack_flag() {
        let slot = Value::StackSlot(StackSlot {
            offset: 0,
            kind: ValueKind::Long,
        });
        let load = LirInstruction::new(
            LirOp::LoadConstantTableBase,
            &[Operand::def(slot, OperandFlags::REG)],
        );
        assert!(verify_lir(&single_block(vec![load])).is_err());
        assert!(verify_lir(&single_block(vec![])).is_ok());
    }

    #[test]
    fn test_unallocated_variable_detected() {
        let v = Value::Variable(Variable {
            index: 0,
            kind: ValueKind::Int,
        });
        let lir = single_block(vec![LirInstruction::new(
            LirOp::LoadConstant(Constant::Int(1)),
            &[Operand::def(v, OperandFlags::REG)],
        )]);
        assert!(verify_lir(&lir).is_ok());
        assert!(verify_allocated(&lir).is_err());
    }
}
