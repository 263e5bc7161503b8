//! Operand rewriting.
//!
//! Replaces every variable with its allocated register or frame slot.
//! Operands that must be in a register but whose variable was spilled are
//! loaded into a scratch register before the instruction and, for results,
//! stored back after it. A result may reuse the scratch of a `Use` input,
//! never that of an `Alive` one.
//!
//! Moves are rebuilt through the target's [`MoveFactory`]: moves between
//! two slots become stack moves, moves whose ends coincide are dropped and
//! constant loads into a slot go through a scratch register when the
//! target cannot store the constant directly.

use super::interval::SCRATCH_PER_CATEGORY;
use super::{Allocation, AllocationMap, AllocatorStats, RegisterConfig};
use crate::lir::instruction::{LirInstruction, LirOp, OperandMode};
use crate::lir::value::{category_of, AddressBase, AddressValue, Register, Value, Variable, VirtualStackSlot};
use crate::lir::{Lir, MoveFactory};
use kiln_core::{KilnError, KilnResult};
use smallvec::SmallVec;

/// Scratch registers handed out for one instruction.
#[derive(Default)]
struct ScratchState {
    /// Variables loaded for inputs, with their scratch and mode.
    inputs: SmallVec<[(Variable, Register, OperandMode); 4]>,
    /// Scratch used by results.
    defs: SmallVec<[(Variable, Register); 2]>,
}

impl ScratchState {
    fn input_scratch(&self, variable: Variable) -> Option<Register> {
        self.inputs.iter().find(|(v, _, _)| *v == variable).map(|(_, r, _)| *r)
    }

    fn def_scratch(&self, variable: Variable) -> Option<Register> {
        self.defs.iter().find(|(v, _)| *v == variable).map(|(_, r)| *r)
    }

    fn take_input(&mut self, config: &RegisterConfig, variable: Variable, mode: OperandMode) -> KilnResult<Register> {
        if let Some(r) = self.input_scratch(variable) {
            return Ok(r);
        }
        let category = category_of(variable.kind);
        let used = self
            .inputs
            .iter()
            .filter(|(v, _, _)| category_of(v.kind) == category)
            .count();
        if used >= SCRATCH_PER_CATEGORY {
            return Err(KilnError::internal(format!("out of scratch registers loading {variable}")));
        }
        let register = config.scratch(category)[used];
        self.inputs.push((variable, register, mode));
        Ok(register)
    }

    fn take_def(&mut self, config: &RegisterConfig, variable: Variable) -> KilnResult<Register> {
        if let Some(r) = self.def_scratch(variable) {
            return Ok(r);
        }
        let category = category_of(variable.kind);
        let free = config.scratch(category).into_iter().find(|r| {
            let held_by_alive = self
                .inputs
                .iter()
                .any(|(_, s, mode)| s == r && *mode == OperandMode::Alive);
            let held_by_def = self.defs.iter().any(|(_, s)| s == r);
            !held_by_alive && !held_by_def
        });
        let register =
            free.ok_or_else(|| KilnError::internal(format!("out of scratch registers storing {variable}")))?;
        self.defs.push((variable, register));
        Ok(register)
    }
}

/// Location of `variable` after allocation.
fn location(map: &AllocationMap, variable: Variable) -> KilnResult<Value> {
    match map.get(variable) {
        Allocation::Register(r) => Ok(r.as_value(variable.kind)),
        Allocation::Spill(slot) => Ok(Value::VirtualStack(VirtualStackSlot {
            kind: variable.kind,
            ..slot
        })),
        Allocation::Unassigned => Err(KilnError::internal(format!("{variable} was never allocated"))),
    }
}

fn resolve(value: Value, map: &AllocationMap) -> KilnResult<Value> {
    match value {
        Value::Variable(v) => location(map, v),
        other => Ok(other),
    }
}

/// Rewrite every instruction of `lir` to use allocated locations.
pub(crate) fn rewrite(
    lir: &mut Lir,
    map: &AllocationMap,
    config: &RegisterConfig,
    moves: &dyn MoveFactory,
    stats: &mut AllocatorStats,
) -> KilnResult<()> {
    for block in lir.blocks_mut() {
        let old = std::mem::take(&mut block.instructions);
        let mut out = Vec::with_capacity(old.len());
        for inst in old {
            rewrite_instruction(inst, map, config, moves, stats, &mut out)?;
        }
        block.instructions = out;
    }
    Ok(())
}

fn rewrite_instruction(
    mut inst: LirInstruction,
    map: &AllocationMap,
    config: &RegisterConfig,
    moves: &dyn MoveFactory,
    stats: &mut AllocatorStats,
    out: &mut Vec<LirInstruction>,
) -> KilnResult<()> {
    match inst.op {
        LirOp::Move => {
            let dst = resolve(inst.value(0), map)?;
            let src = resolve(inst.value(1), map)?;
            if dst == src || (dst.is_register() && dst.as_register() == src.as_register()) {
                return Ok(());
            }
            if dst.is_stack() && src.is_stack() {
                stats.num_stack_moves += 1;
                out.push(moves.create_stack_move(dst, src, config.scratch_general[0])?);
            } else {
                out.push(moves.create_move(dst, src)?);
            }
            return Ok(());
        }
        LirOp::LoadConstant(constant) => {
            let dst = resolve(inst.value(0), map)?;
            if dst.is_stack() && !moves.allow_constant_to_stack_move(&constant) {
                let scratch = config.scratch(category_of(dst.kind()))[0].as_value(dst.kind());
                out.push(moves.create_load(scratch, constant)?);
                out.push(moves.create_move(dst, scratch)?);
                stats.num_spill_moves += 1;
            } else {
                out.push(moves.create_load(dst, constant)?);
            }
            return Ok(());
        }
        _ => {}
    }

    let mut scratch = ScratchState::default();
    let mut before: SmallVec<[LirInstruction; 2]> = SmallVec::new();
    let mut after: SmallVec<[LirInstruction; 2]> = SmallVec::new();

    // Inputs first so results know which scratch registers stay busy.
    for pass_inputs in [true, false] {
        for operand in inst.operands.iter_mut() {
            if operand.mode.is_input() != pass_inputs {
                continue;
            }
            match operand.value {
                Value::Variable(variable) => {
                    let home = location(map, variable)?;
                    if home.is_register() || (home.is_stack() && operand.flags.allows(&home)) {
                        operand.value = home;
                        continue;
                    }
                    match operand.mode {
                        OperandMode::Temp => {
                            return Err(KilnError::internal(format!(
                                "temporary {variable} of `{}` was spilled",
                                inst.op.name()
                            )));
                        }
                        OperandMode::Use | OperandMode::Alive => {
                            let had = scratch.input_scratch(variable).is_some();
                            let r = scratch.take_input(config, variable, operand.mode)?;
                            if !had {
                                before.push(moves.create_move(r.as_value(variable.kind), home)?);
                            }
                            operand.value = r.as_value(variable.kind);
                        }
                        OperandMode::Def => {
                            let had = scratch.def_scratch(variable).is_some();
                            let r = scratch.take_def(config, variable)?;
                            if !had {
                                after.push(moves.create_move(home, r.as_value(variable.kind))?);
                            }
                            operand.value = r.as_value(variable.kind);
                        }
                    }
                }
                Value::Address(address) if pass_inputs => {
                    let AddressBase::Variable(base) = address.base else {
                        continue;
                    };
                    let home = location(map, base)?;
                    let register = match home.as_register() {
                        Some(r) => r,
                        None => {
                            let had = scratch.input_scratch(base).is_some();
                            let r = scratch.take_input(config, base, OperandMode::Use)?;
                            if !had {
                                before.push(moves.create_move(r.as_value(base.kind), home)?);
                            }
                            r
                        }
                    };
                    operand.value = Value::Address(AddressValue::new(
                        AddressBase::Register(register),
                        address.displacement,
                    ));
                }
                _ => {}
            }
        }
    }

    stats.num_spill_moves += before.len() + after.len();
    out.extend(before);
    out.push(inst);
    out.extend(after);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::amd64::Amd64MoveFactory;
    use crate::backend::Target;
    use crate::ir::cfg::BlockId;
    use crate::ir::kinds::BinaryOp;
    use crate::lir::instruction::{Operand, OperandFlags};
    use crate::lir::LirBlock;
    use kiln_core::{Constant, ValueKind};

    fn config() -> RegisterConfig {
        RegisterConfig {
            allocatable: vec![Register::general(0), Register::general(1)],
            callee_saved: vec![],
            scratch_general: [Register::general(10), Register::general(11)],
            scratch_float: [Register::float(14), Register::float(15)],
        }
    }

    fn var(index: u32) -> Variable {
        Variable {
            index,
            kind: ValueKind::Long,
        }
    }

    fn one_block(body: Vec<LirInstruction>) -> Lir {
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
    fn test_spilled_binary_uses_scratch_registers() {
        let mut lir = one_block(vec![LirInstruction::binary(
            BinaryOp::Add,
            64,
            Value::Variable(var(2)),
            Value::Variable(var(0)),
            Value::Variable(var(1)),
        )]);
        let mut map = AllocationMap::new();
        for i in 0..3 {
            let slot = lir.new_stack_slot(8, ValueKind::Long);
            map.set(var(i), Allocation::Spill(slot));
        }
        let mut stats = AllocatorStats::default();
        rewrite(&mut lir, &map, &config(), &Amd64MoveFactory, &mut stats).unwrap();

        let insts = &lir.blocks()[0].instructions;
        let names: Vec<&str> = insts.iter().map(|i| i.name()).collect();
        assert_eq!(names, ["label", "move", "move", "binary", "move", "return"]);
        let add = &insts[3];
        // x and the result share the first scratch; y keeps the second.
        assert_eq!(add.register(0), Some(Register::general(10)));
        assert_eq!(add.register(1), Some(Register::general(10)));
        assert_eq!(add.register(2), Some(Register::general(11)));
        assert_eq!(stats.num_spill_moves, 3);
    }

    #[test]
    fn test_stack_to_stack_move_and_identity_move() {
        let mut lir = one_block(vec![
            LirInstruction::new(
                LirOp::Move,
                &[
                    Operand::def(Value::Variable(var(0)), OperandFlags::REG | OperandFlags::STACK),
                    Operand::use_(Value::Variable(var(1)), OperandFlags::REG | OperandFlags::STACK),
                ],
            ),
            LirInstruction::new(
                LirOp::Move,
                &[
                    Operand::def(Value::Variable(var(2)), OperandFlags::REG | OperandFlags::STACK),
                    Operand::use_(Value::Variable(var(3)), OperandFlags::REG | OperandFlags::STACK),
                ],
            ),
        ]);
        let mut map = AllocationMap::new();
        map.set(var(0), Allocation::Spill(lir.new_stack_slot(8, ValueKind::Long)));
        map.set(var(1), Allocation::Spill(lir.new_stack_slot(8, ValueKind::Long)));
        map.set(var(2), Allocation::Register(Register::general(0)));
        map.set(var(3), Allocation::Register(Register::general(0)));
        let mut stats = AllocatorStats::default();
        rewrite(&mut lir, &map, &config(), &Amd64MoveFactory, &mut stats).unwrap();

        let names: Vec<&str> = lir.instructions().map(|i| i.name()).collect();
        assert_eq!(names, ["label", "stackmove", "return"]);
        assert_eq!(stats.num_stack_moves, 1);
    }

    #[test]
    fn test_wide_constant_to_slot_goes_through_scratch() {
        let mut lir = one_block(vec![LirInstruction::new(
            LirOp::LoadConstant(Constant::Long(0x1234_5678_9abc)),
            &[Operand::def(Value::Variable(var(0)), OperandFlags::REG | OperandFlags::STACK)],
        )]);
        let mut map = AllocationMap::new();
        map.set(var(0), Allocation::Spill(lir.new_stack_slot(8, ValueKind::Long)));
        let mut stats = AllocatorStats::default();
        rewrite(&mut lir, &map, &config(), &Amd64MoveFactory, &mut stats).unwrap();

        let insts = &lir.blocks()[0].instructions;
        assert_eq!(insts[1].register(0), Some(Register::general(10)));
        assert!(matches!(insts[2].op, LirOp::Move));
        assert!(insts[2].value(0).is_stack());
    }
}
