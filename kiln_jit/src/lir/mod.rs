//! Low-level IR.
//!
//! LIR is a list of blocks in code order, each a flat list of
//! [`LirInstruction`]s over [`Value`]s. It is built from a low-tier graph by
//! [`NodeLirBuilder`], checked by [`verify_lir`], rewritten in place by the
//! register allocator and finally turned into machine code by a target
//! emitter. Nothing mutates an instruction after allocation.
//!
//! Block labels reuse the [`BlockId`]s of the CFG the LIR was built from.

pub mod array_equals;
pub mod frame;
pub mod gen;
pub mod instruction;
pub mod moves;
pub mod value;
pub mod verify;

pub use array_equals::{ArrayEqualsOp, ArrayEqualsTier};
pub use frame::FrameMap;
pub use gen::{foreign_call, LirGeneratorTool, NodeLirBuilder};
pub use instruction::{
    ConvertOp, LirFrameState, LirInstruction, LirOp, Operand, OperandFlags, OperandMode, UnaryOp,
};
pub use moves::MoveFactory;
pub use value::{
    AddressBase, AddressValue, Register, RegisterCategory, StackSlot, Value, Variable, VirtualStackSlot,
};
pub use verify::{verify_allocated, verify_lir};

use crate::backend::Target;
use crate::ir::cfg::BlockId;
use kiln_core::{KilnError, KilnResult, ValueKind};
use rustc_hash::FxHashMap;
use std::fmt;

/// Stack words are eight bytes on every supported target.
pub const WORD_SIZE: u32 = 8;

// =============================================================================
// Block
// =============================================================================

/// Instructions of one basic block, `Label` first and a block end last.
#[derive(Debug, Clone)]
pub struct LirBlock {
    pub id: BlockId,
    pub instructions: Vec<LirInstruction>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    pub loop_depth: u32,
}

impl LirBlock {
    pub fn new(id: BlockId) -> Self {
        LirBlock {
            id,
            instructions: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            loop_depth: 0,
        }
    }
}

// =============================================================================
// LIR
// =============================================================================

/// LIR of one compilation unit.
#[derive(Debug, Clone)]
pub struct Lir {
    target: Target,
    blocks: Vec<LirBlock>,
    index: FxHashMap<BlockId, usize>,
    next_variable: u32,
    stack_slots: Vec<VirtualStackSlot>,
    /// Incoming parameters.
    pub parameter_count: u32,
    /// Largest argument count of any call, including deopt calls.
    pub max_call_arguments: u32,
}

impl Lir {
    pub fn new(target: Target) -> Self {
        Lir {
            target,
            blocks: Vec::new(),
            index: FxHashMap::default(),
            next_variable: 0,
            stack_slots: Vec::new(),
            parameter_count: 0,
            max_call_arguments: 0,
        }
    }

    #[inline]
    pub fn target(&self) -> Target {
        self.target
    }

    /// Append a block in code order.
    pub fn add_block(&mut self, block: LirBlock) -> KilnResult<()> {
        if self.index.contains_key(&block.id) {
            return Err(KilnError::internal(format!("block {} added twice", block.id)));
        }
        self.index.insert(block.id, self.blocks.len());
        self.blocks.push(block);
        Ok(())
    }

    /// Blocks in code order.
    #[inline]
    pub fn blocks(&self) -> &[LirBlock] {
        &self.blocks
    }

    #[inline]
    pub fn blocks_mut(&mut self) -> &mut [LirBlock] {
        &mut self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&LirBlock> {
        self.index.get(&id).map(|&i| &self.blocks[i])
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut LirBlock> {
        match self.index.get(&id) {
            Some(&i) => Some(&mut self.blocks[i]),
            None => None,
        }
    }

    /// Position of `id` in code order.
    pub fn code_index(&self, id: BlockId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// A fresh variable.
    pub fn new_variable(&mut self, kind: ValueKind) -> Variable {
        let v = Variable {
            index: self.next_variable,
            kind,
        };
        self.next_variable += 1;
        v
    }

    #[inline]
    pub fn variable_count(&self) -> u32 {
        self.next_variable
    }

    /// Reserve `size` bytes of frame memory, rounded up to whole words.
    pub fn new_stack_slot(&mut self, size: u32, kind: ValueKind) -> VirtualStackSlot {
        let size = size.max(1).div_ceil(WORD_SIZE) * WORD_SIZE;
        let slot = VirtualStackSlot {
            id: self.stack_slots.len() as u32,
            size,
            kind,
        };
        self.stack_slots.push(slot);
        slot
    }

    #[inline]
    pub fn stack_slots(&self) -> &[VirtualStackSlot] {
        &self.stack_slots
    }

    /// Total instruction count.
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    /// Every instruction in code order.
    pub fn instructions(&self) -> impl Iterator<Item = &LirInstruction> + '_ {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    /// Block after `id` in code order.
    pub fn next_in_code_order(&self, id: BlockId) -> Option<BlockId> {
        self.code_index(id).and_then(|i| self.blocks.get(i + 1)).map(|b| b.id)
    }
}

impl fmt::Display for Lir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            for inst in &block.instructions {
                if matches!(inst.op, LirOp::Label(_)) {
                    writeln!(f, "{inst}")?;
                } else {
                    writeln!(f, "    {inst}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_slots_round_to_words() {
        let mut lir = Lir::new(Target::Amd64);
        let a = lir.new_stack_slot(12, ValueKind::Long);
        let b = lir.new_stack_slot(8, ValueKind::Long);
        assert_eq!(a.size, 16);
        assert_eq!(b.id, 1);
        assert_eq!(lir.stack_slots().len(), 2);
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let mut lir = Lir::new(Target::Amd64);
        lir.add_block(LirBlock::new(BlockId::new(0))).unwrap();
        assert!(lir.add_block(LirBlock::new(BlockId::new(0))).is_err());
        assert_eq!(lir.next_in_code_order(BlockId::new(0)), None);
    }
}
