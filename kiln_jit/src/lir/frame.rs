//! Frame layout.
//!
//! Offsets are relative to the stack pointer after the prologue:
//!
//! ```text
//! +------------------------+ frame_size (16-byte aligned)
//! | spill slots, allocas   |
//! +------------------------+
//! | callee-saved registers |
//! +------------------------+
//! | argument staging words | 0
//! +------------------------+ sp
//! ```
//!
//! The staging area holds incoming arguments and outgoing call arguments
//! while they are shuffled between their allocated locations and the
//! calling convention registers.

use super::value::{Register, StackSlot, Value, VirtualStackSlot};
use super::{Lir, WORD_SIZE};
use kiln_core::{KilnError, KilnResult, ValueKind};
use rustc_hash::FxHashMap;

/// Final stack frame of one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct FrameMap {
    staging_words: u32,
    callee_saves: Vec<(Register, i32)>,
    slots: FxHashMap<u32, i32>,
    size: u32,
}

impl FrameMap {
    /// Lay out the frame for `lir`, saving `callee_saved` registers.
    pub fn build(lir: &Lir, callee_saved: &[Register]) -> Self {
        let staging_words = lir.parameter_count.max(lir.max_call_arguments);
        let mut offset = staging_words * WORD_SIZE;
        let mut callee_saves = Vec::with_capacity(callee_saved.len());
        for &reg in callee_saved {
            callee_saves.push((reg, offset as i32));
            offset += WORD_SIZE;
        }
        let mut slots = FxHashMap::default();
        for slot in lir.stack_slots() {
            slots.insert(slot.id, offset as i32);
            offset += slot.size;
        }
        let size = offset.div_ceil(16) * 16;
        log::trace!(
            "frame: {} staging words, {} callee saves, {} slots, {} bytes",
            staging_words,
            callee_saves.len(),
            slots.len(),
            size
        );
        FrameMap {
            staging_words,
            callee_saves,
            slots,
            size,
        }
    }

    /// Frame size in bytes, a multiple of 16.
    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn staging_words(&self) -> u32 {
        self.staging_words
    }

    /// Staging word `index` viewed as `kind`.
    pub fn staging_slot(&self, index: u32, kind: ValueKind) -> KilnResult<StackSlot> {
        if index >= self.staging_words {
            return Err(KilnError::emission(format!(
                "staging word {index} outside a {}-word area",
                self.staging_words
            )));
        }
        Ok(StackSlot {
            offset: (index * WORD_SIZE) as i32,
            kind,
        })
    }

    /// Registers saved in the prologue with their slot offsets.
    #[inline]
    pub fn callee_saves(&self) -> &[(Register, i32)] {
        &self.callee_saves
    }

    pub fn offset_of(&self, slot: &VirtualStackSlot) -> KilnResult<i32> {
        self.slots
            .get(&slot.id)
            .copied()
            .ok_or_else(|| KilnError::internal(format!("stack slot {} has no frame offset", slot.id)))
    }

    /// Replace every virtual stack slot operand in `lir` by its final slot.
    pub fn assign(&self, lir: &mut Lir) -> KilnResult<()> {
        for block in lir.blocks_mut() {
            for inst in &mut block.instructions {
                for operand in inst.operands.iter_mut() {
                    if let Value::VirtualStack(slot) = operand.value {
                        operand.value = Value::StackSlot(StackSlot {
                            offset: self.offset_of(&slot)?,
                            kind: slot.kind,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;

    #[test]
    fn test_layout_is_aligned_and_ordered() {
        let mut lir = Lir::new(Target::Amd64);
        lir.parameter_count = 3;
        let a = lir.new_stack_slot(8, ValueKind::Long);
        let b = lir.new_stack_slot(24, ValueKind::Long);
        let frame = FrameMap::build(&lir, &[Register::general(3)]);
        assert_eq!(frame.staging_words(), 3);
        assert_eq!(frame.callee_saves(), &[(Register::general(3), 24)]);
        assert_eq!(frame.offset_of(&a).unwrap(), 32);
        assert_eq!(frame.offset_of(&b).unwrap(), 40);
        assert_eq!(frame.frame_size(), 64);
        assert!(frame.staging_slot(3, ValueKind::Long).is_err());
    }
}
