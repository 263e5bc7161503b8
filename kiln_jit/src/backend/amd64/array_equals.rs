//! AMD64 emission of the tiered array compare.
//!
//! Register use, after `result = length << log2(element size)`:
//!
//! | Register | Holds                                   |
//! |----------|-----------------------------------------|
//! | result   | bytes still to compare, then 0 or 1     |
//! | t1, t2   | scalar chunks                           |
//! | t3       | byte position from the array bases      |
//! | t4       | end position of the current bulk loop   |
//! | v1, v2   | vector chunks, NaN re-check             |

use super::emitter::Amd64Emitter;
use super::encoder::{AluOp, Condition, Mem, ShiftOp};
use super::registers::{Gpr, Xmm};
use crate::emit::Label;
use crate::lir::array_equals::{ArrayEqualsOp, ArrayEqualsTier, WORD_BYTES};
use crate::lir::instruction::LirInstruction;
use kiln_core::{KilnError, KilnResult, ValueKind};

struct Operands {
    result: Gpr,
    array1: Gpr,
    array2: Gpr,
    t1: Gpr,
    t2: Gpr,
    position: Gpr,
    end: Gpr,
    vectors: Option<(Xmm, Xmm)>,
}

struct Exits {
    equal: Label,
    unequal: Label,
}

impl Amd64Emitter<'_> {
    pub(super) fn array_equals(&mut self, inst: &LirInstruction, op: ArrayEqualsOp) -> KilnResult<()> {
        let vectors = if inst.value(8).is_illegal() {
            None
        } else {
            Some((self.xmm(inst.value(8))?, self.xmm(inst.value(9))?))
        };
        let regs = Operands {
            result: self.gpr(inst.value(0))?,
            array1: self.gpr(inst.value(1))?,
            array2: self.gpr(inst.value(2))?,
            t1: self.gpr(inst.value(4))?,
            t2: self.gpr(inst.value(5))?,
            position: self.gpr(inst.value(6))?,
            end: self.gpr(inst.value(7))?,
            vectors,
        };
        let length = self.gpr(inst.value(3))?;
        if (op.tier.vector_bytes().is_some() || op.needs_nan_check()) && regs.vectors.is_none() {
            return Err(KilnError::emission(format!("{op} needs vector temporaries")));
        }

        let exits = Exits {
            equal: self.asm.buffer().new_label(),
            unequal: self.asm.buffer().new_label(),
        };
        let done = self.asm.buffer().new_label();

        self.asm.mov_rr(false, regs.result, length);
        let shift = op.kind.log2_size();
        if shift > 0 {
            self.asm.shift_ri(ShiftOp::Shl, true, regs.result, shift as u8);
        }
        self.asm.mov_ri32(regs.position, 0);

        if let Some(width) = op.tier.vector_bytes() {
            self.bulk_stage(&op, &regs, &exits, width)?;
        }
        self.bulk_stage(&op, &regs, &exits, WORD_BYTES)?;
        self.tail_stage(&op, &regs, &exits)?;
        self.asm.jmp(exits.equal);

        self.asm.buffer().bind(exits.unequal)?;
        self.asm.mov_ri32(regs.result, 0);
        self.asm.jmp(done);
        self.asm.buffer().bind(exits.equal)?;
        self.asm.mov_ri32(regs.result, 1);
        self.asm.buffer().bind(done)?;
        if op.tier == ArrayEqualsTier::Avx {
            self.asm.vzeroupper();
        }
        Ok(())
    }

    /// Compare `width`-byte chunks while a full chunk is left, then the last
    /// full chunk aligned to the end. Falls through only when there is no
    /// full chunk at all.
    fn bulk_stage(&mut self, op: &ArrayEqualsOp, regs: &Operands, exits: &Exits, width: usize) -> KilnResult<()> {
        let width = width as i32;
        let next = self.asm.buffer().new_label();
        let top = self.asm.buffer().new_label();

        self.asm.mov_rr(true, regs.end, regs.result);
        self.asm.alu_ri(AluOp::And, true, regs.end, !(width - 1));
        self.asm.alu_ri(AluOp::And, true, regs.result, width - 1);
        self.asm.test_rr(true, regs.end, regs.end);
        self.asm.jcc(Condition::Equal, next);
        self.asm.alu_rr(AluOp::Add, true, regs.end, regs.position);

        self.asm.buffer().bind(top)?;
        self.compare_chunk(op, regs, exits, width)?;
        self.asm.alu_ri(AluOp::Add, true, regs.position, width);
        self.asm.alu_rr(AluOp::Cmp, true, regs.position, regs.end);
        self.asm.jcc(Condition::NotEqual, top);

        self.asm.test_rr(true, regs.result, regs.result);
        self.asm.jcc(Condition::Equal, exits.equal);
        self.asm
            .lea(regs.position, Mem::base_index_disp(regs.end, regs.result, -width));
        self.compare_chunk(op, regs, exits, width)?;
        self.asm.jmp(exits.equal);

        self.asm.buffer().bind(next)?;
        Ok(())
    }

    /// Compare one chunk at the current position; jumps to the unequal exit
    /// on a mismatch.
    fn compare_chunk(&mut self, op: &ArrayEqualsOp, regs: &Operands, exits: &Exits, width: i32) -> KilnResult<()> {
        let at1 = Mem::base_index_disp(regs.array1, regs.position, 0);
        let at2 = Mem::base_index_disp(regs.array2, regs.position, 0);
        match (width, regs.vectors) {
            (32, Some((v1, v2))) => {
                self.asm.vmovdqu_load(v1, at1);
                self.asm.vmovdqu_load(v2, at2);
                self.asm.vpxor(v1, v1, v2);
                self.asm.vptest(v1, v1);
            }
            (16, Some((v1, v2))) => {
                self.asm.movdqu_load(v1, at1);
                self.asm.movdqu_load(v2, at2);
                self.asm.pxor(v1, v2);
                self.asm.ptest(v1, v1);
            }
            (8, _) => {
                self.asm.load(true, regs.t1, at1);
                self.asm.cmp_rm(true, regs.t1, at2);
            }
            _ => return Err(KilnError::emission(format!("no {width}-byte compare for {op}"))),
        }
        if !op.needs_nan_check() {
            self.asm.jcc(Condition::NotEqual, exits.unequal);
            return Ok(());
        }
        let matched = self.asm.buffer().new_label();
        self.asm.jcc(Condition::Equal, matched);
        self.recheck_elements(op, regs, exits, width)?;
        self.asm.buffer().bind(matched)?;
        Ok(())
    }

    /// Element-wise compare of a chunk where two NaNs are equal. Falls
    /// through when every element matches.
    fn recheck_elements(&mut self, op: &ArrayEqualsOp, regs: &Operands, exits: &Exits, width: i32) -> KilnResult<()> {
        let Some((v1, v2)) = regs.vectors else {
            return Err(KilnError::emission(format!("{op} needs vector temporaries")));
        };
        let size = op.element_bytes() as i32;
        let double = op.kind == ValueKind::Double;
        for offset in (0..width).step_by(size as usize) {
            let next = self.asm.buffer().new_label();
            self.asm
                .load(double, regs.t1, Mem::base_index_disp(regs.array1, regs.position, offset));
            self.asm
                .load(double, regs.t2, Mem::base_index_disp(regs.array2, regs.position, offset));
            self.asm.alu_rr(AluOp::Cmp, double, regs.t1, regs.t2);
            self.asm.jcc(Condition::Equal, next);
            for (v, t) in [(v1, regs.t1), (v2, regs.t2)] {
                self.asm.movq_to_xmm(v, t);
                // Only an unordered self-compare (NaN) sets PF.
                self.asm.ucomis(double, v, v);
                self.asm.jcc(Condition::NoParity, exits.unequal);
            }
            self.asm.buffer().bind(next)?;
        }
        Ok(())
    }

    /// Up to seven bytes left over from the word stage.
    fn tail_stage(&mut self, op: &ArrayEqualsOp, regs: &Operands, exits: &Exits) -> KilnResult<()> {
        let size = op.element_bytes();
        if size > 4 {
            return Ok(());
        }
        let at1 = Mem::base_index_disp(regs.array1, regs.position, 0);
        let at2 = Mem::base_index_disp(regs.array2, regs.position, 0);

        let skip4 = self.asm.buffer().new_label();
        self.asm.test_ri(false, regs.result, 4);
        self.asm.jcc(Condition::Equal, skip4);
        if op.kind == ValueKind::Float {
            self.recheck_elements(op, regs, exits, 4)?;
            self.asm.jmp(exits.equal);
        } else {
            self.asm.load(false, regs.t1, at1);
            self.asm.cmp_rm(false, regs.t1, at2);
            self.asm.jcc(Condition::NotEqual, exits.unequal);
            if size <= 2 {
                self.asm.alu_ri(AluOp::Add, true, regs.position, 4);
            }
        }
        self.asm.buffer().bind(skip4)?;

        if size <= 2 {
            let skip2 = self.asm.buffer().new_label();
            self.asm.test_ri(false, regs.result, 2);
            self.asm.jcc(Condition::Equal, skip2);
            self.asm.movzx16(false, regs.t1, at1.into());
            self.asm.movzx16(false, regs.t2, at2.into());
            self.asm.alu_rr(AluOp::Cmp, false, regs.t1, regs.t2);
            self.asm.jcc(Condition::NotEqual, exits.unequal);
            if size <= 1 {
                self.asm.alu_ri(AluOp::Add, true, regs.position, 2);
            }
            self.asm.buffer().bind(skip2)?;
        }

        if size <= 1 {
            self.asm.test_ri(false, regs.result, 1);
            self.asm.jcc(Condition::Equal, exits.equal);
            self.asm.movzx8(false, regs.t1, at1.into());
            self.asm.movzx8(false, regs.t2, at2.into());
            self.asm.alu_rr(AluOp::Cmp, false, regs.t1, regs.t2);
            self.asm.jcc(Condition::NotEqual, exits.unequal);
        }
        Ok(())
    }
}
