//! SPARC V9 instruction encoding.
//!
//! Every instruction is one big-endian word. Control transfers have a delay
//! slot; the helpers here always fill it with a `nop` unless the caller
//! supplies the slot instruction explicitly.

use super::registers::{FReg, SReg, TEMPS};
use crate::emit::{CodeBuffer, FixupKind, FixupTarget, Label};
use crate::lir::moves::is_simm;
use kiln_core::{KilnError, KilnResult};

// =============================================================================
// Conditions
// =============================================================================

/// Integer branch and move conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Condition {
    Never = 0,
    Equal = 1,
    LessEqual = 2,
    Less = 3,
    LessEqualUnsigned = 4,
    CarrySet = 5,
    Negative = 6,
    OverflowSet = 7,
    Always = 8,
    NotEqual = 9,
    Greater = 10,
    GreaterEqual = 11,
    GreaterUnsigned = 12,
    CarryClear = 13,
    Positive = 14,
    OverflowClear = 15,
}

impl Condition {
    #[inline]
    pub const fn encoding(self) -> u32 {
        self as u32
    }

    pub fn invert(self) -> Self {
        use Condition::*;
        match self {
            Never => Always,
            Equal => NotEqual,
            LessEqual => Greater,
            Less => GreaterEqual,
            LessEqualUnsigned => GreaterUnsigned,
            CarrySet => CarryClear,
            Negative => Positive,
            OverflowSet => OverflowClear,
            Always => Never,
            NotEqual => Equal,
            Greater => LessEqual,
            GreaterEqual => Less,
            GreaterUnsigned => LessEqualUnsigned,
            CarryClear => CarrySet,
            Positive => Negative,
            OverflowClear => OverflowSet,
        }
    }
}

/// Float branch and move conditions on `%fcc0`. Inverting flips the
/// unordered outcome along with the relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCondition {
    /// Not equal or unordered.
    NotEqual,
    Less,
    Equal,
    /// Unordered, greater or equal.
    UnorderedGreaterEqual,
}

impl FloatCondition {
    #[inline]
    pub const fn encoding(self) -> u32 {
        match self {
            FloatCondition::NotEqual => 1,
            FloatCondition::Less => 4,
            FloatCondition::Equal => 9,
            FloatCondition::UnorderedGreaterEqual => 12,
        }
    }

    pub const fn invert(self) -> Self {
        match self {
            FloatCondition::NotEqual => FloatCondition::Equal,
            FloatCondition::Equal => FloatCondition::NotEqual,
            FloatCondition::Less => FloatCondition::UnorderedGreaterEqual,
            FloatCondition::UnorderedGreaterEqual => FloatCondition::Less,
        }
    }
}

/// Condition code register a branch or conditional move reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCodes {
    /// 32-bit integer flags.
    Icc,
    /// 64-bit integer flags.
    Xcc,
    Fcc0,
}

impl ConditionCodes {
    #[inline]
    pub const fn for_bits(bits: u32) -> Self {
        if bits == 64 {
            ConditionCodes::Xcc
        } else {
            ConditionCodes::Icc
        }
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// `op3` of an arithmetic (format 3, `op = 2`) instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op3(u32);

impl Op3 {
    pub const ADD: Op3 = Op3(0x00);
    pub const AND: Op3 = Op3(0x01);
    pub const OR: Op3 = Op3(0x02);
    pub const XOR: Op3 = Op3(0x03);
    pub const SUB: Op3 = Op3(0x04);
    pub const ORN: Op3 = Op3(0x06);
    pub const MULX: Op3 = Op3(0x09);
    pub const ANDCC: Op3 = Op3(0x11);
    pub const SUBCC: Op3 = Op3(0x14);
    pub const SLL: Op3 = Op3(0x25);
    pub const SRL: Op3 = Op3(0x26);
    pub const SRA: Op3 = Op3(0x27);
    const RD: Op3 = Op3(0x28);
    const MOVCC: Op3 = Op3(0x2C);
    const FPOP1: Op3 = Op3(0x34);
    const FPOP2: Op3 = Op3(0x35);
    const JMPL: Op3 = Op3(0x38);
    const SAVE: Op3 = Op3(0x3C);
    const RESTORE: Op3 = Op3(0x3D);

    #[inline]
    const fn is_shift(self) -> bool {
        matches!(self.0, 0x25..=0x27)
    }
}

/// `op3` of a load or store (format 3, `op = 3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOp(u32);

impl MemOp {
    pub const LDUW: MemOp = MemOp(0x00);
    pub const LDUB: MemOp = MemOp(0x01);
    pub const LDUH: MemOp = MemOp(0x02);
    pub const STW: MemOp = MemOp(0x04);
    pub const STB: MemOp = MemOp(0x05);
    pub const STH: MemOp = MemOp(0x06);
    pub const LDSW: MemOp = MemOp(0x08);
    pub const LDSB: MemOp = MemOp(0x09);
    pub const LDSH: MemOp = MemOp(0x0A);
    pub const LDX: MemOp = MemOp(0x0B);
    pub const STX: MemOp = MemOp(0x0E);
    pub const LDF: MemOp = MemOp(0x20);
    pub const LDDF: MemOp = MemOp(0x23);
    pub const STF: MemOp = MemOp(0x24);
    pub const STDF: MemOp = MemOp(0x27);

    /// Integer load of `bytes`.
    pub fn load(bytes: usize, signed: bool) -> MemOp {
        match (bytes, signed) {
            (1, true) => MemOp::LDSB,
            (1, false) => MemOp::LDUB,
            (2, true) => MemOp::LDSH,
            (2, false) => MemOp::LDUH,
            (4, true) => MemOp::LDSW,
            (4, false) => MemOp::LDUW,
            _ => MemOp::LDX,
        }
    }

    /// Integer store of `bytes`.
    pub fn store(bytes: usize) -> MemOp {
        match bytes {
            1 => MemOp::STB,
            2 => MemOp::STH,
            4 => MemOp::STW,
            _ => MemOp::STX,
        }
    }
}

/// Second operand of a format-3 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Reg(SReg),
    Imm(i32),
}

// `membar` mask bits.
pub const LOAD_LOAD: u32 = 1;
pub const STORE_LOAD: u32 = 2;
pub const LOAD_STORE: u32 = 4;
pub const STORE_STORE: u32 = 8;

pub const NOP: u32 = 0x0100_0000;

#[inline]
pub const fn is_simm13(value: i64) -> bool {
    is_simm(value, 13)
}

// =============================================================================
// Assembler
// =============================================================================

/// SPARC assembler over a [`CodeBuffer`].
pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Assembler { buf }
    }

    #[inline]
    pub fn buffer(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.buf.position()
    }

    #[inline]
    pub fn emit(&mut self, word: u32) {
        self.buf.emit_u32(word);
    }

    #[inline]
    pub fn nop(&mut self) {
        self.emit(NOP);
    }

    // =========================================================================
    // Format 3
    // =========================================================================

    fn format3(&mut self, op: u32, op3: u32, rd: u32, rs1: u32, src: Src) -> KilnResult<()> {
        let low = match src {
            Src::Reg(rs2) => rs2.encoding(),
            Src::Imm(imm) => {
                if !is_simm13(imm as i64) {
                    return Err(KilnError::emission(format!("{imm} does not fit simm13")));
                }
                (1 << 13) | (imm as u32 & 0x1FFF)
            }
        };
        self.emit((op << 30) | (rd << 25) | (op3 << 19) | (rs1 << 14) | low);
        Ok(())
    }

    /// `rd = rs1 op src`. Shifts take the 64-bit form when `wide`.
    pub fn arith(&mut self, op3: Op3, wide: bool, rd: SReg, rs1: SReg, src: Src) -> KilnResult<()> {
        if op3.is_shift() {
            let extended = if wide { 1 << 12 } else { 0 };
            let low = match src {
                Src::Reg(rs2) => rs2.encoding(),
                Src::Imm(count) => {
                    let mask = if wide { 63 } else { 31 };
                    (1 << 13) | (count as u32 & mask)
                }
            };
            self.emit((2 << 30) | (rd.encoding() << 25) | (op3.0 << 19) | (rs1.encoding() << 14) | extended | low);
            return Ok(());
        }
        self.format3(2, op3.0, rd.encoding(), rs1.encoding(), src)
    }

    /// `mov rs, rd` (`or %g0, rs, rd`).
    pub fn mov(&mut self, rd: SReg, rs: SReg) {
        self.emit((2 << 30) | (rd.encoding() << 25) | (Op3::OR.0 << 19) | rs.encoding());
    }

    /// `cmp rs1, src` (`subcc rs1, src, %g0`).
    pub fn cmp(&mut self, rs1: SReg, src: Src) -> KilnResult<()> {
        self.arith(Op3::SUBCC, true, SReg::G0, rs1, src)
    }

    /// `btst rs1, src` (`andcc rs1, src, %g0`).
    pub fn btst(&mut self, rs1: SReg, src: Src) -> KilnResult<()> {
        self.arith(Op3::ANDCC, true, SReg::G0, rs1, src)
    }

    pub fn sethi(&mut self, imm22: u32, rd: SReg) {
        self.emit((rd.encoding() << 25) | (4 << 22) | (imm22 & 0x003F_FFFF));
    }

    /// Materialize `value` into `rd`, sign-extended to 64 bits. Values wider
    /// than 32 bits clobber `g5`.
    pub fn set(&mut self, value: i64, rd: SReg) -> KilnResult<()> {
        if is_simm13(value) {
            return self.format3(2, Op3::OR.0, rd.encoding(), 0, Src::Imm(value as i32));
        }
        if let Ok(word) = i32::try_from(value) {
            self.set_low32(word as u32, rd)?;
            if word < 0 {
                self.arith(Op3::SRA, false, rd, rd, Src::Imm(0))?;
            }
            return Ok(());
        }
        let temp = TEMPS[1];
        if rd == temp {
            return Err(KilnError::emission(format!("cannot build {value:#x} in {temp}")));
        }
        self.set_low32((value >> 32) as u32, rd)?;
        self.arith(Op3::SLL, true, rd, rd, Src::Imm(32))?;
        self.set_low32(value as u32, temp)?;
        self.arith(Op3::OR, true, rd, rd, Src::Reg(temp))
    }

    /// `sethi %hi(value), rd; or rd, %lo(value), rd`, zero-extended.
    fn set_low32(&mut self, value: u32, rd: SReg) -> KilnResult<()> {
        self.sethi(value >> 10, rd);
        let low = value & 0x3FF;
        if low != 0 {
            self.arith(Op3::OR, true, rd, rd, Src::Imm(low as i32))?;
        }
        Ok(())
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Load or store `rd` at `[base + disp]`. Displacements beyond simm13 go
    /// through `g5`.
    pub fn mem(&mut self, op: MemOp, rd: u32, base: SReg, disp: i32) -> KilnResult<()> {
        if is_simm13(disp as i64) {
            return self.format3(3, op.0, rd, base.encoding(), Src::Imm(disp));
        }
        let index = TEMPS[1];
        if base == index {
            return Err(KilnError::emission(format!("displacement {disp} needs {index}, which is in use")));
        }
        self.set(disp as i64, index)?;
        self.format3(3, op.0, rd, base.encoding(), Src::Reg(index))
    }

    /// `membar mask`.
    pub fn membar(&mut self, mask: u32) {
        self.emit((2 << 30) | (Op3::RD.0 << 19) | (15 << 14) | (1 << 13) | (mask & 0x7F));
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// `save %sp, -size, %sp`. Large frames build the size in `g1`.
    pub fn save(&mut self, size: i32) -> KilnResult<()> {
        if is_simm13(-(size as i64)) {
            return self.format3(2, Op3::SAVE.0, SReg::SP.encoding(), SReg::SP.encoding(), Src::Imm(-size));
        }
        self.set(-(size as i64), SReg::G1)?;
        self.format3(2, Op3::SAVE.0, SReg::SP.encoding(), SReg::SP.encoding(), Src::Reg(SReg::G1))
    }

    /// `ret; restore`.
    pub fn ret_restore(&mut self) {
        self.emit(
            (2 << 30) | (Op3::JMPL.0 << 19) | (SReg::I7.encoding() << 14) | (1 << 13) | 8,
        );
        self.emit((2 << 30) | (Op3::RESTORE.0 << 19));
    }

    /// `rd %pc, rd`.
    pub fn rd_pc(&mut self, rd: SReg) {
        self.emit((2 << 30) | (rd.encoding() << 25) | (Op3::RD.0 << 19) | (5 << 14));
    }

    // =========================================================================
    // Conditional moves
    // =========================================================================

    fn movcc_bits(cc: ConditionCodes) -> u32 {
        match cc {
            ConditionCodes::Icc => 1 << 18,
            ConditionCodes::Xcc => (1 << 18) | (1 << 12),
            ConditionCodes::Fcc0 => 0,
        }
    }

    /// `mov<cond> %cc, src, rd` with an integer condition.
    pub fn movcc(&mut self, cond: Condition, cc: ConditionCodes, src: Src, rd: SReg) -> KilnResult<()> {
        self.movcc_raw(cond.encoding(), cc, src, rd)
    }

    /// `movf<cond> %fcc0, src, rd`.
    pub fn movfcc(&mut self, cond: FloatCondition, src: Src, rd: SReg) -> KilnResult<()> {
        self.movcc_raw(cond.encoding(), ConditionCodes::Fcc0, src, rd)
    }

    fn movcc_raw(&mut self, cond: u32, cc: ConditionCodes, src: Src, rd: SReg) -> KilnResult<()> {
        let low = match src {
            Src::Reg(rs2) => rs2.encoding(),
            Src::Imm(imm) => {
                if !is_simm(imm as i64, 11) {
                    return Err(KilnError::emission(format!("{imm} does not fit simm11")));
                }
                (1 << 13) | (imm as u32 & 0x7FF)
            }
        };
        self.emit(
            (2 << 30) | (rd.encoding() << 25) | (Op3::MOVCC.0 << 19) | Self::movcc_bits(cc) | (cond << 14) | low,
        );
        Ok(())
    }

    /// `fmov{s,d}<cond> %icc, rs2, rd` on a non-zero integer condition.
    pub fn fmovcc(&mut self, double: bool, cond: Condition, rs2: FReg, rd: FReg) {
        let opf_cc = 0b100;
        let opf_low = if double { 2 } else { 1 };
        self.emit(
            (2 << 30)
                | (rd.encoding() << 25)
                | (Op3::FPOP2.0 << 19)
                | (cond.encoding() << 14)
                | (opf_cc << 11)
                | (opf_low << 5)
                | rs2.encoding(),
        );
    }

    // =========================================================================
    // Floating point
    // =========================================================================

    pub fn fmov(&mut self, double: bool, rd: FReg, rs2: FReg) {
        let opf = if double { 0x02 } else { 0x01 };
        self.emit((2 << 30) | (rd.encoding() << 25) | (Op3::FPOP1.0 << 19) | (opf << 5) | rs2.encoding());
    }

    /// `fcmp{s,d} %fcc0, rs1, rs2`.
    pub fn fcmp(&mut self, double: bool, rs1: FReg, rs2: FReg) {
        let opf = if double { 0x52 } else { 0x51 };
        self.emit((2 << 30) | (Op3::FPOP2.0 << 19) | (rs1.encoding() << 14) | (opf << 5) | rs2.encoding());
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// `b<cond>,pt %cc, target; nop`.
    pub fn bpcc(&mut self, cond: Condition, cc: ConditionCodes, target: Label) {
        let cc_bits = match cc {
            ConditionCodes::Xcc => 2 << 20,
            _ => 0,
        };
        let at = self.position();
        self.emit((cond.encoding() << 25) | (1 << 22) | cc_bits | (1 << 19));
        self.buf.add_fixup(at, FixupTarget::Label(target), FixupKind::Disp19);
        self.nop();
    }

    /// `ba,pt %icc, target; nop`.
    pub fn ba(&mut self, target: Label) {
        self.bpcc(Condition::Always, ConditionCodes::Icc, target);
    }

    /// `fb<cond>,pt %fcc0, target; nop`.
    pub fn fbpfcc(&mut self, cond: FloatCondition, target: Label) {
        let at = self.position();
        self.emit((cond.encoding() << 25) | (5 << 22) | (1 << 19));
        self.buf.add_fixup(at, FixupTarget::Label(target), FixupKind::Disp19);
        self.nop();
    }

    /// `call name; nop`, relocated against `name`. Returns the offset control
    /// returns to.
    pub fn call_symbol(&mut self, name: &str, relocation: u16) -> u32 {
        let at = self.position();
        self.emit(1 << 30);
        self.buf.relocate(at, name, relocation);
        self.nop();
        self.position()
    }

    pub fn illtrap(&mut self, code: u32) {
        self.emit(code & 0x003F_FFFF);
    }

    /// `sethi` whose immediate is patched with bits 10..32 of
    /// `data offset - anchor`.
    pub fn sethi_data(&mut self, rd: SReg, data_offset: u32, anchor: u32) {
        let at = self.position();
        self.sethi(0, rd);
        self.buf
            .add_fixup(at, FixupTarget::Data(data_offset), FixupKind::Hi22 { anchor });
    }

    /// `or rd, lo10, rd` patched with the low bits of `data offset - anchor`.
    pub fn or_lo_data(&mut self, rd: SReg, data_offset: u32, anchor: u32) -> KilnResult<()> {
        let at = self.position();
        self.arith(Op3::OR, true, rd, rd, Src::Imm(0))?;
        self.buf
            .add_fixup(at, FixupTarget::Data(data_offset), FixupKind::Lo10 { anchor });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;

    fn words(f: impl FnOnce(&mut Assembler<'_>)) -> Vec<u32> {
        let mut buf = CodeBuffer::new(Target::Sparc);
        f(&mut Assembler::new(&mut buf));
        buf.code()
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_frame_words() {
        let w = words(|a| {
            a.save(176).unwrap();
            a.ret_restore();
        });
        assert_eq!(w, vec![0x9DE3_BF50, 0x81C7_E008, 0x81E8_0000]);
    }

    #[test]
    fn test_moves_and_stores() {
        let w = words(|a| {
            a.set(5, SReg::O0).unwrap();
            a.mem(MemOp::STX, 0, SReg::G2, 0x38).unwrap();
            a.membar(STORE_LOAD);
            a.rd_pc(SReg::L7);
        });
        assert_eq!(w, vec![0x9010_2005, 0xC070_A038, 0x8143_E002, 0xAF41_4000]);
    }

    #[test]
    fn test_wide_constants() {
        let w = words(|a| a.set(0x1234_5678, SReg::O0).unwrap());
        assert_eq!(w.len(), 2);
        assert_eq!(w[0], 0x1100_0000 | (0x1234_5678 >> 10));
        let w = words(|a| a.set(-100_000, SReg::O0).unwrap());
        assert_eq!(w.len(), 3);
        let w = words(|a| a.set(0x1_0000_0001, SReg::O0).unwrap());
        assert_eq!(w.len(), 6);
        let mut buf = CodeBuffer::new(Target::Sparc);
        assert!(Assembler::new(&mut buf).set(1 << 40, TEMPS[1]).is_err());
    }

    #[test]
    fn test_call_has_delay_slot() {
        let w = words(|a| {
            let ret = a.call_symbol("deoptimize", 7);
            assert_eq!(ret, 8);
            a.illtrap(0);
        });
        assert_eq!(w, vec![0x4000_0000, NOP, 0]);
    }

    #[test]
    fn test_condition_inversion() {
        assert_eq!(Condition::Less.invert(), Condition::GreaterEqual);
        assert_eq!(Condition::CarrySet.invert(), Condition::CarryClear);
        assert_eq!(FloatCondition::Equal.invert().encoding(), 1);
        assert_eq!(FloatCondition::Less.invert().encoding(), 12);
    }
}
