//! A64 instruction encoding.
//!
//! Every instruction is one 32-bit word. Register fields: `rd`/`rt` in bits
//! 0..5, `rn` in 5..10, `rm` in 16..21; `sf` (bit 31) selects 64-bit
//! operation.

use super::registers::{VReg, XReg, TEMPS};
use crate::emit::{CodeBuffer, FixupKind, FixupTarget, Label};
use kiln_core::{KilnError, KilnResult};

// =============================================================================
// Condition Codes
// =============================================================================

/// Condition of `B.cond`, `CSEL` and `CSINC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Eq = 0b0000,
    Ne = 0b0001,
    /// Unsigned higher or same.
    Hs = 0b0010,
    /// Unsigned lower.
    Lo = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
}

impl Condition {
    #[inline(always)]
    pub const fn encoding(self) -> u32 {
        self as u32
    }

    /// Conditions pair up on bit 0.
    #[inline]
    pub const fn invert(self) -> Self {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Hs => Condition::Lo,
            Condition::Lo => Condition::Hs,
            Condition::Mi => Condition::Pl,
            Condition::Pl => Condition::Mi,
            Condition::Vs => Condition::Vc,
            Condition::Vc => Condition::Vs,
            Condition::Hi => Condition::Ls,
            Condition::Ls => Condition::Hi,
            Condition::Ge => Condition::Lt,
            Condition::Lt => Condition::Ge,
            Condition::Gt => Condition::Le,
            Condition::Le => Condition::Gt,
        }
    }
}

// =============================================================================
// Operation Groups
// =============================================================================

/// Shifted-register logical operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
    /// `ANDS`; `TST` with `rd = zr`.
    Ands,
    /// `ORN`; `MVN` with `rn = zr`.
    Orn,
}

impl LogicOp {
    const fn opcode(self) -> u32 {
        match self {
            LogicOp::And => 0x0A00_0000,
            LogicOp::Orr => 0x2A00_0000,
            LogicOp::Eor => 0x4A00_0000,
            LogicOp::Ands => 0x6A00_0000,
            LogicOp::Orn => 0x2A20_0000,
        }
    }
}

/// Register-count shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
}

/// Load/store flavour: access size, register file and the `opc` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOp {
    size_log2: u32,
    vector: bool,
    opc: u32,
}

impl MemOp {
    pub const STORE_B: MemOp = MemOp::new(0, false, 0b00);
    pub const STORE_H: MemOp = MemOp::new(1, false, 0b00);
    pub const STORE_W: MemOp = MemOp::new(2, false, 0b00);
    pub const STORE_X: MemOp = MemOp::new(3, false, 0b00);
    pub const LOAD_B: MemOp = MemOp::new(0, false, 0b01);
    pub const LOAD_H: MemOp = MemOp::new(1, false, 0b01);
    pub const LOAD_W: MemOp = MemOp::new(2, false, 0b01);
    pub const LOAD_X: MemOp = MemOp::new(3, false, 0b01);
    pub const LOAD_SB_X: MemOp = MemOp::new(0, false, 0b10);
    pub const LOAD_SB_W: MemOp = MemOp::new(0, false, 0b11);
    pub const LOAD_SH_X: MemOp = MemOp::new(1, false, 0b10);
    pub const LOAD_SH_W: MemOp = MemOp::new(1, false, 0b11);
    pub const LOAD_SW: MemOp = MemOp::new(2, false, 0b10);
    pub const STORE_S: MemOp = MemOp::new(2, true, 0b00);
    pub const STORE_D: MemOp = MemOp::new(3, true, 0b00);
    pub const LOAD_S: MemOp = MemOp::new(2, true, 0b01);
    pub const LOAD_D: MemOp = MemOp::new(3, true, 0b01);

    const fn new(size_log2: u32, vector: bool, opc: u32) -> Self {
        MemOp { size_log2, vector, opc }
    }

    /// Integer load of `bytes`, sign-extending to 32 or 64 bits if `signed`.
    pub fn load(bytes: usize, signed: bool, wide: bool) -> MemOp {
        match (bytes, signed, wide) {
            (1, false, _) => Self::LOAD_B,
            (1, true, true) => Self::LOAD_SB_X,
            (1, true, false) => Self::LOAD_SB_W,
            (2, false, _) => Self::LOAD_H,
            (2, true, true) => Self::LOAD_SH_X,
            (2, true, false) => Self::LOAD_SH_W,
            (4, true, true) => Self::LOAD_SW,
            (4, _, _) => Self::LOAD_W,
            _ => Self::LOAD_X,
        }
    }

    pub fn store(bytes: usize) -> MemOp {
        match bytes {
            1 => Self::STORE_B,
            2 => Self::STORE_H,
            4 => Self::STORE_W,
            _ => Self::STORE_X,
        }
    }

    #[inline]
    const fn bits(self) -> u32 {
        (self.size_log2 << 30) | ((self.vector as u32) << 26) | (self.opc << 22)
    }
}

/// Barrier domain of `DMB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierDomain {
    /// Full inner-shareable barrier.
    Ish,
    /// Orders earlier loads against later loads and stores.
    IshLd,
    /// Orders stores against stores.
    IshSt,
}

/// Whether `value` is an `ADD`/`SUB` immediate, possibly shifted by 12.
#[inline]
pub const fn is_arith_imm(value: u64) -> bool {
    value < 0x1000 || (value & 0xFFF == 0 && value >> 12 < 0x1000)
}

// =============================================================================
// Assembler
// =============================================================================

/// Appends A64 instructions to a code buffer.
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

    #[inline(always)]
    fn sf(wide: bool) -> u32 {
        (wide as u32) << 31
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// `ADD`/`SUB` (flag-setting if `set_flags`) with a 12-bit immediate.
    /// Register 31 is `sp` for `rd`/`rn` unless flags are set.
    fn add_sub_imm(&mut self, wide: bool, sub: bool, set_flags: bool, rd: XReg, rn: XReg, imm: u64) -> KilnResult<()> {
        let (imm12, shift) = if imm < 0x1000 {
            (imm as u32, 0)
        } else if imm & 0xFFF == 0 && imm >> 12 < 0x1000 {
            ((imm >> 12) as u32, 1)
        } else {
            return Err(KilnError::emission(format!("{imm:#x} is not an arithmetic immediate")));
        };
        let base = 0x1100_0000 | ((sub as u32) << 30) | ((set_flags as u32) << 29);
        self.emit(Self::sf(wide) | base | (shift << 22) | (imm12 << 10) | (rn.encoding() << 5) | rd.encoding());
        Ok(())
    }

    /// `rd = rn + imm` for any immediate whose magnitude fits 24 bits.
    pub fn add_imm(&mut self, wide: bool, rd: XReg, rn: XReg, imm: i64) -> KilnResult<()> {
        let sub = imm < 0;
        let magnitude = imm.unsigned_abs();
        if is_arith_imm(magnitude) {
            return self.add_sub_imm(wide, sub, false, rd, rn, magnitude);
        }
        if magnitude >= 1 << 24 {
            return Err(KilnError::emission(format!("{imm} is too large for add/sub")));
        }
        self.add_sub_imm(wide, sub, false, rd, rn, magnitude & !0xFFF)?;
        self.add_sub_imm(wide, sub, false, rd, rd, magnitude & 0xFFF)
    }

    /// `CMP rn, #imm` (negative immediates use `CMN`).
    pub fn cmp_imm(&mut self, wide: bool, rn: XReg, imm: i64) -> KilnResult<()> {
        if imm < 0 {
            self.add_sub_imm(wide, false, true, XReg::ZR, rn, imm.unsigned_abs())
        } else {
            self.add_sub_imm(wide, true, true, XReg::ZR, rn, imm as u64)
        }
    }

    pub fn add_rr(&mut self, wide: bool, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(Self::sf(wide) | 0x0B00_0000 | (rm.encoding() << 16) | (rn.encoding() << 5) | rd.encoding());
    }

    pub fn sub_rr(&mut self, wide: bool, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(Self::sf(wide) | 0x4B00_0000 | (rm.encoding() << 16) | (rn.encoding() << 5) | rd.encoding());
    }

    pub fn cmp_rr(&mut self, wide: bool, rn: XReg, rm: XReg) {
        self.emit(Self::sf(wide) | 0x6B00_0000 | (rm.encoding() << 16) | (rn.encoding() << 5) | XReg::ZR.encoding());
    }

    pub fn logic(&mut self, op: LogicOp, wide: bool, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(Self::sf(wide) | op.opcode() | (rm.encoding() << 16) | (rn.encoding() << 5) | rd.encoding());
    }

    /// `MOV rd, rm` between general registers (not `sp`).
    pub fn mov(&mut self, wide: bool, rd: XReg, rm: XReg) {
        self.logic(LogicOp::Orr, wide, rd, XReg::ZR, rm);
    }

    /// `MOV` to or from `sp`.
    pub fn mov_sp(&mut self, rd: XReg, rn: XReg) {
        self.emit(0x9100_0000 | (rn.encoding() << 5) | rd.encoding());
    }

    pub fn mul(&mut self, wide: bool, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(
            Self::sf(wide)
                | 0x1B00_0000
                | (rm.encoding() << 16)
                | (XReg::ZR.encoding() << 10)
                | (rn.encoding() << 5)
                | rd.encoding(),
        );
    }

    pub fn neg(&mut self, wide: bool, rd: XReg, rm: XReg) {
        self.sub_rr(wide, rd, XReg::ZR, rm);
    }

    pub fn mvn(&mut self, wide: bool, rd: XReg, rm: XReg) {
        self.logic(LogicOp::Orn, wide, rd, XReg::ZR, rm);
    }

    pub fn shift_rr(&mut self, op: ShiftOp, wide: bool, rd: XReg, rn: XReg, rm: XReg) {
        let opcode = match op {
            ShiftOp::Lsl => 0x1AC0_2000,
            ShiftOp::Lsr => 0x1AC0_2400,
            ShiftOp::Asr => 0x1AC0_2800,
        };
        self.emit(Self::sf(wide) | opcode | (rm.encoding() << 16) | (rn.encoding() << 5) | rd.encoding());
    }

    /// `UBFM` / `SBFM`.
    fn bitfield(&mut self, signed: bool, wide: bool, rd: XReg, rn: XReg, immr: u32, imms: u32) {
        let base = match (signed, wide) {
            (false, true) => 0xD340_0000,
            (false, false) => 0x5300_0000,
            (true, true) => 0x9340_0000,
            (true, false) => 0x1300_0000,
        };
        self.emit(base | (immr << 16) | (imms << 10) | (rn.encoding() << 5) | rd.encoding());
    }

    /// Shift by a constant, masked to the width.
    pub fn shift_ri(&mut self, op: ShiftOp, wide: bool, rd: XReg, rn: XReg, amount: u32) {
        let width = if wide { 64 } else { 32 };
        let amount = amount & (width - 1);
        match op {
            ShiftOp::Lsl => self.bitfield(false, wide, rd, rn, (width - amount) % width, width - 1 - amount),
            ShiftOp::Lsr => self.bitfield(false, wide, rd, rn, amount, width - 1),
            ShiftOp::Asr => self.bitfield(true, wide, rd, rn, amount, width - 1),
        }
    }

    /// Sign-extend the low `from` bits into a `wide` or 32-bit register.
    pub fn sxt(&mut self, wide: bool, rd: XReg, rn: XReg, from: u32) {
        self.bitfield(true, wide, rd, rn, 0, from - 1);
    }

    /// Zero-extend the low `from` bits.
    pub fn uxt(&mut self, rd: XReg, rn: XReg, from: u32) {
        self.bitfield(false, false, rd, rn, 0, from - 1);
    }

    fn move_wide(&mut self, opcode: u32, wide: bool, rd: XReg, imm: u16, half: u32) {
        self.emit(Self::sf(wide) | opcode | (half << 21) | ((imm as u32) << 5) | rd.encoding());
    }

    /// Materialize `value` with `MOVZ`/`MOVN` then `MOVK`s.
    pub fn mov_imm(&mut self, wide: bool, rd: XReg, value: i64) {
        let count = if wide { 4 } else { 2 };
        let bits = if wide { value as u64 } else { value as u64 & 0xFFFF_FFFF };
        let halves: Vec<u16> = (0..count).map(|i| (bits >> (16 * i)) as u16).collect();
        let ones = halves.iter().filter(|&&h| h == 0xFFFF).count();
        let zeros = halves.iter().filter(|&&h| h == 0).count();
        let (skip, first_op) = if ones > zeros {
            (0xFFFF, 0x1280_0000)
        } else {
            (0x0000, 0x5280_0000)
        };
        let first = halves.iter().position(|&h| h != skip).unwrap_or(0);
        let lead = if skip == 0xFFFF { !halves[first] } else { halves[first] };
        self.move_wide(first_op, wide, rd, lead, first as u32);
        for (i, &half) in halves.iter().enumerate().skip(first + 1) {
            if half != skip {
                self.move_wide(0x7280_0000, wide, rd, half, i as u32);
            }
        }
    }

    pub fn csel(&mut self, wide: bool, rd: XReg, rn: XReg, rm: XReg, cond: Condition) {
        self.emit(
            Self::sf(wide)
                | 0x1A80_0000
                | (rm.encoding() << 16)
                | (cond.encoding() << 12)
                | (rn.encoding() << 5)
                | rd.encoding(),
        );
    }

    /// `CSET rd, cond` (`CSINC rd, zr, zr, !cond`).
    pub fn cset(&mut self, rd: XReg, cond: Condition) {
        self.emit(
            0x1A80_0400
                | (XReg::ZR.encoding() << 16)
                | (cond.invert().encoding() << 12)
                | (XReg::ZR.encoding() << 5)
                | rd.encoding(),
        );
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Load or store `rt` at `[base + disp]`, picking the scaled, unscaled or
    /// register-offset form. The register form goes through `x9`.
    pub fn mem(&mut self, op: MemOp, rt: u32, base: XReg, disp: i32) -> KilnResult<()> {
        let scale = 1i32 << op.size_log2;
        if disp >= 0 && disp % scale == 0 && disp / scale < 0x1000 {
            let imm12 = (disp / scale) as u32;
            self.emit(0x3900_0000 | op.bits() | (imm12 << 10) | (base.encoding() << 5) | rt);
        } else if (-256..256).contains(&disp) {
            let imm9 = (disp as u32) & 0x1FF;
            self.emit(0x3800_0000 | op.bits() | (imm9 << 12) | (base.encoding() << 5) | rt);
        } else {
            let index = TEMPS[1];
            if rt == index.encoding() || base == index {
                return Err(KilnError::emission(format!("displacement {disp} needs {index}, which is in use")));
            }
            self.mov_imm(true, index, disp as i64);
            self.mem_indexed(op, rt, base, index);
        }
        Ok(())
    }

    /// `[base + index]`.
    pub fn mem_indexed(&mut self, op: MemOp, rt: u32, base: XReg, index: XReg) {
        self.emit(0x3820_6800 | op.bits() | (index.encoding() << 16) | (base.encoding() << 5) | rt);
    }

    /// PC-relative load of a data-section entry.
    pub fn ldr_literal(&mut self, op: MemOp, rt: u32, data_offset: u32) -> KilnResult<()> {
        let opcode = match (op.vector, op.size_log2) {
            (false, 2) => 0x1800_0000,
            (false, 3) => 0x5800_0000,
            (true, 2) => 0x1C00_0000,
            (true, 3) => 0x5C00_0000,
            _ => return Err(KilnError::emission(format!("no literal load for {op:?}"))),
        };
        let at = self.position();
        self.emit(opcode | rt);
        self.buf.add_fixup(at, FixupTarget::Data(data_offset), FixupKind::Imm19);
        Ok(())
    }

    /// `STP x29, x30, [sp, #-16]!`.
    pub fn push_frame_record(&mut self) {
        self.emit(0xA9BF_7BFD);
    }

    /// `LDP x29, x30, [sp], #16`.
    pub fn pop_frame_record(&mut self) {
        self.emit(0xA8C1_7BFD);
    }

    pub fn dmb(&mut self, domain: BarrierDomain) {
        let crm = match domain {
            BarrierDomain::Ish => 0b1011,
            BarrierDomain::IshLd => 0b1001,
            BarrierDomain::IshSt => 0b1010,
        };
        self.emit(0xD503_30BF | (crm << 8));
    }

    // =========================================================================
    // Floating Point
    // =========================================================================

    #[inline(always)]
    fn ftype(double: bool) -> u32 {
        (double as u32) << 22
    }

    pub fn fmov(&mut self, double: bool, rd: VReg, rn: VReg) {
        self.emit(0x1E20_4000 | Self::ftype(double) | (rn.encoding() << 5) | rd.encoding());
    }

    /// Raw bits from a general register.
    pub fn fmov_from_general(&mut self, double: bool, rd: VReg, rn: XReg) {
        let opcode = if double { 0x9E67_0000 } else { 0x1E27_0000 };
        self.emit(opcode | (rn.encoding() << 5) | rd.encoding());
    }

    /// Raw bits into a general register.
    pub fn fmov_to_general(&mut self, double: bool, rd: XReg, rn: VReg) {
        let opcode = if double { 0x9E66_0000 } else { 0x1E26_0000 };
        self.emit(opcode | (rn.encoding() << 5) | rd.encoding());
    }

    pub fn fcsel(&mut self, double: bool, rd: VReg, rn: VReg, rm: VReg, cond: Condition) {
        self.emit(
            0x1E20_0C00
                | Self::ftype(double)
                | (rm.encoding() << 16)
                | (cond.encoding() << 12)
                | (rn.encoding() << 5)
                | rd.encoding(),
        );
    }

    /// Unordered operands set `C` and `V` only.
    pub fn fcmp(&mut self, double: bool, rn: VReg, rm: VReg) {
        self.emit(0x1E20_2000 | Self::ftype(double) | (rm.encoding() << 16) | (rn.encoding() << 5));
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    pub fn b(&mut self, target: Label) {
        let at = self.position();
        self.emit(0x1400_0000);
        self.buf.add_fixup(at, FixupTarget::Label(target), FixupKind::Imm26);
    }

    pub fn b_cond(&mut self, cond: Condition, target: Label) {
        let at = self.position();
        self.emit(0x5400_0000 | cond.encoding());
        self.buf.add_fixup(at, FixupTarget::Label(target), FixupKind::Imm19);
    }

    /// `BL` to an external symbol. Returns the return address.
    pub fn bl_symbol(&mut self, name: &str, relocation: u16) -> u32 {
        let at = self.position();
        self.emit(0x9400_0000);
        self.buf.relocate(at, name, relocation);
        self.position()
    }

    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    pub fn brk(&mut self, imm: u16) {
        self.emit(0xD420_0000 | ((imm as u32) << 5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::aarch64::registers::ARG_VREGS;
    use crate::backend::Target;

    fn words(f: impl FnOnce(&mut Assembler<'_>)) -> Vec<u32> {
        let mut buf = CodeBuffer::new(Target::AArch64);
        f(&mut Assembler::new(&mut buf));
        buf.code()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_frame_record() {
        assert_eq!(
            words(|a| {
                a.push_frame_record();
                a.mov_sp(XReg::FP, XReg::SP);
                a.pop_frame_record();
                a.ret();
            }),
            [0xA9BF_7BFD, 0x9100_03FD, 0xA8C1_7BFD, 0xD65F_03C0]
        );
    }

    #[test]
    fn test_arithmetic() {
        let x = |n| XReg::new(n).unwrap();
        assert_eq!(words(|a| a.add_rr(true, x(0), x(1), x(2))), [0x8B02_0020]);
        assert_eq!(words(|a| a.add_imm(true, x(0), x(1), 16).unwrap()), [0x9100_4020]);
        assert_eq!(words(|a| a.add_imm(true, x(0), x(1), -16).unwrap()), [0xD100_4020]);
        assert_eq!(words(|a| a.cmp_rr(true, x(0), x(1))), [0xEB01_001F]);
        assert_eq!(words(|a| a.mov(true, x(0), x(1))), [0xAA01_03E0]);
        assert_eq!(words(|a| a.mul(true, x(0), x(1), x(2))), [0x9B02_7C20]);
        assert_eq!(words(|a| a.cset(x(0), Condition::Eq)), [0x1A9F_17E0]);
        // lsl x0, x1, #3 == ubfm x0, x1, #61, #60
        assert_eq!(words(|a| a.shift_ri(ShiftOp::Lsl, true, x(0), x(1), 3)), [0xD37D_F020]);
        let mut buf = CodeBuffer::new(Target::AArch64);
        assert!(Assembler::new(&mut buf).add_imm(true, x(0), x(1), 1 << 30).is_err());
    }

    #[test]
    fn test_mov_imm() {
        let x0 = XReg::X0;
        assert_eq!(words(|a| a.mov_imm(true, x0, 0)), [0xD280_0000]);
        assert_eq!(words(|a| a.mov_imm(true, x0, 0x1234_0000)), [0xD2A2_4680]);
        // movn x0, #0
        assert_eq!(words(|a| a.mov_imm(true, x0, -1)), [0x9280_0000]);
        assert_eq!(words(|a| a.mov_imm(false, x0, 0x1_0001)).len(), 2);
    }

    #[test]
    fn test_loads_and_stores() {
        let x = |n| XReg::new(n).unwrap();
        assert_eq!(words(|a| a.mem(MemOp::LOAD_X, 0, x(1), 8).unwrap()), [0xF940_0420]);
        assert_eq!(words(|a| a.mem(MemOp::STORE_W, 2, x(3), 4).unwrap()), [0xB900_0462]);
        // ldur x0, [x1, #-8]
        assert_eq!(words(|a| a.mem(MemOp::LOAD_X, 0, x(1), -8).unwrap()), [0xF85F_8020]);
        assert_eq!(words(|a| a.mem_indexed(MemOp::LOAD_X, 0, x(1), x(2))), [0xF862_6820]);
        // ldr xzr, [x1]
        assert_eq!(words(|a| a.mem(MemOp::LOAD_X, 31, x(1), 0).unwrap()), [0xF940_003F]);
        assert_eq!(words(|a| a.mem(MemOp::LOAD_X, 0, x(1), 0x10000).unwrap()).len(), 2);
    }

    #[test]
    fn test_barriers_and_float() {
        assert_eq!(words(|a| a.dmb(BarrierDomain::Ish)), [0xD503_3BBF]);
        let v = |n: usize| ARG_VREGS[n];
        assert_eq!(words(|a| a.fcmp(true, v(0), v(1))), [0x1E61_2000]);
        assert_eq!(words(|a| a.fmov(true, v(0), v(1))), [0x1E60_4020]);
    }
}
