//! AMD64 instruction encoder.
//!
//! Instruction format:
//!
//! ```text
//! [Prefix] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```
//!
//! Every instruction goes through [`Assembler::op`] (legacy encodings) or
//! [`Assembler::vex`] (AVX), which compute REX/VEX bits and the ModR/M,
//! SIB and displacement bytes for a register, `[base + index + disp]` or
//! RIP-relative operand. RIP-relative operands are resolved when the code
//! buffer finishes; they must be the last field of their instruction.

use super::registers::{Gpr, Xmm};
use crate::emit::{CodeBuffer, FixupKind, FixupTarget, Label};

// =============================================================================
// Operands
// =============================================================================

/// `[base + index + disp]`, index scale 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    pub index: Option<Gpr>,
    pub disp: i32,
}

impl Mem {
    #[inline]
    pub const fn base_disp(base: Gpr, disp: i32) -> Self {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    #[inline]
    pub const fn base_index_disp(base: Gpr, index: Gpr, disp: i32) -> Self {
        Mem {
            base,
            index: Some(index),
            disp,
        }
    }

    /// Same operand `offset` bytes further.
    #[inline]
    pub const fn offset(self, offset: i32) -> Self {
        Mem {
            disp: self.disp + offset,
            ..self
        }
    }

    #[inline]
    const fn disp_fits_i8(&self) -> bool {
        self.disp >= -128 && self.disp <= 127
    }
}

/// The r/m operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    /// Register encoding, general or XMM.
    Reg(u8),
    Mem(Mem),
    /// `[rip + disp32]` referring to a label or the data section.
    Rip(FixupTarget),
}

impl From<Gpr> for Rm {
    fn from(r: Gpr) -> Self {
        Rm::Reg(r.encoding())
    }
}

impl From<Xmm> for Rm {
    fn from(r: Xmm) -> Self {
        Rm::Reg(r.encoding())
    }
}

impl From<Mem> for Rm {
    fn from(m: Mem) -> Self {
        Rm::Mem(m)
    }
}

impl Rm {
    fn index_high(&self) -> bool {
        matches!(self, Rm::Mem(Mem { index: Some(i), .. }) if i.high_bit())
    }

    fn base_high(&self) -> bool {
        match self {
            Rm::Reg(r) => *r >= 8,
            Rm::Mem(m) => m.base.high_bit(),
            Rm::Rip(_) => false,
        }
    }
}

/// ModR/M mod field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    Indirect = 0b00,
    IndirectDisp8 = 0b01,
    IndirectDisp32 = 0b10,
    Direct = 0b11,
}

#[inline]
pub const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// SIB byte with scale 1.
#[inline]
pub const fn sib(index: u8, base: u8) -> u8 {
    ((index & 0x7) << 3) | (base & 0x7)
}

// =============================================================================
// Condition Codes
// =============================================================================

/// Condition codes of `Jcc`, `SETcc` and `CMOVcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Parity = 0xA,
    NoParity = 0xB,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl Condition {
    #[inline]
    pub const fn invert(self) -> Condition {
        match self {
            Condition::Below => Condition::AboveEqual,
            Condition::AboveEqual => Condition::Below,
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::BelowEqual => Condition::Above,
            Condition::Above => Condition::BelowEqual,
            Condition::Parity => Condition::NoParity,
            Condition::NoParity => Condition::Parity,
            Condition::Less => Condition::GreaterEqual,
            Condition::GreaterEqual => Condition::Less,
            Condition::LessEqual => Condition::Greater,
            Condition::Greater => Condition::LessEqual,
        }
    }
}

/// Group-1 ALU operations: the `op r/m, r` opcode and the `/digit` of the
/// immediate forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    const fn opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::Or => 0x09,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
        }
    }

    const fn digit(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// Group-2 shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

// =============================================================================
// Assembler
// =============================================================================

/// Appends encoded instructions to a code buffer.
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

    /// ModR/M, SIB and displacement for `reg` and `rm`.
    fn modrm_tail(&mut self, reg: u8, rm: Rm) {
        match rm {
            Rm::Reg(r) => self.buf.emit_u8(modrm(Mod::Direct, reg, r)),
            Rm::Rip(target) => {
                self.buf.emit_u8(modrm(Mod::Indirect, reg, 0b101));
                let at = self.buf.position();
                self.buf.emit_bytes(&[0; 4]);
                self.buf.add_fixup(at, target, FixupKind::Rel32);
            }
            Rm::Mem(mem) => {
                let mod_field = if mem.disp == 0 && !mem.base.needs_displacement() {
                    Mod::Indirect
                } else if mem.disp_fits_i8() {
                    Mod::IndirectDisp8
                } else {
                    Mod::IndirectDisp32
                };
                match mem.index {
                    Some(index) => {
                        self.buf.emit_u8(modrm(mod_field, reg, 0b100));
                        self.buf.emit_u8(sib(index.low_bits(), mem.base.low_bits()));
                    }
                    None if mem.base.needs_sib_as_base() => {
                        self.buf.emit_u8(modrm(mod_field, reg, 0b100));
                        // No index: index field 100.
                        self.buf.emit_u8(sib(0b100, mem.base.low_bits()));
                    }
                    None => self.buf.emit_u8(modrm(mod_field, reg, mem.base.low_bits())),
                }
                match mod_field {
                    Mod::IndirectDisp8 => self.buf.emit_u8(mem.disp as i8 as u8),
                    Mod::IndirectDisp32 => self.buf.emit_bytes(&mem.disp.to_le_bytes()),
                    _ => {}
                }
            }
        }
    }

    /// Legacy-encoded instruction.
    pub fn op(&mut self, prefix: Option<u8>, w: bool, force_rex: bool, opcode: &[u8], reg: u8, rm: Rm) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        let r = reg >= 8;
        let x = rm.index_high();
        let b = rm.base_high();
        if w || r || x || b || force_rex {
            self.buf
                .emit_u8(0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8));
        }
        self.buf.emit_bytes(opcode);
        self.modrm_tail(reg, rm);
    }

    /// VEX-encoded instruction (three-byte form). `map` is 1 for `0F`, 2 for
    /// `0F38`; `pp` is 0, 1 (`66`), 2 (`F3`) or 3 (`F2`).
    #[allow(clippy::too_many_arguments)]
    pub fn vex(&mut self, map: u8, pp: u8, l256: bool, vvvv: u8, opcode: u8, reg: u8, rm: Rm) {
        let r_bar = (reg < 8) as u8;
        let x_bar = (!rm.index_high()) as u8;
        let b_bar = (!rm.base_high()) as u8;
        self.buf.emit_u8(0xC4);
        self.buf.emit_u8((r_bar << 7) | (x_bar << 6) | (b_bar << 5) | map);
        self.buf.emit_u8(((!vvvv & 0xF) << 3) | ((l256 as u8) << 2) | pp);
        self.buf.emit_u8(opcode);
        self.modrm_tail(reg, rm);
    }

    // =========================================================================
    // Data Movement
    // =========================================================================

    pub fn mov_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.op(None, w, false, &[0x89], src.encoding(), dst.into());
    }

    /// `mov dst, [src]` (32 or 64 bits).
    pub fn load(&mut self, w: bool, dst: Gpr, src: impl Into<Rm>) {
        self.op(None, w, false, &[0x8B], dst.encoding(), src.into());
    }

    /// `mov [dst], src` (32 or 64 bits).
    pub fn store(&mut self, w: bool, dst: Mem, src: Gpr) {
        self.op(None, w, false, &[0x89], src.encoding(), dst.into());
    }

    pub fn store8(&mut self, dst: Mem, src: Gpr) {
        self.op(None, false, src.byte_needs_rex(), &[0x88], src.encoding(), dst.into());
    }

    pub fn store16(&mut self, dst: Mem, src: Gpr) {
        self.op(Some(0x66), false, false, &[0x89], src.encoding(), dst.into());
    }

    /// `movzx dst, byte src`.
    pub fn movzx8(&mut self, w: bool, dst: Gpr, src: Rm) {
        let force = matches!(src, Rm::Reg(r) if (4..8).contains(&r));
        self.op(None, w, force, &[0x0F, 0xB6], dst.encoding(), src);
    }

    pub fn movsx8(&mut self, w: bool, dst: Gpr, src: Rm) {
        let force = matches!(src, Rm::Reg(r) if (4..8).contains(&r));
        self.op(None, w, force, &[0x0F, 0xBE], dst.encoding(), src);
    }

    pub fn movzx16(&mut self, w: bool, dst: Gpr, src: Rm) {
        self.op(None, w, false, &[0x0F, 0xB7], dst.encoding(), src);
    }

    pub fn movsx16(&mut self, w: bool, dst: Gpr, src: Rm) {
        self.op(None, w, false, &[0x0F, 0xBF], dst.encoding(), src);
    }

    /// `movsxd dst, dword src`.
    pub fn movsxd(&mut self, dst: Gpr, src: Rm) {
        self.op(None, true, false, &[0x63], dst.encoding(), src);
    }

    /// `mov size ptr [dst], imm`, sign-extended for 8-byte stores.
    pub fn mov_mi(&mut self, size: usize, dst: Mem, imm: i32) {
        match size {
            1 => {
                self.op(None, false, false, &[0xC6], 0, dst.into());
                self.buf.emit_u8(imm as u8);
            }
            2 => {
                self.op(Some(0x66), false, false, &[0xC7], 0, dst.into());
                self.buf.emit_bytes(&(imm as u16).to_le_bytes());
            }
            _ => {
                self.op(None, size == 8, false, &[0xC7], 0, dst.into());
                self.buf.emit_bytes(&imm.to_le_bytes());
            }
        }
    }

    /// `mov dst32, imm32`; zero-extends into the upper half.
    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        if dst.high_bit() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xB8 + dst.low_bits());
        self.buf.emit_bytes(&imm.to_le_bytes());
    }

    /// Load `value` into `dst` with the shortest encoding.
    pub fn mov_ri64(&mut self, dst: Gpr, value: i64) {
        if let Ok(imm) = u32::try_from(value) {
            self.mov_ri32(dst, imm);
        } else if let Ok(imm) = i32::try_from(value) {
            self.op(None, true, false, &[0xC7], 0, dst.into());
            self.buf.emit_bytes(&imm.to_le_bytes());
        } else {
            self.buf.emit_u8(0x48 | (dst.high_bit() as u8));
            self.buf.emit_u8(0xB8 + dst.low_bits());
            self.buf.emit_bytes(&value.to_le_bytes());
        }
    }

    pub fn lea(&mut self, dst: Gpr, src: Mem) {
        self.op(None, true, false, &[0x8D], dst.encoding(), src.into());
    }

    pub fn push(&mut self, src: Gpr) {
        if src.high_bit() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + src.low_bits());
    }

    pub fn pop(&mut self, dst: Gpr) {
        if dst.high_bit() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + dst.low_bits());
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    pub fn alu_rr(&mut self, op: AluOp, w: bool, dst: Gpr, src: Gpr) {
        self.op(None, w, false, &[op.opcode()], src.encoding(), dst.into());
    }

    pub fn alu_ri(&mut self, op: AluOp, w: bool, dst: Gpr, imm: i32) {
        if let Ok(imm8) = i8::try_from(imm) {
            self.op(None, w, false, &[0x83], op.digit(), dst.into());
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.op(None, w, false, &[0x81], op.digit(), dst.into());
            self.buf.emit_bytes(&imm.to_le_bytes());
        }
    }

    /// `cmp dst, [src]`.
    pub fn cmp_rm(&mut self, w: bool, dst: Gpr, src: Mem) {
        self.op(None, w, false, &[0x3B], dst.encoding(), src.into());
    }

    pub fn test_rr(&mut self, w: bool, a: Gpr, b: Gpr) {
        self.op(None, w, false, &[0x85], b.encoding(), a.into());
    }

    pub fn test_ri(&mut self, w: bool, a: Gpr, imm: i32) {
        self.op(None, w, false, &[0xF7], 0, a.into());
        self.buf.emit_bytes(&imm.to_le_bytes());
    }

    /// `test [mem], eax`; faults on a bad address without changing state.
    pub fn test_mem(&mut self, mem: Mem) {
        self.op(None, false, false, &[0x85], Gpr::Rax.encoding(), mem.into());
    }

    pub fn imul_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.op(None, w, false, &[0x0F, 0xAF], dst.encoding(), src.into());
    }

    pub fn imul_rri(&mut self, w: bool, dst: Gpr, src: Gpr, imm: i32) {
        self.op(None, w, false, &[0x69], dst.encoding(), src.into());
        self.buf.emit_bytes(&imm.to_le_bytes());
    }

    pub fn shift_ri(&mut self, op: ShiftOp, w: bool, dst: Gpr, imm: u8) {
        self.op(None, w, false, &[0xC1], op as u8, dst.into());
        self.buf.emit_u8(imm);
    }

    pub fn shift_cl(&mut self, op: ShiftOp, w: bool, dst: Gpr) {
        self.op(None, w, false, &[0xD3], op as u8, dst.into());
    }

    pub fn neg(&mut self, w: bool, dst: Gpr) {
        self.op(None, w, false, &[0xF7], 3, dst.into());
    }

    pub fn not(&mut self, w: bool, dst: Gpr) {
        self.op(None, w, false, &[0xF7], 2, dst.into());
    }

    pub fn setcc(&mut self, cond: Condition, dst: Gpr) {
        self.op(None, false, dst.byte_needs_rex(), &[0x0F, 0x90 + cond as u8], 0, dst.into());
    }

    pub fn cmov(&mut self, cond: Condition, w: bool, dst: Gpr, src: Gpr) {
        self.op(None, w, false, &[0x0F, 0x40 + cond as u8], dst.encoding(), src.into());
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    pub fn jcc(&mut self, cond: Condition, target: Label) {
        self.buf.emit_bytes(&[0x0F, 0x80 + cond as u8]);
        let at = self.buf.position();
        self.buf.emit_bytes(&[0; 4]);
        self.buf.add_fixup(at, FixupTarget::Label(target), FixupKind::Rel32);
    }

    pub fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        let at = self.buf.position();
        self.buf.emit_bytes(&[0; 4]);
        self.buf.add_fixup(at, FixupTarget::Label(target), FixupKind::Rel32);
    }

    /// `call rel32` to an external symbol. Returns the return address.
    pub fn call_symbol(&mut self, name: &str, relocation: u16) -> u32 {
        self.buf.emit_u8(0xE8);
        let at = self.buf.position();
        self.buf.emit_bytes(&[0; 4]);
        self.buf.relocate(at, name, relocation);
        self.buf.position()
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn ud2(&mut self) {
        self.buf.emit_bytes(&[0x0F, 0x0B]);
    }

    /// `lock add dword [rsp], 0`: a full fence.
    pub fn lock_add_rsp_zero(&mut self) {
        self.op(Some(0xF0), false, false, &[0x83], 0, Mem::base_disp(Gpr::Rsp, 0).into());
        self.buf.emit_u8(0);
    }

    // =========================================================================
    // SSE / AVX
    // =========================================================================

    /// `movsd` / `movss` between registers or from memory.
    pub fn movs_load(&mut self, double: bool, dst: Xmm, src: impl Into<Rm>) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.op(Some(prefix), false, false, &[0x0F, 0x10], dst.encoding(), src.into());
    }

    pub fn movs_store(&mut self, double: bool, dst: Mem, src: Xmm) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.op(Some(prefix), false, false, &[0x0F, 0x11], src.encoding(), dst.into());
    }

    /// `ucomisd` / `ucomiss a, b`.
    pub fn ucomis(&mut self, double: bool, a: Xmm, b: Xmm) {
        let prefix = if double { Some(0x66) } else { None };
        self.op(prefix, false, false, &[0x0F, 0x2E], a.encoding(), b.into());
    }

    pub fn xorps(&mut self, dst: Xmm, src: Xmm) {
        self.op(None, false, false, &[0x0F, 0x57], dst.encoding(), src.into());
    }

    /// `movq xmm, r64`.
    pub fn movq_to_xmm(&mut self, dst: Xmm, src: Gpr) {
        self.op(Some(0x66), true, false, &[0x0F, 0x6E], dst.encoding(), src.into());
    }

    pub fn movdqu_load(&mut self, dst: Xmm, src: Mem) {
        self.op(Some(0xF3), false, false, &[0x0F, 0x6F], dst.encoding(), src.into());
    }

    pub fn pxor(&mut self, dst: Xmm, src: Xmm) {
        self.op(Some(0x66), false, false, &[0x0F, 0xEF], dst.encoding(), src.into());
    }

    pub fn ptest(&mut self, a: Xmm, b: Xmm) {
        self.op(Some(0x66), false, false, &[0x0F, 0x38, 0x17], a.encoding(), b.into());
    }

    pub fn vmovdqu_load(&mut self, dst: Xmm, src: Mem) {
        self.vex(1, 2, true, 0, 0x6F, dst.encoding(), src.into());
    }

    pub fn vpxor(&mut self, dst: Xmm, a: Xmm, b: Xmm) {
        self.vex(1, 1, true, a.encoding(), 0xEF, dst.encoding(), b.into());
    }

    pub fn vptest(&mut self, a: Xmm, b: Xmm) {
        self.vex(2, 1, true, 0, 0x17, a.encoding(), b.into());
    }

    pub fn vzeroupper(&mut self) {
        self.buf.emit_bytes(&[0xC5, 0xF8, 0x77]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;

    fn encode(f: impl FnOnce(&mut Assembler<'_>)) -> Vec<u8> {
        let mut buf = CodeBuffer::new(Target::Amd64);
        f(&mut Assembler::new(&mut buf));
        buf.code().to_vec()
    }

    #[test]
    fn test_register_moves() {
        assert_eq!(encode(|a| a.mov_rr(true, Gpr::Rax, Gpr::Rcx)), [0x48, 0x89, 0xC8]);
        assert_eq!(encode(|a| a.mov_rr(true, Gpr::R8, Gpr::Rax)), [0x49, 0x89, 0xC0]);
        assert_eq!(encode(|a| a.mov_rr(false, Gpr::Rdx, Gpr::Rbx)), [0x89, 0xDA]);
    }

    #[test]
    fn test_memory_forms() {
        // mov rax, [rsp + 8]
        assert_eq!(
            encode(|a| a.load(true, Gpr::Rax, Mem::base_disp(Gpr::Rsp, 8))),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // mov [rbp], rcx needs a zero displacement
        assert_eq!(
            encode(|a| a.store(true, Mem::base_disp(Gpr::Rbp, 0), Gpr::Rcx)),
            [0x48, 0x89, 0x4D, 0x00]
        );
        // lea r10, [r13 + 0x100]
        assert_eq!(
            encode(|a| a.lea(Gpr::R10, Mem::base_disp(Gpr::R13, 0x100))),
            [0x4D, 0x8D, 0x95, 0x00, 0x01, 0x00, 0x00]
        );
        // mov rax, [rdi + rsi + 4]
        assert_eq!(
            encode(|a| a.load(true, Gpr::Rax, Mem::base_index_disp(Gpr::Rdi, Gpr::Rsi, 4))),
            [0x48, 0x8B, 0x44, 0x37, 0x04]
        );
    }

    #[test]
    fn test_immediates() {
        assert_eq!(encode(|a| a.alu_ri(AluOp::Add, true, Gpr::Rax, 1)), [0x48, 0x83, 0xC0, 0x01]);
        assert_eq!(
            encode(|a| a.alu_ri(AluOp::Cmp, false, Gpr::Rcx, 1000)),
            [0x81, 0xF9, 0xE8, 0x03, 0x00, 0x00]
        );
        assert_eq!(encode(|a| a.mov_ri64(Gpr::Rax, 5)), [0xB8, 5, 0, 0, 0]);
        assert_eq!(encode(|a| a.mov_ri64(Gpr::Rax, -1)), [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(encode(|a| a.mov_ri64(Gpr::R9, 1 << 40)).len(), 10);
    }

    #[test]
    fn test_byte_register_rex() {
        // sete sil
        assert_eq!(encode(|a| a.setcc(Condition::Equal, Gpr::Rsi)), [0x40, 0x0F, 0x94, 0xC6]);
        assert_eq!(encode(|a| a.setcc(Condition::Equal, Gpr::Rax)), [0x0F, 0x94, 0xC0]);
    }

    #[test]
    fn test_vector_forms() {
        // pxor xmm1, xmm2
        assert_eq!(encode(|a| a.pxor(Xmm::new(1).unwrap(), Xmm::new(2).unwrap())), [0x66, 0x0F, 0xEF, 0xCA]);
        // vptest ymm0, ymm0
        assert_eq!(
            encode(|a| a.vptest(Xmm::XMM0, Xmm::XMM0)),
            [0xC4, 0xE2, 0x7D, 0x17, 0xC0]
        );
        assert_eq!(encode(|a| a.vzeroupper()), [0xC5, 0xF8, 0x77]);
    }
}
