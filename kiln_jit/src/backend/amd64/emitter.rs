//! AMD64 code emission.
//!
//! Frame layout after the prologue (`push rbp; mov rbp, rsp; sub rsp, N`):
//! every frame slot is addressed `[rsp + offset]` as laid out by the
//! [`FrameMap`]. Incoming arguments and outgoing call arguments pass through
//! the staging words at the bottom of the frame, so moving them between
//! convention registers and allocated locations never needs a parallel
//! move resolver.

use super::encoder::{AluOp, Assembler, Condition, Mem, Rm, ShiftOp};
use super::registers::{Gpr, Xmm, ARG_GPRS, ARG_XMMS, FRAME_POINTER, RETURN_GPR, RETURN_XMM, SCRATCH};
use super::RELOC_REL32;
use crate::backend::{emit_blocks, InstructionEmitter, Target};
use crate::emit::{CodeBuffer, CompilationResult, FixupTarget, InfopointReason, Label};
use crate::ir::cfg::BlockId;
use crate::ir::kinds::{BinaryOp, CompareOp, MemoryBarriers};
use crate::lir::instruction::{ConvertOp, LirFrameState, LirInstruction, LirOp, UnaryOp};
use crate::lir::value::{AddressBase, RegisterCategory, StackSlot, Value};
use crate::lir::{FrameMap, Lir};
use kiln_core::{Constant, KilnError, KilnResult, ValueKind};
use rustc_hash::FxHashMap;

/// Emit allocated LIR as AMD64 machine code.
pub fn emit(lir: &Lir, frame: &FrameMap) -> KilnResult<CompilationResult> {
    let mut buf = CodeBuffer::new(Target::Amd64);
    let labels: FxHashMap<BlockId, Label> = lir.blocks().iter().map(|b| (b.id, buf.new_label())).collect();
    {
        let mut emitter = Amd64Emitter {
            asm: Assembler::new(&mut buf),
            frame,
            labels,
        };
        emitter.prologue()?;
        emit_blocks(&mut emitter, lir)?;
    }
    buf.finish(Target::Amd64, frame.frame_size())
}

pub(super) struct Amd64Emitter<'a> {
    pub(super) asm: Assembler<'a>,
    frame: &'a FrameMap,
    labels: FxHashMap<BlockId, Label>,
}

#[inline]
fn is_wide(kind: ValueKind) -> bool {
    matches!(kind, ValueKind::Long | ValueKind::Object)
}

fn unsupported(inst: &LirInstruction) -> KilnError {
    KilnError::emission(format!("`{inst}` is not supported on amd64"))
}

impl Amd64Emitter<'_> {
    // =========================================================================
    // Operands
    // =========================================================================

    pub(super) fn gpr(&self, value: Value) -> KilnResult<Gpr> {
        match value {
            Value::Register(r, _) => Gpr::from_register(r),
            other => Err(KilnError::emission(format!("expected a general register, got {other}"))),
        }
    }

    pub(super) fn xmm(&self, value: Value) -> KilnResult<Xmm> {
        match value {
            Value::Register(r, _) => Xmm::from_register(r),
            other => Err(KilnError::emission(format!("expected an xmm register, got {other}"))),
        }
    }

    fn slot(&self, value: Value) -> KilnResult<Mem> {
        match value {
            Value::StackSlot(s) => Ok(Mem::base_disp(Gpr::Rsp, s.offset)),
            other => Err(KilnError::emission(format!("expected a stack slot, got {other}"))),
        }
    }

    fn address(&self, value: Value) -> KilnResult<Mem> {
        match value {
            Value::Address(a) => match a.base {
                AddressBase::Register(r) => Ok(Mem::base_disp(Gpr::from_register(r)?, a.displacement)),
                AddressBase::Variable(v) => Err(KilnError::emission(format!("unallocated address base {v}"))),
            },
            other => Err(KilnError::emission(format!("expected an address, got {other}"))),
        }
    }

    fn label(&self, block: BlockId) -> KilnResult<Label> {
        self.labels
            .get(&block)
            .copied()
            .ok_or_else(|| KilnError::emission(format!("no label for block {block}")))
    }

    fn imm32(constant: Constant) -> KilnResult<i32> {
        let bits = match constant {
            Constant::Null => 0,
            Constant::Int(v) => v as i64,
            Constant::Long(v) => v,
            Constant::Float(bits) => bits as i32 as i64,
            Constant::Double(bits) => bits as i64,
            Constant::Object(_) => {
                return Err(KilnError::emission("object constants have no immediate form"));
            }
        };
        i32::try_from(bits).map_err(|_| KilnError::emission(format!("{constant} does not fit an imm32")))
    }

    fn staging(&self, index: usize, kind: ValueKind) -> KilnResult<Value> {
        Ok(Value::StackSlot(self.frame.staging_slot(index as u32, kind)?))
    }

    // =========================================================================
    // Moves
    // =========================================================================

    fn is_float_register(value: &Value) -> bool {
        matches!(value, Value::Register(r, _) if r.category == RegisterCategory::Float)
    }

    /// Transfer between any two locations, through `r10` for memory to
    /// memory.
    fn move_value(&mut self, dst: Value, src: Value) -> KilnResult<()> {
        match (dst, src) {
            (_, Value::Constant(c)) => self.load_constant(dst, c),
            (Value::Register(..), Value::Address(_)) => {
                let d = self.gpr(dst)?;
                let m = self.address(src)?;
                self.asm.lea(d, m);
                Ok(())
            }
            (Value::Register(d, _), Value::Register(s, _)) => {
                if d == s {
                    return Ok(());
                }
                let double = src.kind() != ValueKind::Float;
                match (Self::is_float_register(&dst), Self::is_float_register(&src)) {
                    (false, false) => self.asm.mov_rr(true, Gpr::from_register(d)?, Gpr::from_register(s)?),
                    (true, true) => self.asm.movs_load(double, Xmm::from_register(d)?, Xmm::from_register(s)?),
                    (true, false) => self.asm.movq_to_xmm(Xmm::from_register(d)?, Gpr::from_register(s)?),
                    (false, true) => {
                        // movq r64, xmm
                        let (x, g) = (Xmm::from_register(s)?, Gpr::from_register(d)?);
                        self.asm.op(Some(0x66), true, false, &[0x0F, 0x7E], x.encoding(), g.into());
                    }
                }
                Ok(())
            }
            (Value::Register(..), Value::StackSlot(_)) => {
                let m = self.slot(src)?;
                if Self::is_float_register(&dst) {
                    self.asm.movs_load(dst.kind() != ValueKind::Float, self.xmm(dst)?, m);
                } else {
                    self.asm.load(true, self.gpr(dst)?, m);
                }
                Ok(())
            }
            (Value::StackSlot(_), Value::Register(..)) => {
                let m = self.slot(dst)?;
                if Self::is_float_register(&src) {
                    self.asm.movs_store(src.kind() != ValueKind::Float, m, self.xmm(src)?);
                } else {
                    self.asm.store(true, m, self.gpr(src)?);
                }
                Ok(())
            }
            (Value::StackSlot(_), Value::StackSlot(_)) => {
                let (d, s) = (self.slot(dst)?, self.slot(src)?);
                self.asm.load(true, SCRATCH[0], s);
                self.asm.store(true, d, SCRATCH[0]);
                Ok(())
            }
            _ => Err(KilnError::emission(format!("cannot move {src} to {dst}"))),
        }
    }

    fn load_constant(&mut self, dst: Value, constant: Constant) -> KilnResult<()> {
        match dst {
            Value::Register(..) if Self::is_float_register(&dst) => {
                let x = self.xmm(dst)?;
                if constant.is_default() {
                    self.asm.xorps(x, x);
                } else {
                    let offset = self.asm.buffer().data_constant(constant);
                    let double = constant.kind() == ValueKind::Double;
                    self.asm.movs_load(double, x, Rm::Rip(FixupTarget::Data(offset)));
                }
            }
            Value::Register(..) => {
                let d = self.gpr(dst)?;
                let value = match constant {
                    Constant::Int(v) => v as u32 as i64,
                    Constant::Float(bits) => bits as i64,
                    Constant::Object(handle) | Constant::Double(handle) => handle as i64,
                    other => other.as_i64(),
                };
                self.asm.mov_ri64(d, value);
            }
            Value::StackSlot(_) => {
                let m = self.slot(dst)?;
                let size = constant.table_size();
                match Self::imm32(constant) {
                    Ok(imm) => self.asm.mov_mi(size, m, imm),
                    Err(_) => {
                        self.load_constant(SCRATCH[0].reg().as_value(ValueKind::Long), constant)?;
                        self.asm.store(true, m, SCRATCH[0]);
                    }
                }
            }
            other => return Err(KilnError::emission(format!("cannot load a constant into {other}"))),
        }
        Ok(())
    }

    // =========================================================================
    // Frame
    // =========================================================================

    fn prologue(&mut self) -> KilnResult<()> {
        self.asm.push(FRAME_POINTER);
        self.asm.mov_rr(true, FRAME_POINTER, Gpr::Rsp);
        let size = self.frame.frame_size();
        if size > 0 {
            self.asm.alu_ri(AluOp::Sub, true, Gpr::Rsp, size as i32);
        }
        for &(reg, offset) in self.frame.callee_saves() {
            let slot = Value::StackSlot(StackSlot {
                offset,
                kind: ValueKind::Long,
            });
            self.move_value(slot, reg.as_value(ValueKind::Long))?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> KilnResult<()> {
        for &(reg, offset) in self.frame.callee_saves() {
            let slot = Value::StackSlot(StackSlot {
                offset,
                kind: ValueKind::Long,
            });
            self.move_value(reg.as_value(ValueKind::Long), slot)?;
        }
        self.asm.mov_rr(true, Gpr::Rsp, FRAME_POINTER);
        self.asm.pop(FRAME_POINTER);
        self.asm.ret();
        Ok(())
    }

    /// Convention register for each value in order.
    fn convention_registers(values: &[Value]) -> KilnResult<Vec<Value>> {
        let (mut general, mut float) = (0, 0);
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            let kind = value.kind();
            let reg = if kind.is_float() {
                float += 1;
                ARG_XMMS.get(float - 1).map(|x| x.reg())
            } else {
                general += 1;
                ARG_GPRS.get(general - 1).map(|g| g.reg())
            };
            let reg = reg.ok_or_else(|| KilnError::emission(format!("{} arguments exceed the registers", values.len())))?;
            out.push(reg.as_value(kind));
        }
        Ok(out)
    }

    fn incoming(&mut self, inst: &LirInstruction) -> KilnResult<()> {
        let defs: Vec<Value> = inst.operands.iter().map(|o| o.value).collect();
        let sources = Self::convention_registers(&defs)?;
        for (i, src) in sources.iter().enumerate() {
            let staging = self.staging(i, src.kind())?;
            self.move_value(staging, *src)?;
        }
        for (i, dst) in defs.iter().enumerate() {
            let staging = self.staging(i, dst.kind())?;
            self.move_value(*dst, staging)?;
        }
        Ok(())
    }

    fn foreign_call(&mut self, inst: &LirInstruction, name: &str) -> KilnResult<()> {
        let result = inst.value(0);
        let args: Vec<Value> = inst.operands.iter().skip(1).map(|o| o.value).collect();
        for (i, arg) in args.iter().enumerate() {
            let staging = self.staging(i, arg.kind())?;
            self.move_value(staging, *arg)?;
        }
        let registers = Self::convention_registers(&args)?;
        for (i, reg) in registers.iter().enumerate() {
            let staging = self.staging(i, reg.kind())?;
            self.move_value(*reg, staging)?;
        }
        let return_address = self.asm.call_symbol(name, RELOC_REL32);
        self.record(return_address, InfopointReason::Call, inst.state.as_ref());
        if !result.is_illegal() {
            let from = if result.kind().is_float() {
                RETURN_XMM.reg()
            } else {
                RETURN_GPR.reg()
            };
            self.move_value(result, from.as_value(result.kind()))?;
        }
        Ok(())
    }

    fn record(&mut self, pc: u32, reason: InfopointReason, state: Option<&LirFrameState>) {
        if let Some(state) = state {
            self.asm
                .buffer()
                .infopoint(pc, reason, state.deopt, state.position.clone());
        }
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// Jump to `t` on `cond`, else to `f`, falling through to `next`.
    fn branch_on(&mut self, cond: Condition, t: BlockId, f: BlockId, next: Option<BlockId>) -> KilnResult<()> {
        let (tl, fl) = (self.label(t)?, self.label(f)?);
        if next == Some(t) {
            self.asm.jcc(cond.invert(), fl);
        } else {
            self.asm.jcc(cond, tl);
            if next != Some(f) {
                self.asm.jmp(fl);
            }
        }
        Ok(())
    }

    /// Set flags for an integer comparison and return the condition that
    /// holds when it is true.
    fn integer_compare(&mut self, op: CompareOp, bits: u32, x: Value, y: Value) -> KilnResult<Condition> {
        let w = bits == 64;
        let x = self.gpr(x)?;
        let test = op == CompareOp::IntegerTest;
        match y {
            Value::Constant(c) => {
                let imm = Self::imm32(c)?;
                if test {
                    self.asm.test_ri(w, x, imm);
                } else {
                    self.asm.alu_ri(AluOp::Cmp, w, x, imm);
                }
            }
            _ => {
                let y = self.gpr(y)?;
                if test {
                    self.asm.test_rr(w, x, y);
                } else {
                    self.asm.alu_rr(AluOp::Cmp, w, x, y);
                }
            }
        }
        match op {
            CompareOp::IntegerEquals | CompareOp::ObjectEquals | CompareOp::IntegerTest => Ok(Condition::Equal),
            CompareOp::IntegerLessThan => Ok(Condition::Less),
            CompareOp::IntegerBelow => Ok(Condition::Below),
            CompareOp::FloatEquals | CompareOp::FloatLessThan => {
                Err(KilnError::emission(format!("{op:?} is not an integer comparison")))
            }
        }
    }

    fn branch(&mut self, inst: &LirInstruction, next: Option<BlockId>) -> KilnResult<()> {
        let LirOp::Branch {
            op,
            bits,
            true_target,
            false_target,
            ..
        } = inst.op
        else {
            return Err(unsupported(inst));
        };
        let (x, y) = (inst.value(0), inst.value(1));
        match op {
            CompareOp::FloatEquals => {
                let double = x.kind() == ValueKind::Double;
                self.asm.ucomis(double, self.xmm(x)?, self.xmm(y)?);
                // Unordered is not equal.
                let fl = self.label(false_target)?;
                self.asm.jcc(Condition::Parity, fl);
                self.branch_on(Condition::Equal, true_target, false_target, next)
            }
            CompareOp::FloatLessThan => {
                let double = x.kind() == ValueKind::Double;
                // y > x leaves CF and ZF clear; unordered sets both.
                self.asm.ucomis(double, self.xmm(y)?, self.xmm(x)?);
                self.branch_on(Condition::Above, true_target, false_target, next)
            }
            _ => {
                let cond = self.integer_compare(op, bits, x, y)?;
                self.branch_on(cond, true_target, false_target, next)
            }
        }
    }

    fn compare_set(&mut self, inst: &LirInstruction, op: CompareOp, bits: u32) -> KilnResult<()> {
        let dst = self.gpr(inst.value(0))?;
        let (x, y) = (inst.value(1), inst.value(2));
        match op {
            CompareOp::FloatEquals => {
                let double = x.kind() == ValueKind::Double;
                let skip = self.asm.buffer().new_label();
                self.asm.mov_ri32(dst, 0);
                self.asm.ucomis(double, self.xmm(x)?, self.xmm(y)?);
                self.asm.jcc(Condition::Parity, skip);
                self.asm.jcc(Condition::NotEqual, skip);
                self.asm.mov_ri32(dst, 1);
                self.asm.buffer().bind(skip)?;
            }
            CompareOp::FloatLessThan => {
                let double = x.kind() == ValueKind::Double;
                self.asm.ucomis(double, self.xmm(y)?, self.xmm(x)?);
                self.asm.setcc(Condition::Above, dst);
                self.asm.movzx8(false, dst, dst.into());
            }
            _ => {
                let cond = self.integer_compare(op, bits, x, y)?;
                self.asm.setcc(cond, dst);
                self.asm.movzx8(false, dst, dst.into());
            }
        }
        Ok(())
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn binary(&mut self, inst: &LirInstruction, op: BinaryOp, bits: u32) -> KilnResult<()> {
        let w = bits == 64;
        let dst = self.gpr(inst.value(0))?;
        let x = self.gpr(inst.value(1))?;
        let y = inst.value(2);
        let alu = match op {
            BinaryOp::Add => Some(AluOp::Add),
            BinaryOp::Sub => Some(AluOp::Sub),
            BinaryOp::And => Some(AluOp::And),
            BinaryOp::Or => Some(AluOp::Or),
            BinaryOp::Xor => Some(AluOp::Xor),
            _ => None,
        };
        if let Some(alu) = alu {
            if dst != x {
                self.asm.mov_rr(true, dst, x);
            }
            match y {
                Value::Constant(c) => self.asm.alu_ri(alu, w, dst, Self::imm32(c)?),
                _ => self.asm.alu_rr(alu, w, dst, self.gpr(y)?),
            }
            return Ok(());
        }
        if op == BinaryOp::Mul {
            match y {
                Value::Constant(c) => self.asm.imul_rri(w, dst, x, Self::imm32(c)?),
                _ => {
                    if dst != x {
                        self.asm.mov_rr(true, dst, x);
                    }
                    self.asm.imul_rr(w, dst, self.gpr(y)?);
                }
            }
            return Ok(());
        }
        let shift = match op {
            BinaryOp::Shl => ShiftOp::Shl,
            BinaryOp::Shr => ShiftOp::Sar,
            _ => ShiftOp::Shr,
        };
        match y {
            Value::Constant(c) => {
                if dst != x {
                    self.asm.mov_rr(true, dst, x);
                }
                let mask = if w { 63 } else { 31 };
                self.asm.shift_ri(shift, w, dst, (c.as_i64() & mask) as u8);
            }
            _ => self.variable_shift(shift, w, dst, x, self.gpr(y)?),
        }
        Ok(())
    }

    /// Shift by a register count. The count must be in `cl`; operands are
    /// parked on the stack so any of them may be `rcx` or a scratch
    /// register.
    fn variable_shift(&mut self, op: ShiftOp, w: bool, dst: Gpr, x: Gpr, y: Gpr) {
        let work = SCRATCH[1];
        self.asm.push(x);
        self.asm.push(y);
        self.asm.push(Gpr::Rcx);
        self.asm.load(true, Gpr::Rcx, Mem::base_disp(Gpr::Rsp, 8));
        self.asm.load(true, work, Mem::base_disp(Gpr::Rsp, 16));
        self.asm.shift_cl(op, w, work);
        if dst == Gpr::Rcx {
            self.asm.alu_ri(AluOp::Add, true, Gpr::Rsp, 8);
        } else {
            self.asm.pop(Gpr::Rcx);
        }
        self.asm.alu_ri(AluOp::Add, true, Gpr::Rsp, 16);
        if dst != work {
            self.asm.mov_rr(true, dst, work);
        }
    }

    fn convert(&mut self, inst: &LirInstruction, op: ConvertOp) -> KilnResult<()> {
        let dst = self.gpr(inst.value(0))?;
        let src: Rm = self.gpr(inst.value(1))?.into();
        let x = self.gpr(inst.value(1))?;
        match op {
            ConvertOp::Narrow { bits: 8 } => self.asm.movsx8(false, dst, src),
            ConvertOp::Narrow { bits: 16 } => self.asm.movsx16(false, dst, src),
            ConvertOp::Narrow { bits: 32 } => self.asm.mov_rr(false, dst, x),
            ConvertOp::Narrow { .. } => self.asm.mov_rr(true, dst, x),
            ConvertOp::SignExtend { from: 8, to } => self.asm.movsx8(to == 64, dst, src),
            ConvertOp::SignExtend { from: 16, to } => self.asm.movsx16(to == 64, dst, src),
            ConvertOp::SignExtend { from: 32, to: 64 } => self.asm.movsxd(dst, src),
            ConvertOp::SignExtend { from: 32, .. } => self.asm.mov_rr(false, dst, x),
            ConvertOp::SignExtend { .. } => self.asm.mov_rr(true, dst, x),
            ConvertOp::ZeroExtend { from: 8, .. } => self.asm.movzx8(false, dst, src),
            ConvertOp::ZeroExtend { from: 16, .. } => self.asm.movzx16(false, dst, src),
            ConvertOp::ZeroExtend { from: 32, .. } => self.asm.mov_rr(false, dst, x),
            ConvertOp::ZeroExtend { .. } => self.asm.mov_rr(true, dst, x),
        }
        Ok(())
    }

    fn select(&mut self, inst: &LirInstruction) -> KilnResult<()> {
        let (dst, cond, t, f) = (inst.value(0), inst.value(1), inst.value(2), inst.value(3));
        let c = self.gpr(cond)?;
        if Self::is_float_register(&dst) {
            let double = dst.kind() != ValueKind::Float;
            let skip = self.asm.buffer().new_label();
            self.asm.movs_load(double, self.xmm(dst)?, self.xmm(f)?);
            self.asm.test_rr(false, c, c);
            self.asm.jcc(Condition::Equal, skip);
            self.asm.movs_load(double, self.xmm(dst)?, self.xmm(t)?);
            self.asm.buffer().bind(skip)?;
        } else {
            let d = self.gpr(dst)?;
            self.asm.mov_rr(true, d, self.gpr(f)?);
            self.asm.test_rr(false, c, c);
            self.asm.cmov(Condition::NotEqual, true, d, self.gpr(t)?);
        }
        Ok(())
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn load(&mut self, inst: &LirInstruction, size: usize, signed: bool) -> KilnResult<()> {
        let dst = inst.value(0);
        let m = self.address(inst.value(1))?;
        if Self::is_float_register(&dst) {
            self.asm.movs_load(size == 8, self.xmm(dst)?, m);
            return Ok(());
        }
        let d = self.gpr(dst)?;
        let w = is_wide(dst.kind());
        match (size, signed) {
            (1, true) => self.asm.movsx8(w, d, m.into()),
            (1, false) => self.asm.movzx8(false, d, m.into()),
            (2, true) => self.asm.movsx16(w, d, m.into()),
            (2, false) => self.asm.movzx16(false, d, m.into()),
            (4, true) if w => self.asm.movsxd(d, m.into()),
            (4, _) => self.asm.load(false, d, m),
            _ => self.asm.load(true, d, m),
        }
        Ok(())
    }

    fn store(&mut self, inst: &LirInstruction, size: usize) -> KilnResult<()> {
        let m = self.address(inst.value(0))?;
        let value = inst.value(1);
        match value {
            Value::Constant(c) => self.asm.mov_mi(size, m, Self::imm32(c)?),
            _ if Self::is_float_register(&value) => self.asm.movs_store(size == 8, m, self.xmm(value)?),
            _ => {
                let r = self.gpr(value)?;
                match size {
                    1 => self.asm.store8(m, r),
                    2 => self.asm.store16(m, r),
                    4 => self.asm.store(false, m, r),
                    _ => self.asm.store(true, m, r),
                }
            }
        }
        Ok(())
    }
}

impl InstructionEmitter for Amd64Emitter<'_> {
    fn emit_instruction(&mut self, inst: &LirInstruction, next: Option<BlockId>) -> KilnResult<()> {
        match &inst.op {
            LirOp::Label(block) => {
                let label = self.label(*block)?;
                self.asm.buffer().bind(label)?;
            }
            LirOp::Incoming => self.incoming(inst)?,
            LirOp::Jump(target) => {
                if next != Some(*target) {
                    let label = self.label(*target)?;
                    self.asm.jmp(label);
                }
            }
            LirOp::Branch { .. } => self.branch(inst, next)?,
            LirOp::Move => self.move_value(inst.value(0), inst.value(1))?,
            LirOp::StackMove => {
                let (dst, src) = (self.slot(inst.value(0))?, self.slot(inst.value(1))?);
                let scratch = inst.value(2);
                if Self::is_float_register(&scratch) {
                    let x = self.xmm(scratch)?;
                    self.asm.movs_load(true, x, src);
                    self.asm.movs_store(true, dst, x);
                } else {
                    let r = self.gpr(scratch)?;
                    self.asm.load(true, r, src);
                    self.asm.store(true, dst, r);
                }
            }
            LirOp::LoadConstant(c) => self.load_constant(inst.value(0), *c)?,
            LirOp::LoadConstantFromTable(c) => {
                let dst = inst.value(0);
                let offset = self.asm.buffer().data_constant(*c);
                let source = Rm::Rip(FixupTarget::Data(offset));
                if Self::is_float_register(&dst) {
                    self.asm.movs_load(c.kind() == ValueKind::Double, self.xmm(dst)?, source);
                } else {
                    self.asm.load(c.table_size() == 8, self.gpr(dst)?, source);
                }
            }
            LirOp::LoadAddress => {
                let (d, m) = (self.gpr(inst.value(0))?, self.address(inst.value(1))?);
                self.asm.lea(d, m);
            }
            LirOp::StackBlockAddress => {
                let (d, m) = (self.gpr(inst.value(0))?, self.slot(inst.value(1))?);
                self.asm.lea(d, m);
            }
            LirOp::Load(access) => self.load(inst, access.size.bytes(), access.signed)?,
            LirOp::Store(access) => self.store(inst, access.size.bytes())?,
            LirOp::Binary { op, bits } => self.binary(inst, *op, *bits)?,
            LirOp::Unary { op, bits } => {
                let (d, x) = (self.gpr(inst.value(0))?, self.gpr(inst.value(1))?);
                if d != x {
                    self.asm.mov_rr(true, d, x);
                }
                match op {
                    UnaryOp::Negate => self.asm.neg(*bits == 64, d),
                    UnaryOp::Not => self.asm.not(*bits == 64, d),
                }
            }
            LirOp::Convert(op) => self.convert(inst, *op)?,
            LirOp::CompareSet { op, bits } => self.compare_set(inst, *op, *bits)?,
            LirOp::Select => self.select(inst)?,
            LirOp::Membar(barriers) => {
                // Only store-load ordering needs a fence under TSO.
                if barriers.contains(MemoryBarriers::STORE_LOAD) {
                    self.asm.lock_add_rsp_zero();
                }
            }
            LirOp::NullCheck => {
                let m = self.address(inst.value(0))?;
                let pc = self.asm.position();
                self.asm.test_mem(m);
                if let Some(state) = &inst.state {
                    self.asm.buffer().exception_site(pc, state.deopt);
                }
                self.record(pc, InfopointReason::ImplicitException, inst.state.as_ref());
            }
            LirOp::ForeignCall(descriptor) => self.foreign_call(inst, descriptor.name())?,
            LirOp::ArrayEquals(op) => self.array_equals(inst, *op)?,
            LirOp::Deoptimize(info) => {
                let code = !(((info.reason as i32) << 3) | info.action as i32);
                self.asm.mov_ri32(ARG_GPRS[0], code as u32);
                let return_address = self.asm.call_symbol("deoptimize", RELOC_REL32);
                self.record(return_address, InfopointReason::Deopt, inst.state.as_ref());
                self.asm.ud2();
            }
            LirOp::Return => {
                let value = inst.value(0);
                if !value.is_illegal() {
                    let to = if value.kind().is_float() {
                        RETURN_XMM.reg()
                    } else {
                        RETURN_GPR.reg()
                    };
                    self.move_value(to.as_value(value.kind()), value)?;
                }
                self.epilogue()?;
            }
            LirOp::FloatCompare
            | LirOp::FloatBranch { .. }
            | LirOp::LoadConstantTableBase
            | LirOp::RuntimeCallEpilogue => return Err(unsupported(inst)),
        }
        Ok(())
    }
}
