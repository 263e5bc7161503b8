//! AArch64 code emission.
//!
//! Frame: `stp x29, x30, [sp, #-16]!; mov x29, sp; sub sp, sp, #N`. Frame
//! slots are `[sp + offset]`. Arguments pass through the staging words the
//! same way as on AMD64.

use super::encoder::{Assembler, BarrierDomain, Condition, LogicOp, MemOp, ShiftOp};
use super::registers::{VReg, XReg, ARG_VREGS, ARG_XREGS, RETURN_VREG, RETURN_XREG, SCRATCH, TEMPS};
use super::RELOC_BRANCH26;
use crate::backend::{emit_blocks, InstructionEmitter, Target};
use crate::emit::{CodeBuffer, CompilationResult, InfopointReason, Label};
use crate::ir::cfg::BlockId;
use crate::ir::kinds::{BinaryOp, CompareOp, MemoryBarriers};
use crate::lir::instruction::{ConvertOp, LirFrameState, LirInstruction, LirOp, UnaryOp};
use crate::lir::value::{AddressBase, Register, RegisterCategory, StackSlot, Value};
use crate::lir::{FrameMap, Lir};
use kiln_core::{Constant, KilnError, KilnResult, ValueKind};
use rustc_hash::FxHashMap;

/// Emit allocated LIR as A64 machine code.
pub fn emit(lir: &Lir, frame: &FrameMap) -> KilnResult<CompilationResult> {
    let mut buf = CodeBuffer::new(Target::AArch64);
    let labels: FxHashMap<BlockId, Label> = lir.blocks().iter().map(|b| (b.id, buf.new_label())).collect();
    {
        let mut emitter = AArch64Emitter {
            asm: Assembler::new(&mut buf),
            frame,
            labels,
        };
        emitter.prologue()?;
        emit_blocks(&mut emitter, lir)?;
    }
    buf.finish(Target::AArch64, frame.frame_size())
}

struct AArch64Emitter<'a> {
    asm: Assembler<'a>,
    frame: &'a FrameMap,
    labels: FxHashMap<BlockId, Label>,
}

#[inline]
fn is_wide(kind: ValueKind) -> bool {
    matches!(kind, ValueKind::Long | ValueKind::Object | ValueKind::Double)
}

fn is_float_register(value: &Value) -> bool {
    matches!(value, Value::Register(r, _) if r.category == RegisterCategory::Float)
}

/// Value-sized load or store of a register of `kind`.
fn slot_op(kind: ValueKind, float: bool, load: bool) -> MemOp {
    match (float, kind == ValueKind::Float, load) {
        (true, true, true) => MemOp::LOAD_S,
        (true, true, false) => MemOp::STORE_S,
        (true, false, true) => MemOp::LOAD_D,
        (true, false, false) => MemOp::STORE_D,
        (false, _, true) => MemOp::LOAD_X,
        (false, _, false) => MemOp::STORE_X,
    }
}

impl AArch64Emitter<'_> {
    // =========================================================================
    // Operands
    // =========================================================================

    fn x(&self, value: Value) -> KilnResult<XReg> {
        match value {
            Value::Register(r, _) => XReg::from_register(r),
            other => Err(KilnError::emission(format!("expected a general register, got {other}"))),
        }
    }

    fn v(&self, value: Value) -> KilnResult<VReg> {
        match value {
            Value::Register(r, _) => VReg::from_register(r),
            other => Err(KilnError::emission(format!("expected a vector register, got {other}"))),
        }
    }

    fn base(register: Register) -> KilnResult<XReg> {
        if register == Register::general(31) {
            Ok(XReg::SP)
        } else {
            XReg::from_register(register)
        }
    }

    fn address(&self, value: Value) -> KilnResult<(XReg, i32)> {
        match value {
            Value::Address(a) => match a.base {
                AddressBase::Register(r) => Ok((Self::base(r)?, a.displacement)),
                AddressBase::Variable(v) => Err(KilnError::emission(format!("unallocated address base {v}"))),
            },
            Value::StackSlot(s) => Ok((XReg::SP, s.offset)),
            other => Err(KilnError::emission(format!("expected an address, got {other}"))),
        }
    }

    fn label(&self, block: BlockId) -> KilnResult<Label> {
        self.labels
            .get(&block)
            .copied()
            .ok_or_else(|| KilnError::emission(format!("no label for block {block}")))
    }

    fn staging(&self, index: usize, kind: ValueKind) -> KilnResult<Value> {
        Ok(Value::StackSlot(self.frame.staging_slot(index as u32, kind)?))
    }

    /// General register holding `value`, materializing constants into `x8`.
    fn general_operand(&mut self, value: Value, wide: bool) -> KilnResult<XReg> {
        match value {
            Value::Constant(c) => {
                if c.is_default() {
                    return Ok(XReg::ZR);
                }
                self.asm.mov_imm(wide, TEMPS[0], c.as_i64());
                Ok(TEMPS[0])
            }
            _ => self.x(value),
        }
    }

    // =========================================================================
    // Moves
    // =========================================================================

    fn move_value(&mut self, dst: Value, src: Value) -> KilnResult<()> {
        match (dst, src) {
            (_, Value::Constant(c)) => self.load_constant(dst, c),
            (Value::Register(..), Value::Address(_)) => {
                let d = self.x(dst)?;
                let (base, disp) = self.address(src)?;
                self.asm.add_imm(true, d, base, disp as i64)
            }
            (Value::Register(d, _), Value::Register(s, _)) => {
                if d == s {
                    return Ok(());
                }
                let double = src.kind() != ValueKind::Float;
                match (is_float_register(&dst), is_float_register(&src)) {
                    (false, false) => self.asm.mov(true, XReg::from_register(d)?, XReg::from_register(s)?),
                    (true, true) => self.asm.fmov(double, VReg::from_register(d)?, VReg::from_register(s)?),
                    (true, false) => {
                        let double = dst.kind() != ValueKind::Float;
                        self.asm
                            .fmov_from_general(double, VReg::from_register(d)?, XReg::from_register(s)?)
                    }
                    (false, true) => self
                        .asm
                        .fmov_to_general(double, XReg::from_register(d)?, VReg::from_register(s)?),
                }
                Ok(())
            }
            (Value::Register(r, kind), Value::StackSlot(s)) => {
                let float = r.is_float();
                self.asm
                    .mem(slot_op(kind, float, true), r.encoding as u32, XReg::SP, s.offset)
            }
            (Value::StackSlot(s), Value::Register(r, kind)) => {
                let float = r.is_float();
                self.asm
                    .mem(slot_op(kind, float, false), r.encoding as u32, XReg::SP, s.offset)
            }
            (Value::StackSlot(d), Value::StackSlot(s)) => {
                let scratch = SCRATCH[0].encoding();
                self.asm.mem(MemOp::LOAD_X, scratch, XReg::SP, s.offset)?;
                self.asm.mem(MemOp::STORE_X, scratch, XReg::SP, d.offset)
            }
            _ => Err(KilnError::emission(format!("cannot move {src} to {dst}"))),
        }
    }

    fn load_constant(&mut self, dst: Value, constant: Constant) -> KilnResult<()> {
        match dst {
            Value::Register(r, _) if r.is_float() => {
                let v = VReg::from_register(r)?;
                let double = constant.kind() != ValueKind::Float;
                if constant.is_default() {
                    self.asm.fmov_from_general(double, v, XReg::ZR);
                    Ok(())
                } else {
                    let offset = self.asm.buffer().data_constant(constant);
                    let op = if double { MemOp::LOAD_D } else { MemOp::LOAD_S };
                    self.asm.ldr_literal(op, v.encoding(), offset)
                }
            }
            Value::Register(r, _) => {
                let d = XReg::from_register(r)?;
                let wide = !matches!(constant, Constant::Int(_) | Constant::Float(_));
                self.asm.mov_imm(wide, d, constant.as_i64());
                Ok(())
            }
            Value::StackSlot(s) => {
                if constant.is_default() {
                    return self.asm.mem(MemOp::STORE_X, XReg::ZR.encoding(), XReg::SP, s.offset);
                }
                self.asm.mov_imm(true, SCRATCH[0], constant.as_i64());
                self.asm.mem(MemOp::STORE_X, SCRATCH[0].encoding(), XReg::SP, s.offset)
            }
            other => Err(KilnError::emission(format!("cannot load a constant into {other}"))),
        }
    }

    // =========================================================================
    // Frame
    // =========================================================================

    fn prologue(&mut self) -> KilnResult<()> {
        self.asm.push_frame_record();
        self.asm.mov_sp(XReg::FP, XReg::SP);
        let size = self.frame.frame_size();
        if size > 0 {
            self.asm.add_imm(true, XReg::SP, XReg::SP, -(size as i64))?;
        }
        for &(reg, offset) in self.frame.callee_saves() {
            let slot = Value::StackSlot(StackSlot {
                offset,
                kind: ValueKind::Long,
            });
            let kind = if reg.is_float() { ValueKind::Double } else { ValueKind::Long };
            self.move_value(slot, reg.as_value(kind))?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> KilnResult<()> {
        for &(reg, offset) in self.frame.callee_saves() {
            let slot = Value::StackSlot(StackSlot {
                offset,
                kind: ValueKind::Long,
            });
            let kind = if reg.is_float() { ValueKind::Double } else { ValueKind::Long };
            self.move_value(reg.as_value(kind), slot)?;
        }
        self.asm.mov_sp(XReg::SP, XReg::FP);
        self.asm.pop_frame_record();
        self.asm.ret();
        Ok(())
    }

    fn convention_registers(values: &[Value]) -> KilnResult<Vec<Value>> {
        let (mut general, mut float) = (0, 0);
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            let kind = value.kind();
            let reg = if kind.is_float() {
                float += 1;
                ARG_VREGS.get(float - 1).map(|v| v.reg())
            } else {
                general += 1;
                ARG_XREGS.get(general - 1).map(|x| x.reg())
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
        let return_address = self.asm.bl_symbol(name, RELOC_BRANCH26);
        self.record(return_address, InfopointReason::Call, inst.state.as_ref());
        if !result.is_illegal() {
            let from = if result.kind().is_float() {
                RETURN_VREG.reg()
            } else {
                RETURN_XREG.reg()
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
    // Compares
    // =========================================================================

    /// Set flags for `x op y`; returns the condition that holds when true.
    fn compare(&mut self, op: CompareOp, bits: u32, x: Value, y: Value) -> KilnResult<Condition> {
        let wide = bits == 64;
        match op {
            CompareOp::FloatEquals | CompareOp::FloatLessThan => {
                let double = x.kind() != ValueKind::Float;
                let (rn, rm) = (self.v(x)?, self.v(y)?);
                self.asm.fcmp(double, rn, rm);
                // Unordered sets only C and V: both EQ and MI are false.
                return Ok(if op == CompareOp::FloatEquals {
                    Condition::Eq
                } else {
                    Condition::Mi
                });
            }
            CompareOp::IntegerTest => {
                let rn = self.x(x)?;
                let rm = self.general_operand(y, wide)?;
                self.asm.logic(LogicOp::Ands, wide, XReg::ZR, rn, rm);
                return Ok(Condition::Eq);
            }
            _ => {}
        }
        let rn = self.x(x)?;
        match y {
            Value::Constant(c) => self.asm.cmp_imm(wide, rn, c.as_i64())?,
            _ => {
                let rm = self.x(y)?;
                self.asm.cmp_rr(wide, rn, rm);
            }
        }
        Ok(match op {
            CompareOp::IntegerLessThan => Condition::Lt,
            CompareOp::IntegerBelow => Condition::Lo,
            _ => Condition::Eq,
        })
    }

    fn branch_on(&mut self, cond: Condition, t: BlockId, f: BlockId, next: Option<BlockId>) -> KilnResult<()> {
        let (tl, fl) = (self.label(t)?, self.label(f)?);
        if next == Some(t) {
            self.asm.b_cond(cond.invert(), fl);
        } else {
            self.asm.b_cond(cond, tl);
            if next != Some(f) {
                self.asm.b(fl);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn binary(&mut self, inst: &LirInstruction, op: BinaryOp, bits: u32) -> KilnResult<()> {
        let wide = bits == 64;
        let d = self.x(inst.value(0))?;
        let x = self.x(inst.value(1))?;
        let y = inst.value(2);
        match (op, y) {
            (BinaryOp::Add, Value::Constant(c)) => self.asm.add_imm(wide, d, x, c.as_i64())?,
            (BinaryOp::Sub, Value::Constant(c)) => self.asm.add_imm(wide, d, x, c.as_i64().wrapping_neg())?,
            (BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr, Value::Constant(c)) => {
                self.asm.shift_ri(shift_op(op), wide, d, x, c.as_i64() as u32);
            }
            _ => {
                let y = self.general_operand(y, wide)?;
                match op {
                    BinaryOp::Add => self.asm.add_rr(wide, d, x, y),
                    BinaryOp::Sub => self.asm.sub_rr(wide, d, x, y),
                    BinaryOp::Mul => self.asm.mul(wide, d, x, y),
                    BinaryOp::And => self.asm.logic(LogicOp::And, wide, d, x, y),
                    BinaryOp::Or => self.asm.logic(LogicOp::Orr, wide, d, x, y),
                    BinaryOp::Xor => self.asm.logic(LogicOp::Eor, wide, d, x, y),
                    BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => {
                        self.asm.shift_rr(shift_op(op), wide, d, x, y)
                    }
                }
            }
        }
        Ok(())
    }

    fn convert(&mut self, inst: &LirInstruction, op: ConvertOp) -> KilnResult<()> {
        let d = self.x(inst.value(0))?;
        let x = self.x(inst.value(1))?;
        match op {
            ConvertOp::Narrow { bits: bits @ (8 | 16) } => self.asm.sxt(false, d, x, bits),
            ConvertOp::Narrow { bits: 32 } => self.asm.mov(false, d, x),
            ConvertOp::Narrow { .. } => self.asm.mov(true, d, x),
            ConvertOp::SignExtend { from: from @ (8 | 16), to } => self.asm.sxt(to == 64, d, x, from),
            ConvertOp::SignExtend { from: 32, to: 64 } => self.asm.sxt(true, d, x, 32),
            ConvertOp::SignExtend { .. } => self.asm.mov(true, d, x),
            ConvertOp::ZeroExtend { from: from @ (8 | 16), .. } => self.asm.uxt(d, x, from),
            ConvertOp::ZeroExtend { from: 32, .. } => self.asm.mov(false, d, x),
            ConvertOp::ZeroExtend { .. } => self.asm.mov(true, d, x),
        }
        Ok(())
    }

    fn select(&mut self, inst: &LirInstruction) -> KilnResult<()> {
        let (dst, cond, t, f) = (inst.value(0), inst.value(1), inst.value(2), inst.value(3));
        let cond = self.x(cond)?;
        self.asm.cmp_imm(false, cond, 0)?;
        if is_float_register(&dst) {
            let double = dst.kind() != ValueKind::Float;
            let (d, t, f) = (self.v(dst)?, self.v(t)?, self.v(f)?);
            self.asm.fcsel(double, d, t, f, Condition::Ne);
        } else {
            let (d, t, f) = (self.x(dst)?, self.x(t)?, self.x(f)?);
            self.asm.csel(true, d, t, f, Condition::Ne);
        }
        Ok(())
    }

    fn membar(&mut self, barriers: MemoryBarriers) {
        if barriers.is_empty() {
            return;
        }
        let domain = if barriers.contains(MemoryBarriers::STORE_LOAD) {
            BarrierDomain::Ish
        } else if barriers == MemoryBarriers::STORE_STORE {
            BarrierDomain::IshSt
        } else if !barriers.intersects(MemoryBarriers::STORE_STORE) {
            BarrierDomain::IshLd
        } else {
            BarrierDomain::Ish
        };
        self.asm.dmb(domain);
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn load(&mut self, inst: &LirInstruction, size: usize, signed: bool) -> KilnResult<()> {
        let dst = inst.value(0);
        let (base, disp) = self.address(inst.value(1))?;
        let (op, rt) = if is_float_register(&dst) {
            let op = if size == 8 { MemOp::LOAD_D } else { MemOp::LOAD_S };
            (op, self.v(dst)?.encoding())
        } else {
            (MemOp::load(size, signed, is_wide(dst.kind())), self.x(dst)?.encoding())
        };
        self.asm.mem(op, rt, base, disp)
    }

    fn store(&mut self, inst: &LirInstruction, size: usize) -> KilnResult<()> {
        let (base, disp) = self.address(inst.value(0))?;
        let value = inst.value(1);
        if is_float_register(&value) {
            let op = if size == 8 { MemOp::STORE_D } else { MemOp::STORE_S };
            let rt = self.v(value)?.encoding();
            return self.asm.mem(op, rt, base, disp);
        }
        let rt = self.general_operand(value, size == 8)?;
        self.asm.mem(MemOp::store(size), rt.encoding(), base, disp)
    }
}

fn shift_op(op: BinaryOp) -> ShiftOp {
    match op {
        BinaryOp::Shr => ShiftOp::Asr,
        BinaryOp::UShr => ShiftOp::Lsr,
        _ => ShiftOp::Lsl,
    }
}

impl InstructionEmitter for AArch64Emitter<'_> {
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
                    self.asm.b(label);
                }
            }
            LirOp::Branch {
                op,
                bits,
                true_target,
                false_target,
                ..
            } => {
                let cond = self.compare(*op, *bits, inst.value(0), inst.value(1))?;
                self.branch_on(cond, *true_target, *false_target, next)?;
            }
            LirOp::Move => self.move_value(inst.value(0), inst.value(1))?,
            LirOp::StackMove => {
                let (dst, src, scratch) = (inst.value(0), inst.value(1), inst.value(2));
                let (Value::StackSlot(d), Value::StackSlot(s), Value::Register(r, _)) = (dst, src, scratch) else {
                    return Err(KilnError::emission(format!("malformed `{inst}`")));
                };
                let (load, store) = if r.is_float() {
                    (MemOp::LOAD_D, MemOp::STORE_D)
                } else {
                    (MemOp::LOAD_X, MemOp::STORE_X)
                };
                self.asm.mem(load, r.encoding as u32, XReg::SP, s.offset)?;
                self.asm.mem(store, r.encoding as u32, XReg::SP, d.offset)?;
            }
            LirOp::LoadConstant(c) => self.load_constant(inst.value(0), *c)?,
            LirOp::LoadConstantFromTable(c) => {
                let dst = inst.value(0);
                let offset = self.asm.buffer().data_constant(*c);
                let (op, rt) = match (is_float_register(&dst), c.table_size()) {
                    (true, 4) => (MemOp::LOAD_S, self.v(dst)?.encoding()),
                    (true, _) => (MemOp::LOAD_D, self.v(dst)?.encoding()),
                    (false, 4) => (MemOp::LOAD_W, self.x(dst)?.encoding()),
                    (false, _) => (MemOp::LOAD_X, self.x(dst)?.encoding()),
                };
                self.asm.ldr_literal(op, rt, offset)?;
            }
            LirOp::LoadAddress | LirOp::StackBlockAddress => {
                let d = self.x(inst.value(0))?;
                let (base, disp) = self.address(inst.value(1))?;
                self.asm.add_imm(true, d, base, disp as i64)?;
            }
            LirOp::Load(access) => self.load(inst, access.size.bytes(), access.signed)?,
            LirOp::Store(access) => self.store(inst, access.size.bytes())?,
            LirOp::Binary { op, bits } => self.binary(inst, *op, *bits)?,
            LirOp::Unary { op, bits } => {
                let (d, x) = (self.x(inst.value(0))?, self.x(inst.value(1))?);
                match op {
                    UnaryOp::Negate => self.asm.neg(*bits == 64, d, x),
                    UnaryOp::Not => self.asm.mvn(*bits == 64, d, x),
                }
            }
            LirOp::Convert(op) => self.convert(inst, *op)?,
            LirOp::CompareSet { op, bits } => {
                let d = self.x(inst.value(0))?;
                let cond = self.compare(*op, *bits, inst.value(1), inst.value(2))?;
                self.asm.cset(d, cond);
            }
            LirOp::Select => self.select(inst)?,
            LirOp::Membar(barriers) => self.membar(*barriers),
            LirOp::NullCheck => {
                let (base, disp) = self.address(inst.value(0))?;
                let pc = self.asm.position();
                self.asm.mem(MemOp::LOAD_X, XReg::ZR.encoding(), base, disp)?;
                if let Some(state) = &inst.state {
                    self.asm.buffer().exception_site(pc, state.deopt);
                }
                self.record(pc, InfopointReason::ImplicitException, inst.state.as_ref());
            }
            LirOp::ForeignCall(descriptor) => self.foreign_call(inst, descriptor.name())?,
            LirOp::Deoptimize(info) => {
                let code = !(((info.reason as i32) << 3) | info.action as i32);
                self.asm.mov_imm(false, ARG_XREGS[0], code as i64);
                let return_address = self.asm.bl_symbol("deoptimize", RELOC_BRANCH26);
                self.record(return_address, InfopointReason::Deopt, inst.state.as_ref());
                self.asm.brk(0);
            }
            LirOp::Return => {
                let value = inst.value(0);
                if !value.is_illegal() {
                    let to = if value.kind().is_float() {
                        RETURN_VREG.reg()
                    } else {
                        RETURN_XREG.reg()
                    };
                    self.move_value(to.as_value(value.kind()), value)?;
                }
                self.epilogue()?;
            }
            LirOp::ArrayEquals(_)
            | LirOp::FloatCompare
            | LirOp::FloatBranch { .. }
            | LirOp::LoadConstantTableBase
            | LirOp::RuntimeCallEpilogue => {
                return Err(KilnError::emission(format!("`{inst}` is not supported on aarch64")));
            }
        }
        Ok(())
    }
}
