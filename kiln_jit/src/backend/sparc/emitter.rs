//! SPARC code emission.
//!
//! The frame comes from `save %sp, -(frame + 176), %sp`. Frame slots live
//! above the register window save area, at `%sp + 2047 + 176 + offset`.
//! Code and data are big-endian.

use super::encoder::{
    is_simm13, Assembler, Condition, ConditionCodes, FloatCondition, MemOp, Op3, Src, STORE_LOAD,
};
use super::registers::{
    FReg, SReg, ARG_FREGS, ARG_IN, ARG_OUT, CONSTANT_TABLE_BASE, RETURN_FREG, SCRATCH, STACK_BIAS, TEMPS, THREAD,
    WINDOW_SAVE_AREA,
};
use super::RELOC_WDISP30;
use crate::backend::{emit_blocks, InstructionEmitter, Target};
use crate::emit::{CodeBuffer, CompilationResult, InfopointReason, Label};
use crate::ir::cfg::BlockId;
use crate::ir::kinds::{BinaryOp, CompareOp, MemoryBarriers};
use crate::lir::instruction::{ConvertOp, LirFrameState, LirInstruction, LirOp, UnaryOp};
use crate::lir::value::{AddressBase, RegisterCategory, Value};
use crate::lir::{FrameMap, Lir};
use kiln_core::{Constant, KilnError, KilnResult, ValueKind};
use kiln_gc::ThreadLayout;
use rustc_hash::FxHashMap;

/// Emit allocated LIR as SPARC V9 machine code.
pub fn emit(lir: &Lir, frame: &FrameMap, layout: &ThreadLayout) -> KilnResult<CompilationResult> {
    let mut buf = CodeBuffer::new(Target::Sparc);
    let labels: FxHashMap<BlockId, Label> = lir.blocks().iter().map(|b| (b.id, buf.new_label())).collect();
    {
        let mut emitter = SparcEmitter {
            asm: Assembler::new(&mut buf),
            frame,
            layout,
            labels,
        };
        emitter.asm.save(frame.frame_size() as i32 + WINDOW_SAVE_AREA)?;
        emit_blocks(&mut emitter, lir)?;
    }
    buf.finish(Target::Sparc, frame.frame_size())
}

struct SparcEmitter<'a> {
    asm: Assembler<'a>,
    frame: &'a FrameMap,
    layout: &'a ThreadLayout,
    labels: FxHashMap<BlockId, Label>,
}

#[inline]
fn slot_displacement(offset: i32) -> i32 {
    STACK_BIAS + WINDOW_SAVE_AREA + offset
}

fn is_float_register(value: &Value) -> bool {
    matches!(value, Value::Register(r, _) if r.category == RegisterCategory::Float)
}

fn float_op(kind: ValueKind, load: bool) -> MemOp {
    match (kind == ValueKind::Float, load) {
        (true, true) => MemOp::LDF,
        (true, false) => MemOp::STF,
        (false, true) => MemOp::LDDF,
        (false, false) => MemOp::STDF,
    }
}

fn alu_op(op: BinaryOp) -> Op3 {
    match op {
        BinaryOp::Add => Op3::ADD,
        BinaryOp::Sub => Op3::SUB,
        BinaryOp::Mul => Op3::MULX,
        BinaryOp::And => Op3::AND,
        BinaryOp::Or => Op3::OR,
        BinaryOp::Xor => Op3::XOR,
        BinaryOp::Shl => Op3::SLL,
        BinaryOp::Shr => Op3::SRA,
        BinaryOp::UShr => Op3::SRL,
    }
}

impl SparcEmitter<'_> {
    // =========================================================================
    // Operands
    // =========================================================================

    fn s(&self, value: Value) -> KilnResult<SReg> {
        match value {
            Value::Register(r, _) => SReg::from_register(r),
            other => Err(KilnError::emission(format!("expected an integer register, got {other}"))),
        }
    }

    fn f(&self, value: Value) -> KilnResult<FReg> {
        match value {
            Value::Register(r, _) => FReg::from_register(r),
            other => Err(KilnError::emission(format!("expected a float register, got {other}"))),
        }
    }

    fn address(&self, value: Value) -> KilnResult<(SReg, i32)> {
        match value {
            Value::Address(a) => match a.base {
                AddressBase::Register(r) => Ok((SReg::from_register(r)?, a.displacement)),
                AddressBase::Variable(v) => Err(KilnError::emission(format!("unallocated address base {v}"))),
            },
            Value::StackSlot(s) => Ok((SReg::SP, slot_displacement(s.offset))),
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

    /// Second operand for `value`: an immediate when it fits, `%g0` for
    /// zero, otherwise a register (constants built in `g4`).
    fn src_operand(&mut self, value: Value) -> KilnResult<Src> {
        match value {
            Value::Constant(c) => {
                let v = c.as_i64();
                if v == 0 {
                    Ok(Src::Reg(SReg::G0))
                } else if is_simm13(v) {
                    Ok(Src::Imm(v as i32))
                } else {
                    self.asm.set(v, TEMPS[0])?;
                    Ok(Src::Reg(TEMPS[0]))
                }
            }
            _ => Ok(Src::Reg(self.s(value)?)),
        }
    }

    /// `rd = base + disp`.
    fn add_displacement(&mut self, rd: SReg, base: SReg, disp: i32) -> KilnResult<()> {
        if is_simm13(disp as i64) {
            return self.asm.arith(Op3::ADD, true, rd, base, Src::Imm(disp));
        }
        self.asm.set(disp as i64, TEMPS[0])?;
        self.asm.arith(Op3::ADD, true, rd, base, Src::Reg(TEMPS[0]))
    }

    // =========================================================================
    // Moves
    // =========================================================================

    fn move_value(&mut self, dst: Value, src: Value) -> KilnResult<()> {
        match (dst, src) {
            (_, Value::Constant(c)) => self.load_constant(dst, c),
            (Value::Register(..), Value::Address(_)) => {
                let rd = self.s(dst)?;
                let (base, disp) = self.address(src)?;
                self.add_displacement(rd, base, disp)
            }
            (Value::Register(d, _), Value::Register(s, _)) => {
                if d == s {
                    return Ok(());
                }
                match (d.is_float(), s.is_float()) {
                    (false, false) => self.asm.mov(SReg::from_register(d)?, SReg::from_register(s)?),
                    (true, true) => {
                        let double = src.kind() != ValueKind::Float;
                        self.asm.fmov(double, FReg::from_register(d)?, FReg::from_register(s)?)
                    }
                    _ => return Err(KilnError::emission(format!("no direct move from {src} to {dst}"))),
                }
                Ok(())
            }
            (Value::Register(r, kind), Value::StackSlot(s)) => {
                let op = if r.is_float() { float_op(kind, true) } else { MemOp::LDX };
                self.asm
                    .mem(op, r.encoding as u32, SReg::SP, slot_displacement(s.offset))
            }
            (Value::StackSlot(s), Value::Register(r, kind)) => {
                let op = if r.is_float() { float_op(kind, false) } else { MemOp::STX };
                self.asm
                    .mem(op, r.encoding as u32, SReg::SP, slot_displacement(s.offset))
            }
            (Value::StackSlot(d), Value::StackSlot(s)) => {
                let scratch = SCRATCH[0].encoding();
                self.asm.mem(MemOp::LDX, scratch, SReg::SP, slot_displacement(s.offset))?;
                self.asm.mem(MemOp::STX, scratch, SReg::SP, slot_displacement(d.offset))
            }
            _ => Err(KilnError::emission(format!("cannot move {src} to {dst}"))),
        }
    }

    fn load_constant(&mut self, dst: Value, constant: Constant) -> KilnResult<()> {
        match dst {
            Value::Register(r, _) if r.is_float() => self.load_from_table(dst, constant),
            Value::Register(r, _) => self.asm.set(constant.as_i64(), SReg::from_register(r)?),
            Value::StackSlot(s) => {
                let rt = if constant.is_default() {
                    SReg::G0
                } else {
                    self.asm.set(constant.as_i64(), SCRATCH[0])?;
                    SCRATCH[0]
                };
                self.asm
                    .mem(MemOp::STX, rt.encoding(), SReg::SP, slot_displacement(s.offset))
            }
            other => Err(KilnError::emission(format!("cannot load a constant into {other}"))),
        }
    }

    fn load_from_table(&mut self, dst: Value, constant: Constant) -> KilnResult<()> {
        let offset = self.asm.buffer().data_constant(constant);
        if !is_simm13(offset as i64) {
            return Err(KilnError::emission(format!(
                "constant table offset {offset} of {constant} exceeds simm13"
            )));
        }
        let (op, rd) = if is_float_register(&dst) {
            let op = if constant.table_size() == 4 { MemOp::LDF } else { MemOp::LDDF };
            (op, self.f(dst)?.encoding())
        } else {
            let op = match constant {
                Constant::Int(_) => MemOp::LDSW,
                Constant::Float(_) => MemOp::LDUW,
                _ => MemOp::LDX,
            };
            (op, self.s(dst)?.encoding())
        };
        self.asm.mem(op, rd, CONSTANT_TABLE_BASE, offset as i32)
    }

    /// `%l7 = start of the data section`.
    fn load_table_base(&mut self) -> KilnResult<()> {
        let anchor = self.asm.position();
        let temp = TEMPS[0];
        self.asm.rd_pc(CONSTANT_TABLE_BASE);
        self.asm.sethi_data(temp, 0, anchor);
        self.asm.or_lo_data(temp, 0, anchor)?;
        self.asm
            .arith(Op3::ADD, true, CONSTANT_TABLE_BASE, CONSTANT_TABLE_BASE, Src::Reg(temp))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn convention_registers(values: &[Value], general: &[SReg]) -> KilnResult<Vec<Value>> {
        let (mut ints, mut floats) = (0, 0);
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            let kind = value.kind();
            let reg = if kind.is_float() {
                floats += 1;
                ARG_FREGS.get(floats - 1).map(|f| f.reg())
            } else {
                ints += 1;
                general.get(ints - 1).map(|s| s.reg())
            };
            let reg = reg.ok_or_else(|| KilnError::emission(format!("{} arguments exceed the registers", values.len())))?;
            out.push(reg.as_value(kind));
        }
        Ok(out)
    }

    fn incoming(&mut self, inst: &LirInstruction) -> KilnResult<()> {
        let defs: Vec<Value> = inst.operands.iter().map(|o| o.value).collect();
        let sources = Self::convention_registers(&defs, &ARG_IN)?;
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
        let registers = Self::convention_registers(&args, &ARG_OUT)?;
        for (i, reg) in registers.iter().enumerate() {
            let staging = self.staging(i, reg.kind())?;
            self.move_value(*reg, staging)?;
        }
        let return_address = self.asm.call_symbol(name, RELOC_WDISP30);
        self.record(return_address, InfopointReason::Call, inst.state.as_ref());
        if !result.is_illegal() {
            let from = if result.kind().is_float() {
                RETURN_FREG.reg()
            } else {
                ARG_OUT[0].reg()
            };
            self.move_value(result, from.as_value(result.kind()))?;
        }
        Ok(())
    }

    /// Restore the thread register and clear the frame anchor after a C call.
    fn runtime_call_epilogue(&mut self, saved: Value) -> KilnResult<()> {
        self.move_value(THREAD.reg().as_value(ValueKind::Long), saved)?;
        let zero = SReg::G0.encoding();
        self.asm.mem(MemOp::STX, zero, THREAD, self.layout.last_java_sp_offset)?;
        self.asm.mem(MemOp::STX, zero, THREAD, self.layout.last_java_pc_offset)?;
        self.asm.mem(MemOp::STW, zero, THREAD, self.layout.frame_anchor_flags_offset)
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

    /// Set the integer flags for `x op y`; returns the condition that holds
    /// when true.
    fn integer_compare(&mut self, op: CompareOp, x: Value, y: Value) -> KilnResult<Condition> {
        let rs1 = self.s(x)?;
        let src = self.src_operand(y)?;
        if op == CompareOp::IntegerTest {
            self.asm.btst(rs1, src)?;
            return Ok(Condition::Equal);
        }
        self.asm.cmp(rs1, src)?;
        Ok(match op {
            CompareOp::IntegerLessThan => Condition::Less,
            CompareOp::IntegerBelow => Condition::CarrySet,
            _ => Condition::Equal,
        })
    }

    fn float_compare(&mut self, op: CompareOp, x: Value, y: Value) -> KilnResult<FloatCondition> {
        let double = x.kind() != ValueKind::Float;
        let (rs1, rs2) = (self.f(x)?, self.f(y)?);
        self.asm.fcmp(double, rs1, rs2);
        Ok(if op == CompareOp::FloatEquals {
            FloatCondition::Equal
        } else {
            FloatCondition::Less
        })
    }

    fn branch_on(
        &mut self,
        cond: Condition,
        cc: ConditionCodes,
        t: BlockId,
        f: BlockId,
        next: Option<BlockId>,
    ) -> KilnResult<()> {
        let (tl, fl) = (self.label(t)?, self.label(f)?);
        if next == Some(t) {
            self.asm.bpcc(cond.invert(), cc, fl);
        } else {
            self.asm.bpcc(cond, cc, tl);
            if next != Some(f) {
                self.asm.ba(fl);
            }
        }
        Ok(())
    }

    fn branch_on_float(&mut self, cond: FloatCondition, t: BlockId, f: BlockId, next: Option<BlockId>) -> KilnResult<()> {
        let (tl, fl) = (self.label(t)?, self.label(f)?);
        if next == Some(t) {
            self.asm.fbpfcc(cond.invert(), fl);
        } else {
            self.asm.fbpfcc(cond, tl);
            if next != Some(f) {
                self.asm.ba(fl);
            }
        }
        Ok(())
    }

    fn compare_set(&mut self, inst: &LirInstruction, op: CompareOp, bits: u32) -> KilnResult<()> {
        let rd = self.s(inst.value(0))?;
        if op.is_float() {
            let cond = self.float_compare(op, inst.value(1), inst.value(2))?;
            self.asm.set(0, rd)?;
            return self.asm.movfcc(cond, Src::Imm(1), rd);
        }
        let cond = self.integer_compare(op, inst.value(1), inst.value(2))?;
        self.asm.set(0, rd)?;
        self.asm.movcc(cond, ConditionCodes::for_bits(bits), Src::Imm(1), rd)
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn binary(&mut self, inst: &LirInstruction, op: BinaryOp, bits: u32) -> KilnResult<()> {
        let rd = self.s(inst.value(0))?;
        let rs1 = self.s(inst.value(1))?;
        let src = self.src_operand(inst.value(2))?;
        self.asm.arith(alu_op(op), bits == 64, rd, rs1, src)
    }

    /// Sign- or zero-extend the low `from` bits through a shift pair.
    fn extend(&mut self, rd: SReg, rs: SReg, from: u32, signed: bool) -> KilnResult<()> {
        let shift = Src::Imm(64 - from as i32);
        self.asm.arith(Op3::SLL, true, rd, rs, shift)?;
        let right = if signed { Op3::SRA } else { Op3::SRL };
        self.asm.arith(right, true, rd, rd, shift)
    }

    fn convert(&mut self, inst: &LirInstruction, op: ConvertOp) -> KilnResult<()> {
        let rd = self.s(inst.value(0))?;
        let rs = self.s(inst.value(1))?;
        match op {
            ConvertOp::Narrow { bits: bits @ (8 | 16) } => self.extend(rd, rs, bits, true),
            ConvertOp::Narrow { bits: 32 } | ConvertOp::SignExtend { from: 32, .. } => {
                self.asm.arith(Op3::SRA, false, rd, rs, Src::Imm(0))
            }
            ConvertOp::SignExtend { from: from @ (8 | 16), .. } => self.extend(rd, rs, from, true),
            ConvertOp::ZeroExtend { from: from @ (8 | 16), .. } => self.extend(rd, rs, from, false),
            ConvertOp::ZeroExtend { from: 32, .. } => self.asm.arith(Op3::SRL, false, rd, rs, Src::Imm(0)),
            ConvertOp::Narrow { .. } | ConvertOp::SignExtend { .. } | ConvertOp::ZeroExtend { .. } => {
                self.asm.mov(rd, rs);
                Ok(())
            }
        }
    }

    fn select(&mut self, inst: &LirInstruction) -> KilnResult<()> {
        let (dst, cond, t, f) = (inst.value(0), inst.value(1), inst.value(2), inst.value(3));
        let cond = self.s(cond)?;
        self.asm.cmp(cond, Src::Reg(SReg::G0))?;
        if is_float_register(&dst) {
            let double = dst.kind() != ValueKind::Float;
            let (d, t, f) = (self.f(dst)?, self.f(t)?, self.f(f)?);
            self.asm.fmov(double, d, f);
            self.asm.fmovcc(double, Condition::NotEqual, t, d);
            Ok(())
        } else {
            let (d, t, f) = (self.s(dst)?, self.s(t)?, self.s(f)?);
            self.asm.mov(d, f);
            self.asm.movcc(Condition::NotEqual, ConditionCodes::Icc, Src::Reg(t), d)
        }
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn load(&mut self, inst: &LirInstruction, size: usize, signed: bool) -> KilnResult<()> {
        let dst = inst.value(0);
        let (base, disp) = self.address(inst.value(1))?;
        let (op, rd) = if is_float_register(&dst) {
            let op = if size == 8 { MemOp::LDDF } else { MemOp::LDF };
            (op, self.f(dst)?.encoding())
        } else {
            (MemOp::load(size, signed), self.s(dst)?.encoding())
        };
        self.asm.mem(op, rd, base, disp)
    }

    fn store(&mut self, inst: &LirInstruction, size: usize) -> KilnResult<()> {
        let (base, disp) = self.address(inst.value(0))?;
        let value = inst.value(1);
        if is_float_register(&value) {
            let op = if size == 8 { MemOp::STDF } else { MemOp::STF };
            let rd = self.f(value)?.encoding();
            return self.asm.mem(op, rd, base, disp);
        }
        let rd = match value {
            Value::Constant(c) if c.is_default() => SReg::G0,
            Value::Constant(c) => {
                self.asm.set(c.as_i64(), TEMPS[0])?;
                TEMPS[0]
            }
            _ => self.s(value)?,
        };
        self.asm.mem(MemOp::store(size), rd.encoding(), base, disp)
    }
}

impl InstructionEmitter for SparcEmitter<'_> {
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
                    self.asm.ba(label);
                }
            }
            LirOp::Branch {
                op,
                bits,
                true_target,
                false_target,
                ..
            } => {
                if op.is_float() {
                    let cond = self.float_compare(*op, inst.value(0), inst.value(1))?;
                    self.branch_on_float(cond, *true_target, *false_target, next)?;
                } else {
                    let cond = self.integer_compare(*op, inst.value(0), inst.value(1))?;
                    let cc = ConditionCodes::for_bits(*bits);
                    self.branch_on(cond, cc, *true_target, *false_target, next)?;
                }
            }
            LirOp::FloatCompare => {
                let double = inst.value(0).kind() != ValueKind::Float;
                let (rs1, rs2) = (self.f(inst.value(0))?, self.f(inst.value(1))?);
                self.asm.fcmp(double, rs1, rs2);
            }
            LirOp::FloatBranch {
                op,
                true_target,
                false_target,
                ..
            } => {
                let cond = if *op == CompareOp::FloatEquals {
                    FloatCondition::Equal
                } else {
                    FloatCondition::Less
                };
                self.branch_on_float(cond, *true_target, *false_target, next)?;
            }
            LirOp::Move => self.move_value(inst.value(0), inst.value(1))?,
            LirOp::StackMove => {
                let (dst, src, scratch) = (inst.value(0), inst.value(1), inst.value(2));
                let (Value::StackSlot(d), Value::StackSlot(s), Value::Register(r, kind)) = (dst, src, scratch) else {
                    return Err(KilnError::emission(format!("malformed `{inst}`")));
                };
                let (load, store) = if r.is_float() {
                    (float_op(kind, true), float_op(kind, false))
                } else {
                    (MemOp::LDX, MemOp::STX)
                };
                self.asm
                    .mem(load, r.encoding as u32, SReg::SP, slot_displacement(s.offset))?;
                self.asm
                    .mem(store, r.encoding as u32, SReg::SP, slot_displacement(d.offset))?;
            }
            LirOp::LoadConstant(c) => self.load_constant(inst.value(0), *c)?,
            LirOp::LoadConstantFromTable(c) => self.load_from_table(inst.value(0), *c)?,
            LirOp::LoadConstantTableBase => self.load_table_base()?,
            LirOp::LoadAddress | LirOp::StackBlockAddress => {
                let rd = self.s(inst.value(0))?;
                let (base, disp) = self.address(inst.value(1))?;
                self.add_displacement(rd, base, disp)?;
            }
            LirOp::Load(access) => self.load(inst, access.size.bytes(), access.signed)?,
            LirOp::Store(access) => self.store(inst, access.size.bytes())?,
            LirOp::Binary { op, bits } => self.binary(inst, *op, *bits)?,
            LirOp::Unary { op, .. } => {
                let (rd, rs) = (self.s(inst.value(0))?, self.s(inst.value(1))?);
                let op3 = match op {
                    UnaryOp::Negate => Op3::SUB,
                    UnaryOp::Not => Op3::ORN,
                };
                self.asm.arith(op3, true, rd, SReg::G0, Src::Reg(rs))?;
            }
            LirOp::Convert(op) => self.convert(inst, *op)?,
            LirOp::CompareSet { op, bits } => self.compare_set(inst, *op, *bits)?,
            LirOp::Select => self.select(inst)?,
            // Total store order: only store-load needs a fence.
            LirOp::Membar(barriers) => {
                if barriers.contains(MemoryBarriers::STORE_LOAD) {
                    self.asm.membar(STORE_LOAD);
                }
            }
            LirOp::NullCheck => {
                let (base, disp) = self.address(inst.value(0))?;
                let pc = self.asm.position();
                self.asm.mem(MemOp::LDX, SReg::G0.encoding(), base, disp)?;
                if let Some(state) = &inst.state {
                    self.asm.buffer().exception_site(pc, state.deopt);
                }
                self.record(pc, InfopointReason::ImplicitException, inst.state.as_ref());
            }
            LirOp::ForeignCall(descriptor) => self.foreign_call(inst, descriptor.name())?,
            LirOp::RuntimeCallEpilogue => self.runtime_call_epilogue(inst.value(0))?,
            LirOp::Deoptimize(info) => {
                let code = !(((info.reason as i32) << 3) | info.action as i32);
                self.asm.set(code as i64, ARG_OUT[0])?;
                let return_address = self.asm.call_symbol("deoptimize", RELOC_WDISP30);
                self.record(return_address, InfopointReason::Deopt, inst.state.as_ref());
                self.asm.illtrap(0);
            }
            LirOp::Return => {
                let value = inst.value(0);
                if !value.is_illegal() {
                    let to = if value.kind().is_float() {
                        RETURN_FREG.reg()
                    } else {
                        ARG_IN[0].reg()
                    };
                    self.move_value(to.as_value(value.kind()), value)?;
                }
                self.asm.ret_restore();
            }
            LirOp::ArrayEquals(_) => {
                return Err(KilnError::emission(format!("`{inst}` is not supported on sparc")));
            }
        }
        Ok(())
    }
}
