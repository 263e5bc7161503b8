//! Instruction selection.
//!
//! [`NodeLirBuilder`] walks the blocks of a low-tier graph in reverse
//! postorder and turns fixed nodes into LIR in control order. Floating
//! nodes are emitted on demand, in the block of their first use; a value is
//! reused by later users only when its block dominates theirs, otherwise it
//! is recomputed. Phis become variables written by moves at the end of each
//! predecessor.
//!
//! Targets plug in through [`LirGeneratorTool`]: which constants an
//! instruction can take inline, where the thread lives, and how calls and
//! float branches are shaped.

use super::array_equals::ArrayEqualsOp;
use super::instruction::{
    ConvertOp, LirFrameState, LirInstruction, LirOp, Operand, OperandFlags, UnaryOp,
};
use super::moves::MoveFactory;
use super::value::{AddressBase, AddressValue, Register, Value, Variable};
use super::{Lir, LirBlock};
use crate::backend::Target;
use crate::ir::cfg::{BlockId, Cfg};
use crate::ir::graph::Graph;
use crate::ir::kinds::{BinaryOp, CompareOp, DeoptInfo, NodeKind, RegisterRole};
use crate::ir::node::NodeId;
use crate::stubs::ForeignCallDescriptor;
use kiln_core::{CompilerOptions, Constant, DeoptAction, DeoptReason, KilnError, KilnResult, ValueKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Target Hooks
// =============================================================================

/// Target-specific parts of instruction selection.
pub trait LirGeneratorTool: Send + Sync {
    fn target(&self) -> Target;

    fn move_factory(&self) -> &dyn MoveFactory;

    /// Register holding the current thread.
    fn thread_register(&self) -> Register;

    fn stack_pointer(&self) -> Register;

    /// Whether `constant` can be the right operand of `op`.
    fn can_inline_binary(&self, _op: BinaryOp, constant: &Constant) -> bool {
        self.move_factory().can_inline_constant(constant)
    }

    /// Whether a store can write `constant` without a register.
    fn can_store_constant(&self, constant: &Constant) -> bool {
        self.move_factory().allow_constant_to_stack_move(constant)
    }

    /// Whether null checks followed by a null-check deopt can be folded into
    /// a faulting access.
    fn implicit_null_checks(&self) -> bool {
        true
    }

    /// Inline array equality for `kind`, or `None` to call the runtime's
    /// `array_equals_<kind>` routine instead.
    fn array_equals_op(&self, _kind: ValueKind, _options: &CompilerOptions) -> Option<ArrayEqualsOp> {
        None
    }

    /// Instructions after `Incoming` in the entry block.
    fn emit_prologue(&self, _gen: &mut NodeLirBuilder<'_>) -> KilnResult<()> {
        Ok(())
    }

    /// Branch on a float comparison of two registers.
    #[allow(clippy::too_many_arguments)]
    fn emit_float_branch(
        &self,
        gen: &mut NodeLirBuilder<'_>,
        op: CompareOp,
        x: Value,
        y: Value,
        true_target: BlockId,
        false_target: BlockId,
        probability: f64,
    ) -> KilnResult<()> {
        let bits = x.kind().byte_size() * 8;
        gen.append(LirInstruction::new(
            LirOp::Branch {
                op,
                bits,
                true_target,
                false_target,
                probability,
            },
            &[Operand::use_(x, OperandFlags::REG), Operand::use_(y, OperandFlags::REG)],
        ));
        Ok(())
    }

    /// Call `descriptor` with `args`, defining `result` (illegal for void).
    fn emit_foreign_call(
        &self,
        gen: &mut NodeLirBuilder<'_>,
        descriptor: &Arc<ForeignCallDescriptor>,
        args: &[Value],
        result: Value,
        state: LirFrameState,
    ) -> KilnResult<()> {
        gen.append(foreign_call(descriptor, args, result, state));
        Ok(())
    }
}

/// The generic `ForeignCall` instruction.
pub fn foreign_call(
    descriptor: &Arc<ForeignCallDescriptor>,
    args: &[Value],
    result: Value,
    state: LirFrameState,
) -> LirInstruction {
    let mut operands: SmallVec<[Operand; 4]> = SmallVec::new();
    operands.push(Operand::def(result, OperandFlags::REG | OperandFlags::ILLEGAL));
    for &arg in args {
        operands.push(Operand::use_(
            arg,
            OperandFlags::REG | OperandFlags::STACK | OperandFlags::CONST,
        ));
    }
    LirInstruction::new(LirOp::ForeignCall(Arc::clone(descriptor)), &operands).with_state(state)
}

/// Operation width for values of `kind`.
#[inline]
fn op_bits(kind: ValueKind) -> u32 {
    match kind {
        ValueKind::Long | ValueKind::Object | ValueKind::Double => 64,
        _ => 32,
    }
}

// =============================================================================
// Node LIR Builder
// =============================================================================

/// Builds the LIR of one low-tier graph.
pub struct NodeLirBuilder<'a> {
    graph: &'a Graph,
    cfg: &'a Cfg,
    tool: &'a dyn LirGeneratorTool,
    options: &'a CompilerOptions,
    lir: Lir,
    results: FxHashMap<NodeId, SmallVec<[(BlockId, Value); 1]>>,
    phi_variables: FxHashMap<NodeId, Variable>,
    current_block: BlockId,
    instructions: Vec<LirInstruction>,
}

impl<'a> NodeLirBuilder<'a> {
    pub fn new(
        graph: &'a Graph,
        cfg: &'a Cfg,
        tool: &'a dyn LirGeneratorTool,
        options: &'a CompilerOptions,
    ) -> Self {
        NodeLirBuilder {
            graph,
            cfg,
            tool,
            options,
            lir: Lir::new(tool.target()),
            results: FxHashMap::default(),
            phi_variables: FxHashMap::default(),
            current_block: cfg.entry,
            instructions: Vec::new(),
        }
    }

    /// Select instructions for every block.
    pub fn build(mut self) -> KilnResult<Lir> {
        let order: Vec<BlockId> = self.cfg.rpo.clone();
        for id in order {
            self.do_block(id)?;
        }
        log::debug!(
            "{:?} lir: {} blocks, {} instructions, {} variables",
            self.tool.target(),
            self.lir.blocks().len(),
            self.lir.instruction_count(),
            self.lir.variable_count()
        );
        Ok(self.lir)
    }

    // =========================================================================
    // Building Blocks
    // =========================================================================

    /// Append to the current block.
    #[inline]
    pub fn append(&mut self, inst: LirInstruction) {
        self.instructions.push(inst);
    }

    pub fn new_variable(&mut self, kind: ValueKind) -> Variable {
        self.lir.new_variable(kind)
    }

    pub fn lir_mut(&mut self) -> &mut Lir {
        &mut self.lir
    }

    #[inline]
    pub fn options(&self) -> &CompilerOptions {
        self.options
    }

    #[inline]
    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Record the value of `node` for users dominated by the current block.
    pub fn set_result(&mut self, node: NodeId, value: Value) {
        self.results.entry(node).or_default().push((self.current_block, value));
    }

    /// Append a move built by the target's factory.
    pub fn emit_move(&mut self, dst: Value, src: Value) -> KilnResult<()> {
        let inst = self.tool.move_factory().create_move(dst, src)?;
        self.append(inst);
        Ok(())
    }

    /// Copy `value` into a fresh variable unless it already is one.
    pub fn in_variable(&mut self, value: Value) -> KilnResult<Variable> {
        if let Value::Variable(v) = value {
            return Ok(v);
        }
        let kind = match value.kind() {
            ValueKind::Void => ValueKind::Long,
            k => k.stack_kind(),
        };
        let v = self.new_variable(kind);
        self.emit_move(Value::Variable(v), value)?;
        Ok(v)
    }

    fn do_block(&mut self, id: BlockId) -> KilnResult<()> {
        self.current_block = id;
        self.instructions = vec![LirInstruction::label(id)];
        if id == self.cfg.entry {
            self.emit_incoming()?;
            let tool = self.tool;
            tool.emit_prologue(self)?;
        }
        let nodes = self.cfg.block(id).nodes.clone();
        for node in nodes {
            self.do_fixed(node)?;
        }
        if !self.instructions.last().is_some_and(|i| i.op.is_block_end()) {
            let next = self.cfg.block(id).successors.first().copied().ok_or_else(|| {
                KilnError::internal(format!("block {id} falls off without a successor"))
            })?;
            self.append(LirInstruction::jump(next));
        }
        let cfg_block = self.cfg.block(id);
        let block = LirBlock {
            id,
            instructions: std::mem::take(&mut self.instructions),
            predecessors: cfg_block.predecessors.clone(),
            successors: cfg_block.successors.clone(),
            loop_depth: cfg_block.loop_depth,
        };
        self.lir.add_block(block)
    }

    fn emit_incoming(&mut self) -> KilnResult<()> {
        let mut params: Vec<(u32, NodeId)> = self
            .graph
            .iter()
            .filter_map(|(id, n)| match n.kind {
                NodeKind::Parameter(i) => Some((i, id)),
                _ => None,
            })
            .collect();
        params.sort_unstable();
        let count = params.last().map_or(0, |(i, _)| i + 1);
        let mut defs: SmallVec<[Operand; 4]> = SmallVec::new();
        let mut by_index: FxHashMap<u32, NodeId> = FxHashMap::default();
        for (i, id) in params {
            by_index.insert(i, id);
        }
        for i in 0..count {
            let kind = match by_index.get(&i) {
                Some(&node) => self.value_kind(node),
                None => ValueKind::Long,
            };
            let v = self.new_variable(kind);
            if let Some(&node) = by_index.get(&i) {
                self.set_result(node, Value::Variable(v));
            }
            defs.push(Operand::def(
                Value::Variable(v),
                OperandFlags::REG | OperandFlags::STACK,
            ));
        }
        self.lir.parameter_count = count;
        self.append(LirInstruction::new(LirOp::Incoming, &defs));
        Ok(())
    }

    // =========================================================================
    // Fixed Nodes
    // =========================================================================

    fn do_fixed(&mut self, node: NodeId) -> KilnResult<()> {
        let kind = self.graph.kind(node).clone();
        match kind {
            NodeKind::Start | NodeKind::Begin | NodeKind::Merge | NodeKind::LoopBegin | NodeKind::LoopExit => {}
            NodeKind::End | NodeKind::LoopEnd => self.do_end(node)?,
            NodeKind::If { probability } => self.do_if(node, probability)?,
            NodeKind::Return => {
                let value = match self.graph.node(node).input(0) {
                    Some(v) => self.operand(v)?,
                    None => Value::Illegal,
                };
                self.append(LirInstruction::ret(value));
            }
            NodeKind::Deoptimize(info) => {
                let state = self.state_for(node, info);
                self.lir.max_call_arguments = self.lir.max_call_arguments.max(1);
                self.append(LirInstruction::deoptimize(state));
            }
            NodeKind::Unreachable => {
                self.lir.max_call_arguments = self.lir.max_call_arguments.max(1);
                let state = self.state_for(node, DeoptInfo::new(DeoptReason::UnreachedCode, DeoptAction::None));
                self.append(LirInstruction::deoptimize(state));
            }
            NodeKind::ForeignCall { descriptor } => self.do_foreign_call(node, &descriptor)?,
            NodeKind::Read { access, .. } => {
                let address = self.address_of(self.input(node, 0)?)?;
                let dst = self.new_variable(self.value_kind(node));
                self.append(LirInstruction::new(
                    LirOp::Load(access),
                    &[
                        Operand::def(Value::Variable(dst), OperandFlags::REG),
                        Operand::use_(Value::Address(address), OperandFlags::COMPOSITE),
                    ],
                ));
                self.set_result(node, Value::Variable(dst));
            }
            NodeKind::Write { access, .. } => {
                let address = self.address_of(self.input(node, 0)?)?;
                let value = self.operand(self.input(node, 1)?)?;
                let value = match value {
                    Value::Constant(c) if self.tool.can_store_constant(&c) => value,
                    other => Value::Variable(self.in_variable(other)?),
                };
                self.append(LirInstruction::new(
                    LirOp::Store(access),
                    &[
                        Operand::use_(Value::Address(address), OperandFlags::COMPOSITE),
                        Operand::use_(value, OperandFlags::REG | OperandFlags::CONST),
                    ],
                ));
            }
            NodeKind::Membar { barriers } => self.append(LirInstruction::membar(barriers)),
            NodeKind::ReadRegister(role) => {
                let dst = self.new_variable(ValueKind::Long);
                match role {
                    RegisterRole::Thread => {
                        let thread = self.tool.thread_register().as_value(ValueKind::Long);
                        self.emit_move(Value::Variable(dst), thread)?;
                    }
                    RegisterRole::StackPointer => {
                        let sp = AddressValue::new(AddressBase::Register(self.tool.stack_pointer()), 0);
                        self.emit_move(Value::Variable(dst), Value::Address(sp))?;
                    }
                }
                self.set_result(node, Value::Variable(dst));
            }
            NodeKind::Alloca { slots } => {
                let block = self.lir.new_stack_slot(slots * super::WORD_SIZE, ValueKind::Long);
                let dst = self.new_variable(ValueKind::Long);
                self.append(LirInstruction::new(
                    LirOp::StackBlockAddress,
                    &[
                        Operand::def(Value::Variable(dst), OperandFlags::REG),
                        Operand::alive(
                            Value::VirtualStack(block),
                            OperandFlags::STACK | OperandFlags::UNINITIALIZED,
                        ),
                    ],
                ));
                self.set_result(node, Value::Variable(dst));
            }
            NodeKind::ArrayEquals { kind } => self.do_array_equals(node, kind)?,
            NodeKind::FixedGuard(_)
            | NodeKind::Invoke { .. }
            | NodeKind::SerialWriteBarrier { .. }
            | NodeKind::SerialArrayRangeWriteBarrier { .. }
            | NodeKind::G1PreWriteBarrier { .. }
            | NodeKind::G1PostWriteBarrier { .. }
            | NodeKind::G1ArrayRangePreWriteBarrier { .. }
            | NodeKind::G1ArrayRangePostWriteBarrier { .. } => {
                return Err(KilnError::internal_at(
                    node.index(),
                    format!("{} reached instruction selection unlowered", kind.name()),
                ));
            }
            other => {
                return Err(KilnError::internal_at(
                    node.index(),
                    format!("{} is not a fixed node", other.name()),
                ));
            }
        }
        Ok(())
    }

    fn do_end(&mut self, end: NodeId) -> KilnResult<()> {
        let merge = self
            .graph
            .merge_of(end)
            .ok_or_else(|| KilnError::internal_at(end.index(), "end without merge"))?;
        let index = self
            .graph
            .merge_ends(merge)
            .iter()
            .position(|&e| e == end)
            .ok_or_else(|| KilnError::internal_at(end.index(), "end not listed by its merge"))?;
        let phis = self.graph.phis(merge);
        // Sources first, then targets, so phis reading each other see the
        // old values.
        let mut staged: SmallVec<[(Variable, Variable); 4]> = SmallVec::new();
        for &phi in &phis {
            let source = self.input(phi, index + 1)?;
            let value = self.operand(source)?;
            let target = self.phi_variable(phi);
            let temp = self.new_variable(target.kind);
            self.emit_move(Value::Variable(temp), value)?;
            staged.push((target, temp));
        }
        for (target, temp) in staged {
            self.emit_move(Value::Variable(target), Value::Variable(temp))?;
        }
        let block = self
            .cfg
            .block_of(merge)
            .ok_or_else(|| KilnError::internal_at(merge.index(), "merge outside the cfg"))?;
        self.append(LirInstruction::jump(block));
        Ok(())
    }

    fn do_if(&mut self, node: NodeId, probability: f64) -> KilnResult<()> {
        let successors = &self.cfg.block(self.current_block).successors;
        let (true_block, false_block) = match successors.as_slice() {
            [t, f] => (*t, *f),
            _ => return Err(KilnError::internal_at(node.index(), "If without two successor blocks")),
        };
        let condition = self.input(node, 0)?;
        if self.try_implicit_null_check(condition, true_block, false_block)? {
            return Ok(());
        }
        self.emit_branch(condition, true_block, false_block, probability)
    }

    /// `if (x == null) deopt(NullCheckException)` becomes a faulting probe
    /// of `[x]` that records an implicit exception site.
    fn try_implicit_null_check(
        &mut self,
        condition: NodeId,
        null_block: BlockId,
        non_null_block: BlockId,
    ) -> KilnResult<bool> {
        if !self.tool.implicit_null_checks() || !matches!(self.graph.kind(condition), NodeKind::IsNull) {
            return Ok(false);
        }
        let nodes = &self.cfg.block(null_block).nodes;
        let deopt = match nodes.as_slice() {
            [_, d] => *d,
            _ => return Ok(false),
        };
        let info = match self.graph.kind(deopt) {
            NodeKind::Deoptimize(info) if info.reason == DeoptReason::NullCheckException => *info,
            _ => return Ok(false),
        };
        let object = self.input(condition, 0)?;
        let base = self.operand(object)?;
        let base = self.in_variable(base)?;
        let state = self.state_for(deopt, info);
        self.append(
            LirInstruction::new(
                LirOp::NullCheck,
                &[Operand::use_(
                    Value::Address(AddressValue::new(AddressBase::Variable(base), 0)),
                    OperandFlags::COMPOSITE,
                )],
            )
            .with_state(state),
        );
        self.append(LirInstruction::jump(non_null_block));
        Ok(true)
    }

    /// Branch to `true_target` when `condition` holds.
    pub fn emit_branch(
        &mut self,
        condition: NodeId,
        true_target: BlockId,
        false_target: BlockId,
        probability: f64,
    ) -> KilnResult<()> {
        match self.graph.kind(condition).clone() {
            NodeKind::LogicConstant(value) => {
                self.append(LirInstruction::jump(if value { true_target } else { false_target }));
            }
            NodeKind::LogicNegation => {
                let inner = self.input(condition, 0)?;
                self.emit_branch(inner, false_target, true_target, 1.0 - probability)?;
            }
            NodeKind::Compare(op) => {
                let (x, y) = (self.input(condition, 0)?, self.input(condition, 1)?);
                if op.is_float() {
                    let x = self.register_operand(x)?;
                    let y = self.register_operand(y)?;
                    let tool = self.tool;
                    tool.emit_float_branch(self, op, x, y, true_target, false_target, probability)?;
                } else {
                    let (x, y) = self.compare_operands(op, x, y)?;
                    let bits = op_bits(x.kind());
                    self.append_branch(op, bits, x, y, true_target, false_target, probability);
                }
            }
            NodeKind::IsNull => {
                let x = self.input(condition, 0)?;
                let x = self.register_operand(x)?;
                let null = Value::Constant(Constant::Null);
                self.append_branch(CompareOp::ObjectEquals, 64, x, null, true_target, false_target, probability);
            }
            _ => {
                let value = self.logic_value(condition)?;
                let zero = Value::Constant(Constant::Int(0));
                self.append_branch(
                    CompareOp::IntegerEquals,
                    32,
                    value,
                    zero,
                    false_target,
                    true_target,
                    1.0 - probability,
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn append_branch(
        &mut self,
        op: CompareOp,
        bits: u32,
        x: Value,
        y: Value,
        true_target: BlockId,
        false_target: BlockId,
        probability: f64,
    ) {
        self.append(LirInstruction::new(
            LirOp::Branch {
                op,
                bits,
                true_target,
                false_target,
                probability,
            },
            &[
                Operand::use_(x, OperandFlags::REG),
                Operand::use_(y, OperandFlags::REG | OperandFlags::CONST),
            ],
        ));
    }

    /// Left operand in a register, right operand inline when it fits.
    fn compare_operands(&mut self, op: CompareOp, x: NodeId, y: NodeId) -> KilnResult<(Value, Value)> {
        let (mut x, mut y) = (self.operand(x)?, self.operand(y)?);
        if x.is_constant() && !y.is_constant() && op.is_symmetric() {
            std::mem::swap(&mut x, &mut y);
        }
        let x = Value::Variable(self.in_variable(x)?);
        let y = match y {
            Value::Constant(c) if self.tool.move_factory().can_inline_constant(&c) => y,
            other => Value::Variable(self.in_variable(other)?),
        };
        Ok((x, y))
    }

    fn do_foreign_call(&mut self, node: NodeId, descriptor: &Arc<ForeignCallDescriptor>) -> KilnResult<()> {
        let inputs = self.graph.node(node).inputs().to_vec();
        let mut args = Vec::with_capacity(inputs.len());
        for input in inputs {
            let value = self.operand(input)?;
            let value = match value {
                Value::Constant(c) if self.tool.move_factory().can_inline_constant(&c) => value,
                other => Value::Variable(self.in_variable(other)?),
            };
            args.push(value);
        }
        let result = match descriptor.result() {
            ValueKind::Void => Value::Illegal,
            kind => Value::Variable(self.new_variable(kind.stack_kind())),
        };
        self.lir.max_call_arguments = self.lir.max_call_arguments.max(args.len() as u32);
        let state = self.state_for(node, DeoptInfo::new(DeoptReason::None, DeoptAction::None));
        let tool = self.tool;
        tool.emit_foreign_call(self, descriptor, &args, result, state)?;
        if !result.is_illegal() {
            self.set_result(node, result);
        }
        Ok(())
    }

    fn do_array_equals(&mut self, node: NodeId, kind: ValueKind) -> KilnResult<()> {
        let Some(op) = self.tool.array_equals_op(kind, self.options) else {
            let descriptor = Arc::new(ForeignCallDescriptor::new(
                format!("array_equals_{kind}"),
                &[ValueKind::Long, ValueKind::Long, ValueKind::Int],
                ValueKind::Int,
            ));
            return self.do_foreign_call(node, &descriptor);
        };
        let mut alive: SmallVec<[Value; 3]> = SmallVec::new();
        for i in 0..3 {
            let input = self.input(node, i)?;
            let value = self.operand(input)?;
            alive.push(Value::Variable(self.in_variable(value)?));
        }
        let result = Value::Variable(self.new_variable(ValueKind::Int));
        let mut operands: SmallVec<[Operand; 4]> = SmallVec::new();
        operands.push(Operand::def(result, OperandFlags::REG));
        for value in alive {
            operands.push(Operand::alive(value, OperandFlags::REG));
        }
        for _ in 0..4 {
            let temp = Value::Variable(self.new_variable(ValueKind::Long));
            operands.push(Operand::temp(temp, OperandFlags::REG));
        }
        let vector_temps = op.tier.vector_bytes().is_some() || op.needs_nan_check();
        for _ in 0..2 {
            let temp = if vector_temps {
                Value::Variable(self.new_variable(ValueKind::Double))
            } else {
                Value::Illegal
            };
            operands.push(Operand::temp(temp, OperandFlags::REG | OperandFlags::ILLEGAL));
        }
        self.append(LirInstruction::new(LirOp::ArrayEquals(op), &operands));
        self.set_result(node, result);
        Ok(())
    }

    // =========================================================================
    // Operands
    // =========================================================================

    fn input(&self, node: NodeId, index: usize) -> KilnResult<NodeId> {
        self.graph.node(node).input(index).ok_or_else(|| {
            KilnError::internal_at(
                node.index(),
                format!("{} is missing input {index}", self.graph.kind(node).name()),
            )
        })
    }

    fn value_kind(&self, node: NodeId) -> ValueKind {
        match self.graph.stamp(node).kind() {
            ValueKind::Void => ValueKind::Int,
            k => k,
        }
    }

    fn state_for(&self, node: NodeId, deopt: DeoptInfo) -> LirFrameState {
        LirFrameState::new(self.graph.node(node).position.clone(), deopt)
    }

    fn lookup(&self, node: NodeId) -> Option<Value> {
        let dominators = self.cfg.dominators();
        self.results.get(&node).and_then(|defs| {
            defs.iter()
                .rev()
                .find(|(block, _)| dominators.dominates(*block, self.current_block))
                .map(|(_, value)| *value)
        })
    }

    fn phi_variable(&mut self, phi: NodeId) -> Variable {
        if let Some(&v) = self.phi_variables.get(&phi) {
            return v;
        }
        let v = self.new_variable(self.value_kind(phi));
        self.phi_variables.insert(phi, v);
        v
    }

    /// Value of `node` for use in the current block. Constants are returned
    /// as is; the consumer decides whether to inline them.
    pub fn operand(&mut self, node: NodeId) -> KilnResult<Value> {
        if let Some(value) = self.lookup(node) {
            return Ok(value);
        }
        let kind = self.graph.kind(node).clone();
        let value = match kind {
            NodeKind::Constant(c) => return Ok(Value::Constant(c)),
            NodeKind::LogicConstant(b) => return Ok(Value::Constant(Constant::boolean(b))),
            NodeKind::Phi => return Ok(Value::Variable(self.phi_variable(node))),
            ref k if k.is_logic() => return self.logic_value(node),
            ref k if k.is_fixed() || matches!(k, NodeKind::Parameter(_)) => {
                return Err(KilnError::internal_at(
                    node.index(),
                    format!("{} used before its definition", k.name()),
                ));
            }
            _ => self.emit_floating(node, &kind)?,
        };
        self.set_result(node, value);
        Ok(value)
    }

    /// Value of `node` in a variable.
    pub fn register_operand(&mut self, node: NodeId) -> KilnResult<Value> {
        let value = self.operand(node)?;
        Ok(Value::Variable(self.in_variable(value)?))
    }

    /// Composite address for an address-valued node.
    fn address_of(&mut self, node: NodeId) -> KilnResult<AddressValue> {
        if matches!(self.graph.kind(node), NodeKind::OffsetAddress) {
            let offset = self.input(node, 1)?;
            let base = self.input(node, 0)?;
            let base = self.operand(base)?;
            let base = self.in_variable(base)?;
            if let Some(displacement) = self.graph.as_integer(offset).and_then(|d| i32::try_from(d).ok()) {
                return Ok(AddressValue::new(AddressBase::Variable(base), displacement));
            }
            // Dynamic offset: fold it into a fresh base.
            let offset = self.operand(offset)?;
            let offset = Value::Variable(self.in_variable(offset)?);
            let sum = self.new_variable(ValueKind::Long);
            self.append(LirInstruction::binary(
                BinaryOp::Add,
                op_bits(ValueKind::Long),
                Value::Variable(sum),
                Value::Variable(base),
                offset,
            ));
            return Ok(AddressValue::new(AddressBase::Variable(sum), 0));
        }
        let value = self.operand(node)?;
        let base = self.in_variable(value)?;
        Ok(AddressValue::new(AddressBase::Variable(base), 0))
    }

    fn emit_floating(&mut self, node: NodeId, kind: &NodeKind) -> KilnResult<Value> {
        let result_kind = self.value_kind(node);
        match *kind {
            NodeKind::Binary(op) => {
                let (x, y) = (self.input(node, 0)?, self.input(node, 1)?);
                let (mut x, mut y) = (self.operand(x)?, self.operand(y)?);
                if x.is_constant() && !y.is_constant() && op.is_commutative() {
                    std::mem::swap(&mut x, &mut y);
                }
                let x = Value::Variable(self.in_variable(x)?);
                let y = match y {
                    Value::Constant(c) if self.tool.can_inline_binary(op, &c) => y,
                    other => Value::Variable(self.in_variable(other)?),
                };
                let dst = Value::Variable(self.new_variable(result_kind));
                self.append(LirInstruction::binary(op, op_bits(result_kind), dst, x, y));
                Ok(dst)
            }
            NodeKind::Negate | NodeKind::Not => {
                let op = if matches!(kind, NodeKind::Negate) {
                    UnaryOp::Negate
                } else {
                    UnaryOp::Not
                };
                let x = self.input(node, 0)?;
                let x = self.register_operand(x)?;
                let dst = Value::Variable(self.new_variable(result_kind));
                self.append(LirInstruction::new(
                    LirOp::Unary {
                        op,
                        bits: op_bits(result_kind),
                    },
                    &[Operand::def(dst, OperandFlags::REG), Operand::use_(x, OperandFlags::REG)],
                ));
                Ok(dst)
            }
            NodeKind::Narrow { bits } => self.emit_convert(node, ConvertOp::Narrow { bits }, result_kind),
            NodeKind::SignExtend { from, to } => {
                self.emit_convert(node, ConvertOp::SignExtend { from, to }, result_kind)
            }
            NodeKind::ZeroExtend { from, to } => {
                self.emit_convert(node, ConvertOp::ZeroExtend { from, to }, result_kind)
            }
            NodeKind::OffsetAddress => {
                let address = self.address_of(node)?;
                let dst = Value::Variable(self.new_variable(ValueKind::Long));
                self.emit_move(dst, Value::Address(address))?;
                Ok(dst)
            }
            NodeKind::Conditional => {
                let condition = self.input(node, 0)?;
                let condition = self.logic_value(condition)?;
                let t = self.input(node, 1)?;
                let t = self.register_operand(t)?;
                let f = self.input(node, 2)?;
                let f = self.register_operand(f)?;
                let dst = Value::Variable(self.new_variable(result_kind));
                self.append(LirInstruction::new(
                    LirOp::Select,
                    &[
                        Operand::def(dst, OperandFlags::REG),
                        Operand::alive(condition, OperandFlags::REG),
                        Operand::alive(t, OperandFlags::REG),
                        Operand::alive(f, OperandFlags::REG),
                    ],
                ));
                Ok(dst)
            }
            NodeKind::Guard(_) => Err(KilnError::internal_at(
                node.index(),
                "floating guard reached instruction selection",
            )),
            ref other => Err(KilnError::internal_at(
                node.index(),
                format!("no instruction selection for {}", other.name()),
            )),
        }
    }

    fn emit_convert(&mut self, node: NodeId, op: ConvertOp, result_kind: ValueKind) -> KilnResult<Value> {
        let x = self.input(node, 0)?;
        let x = self.register_operand(x)?;
        let dst = Value::Variable(self.new_variable(result_kind));
        self.append(LirInstruction::new(
            LirOp::Convert(op),
            &[Operand::def(dst, OperandFlags::REG), Operand::use_(x, OperandFlags::REG)],
        ));
        Ok(dst)
    }

    /// A logic node materialized as an `int` 0 or 1 in a variable.
    fn logic_value(&mut self, node: NodeId) -> KilnResult<Value> {
        if self.graph.kind(node).is_logic() {
            if let Some(value) = self.lookup(node) {
                return Ok(Value::Variable(self.in_variable(value)?));
            }
        }
        let value = match self.graph.kind(node).clone() {
            NodeKind::LogicConstant(b) => {
                Value::Variable(self.in_variable(Value::Constant(Constant::boolean(b)))?)
            }
            NodeKind::Compare(op) => {
                let (x, y) = (self.input(node, 0)?, self.input(node, 1)?);
                let (x, y) = if op.is_float() {
                    (self.register_operand(x)?, self.register_operand(y)?)
                } else {
                    self.compare_operands(op, x, y)?
                };
                self.compare_set(op, x, y)
            }
            NodeKind::IsNull => {
                let x = self.input(node, 0)?;
                let x = self.register_operand(x)?;
                self.compare_set(CompareOp::ObjectEquals, x, Value::Constant(Constant::Null))
            }
            NodeKind::LogicNegation => {
                let inner = self.input(node, 0)?;
                let inner = self.logic_value(inner)?;
                self.flip(inner)
            }
            NodeKind::ShortCircuitOr { x_negated, y_negated } => {
                let x = self.input(node, 0)?;
                let mut x = self.logic_value(x)?;
                if x_negated {
                    x = self.flip(x);
                }
                let y = self.input(node, 1)?;
                let mut y = self.logic_value(y)?;
                if y_negated {
                    y = self.flip(y);
                }
                let dst = Value::Variable(self.new_variable(ValueKind::Int));
                self.append(LirInstruction::binary(BinaryOp::Or, 32, dst, x, y));
                dst
            }
            NodeKind::Constant(c) => Value::Variable(self.in_variable(Value::Constant(c))?),
            _ => {
                // Any other int value: non-zero is true.
                let v = self.register_operand(node)?;
                let is_zero = self.compare_set(CompareOp::IntegerEquals, v, Value::Constant(Constant::Int(0)));
                return Ok(self.flip(is_zero));
            }
        };
        self.set_result(node, value);
        Ok(value)
    }

    fn compare_set(&mut self, op: CompareOp, x: Value, y: Value) -> Value {
        let dst = Value::Variable(self.new_variable(ValueKind::Int));
        let bits = op_bits(x.kind());
        self.append(LirInstruction::new(
            LirOp::CompareSet { op, bits },
            &[
                Operand::def(dst, OperandFlags::REG),
                Operand::use_(x, OperandFlags::REG),
                Operand::use_(y, OperandFlags::REG | OperandFlags::CONST),
            ],
        ));
        dst
    }

    fn flip(&mut self, value: Value) -> Value {
        let dst = Value::Variable(self.new_variable(ValueKind::Int));
        self.append(LirInstruction::binary(
            BinaryOp::Xor,
            32,
            dst,
            value,
            Value::Constant(Constant::Int(1)),
        ));
        dst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::amd64::Amd64LirGenerator;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::stamp::Stamp;
    use crate::lir::verify::verify_lir;

    fn build(graph: &Graph) -> Lir {
        let cfg = Cfg::build(graph).unwrap();
        let tool = Amd64LirGenerator::default();
        let options = CompilerOptions::debug();
        NodeLirBuilder::new(graph, &cfg, &tool, &options).build().unwrap()
    }

    #[test]
    fn test_add_and_return() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let one = b.graph().int(1);
        let sum = b.graph().add_node(NodeKind::Binary(BinaryOp::Add), &[x, one]);
        b.append_return(Some(sum)).unwrap();

        let lir = build(&g);
        verify_lir(&lir).unwrap();
        assert_eq!(lir.parameter_count, 1);
        let ops: Vec<&'static str> = lir.instructions().map(|i| i.name()).collect();
        assert_eq!(ops, ["label", "incoming", "binary", "return"]);
        let add = lir.instructions().find(|i| i.name() == "binary").unwrap();
        assert_eq!(add.value(2), Value::Constant(Constant::Int(1)));
    }

    #[test]
    fn test_diamond_phi_moves_and_branch() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let zero = b.graph().int(0);
        let cond = b.graph().add_node(NodeKind::Compare(CompareOp::IntegerLessThan), &[x, zero]);
        let mut scope = b.begin_if(cond, 0.25).unwrap();
        let one = b.graph().int(1);
        b.else_branch(&mut scope).unwrap();
        let two = b.graph().int(2);
        let join = b.end_if(scope).unwrap();
        let v = b.merge_value(&join, one, two);
        b.append_return(Some(v)).unwrap();

        let lir = build(&g);
        verify_lir(&lir).unwrap();
        let branch = lir
            .instructions()
            .find(|i| matches!(i.op, LirOp::Branch { .. }))
            .unwrap();
        assert!(matches!(
            branch.op,
            LirOp::Branch {
                op: CompareOp::IntegerLessThan,
                bits: 32,
                ..
            }
        ));
        // Each arm stages its phi input through a temporary.
        let constant_loads = lir
            .instructions()
            .filter(|i| matches!(i.op, LirOp::LoadConstant(_)))
            .count();
        assert_eq!(constant_loads, 2);
        assert_eq!(lir.blocks().len(), 4);
    }

    #[test]
    fn test_dynamic_offset_folds_into_base() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let object = b.parameter(0, Stamp::word());
        let offset = b.parameter(1, Stamp::word());
        let address = b.add(NodeKind::OffsetAddress, &[object, offset]);
        let value = b
            .read(crate::ir::kinds::LocationIdentity::Any, crate::ir::kinds::MemoryAccess::WORD, address)
            .unwrap();
        b.append_return(Some(value)).unwrap();

        let lir = build(&g);
        verify_lir(&lir).unwrap();
        let ops: Vec<&'static str> = lir.instructions().map(|i| i.name()).collect();
        let add = ops.iter().position(|op| *op == "binary").unwrap();
        let load = ops.iter().position(|op| *op == "load").unwrap();
        assert!(add < load, "{ops:?}");
    }

    #[test]
    fn test_unlowered_invoke_is_rejected() {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        b.append(
            NodeKind::Invoke {
                target: kiln_core::MethodRef::new(kiln_core::TypeRef::new("T"), "m", "()V"),
            },
            &[],
        )
        .unwrap();
        b.append_return(None).unwrap();
        let cfg = Cfg::build(&g).unwrap();
        let tool = Amd64LirGenerator::default();
        let options = CompilerOptions::debug();
        let err = NodeLirBuilder::new(&g, &cfg, &tool, &options).build().unwrap_err();
        assert!(err.is_internal());
    }
}
