//! Target backends.
//!
//! Each target provides instruction selection hooks, a move factory, a
//! register file for the allocator and an emitter:
//!
//! - `amd64`: x86-64, System V calling convention
//! - `aarch64`: ARMv8-A, AAPCS64
//! - `sparc`: SPARC V9, register windows, big-endian
//!
//! [`compile`] runs a low-tier graph through instruction selection,
//! register allocation, frame layout and emission.

pub mod aarch64;
pub mod amd64;
pub mod sparc;

use crate::emit::CompilationResult;
use crate::ir::cfg::{BlockId, Cfg};
use crate::ir::graph::Graph;
use crate::lir::{verify_allocated, verify_lir, FrameMap, Lir, LirGeneratorTool, LirInstruction, NodeLirBuilder};
use crate::regalloc::{allocate_registers, RegisterConfig};
use kiln_core::{CompilerOptions, KilnResult};
use std::fmt;

// =============================================================================
// Target
// =============================================================================

/// Instruction set a compilation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Amd64,
    AArch64,
    Sparc,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::Amd64, Target::AArch64, Target::Sparc];

    pub const fn name(self) -> &'static str {
        match self {
            Target::Amd64 => "amd64",
            Target::AArch64 => "aarch64",
            Target::Sparc => "sparc",
        }
    }

    /// Byte order of instruction words and data.
    #[inline]
    pub const fn is_big_endian(self) -> bool {
        matches!(self, Target::Sparc)
    }

    /// Target of the machine running the compiler, if supported.
    pub const fn host() -> Option<Target> {
        if cfg!(target_arch = "x86_64") {
            Some(Target::Amd64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Target::AArch64)
        } else if cfg!(target_arch = "sparc64") {
            Some(Target::Sparc)
        } else {
            None
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Everything target-specific about code generation.
pub trait Backend: Send + Sync {
    fn target(&self) -> Target;

    fn lir_generator(&self) -> &dyn LirGeneratorTool;

    fn register_config(&self) -> &RegisterConfig;

    /// Whether the prologue saves the callee-saved registers it uses.
    /// Register window targets get them preserved by the hardware.
    fn saves_callee_saved(&self) -> bool {
        true
    }

    /// Emit allocated LIR.
    fn emit(&self, lir: &Lir, frame: &FrameMap) -> KilnResult<CompilationResult>;
}

/// Backend for `target` with its default configuration.
pub fn backend_for(target: Target) -> Box<dyn Backend> {
    match target {
        Target::Amd64 => Box::new(amd64::Amd64Backend::default()),
        Target::AArch64 => Box::new(aarch64::AArch64Backend::default()),
        Target::Sparc => Box::new(sparc::SparcBackend::default()),
    }
}

/// Compile a low-tier graph to machine code.
pub fn compile(graph: &Graph, backend: &dyn Backend, options: &CompilerOptions) -> KilnResult<CompilationResult> {
    let cfg = Cfg::build(graph)?;
    let mut lir = NodeLirBuilder::new(graph, &cfg, backend.lir_generator(), options).build()?;
    if options.verify_lir {
        verify_lir(&lir)?;
    }
    let allocation = allocate_registers(
        &mut lir,
        backend.register_config(),
        backend.lir_generator().move_factory(),
    )?;
    let saved = if backend.saves_callee_saved() {
        allocation.used_callee_saved
    } else {
        Vec::new()
    };
    let frame = FrameMap::build(&lir, &saved);
    frame.assign(&mut lir)?;
    if options.verify_lir {
        verify_allocated(&lir)?;
    }
    log::trace!("{} allocated lir:\n{lir}", backend.target());
    backend.emit(&lir, &frame)
}

// =============================================================================
// Emission Driver
// =============================================================================

/// Per-instruction code emission.
pub(crate) trait InstructionEmitter {
    /// Emit `inst`; `next` is the block that follows in code order, so
    /// jumps to it can fall through.
    fn emit_instruction(&mut self, inst: &LirInstruction, next: Option<BlockId>) -> KilnResult<()>;
}

/// Emit every block of `lir` in code order.
pub(crate) fn emit_blocks<E: InstructionEmitter>(emitter: &mut E, lir: &Lir) -> KilnResult<()> {
    let blocks = lir.blocks();
    for (i, block) in blocks.iter().enumerate() {
        let next = blocks.get(i + 1).map(|b| b.id);
        for inst in &block.instructions {
            emitter.emit_instruction(inst, next)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_properties() {
        assert!(Target::Sparc.is_big_endian());
        assert!(!Target::Amd64.is_big_endian());
        assert_eq!(Target::AArch64.to_string(), "aarch64");
        for target in Target::ALL {
            assert_eq!(backend_for(target).target(), target);
        }
    }
}
