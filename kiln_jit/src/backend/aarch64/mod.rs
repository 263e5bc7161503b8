//! AArch64 backend.

pub mod emitter;
pub mod encoder;
pub mod lir_gen;
pub mod moves;
pub mod registers;

pub use lir_gen::AArch64LirGenerator;
pub use moves::AArch64MoveFactory;

use super::{Backend, Target};
use crate::emit::CompilationResult;
use crate::lir::{FrameMap, Lir, LirGeneratorTool};
use crate::regalloc::RegisterConfig;
use kiln_core::KilnResult;

// ELF AArch64 relocation kinds recorded in the relocation table.
pub const RELOC_ABS64: u16 = 1;
pub const RELOC_ADR_PREL_LO21: u16 = 2;
pub const RELOC_BRANCH26: u16 = 3;

/// AAPCS64 code generation.
#[derive(Debug, Clone)]
pub struct AArch64Backend {
    generator: AArch64LirGenerator,
    config: RegisterConfig,
}

impl Default for AArch64Backend {
    fn default() -> Self {
        AArch64Backend {
            generator: AArch64LirGenerator::default(),
            config: registers::register_config(),
        }
    }
}

impl Backend for AArch64Backend {
    fn target(&self) -> Target {
        Target::AArch64
    }

    fn lir_generator(&self) -> &dyn LirGeneratorTool {
        &self.generator
    }

    fn register_config(&self) -> &RegisterConfig {
        &self.config
    }

    fn emit(&self, lir: &Lir, frame: &FrameMap) -> KilnResult<CompilationResult> {
        emitter::emit(lir, frame)
    }
}
