//! AMD64 backend.

mod array_equals;
pub mod emitter;
pub mod encoder;
pub mod features;
pub mod lir_gen;
pub mod moves;
pub mod registers;

pub use lir_gen::Amd64LirGenerator;
pub use moves::Amd64MoveFactory;

use super::{Backend, Target};
use crate::emit::CompilationResult;
use crate::lir::{FrameMap, Lir, LirGeneratorTool};
use crate::regalloc::RegisterConfig;
use features::CpuFeatures;
use kiln_core::KilnResult;

// ELF x86-64 relocation kinds recorded in the relocation table.
pub const RELOC_ADDR64: u16 = 1;
pub const RELOC_ADDR32: u16 = 2;
pub const RELOC_ADDR32NB: u16 = 3;
pub const RELOC_REL32: u16 = 4;

/// System V AMD64 code generation.
#[derive(Debug, Clone)]
pub struct Amd64Backend {
    generator: Amd64LirGenerator,
    config: RegisterConfig,
}

impl Amd64Backend {
    /// Backend targeting a CPU with `features`.
    pub fn new(features: CpuFeatures) -> Self {
        Amd64Backend {
            generator: Amd64LirGenerator::new(features),
            config: registers::register_config(),
        }
    }
}

impl Default for Amd64Backend {
    fn default() -> Self {
        Amd64Backend {
            generator: Amd64LirGenerator::default(),
            config: registers::register_config(),
        }
    }
}

impl Backend for Amd64Backend {
    fn target(&self) -> Target {
        Target::Amd64
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
