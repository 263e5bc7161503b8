//! SPARC V9 backend.
//!
//! Register windows preserve the `l` and `i` registers across calls, so the
//! prologue saves nothing beyond the window itself.

pub mod emitter;
pub mod encoder;
pub mod lir_gen;
pub mod moves;
pub mod registers;

pub use lir_gen::SparcLirGenerator;
pub use moves::SparcMoveFactory;

use super::{Backend, Target};
use crate::emit::CompilationResult;
use crate::lir::{FrameMap, Lir, LirGeneratorTool};
use crate::regalloc::RegisterConfig;
use kiln_core::KilnResult;
use kiln_gc::ThreadLayout;

// ELF SPARC relocation kinds recorded in the relocation table.
pub const RELOC_64: u16 = 54;
pub const RELOC_WDISP30: u16 = 7;

/// SPARC V9 code generation.
#[derive(Debug, Clone)]
pub struct SparcBackend {
    generator: SparcLirGenerator,
    config: RegisterConfig,
    layout: ThreadLayout,
}

impl SparcBackend {
    /// Backend whose C-call epilogues clear the frame anchor in `layout`.
    pub fn new(layout: ThreadLayout) -> Self {
        SparcBackend {
            generator: SparcLirGenerator::default(),
            config: registers::register_config(),
            layout,
        }
    }
}

impl Default for SparcBackend {
    fn default() -> Self {
        Self::new(ThreadLayout::default())
    }
}

impl Backend for SparcBackend {
    fn target(&self) -> Target {
        Target::Sparc
    }

    fn lir_generator(&self) -> &dyn LirGeneratorTool {
        &self.generator
    }

    fn register_config(&self) -> &RegisterConfig {
        &self.config
    }

    fn saves_callee_saved(&self) -> bool {
        false
    }

    fn emit(&self, lir: &Lir, frame: &FrameMap) -> KilnResult<CompilationResult> {
        emitter::emit(lir, frame, &self.layout)
    }
}
