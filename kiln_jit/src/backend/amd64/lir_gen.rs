//! AMD64 instruction selection hooks.

use super::features::{cpu_features, CpuFeatures};
use super::moves::Amd64MoveFactory;
use super::registers::{STACK_POINTER, THREAD};
use crate::backend::Target;
use crate::lir::array_equals::{ArrayEqualsOp, ArrayEqualsTier};
use crate::lir::value::Register;
use crate::lir::{LirGeneratorTool, MoveFactory};
use kiln_core::{CompilerOptions, ValueKind};

/// Instruction selection for AMD64 with a fixed CPU feature set.
#[derive(Debug, Clone)]
pub struct Amd64LirGenerator {
    moves: Amd64MoveFactory,
    features: CpuFeatures,
}

impl Amd64LirGenerator {
    pub fn new(features: CpuFeatures) -> Self {
        Amd64LirGenerator {
            moves: Amd64MoveFactory,
            features,
        }
    }

    #[inline]
    pub fn features(&self) -> CpuFeatures {
        self.features
    }
}

impl Default for Amd64LirGenerator {
    /// Generator for the host CPU.
    fn default() -> Self {
        Self::new(cpu_features())
    }
}

impl LirGeneratorTool for Amd64LirGenerator {
    fn target(&self) -> Target {
        Target::Amd64
    }

    fn move_factory(&self) -> &dyn MoveFactory {
        &self.moves
    }

    fn thread_register(&self) -> Register {
        THREAD.reg()
    }

    fn stack_pointer(&self) -> Register {
        STACK_POINTER.reg()
    }

    fn array_equals_op(&self, kind: ValueKind, options: &CompilerOptions) -> Option<ArrayEqualsOp> {
        let tier = if cfg!(feature = "no-simd") {
            ArrayEqualsTier::Word
        } else {
            ArrayEqualsTier::select(self.features, options.max_vector_bytes)
        };
        Some(ArrayEqualsOp::new(kind, tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_follows_features_and_options() {
        let avx = Amd64LirGenerator::new(CpuFeatures::SSE2 | CpuFeatures::SSE4_1 | CpuFeatures::AVX | CpuFeatures::AVX2);
        let mut options = CompilerOptions::default();
        let expected = if cfg!(feature = "no-simd") {
            ArrayEqualsTier::Word
        } else {
            ArrayEqualsTier::Avx
        };
        assert_eq!(avx.array_equals_op(ValueKind::Byte, &options).map(|op| op.tier), Some(expected));
        options.max_vector_bytes = 8;
        assert_eq!(avx.array_equals_op(ValueKind::Byte, &options).map(|op| op.tier), Some(ArrayEqualsTier::Word));
        let base = Amd64LirGenerator::new(CpuFeatures::BASELINE);
        options.max_vector_bytes = 32;
        assert_eq!(base.array_equals_op(ValueKind::Int, &options).map(|op| op.tier), Some(ArrayEqualsTier::Word));
    }
}
