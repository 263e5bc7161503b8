//! Compiler options.
//!
//! # Example
//!
//! ```ignore
//! use kiln_core::CompilerOptions;
//!
//! let options = CompilerOptions {
//!     strict_source_positions: true,
//!     ..CompilerOptions::debug()
//! };
//! options.validate()?;
//! ```

use crate::error::{KilnError, KilnResult};

/// Options that steer one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    // =========================================================================
    // Verification
    // =========================================================================
    /// Run the graph verification phases between tiers.
    ///
    /// Default: on in debug builds, off in release builds.
    pub verify_graphs: bool,

    /// Check each inlining splice against the caller's invoke bytecode.
    ///
    /// Default: false
    pub strict_source_positions: bool,

    /// Verify LIR operand flags after instruction selection.
    ///
    /// Default: same as `verify_graphs`
    pub verify_lir: bool,

    /// Object results of runtime stubs pass through the `verify_oop`
    /// runtime routine.
    ///
    /// Default: false
    pub verify_oops: bool,

    // =========================================================================
    // Canonicalization
    // =========================================================================
    /// Upper bound on worklist pops per canonicalizer run.
    ///
    /// A graph that has not converged by then is reported as an internal
    /// error, since every rewrite strictly shrinks or simplifies the graph.
    ///
    /// Default: 100_000
    pub max_canonicalizer_steps: usize,

    // =========================================================================
    // Lowering
    // =========================================================================
    /// Let fixed guards float during the high tier.
    ///
    /// Default: true
    pub floating_guards: bool,

    /// Track source positions on nodes.
    ///
    /// Default: true
    pub track_source_positions: bool,

    // =========================================================================
    // Code Generation
    // =========================================================================
    /// Largest SIMD width in bytes the array-equals intrinsic may use
    /// (32, 16 or 8). Clamped further by detected CPU features.
    ///
    /// Default: 32
    pub max_vector_bytes: u32,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            verify_graphs: cfg!(debug_assertions),
            strict_source_positions: false,
            verify_lir: cfg!(debug_assertions),
            verify_oops: false,
            max_canonicalizer_steps: 100_000,
            floating_guards: true,
            track_source_positions: true,
            max_vector_bytes: 32,
        }
    }
}

impl CompilerOptions {
    /// Options with every check switched on.
    pub fn debug() -> Self {
        Self {
            verify_graphs: true,
            strict_source_positions: true,
            verify_lir: true,
            verify_oops: true,
            ..Default::default()
        }
    }

    /// Options for fast production compiles.
    pub fn production() -> Self {
        Self {
            verify_graphs: false,
            strict_source_positions: false,
            verify_lir: false,
            ..Default::default()
        }
    }

    /// Validate option combinations.
    pub fn validate(&self) -> KilnResult<()> {
        if !matches!(self.max_vector_bytes, 8 | 16 | 32) {
            return Err(KilnError::config(format!(
                "max_vector_bytes must be 8, 16 or 32, got {}",
                self.max_vector_bytes
            )));
        }
        if self.max_canonicalizer_steps == 0 {
            return Err(KilnError::config("max_canonicalizer_steps must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(CompilerOptions::default().validate().is_ok());
        assert!(CompilerOptions::debug().validate().is_ok());
        assert!(CompilerOptions::production().validate().is_ok());
    }

    #[test]
    fn test_bad_vector_width() {
        let options = CompilerOptions {
            max_vector_bytes: 24,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(KilnError::Config { .. })));
    }

    #[test]
    fn test_debug_enables_checks() {
        let options = CompilerOptions::debug();
        assert!(options.verify_graphs);
        assert!(options.strict_source_positions);
        assert!(options.verify_lir);
    }
}
