//! Deoptimization reason and action codes.
//!
//! Every guard and deoptimizing node carries a reason, an action and an
//! optional speculation handle. The runtime interprets the triple to decide
//! whether to reprofile, recompile, or stop speculating on a path.

use std::fmt;

// =============================================================================
// Deoptimization Reason
// =============================================================================

/// Why compiled code gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeoptReason {
    None = 0,
    NullCheckException = 1,
    BoundsCheckException = 2,
    ClassCastException = 3,
    ArrayStoreException = 4,
    UnreachedCode = 5,
    TypeCheckedInliningViolated = 6,
    OptimizedTypeCheckViolated = 7,
    NotCompiledExceptionHandler = 8,
    Unresolved = 9,
    JavaSubroutineMismatch = 10,
    ArithmeticException = 11,
    RuntimeConstraint = 12,
    LoopLimitCheck = 13,
    TransferToInterpreter = 14,
}

impl DeoptReason {
    /// Number of reasons, used to size per-reason counters.
    pub const COUNT: usize = 15;

    /// All reasons in encoding order.
    pub const ALL: [DeoptReason; Self::COUNT] = [
        DeoptReason::None,
        DeoptReason::NullCheckException,
        DeoptReason::BoundsCheckException,
        DeoptReason::ClassCastException,
        DeoptReason::ArrayStoreException,
        DeoptReason::UnreachedCode,
        DeoptReason::TypeCheckedInliningViolated,
        DeoptReason::OptimizedTypeCheckViolated,
        DeoptReason::NotCompiledExceptionHandler,
        DeoptReason::Unresolved,
        DeoptReason::JavaSubroutineMismatch,
        DeoptReason::ArithmeticException,
        DeoptReason::RuntimeConstraint,
        DeoptReason::LoopLimitCheck,
        DeoptReason::TransferToInterpreter,
    ];

    /// Get the encoding.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decode from an index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Short name.
    pub const fn name(self) -> &'static str {
        match self {
            DeoptReason::None => "none",
            DeoptReason::NullCheckException => "null_check",
            DeoptReason::BoundsCheckException => "range_check",
            DeoptReason::ClassCastException => "class_check",
            DeoptReason::ArrayStoreException => "array_check",
            DeoptReason::UnreachedCode => "unreached",
            DeoptReason::TypeCheckedInliningViolated => "type_checked_inlining",
            DeoptReason::OptimizedTypeCheckViolated => "optimized_type_check",
            DeoptReason::NotCompiledExceptionHandler => "not_compiled_exception_handler",
            DeoptReason::Unresolved => "unresolved",
            DeoptReason::JavaSubroutineMismatch => "jsr_mismatch",
            DeoptReason::ArithmeticException => "div0_check",
            DeoptReason::RuntimeConstraint => "constraint",
            DeoptReason::LoopLimitCheck => "loop_limit_check",
            DeoptReason::TransferToInterpreter => "transfer_to_interpreter",
        }
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Deoptimization Action
// =============================================================================

/// What the runtime should do after deoptimizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeoptAction {
    /// Just interpret; do not invalidate or reprofile.
    None = 0,
    /// Recompile, reusing the current profile.
    RecompileIfTooManyDeopts = 1,
    /// Invalidate the code; keep profiling.
    InvalidateReprofile = 2,
    /// Invalidate the code and recompile immediately.
    InvalidateRecompile = 3,
    /// Invalidate the code and stop compiling the method.
    InvalidateStopCompiling = 4,
}

impl DeoptAction {
    /// Whether this action invalidates the installed code.
    #[inline]
    pub const fn does_invalidate(self) -> bool {
        matches!(
            self,
            DeoptAction::InvalidateReprofile
                | DeoptAction::InvalidateRecompile
                | DeoptAction::InvalidateStopCompiling
        )
    }
}

// =============================================================================
// Speculation
// =============================================================================

/// Identity of a speculative assumption, recorded in a speculation log.
///
/// Two guards derived from the same assumption share the reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpeculationReason {
    /// Grouping identifier (e.g. a guard kind).
    pub group: &'static str,
    /// Bytecode index the assumption is about.
    pub bci: i32,
    /// Extra discriminator inside the group.
    pub detail: u64,
}

impl SpeculationReason {
    /// Create a reason.
    pub const fn new(group: &'static str, bci: i32, detail: u64) -> Self {
        Self { group, bci, detail }
    }
}

/// Opaque handle the runtime hands back when a speculation is taken.
///
/// `NO_SPECULATION` marks guards that do not speculate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeculationHandle(pub u64);

impl SpeculationHandle {
    /// The absent speculation.
    pub const NO_SPECULATION: SpeculationHandle = SpeculationHandle(0);

    /// Whether this handle refers to a real speculation.
    #[inline]
    pub const fn is_speculative(self) -> bool {
        self.0 != 0
    }
}

impl Default for SpeculationHandle {
    fn default() -> Self {
        Self::NO_SPECULATION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_roundtrip_index() {
        for reason in DeoptReason::ALL {
            assert_eq!(DeoptReason::from_index(reason.index()), Some(reason));
        }
        assert_eq!(DeoptReason::from_index(DeoptReason::COUNT), None);
    }

    #[test]
    fn test_action_invalidation() {
        assert!(!DeoptAction::None.does_invalidate());
        assert!(!DeoptAction::RecompileIfTooManyDeopts.does_invalidate());
        assert!(DeoptAction::InvalidateReprofile.does_invalidate());
    }

    #[test]
    fn test_no_speculation() {
        assert!(!SpeculationHandle::default().is_speculative());
        assert!(SpeculationHandle(3).is_speculative());
    }
}
