//! Error types and result definitions for the compiler backend.
//!
//! Errors fall into three classes:
//! - **Target-program errors**: never produced by the backend; malformed
//!   bytecode is rejected before a graph is built.
//! - **Internal errors**: broken graph or LIR invariants, unknown profile
//!   tags, lowering run out of order. Fatal to the one compilation that hit
//!   them and nothing else.
//! - **Recoverable conditions**: handled in place by taking a slower path.
//!   Only [`KilnError::Bailout`] reaches callers, and it means "leave this
//!   method to the interpreter".

use thiserror::Error;

/// The result type used throughout the backend.
pub type KilnResult<T> = Result<T, KilnError>;

/// Coarse classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Error in the program being compiled.
    TargetProgram,
    /// Compiler bug: an invariant was violated.
    Internal,
    /// Expected condition; the caller may retry or fall back.
    Recoverable,
}

/// A failed structural check from one of the verification phases.
///
/// Kept apart from [`KilnError::Internal`] so a verifier hit reads as a
/// compiler bug with a phase name attached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification of {phase} failed: {message}")]
pub struct VerificationError {
    /// Name of the check that failed.
    pub phase: &'static str,
    /// What was wrong.
    pub message: String,
    /// Raw index of the offending node, when there is one.
    pub node: Option<u32>,
}

impl VerificationError {
    /// Create a verification error not tied to a node.
    #[must_use]
    pub fn new(phase: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            node: None,
        }
    }

    /// Create a verification error pointing at a node.
    #[must_use]
    pub fn at(phase: &'static str, node: u32, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            node: Some(node),
        }
    }
}

/// Every error the backend can raise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KilnError {
    /// An internal invariant was violated.
    #[error("internal compiler error: {message}")]
    Internal {
        /// Diagnostic message.
        message: String,
        /// Offending node, if known.
        node: Option<u32>,
    },

    /// A verification phase rejected the graph.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// An LIR instruction was built with operands its flags forbid.
    #[error("illegal operands for {instruction}: {message}")]
    IllegalLir {
        /// Instruction mnemonic.
        instruction: &'static str,
        /// What was wrong.
        message: String,
    },

    /// The profiling buffer holds a tag with no accessor.
    #[error("unknown profile data tag {tag} at position {position}")]
    UnknownProfileTag {
        /// The tag byte read from the buffer.
        tag: u8,
        /// Byte position of the record.
        position: usize,
    },

    /// A lowering phase ran before or after its slot in the tier order.
    #[error("lowering order violated: {message}")]
    LoweringOrder {
        /// What was out of order.
        message: String,
    },

    /// Snippet arguments did not match the template's parameters.
    #[error("snippet `{snippet}`: {message}")]
    SnippetBinding {
        /// Template name.
        snippet: String,
        /// Binding problem.
        message: String,
    },

    /// Machine code could not be produced (unbound label, out-of-range
    /// displacement, register class mismatch).
    #[error("emission failed: {message}")]
    Emission {
        /// What went wrong.
        message: String,
    },

    /// A configuration table failed validation.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was invalid.
        message: String,
    },

    /// Compilation was abandoned; the method stays interpreted.
    #[error("bailout: {message}")]
    Bailout {
        /// Why the compiler gave up.
        message: String,
    },
}

impl KilnError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            node: None,
        }
    }

    /// Create an internal error that names a node.
    #[must_use]
    pub fn internal_at(node: u32, message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            node: Some(node),
        }
    }

    /// Create an illegal-LIR error.
    #[must_use]
    pub fn illegal_lir(instruction: &'static str, message: impl Into<String>) -> Self {
        Self::IllegalLir {
            instruction,
            message: message.into(),
        }
    }

    /// Create a lowering-order error.
    #[must_use]
    pub fn lowering_order(message: impl Into<String>) -> Self {
        Self::LoweringOrder {
            message: message.into(),
        }
    }

    /// Create a snippet-binding error.
    #[must_use]
    pub fn snippet(snippet: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SnippetBinding {
            snippet: snippet.into(),
            message: message.into(),
        }
    }

    /// Create an emission error.
    #[must_use]
    pub fn emission(message: impl Into<String>) -> Self {
        Self::Emission {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a bailout.
    #[must_use]
    pub fn bailout(message: impl Into<String>) -> Self {
        Self::Bailout {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            KilnError::Bailout { .. } => ErrorClass::Recoverable,
            KilnError::Internal { .. }
            | KilnError::Verification(_)
            | KilnError::IllegalLir { .. }
            | KilnError::UnknownProfileTag { .. }
            | KilnError::LoweringOrder { .. }
            | KilnError::SnippetBinding { .. }
            | KilnError::Emission { .. }
            | KilnError::Config { .. } => ErrorClass::Internal,
        }
    }

    /// Check whether this error signals a compiler bug.
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.class() == ErrorClass::Internal
    }

    /// Node the error refers to, if any.
    pub fn node(&self) -> Option<u32> {
        match self {
            KilnError::Internal { node, .. } => *node,
            KilnError::Verification(v) => v.node,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_error_is_distinguishable() {
        let err: KilnError = VerificationError::at("GraphIntegrity", 7, "dangling input").into();
        assert!(matches!(err, KilnError::Verification(_)));
        assert_eq!(err.node(), Some(7));
        assert_eq!(err.class(), ErrorClass::Internal);
        assert_eq!(
            err.to_string(),
            "verification of GraphIntegrity failed: dangling input"
        );
    }

    #[test]
    fn test_bailout_is_recoverable() {
        let err = KilnError::bailout("unresolved type");
        assert_eq!(err.class(), ErrorClass::Recoverable);
        assert!(!err.is_internal());
    }

    #[test]
    fn test_unknown_tag_message() {
        let err = KilnError::UnknownProfileTag { tag: 42, position: 16 };
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "unknown profile data tag 42 at position 16");
    }
}
