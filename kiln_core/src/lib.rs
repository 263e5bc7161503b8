//! Core types shared by the Kiln compiler backend crates.
//!
//! - [`error`]: the backend-wide error type and its three classes
//! - [`deopt`]: deoptimization reasons, actions and speculation handles
//! - [`meta`]: handles for front-end metadata (types, methods, bytecode)
//! - [`constant`]: compile-time constants
//! - [`memory`]: raw memory interface used by runtime stubs and the evaluator
//! - [`options`]: per-compilation options

pub mod constant;
pub mod deopt;
pub mod error;
pub mod memory;
pub mod meta;
pub mod options;

pub use constant::Constant;
pub use deopt::{DeoptAction, DeoptReason, SpeculationHandle, SpeculationReason};
pub use error::{ErrorClass, KilnError, KilnResult, VerificationError};
pub use memory::{AccessSize, RawMemory, RuntimeCalls};
pub use meta::{BytecodeProvider, MethodRef, NoBytecode, Opcode, TypeRef, ValueKind};
pub use options::CompilerOptions;
