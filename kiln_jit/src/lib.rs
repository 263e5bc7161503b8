//! Kiln compiler backend.
//!
//! Graph IR in, machine code out:
//! - Node graph IR with source positions and an evaluator
//! - Canonicalization, verification and tiered phase suites
//! - Lowering of guards, write barriers and intrinsic substitutions
//! - LIR with target move factories and linear-scan allocation
//! - Code emission for AMD64, AArch64 and SPARC
//! - Foreign call stub graphs
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod backend;
pub mod emit;
pub mod ir;
pub mod lir;
pub mod lowering;
pub mod opt;
pub mod regalloc;
pub mod stubs;

pub use backend::{backend_for, compile, Backend, Target};
pub use emit::{CompilationResult, RelocationEntry};
pub use ir::{Graph, GraphBuilder, NodeId, NodeKind};
pub use opt::{Phase, PhaseSuite, Suites};
pub use stubs::{ForeignCallDescriptor, ForeignCallStub, StubCache};
