//! Graph intermediate representation.
//!
//! # Core Components
//!
//! - **Arena** (`arena.rs`): typed ids, node storage, side tables
//! - **Kinds** (`kinds.rs`): the closed set of node kinds and their payloads
//! - **Stamp** (`stamp.rs`): abstract value types
//! - **Node** (`node.rs`): node storage with inputs, control edges and flags
//! - **Graph** (`graph.rs`): mutation API with an incremental usage index
//! - **CFG** (`cfg.rs`): basic blocks, dominators, guard placement
//! - **Builder** (`builder.rs`): structured construction of control flow
//! - **Source positions** (`source_position.rs`): inlining-aware positions
//! - **Eval** (`eval.rs`): interpreter used to check rewrites

pub mod arena;
pub mod builder;
pub mod cfg;
pub mod eval;
pub mod graph;
pub mod kinds;
pub mod node;
pub mod source_position;
pub mod stamp;

pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::{GraphBuilder, IfScope, Join, LoopScope};
pub use cfg::{BasicBlock, BlockId, Cfg, DominatorTree};
pub use eval::{evaluate, EvalOutcome, Evaluator};
pub use graph::{Graph, GuardsStage};
pub use kinds::{
    BarrierKind, BinaryOp, CompareOp, DeoptInfo, GuardInfo, LocationIdentity, MemoryAccess,
    MemoryBarriers, NodeKind, RegisterRole,
};
pub use node::{InputList, Node, NodeFlags, NodeId};
pub use source_position::{CallerCheck, Marker, NodeSourcePosition, SourceLanguagePosition};
pub use stamp::Stamp;
