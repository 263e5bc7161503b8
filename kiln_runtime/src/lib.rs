//! Kiln runtime interfaces.
//!
//! Read-side views of runtime-owned data the compiler consumes:
//!
//! - [`profile`]: method profiling buffers, decoded through a tag-indexed
//!   accessor table
//! - [`speculation`]: per-method speculation logs and their registry

#![warn(clippy::all)]

pub mod profile;
pub mod speculation;

pub use profile::{AccessorTable, MethodData, ProfileAccessor, ProfileLayout};
pub use speculation::{SpeculationLog, SpeculationLogRegistry};
