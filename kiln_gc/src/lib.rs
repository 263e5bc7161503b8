//! Kiln barrier runtime.
//!
//! Collector-side support for the write barriers the compiler lowers into
//! compiled code.
//!
//! # Barrier Families
//!
//! - **Serial card marking**: every reference store dirties the card of the
//!   written field. Nothing is queued.
//!
//! - **G1 (SATB + dirty-card queues)**: a pre barrier records the value being
//!   overwritten while concurrent marking is active; a post barrier dirties
//!   the card of a cross-region store and queues the card address for
//!   refinement. Young cards are never queued.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_gc::{BarrierHeap, BarrierConfig, ThreadLayout};
//!
//! let mut heap = BarrierHeap::new(BarrierConfig::default(), ThreadLayout::default())?;
//! heap.set_marking(true);
//!
//! // ... run compiled code against `heap` ...
//!
//! for card in heap.drain_dirty_cards() {
//!     refine(card);
//! }
//! ```

#![warn(clippy::all)]

pub mod barrier;
pub mod config;
pub mod heap;

mod stats;

pub use barrier::{card_address, crosses_regions, BarrierRuntimeCall, CardTable, PtrQueue, QueueSet};
pub use config::{BarrierConfig, ConfigError, ThreadLayout};
pub use heap::BarrierHeap;
pub use stats::{BarrierStats, BarrierStatsSnapshot};
