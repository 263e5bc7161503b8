//! Register allocation.
//!
//! A linear scan over whole-lifetime intervals:
//!
//! - `interval.rs`: liveness and live intervals
//! - `linear_scan.rs`: register assignment and spill decisions
//! - `spill.rs`: rewriting operands, spill loads and stores, stack moves
//!
//! Spilled variables live in 8-byte frame slots. Instructions that cannot
//! take a slot directly go through the target's scratch registers, which
//! are never handed out by the allocator.
//!
//! # Usage
//!
//! ```ignore
//! let result = allocate_registers(&mut lir, &config, move_factory)?;
//! let frame = FrameMap::build(&lir, &result.used_callee_saved);
//! ```

pub mod interval;
pub mod linear_scan;
pub mod spill;

pub use interval::{build_intervals, LiveInterval, LiveRange, ProgPoint};
pub use linear_scan::LinearScanAllocator;

use crate::lir::value::{Register, RegisterCategory, Variable, VirtualStackSlot};
use crate::lir::{Lir, MoveFactory};
use kiln_core::KilnResult;
use rustc_hash::FxHashMap;

// =============================================================================
// Register Configuration
// =============================================================================

/// The register file a target hands to the allocator.
#[derive(Debug, Clone)]
pub struct RegisterConfig {
    /// Allocatable registers in preference order.
    pub allocatable: Vec<Register>,
    /// Allocatable registers preserved across calls.
    pub callee_saved: Vec<Register>,
    /// Reserved for loading and storing spilled operands.
    pub scratch_general: [Register; 2],
    pub scratch_float: [Register; 2],
}

impl RegisterConfig {
    /// Allocatable registers of `category`.
    pub fn allocatable_in(&self, category: RegisterCategory) -> impl Iterator<Item = Register> + '_ {
        self.allocatable.iter().copied().filter(move |r| r.category == category)
    }

    #[inline]
    pub fn is_callee_saved(&self, register: Register) -> bool {
        self.callee_saved.contains(&register)
    }

    /// Scratch registers of `category`.
    #[inline]
    pub fn scratch(&self, category: RegisterCategory) -> [Register; 2] {
        match category {
            RegisterCategory::General => self.scratch_general,
            RegisterCategory::Float => self.scratch_float,
        }
    }
}

// =============================================================================
// Allocation Result
// =============================================================================

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Register(Register),
    Spill(VirtualStackSlot),
    Unassigned,
}

impl Allocation {
    #[inline]
    pub fn is_register(self) -> bool {
        matches!(self, Allocation::Register(_))
    }

    #[inline]
    pub fn is_spill(self) -> bool {
        matches!(self, Allocation::Spill(_))
    }

    #[inline]
    pub fn reg(self) -> Option<Register> {
        match self {
            Allocation::Register(r) => Some(r),
            _ => None,
        }
    }
}

/// Variable index to location.
#[derive(Debug, Clone, Default)]
pub struct AllocationMap {
    allocations: FxHashMap<u32, Allocation>,
}

impl AllocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, variable: Variable, allocation: Allocation) {
        self.allocations.insert(variable.index, allocation);
    }

    pub fn get(&self, variable: Variable) -> Allocation {
        self.allocations
            .get(&variable.index)
            .copied()
            .unwrap_or(Allocation::Unassigned)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, Allocation)> + '_ {
        self.allocations.iter().map(|(&v, &a)| (v, a))
    }
}

/// Statistics from one allocation.
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    pub num_variables: usize,
    pub num_allocated: usize,
    pub num_spilled: usize,
    /// Spill loads and stores inserted.
    pub num_spill_moves: usize,
    /// Stack-to-stack transfers created.
    pub num_stack_moves: usize,
}

/// Outcome of [`allocate_registers`].
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub stats: AllocatorStats,
    /// Callee-saved registers that were assigned, in register order.
    pub used_callee_saved: Vec<Register>,
}

/// Allocate every variable of `lir` and rewrite its operands.
pub fn allocate_registers(
    lir: &mut Lir,
    config: &RegisterConfig,
    moves: &dyn MoveFactory,
) -> KilnResult<AllocationResult> {
    let intervals = build_intervals(lir);
    let (map, mut stats) = LinearScanAllocator::new(config).allocate(lir, &intervals)?;
    spill::rewrite(lir, &map, config, moves, &mut stats)?;

    let mut used_callee_saved: Vec<Register> = map
        .iter()
        .filter_map(|(_, a)| a.reg())
        .filter(|r| config.is_callee_saved(*r))
        .collect();
    used_callee_saved.sort_unstable();
    used_callee_saved.dedup();
    log::debug!(
        "regalloc: {} variables, {} spilled, {} spill moves, {} stack moves, {} callee saves",
        stats.num_variables,
        stats.num_spilled,
        stats.num_spill_moves,
        stats.num_stack_moves,
        used_callee_saved.len()
    );
    Ok(AllocationResult {
        stats,
        used_callee_saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ValueKind;

    #[test]
    fn test_allocation_map_defaults_to_unassigned() {
        let mut map = AllocationMap::new();
        let v = Variable {
            index: 3,
            kind: ValueKind::Long,
        };
        assert_eq!(map.get(v), Allocation::Unassigned);
        map.set(v, Allocation::Register(Register::general(1)));
        assert!(map.get(v).is_register());
        assert_eq!(map.get(v).reg(), Some(Register::general(1)));
    }
}
