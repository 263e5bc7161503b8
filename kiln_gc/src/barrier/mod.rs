//! Write barrier runtime support.
//!
//! Compiled barrier snippets run inline and call into the runtime only when
//! a thread queue is full.
//! This module names those entry points and the card arithmetic they share
//! with the compiled fast paths.

mod card_table;
mod ptr_queue;

pub use card_table::CardTable;
pub use ptr_queue::{PtrQueue, QueueSet};

use crate::config::BarrierConfig;

// =============================================================================
// Runtime Entry Points
// =============================================================================

/// Runtime entry points reachable from compiled barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierRuntimeCall {
    /// Record an overwritten value when the SATB buffer is full.
    /// Arguments: `[previous_value]`.
    SatbEnqueue,
    /// Record a dirtied card when the card buffer is full.
    /// Arguments: `[card_address]`.
    CardEnqueue,
}

impl BarrierRuntimeCall {
    /// Every entry point.
    pub const ALL: [BarrierRuntimeCall; 2] = [BarrierRuntimeCall::SatbEnqueue, BarrierRuntimeCall::CardEnqueue];

    /// Linkage symbol.
    pub const fn symbol(self) -> &'static str {
        match self {
            BarrierRuntimeCall::SatbEnqueue => "g1_satb_enqueue",
            BarrierRuntimeCall::CardEnqueue => "g1_card_enqueue",
        }
    }

    /// Look up an entry point by symbol.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|call| call.symbol() == symbol)
    }

    /// Number of word arguments.
    pub const fn arg_count(self) -> usize {
        match self {
            BarrierRuntimeCall::SatbEnqueue | BarrierRuntimeCall::CardEnqueue => 1,
        }
    }
}

// =============================================================================
// Card Arithmetic
// =============================================================================

/// Address of the card byte covering `addr`, computed the way compiled
/// code does it: biased base plus shifted address.
#[inline]
pub fn card_address(config: &BarrierConfig, addr: u64) -> u64 {
    config.card_start().wrapping_add(addr >> config.card_shift)
}

/// Whether a store of `value` into `field` crosses regions. Null values and
/// same-region stores need no post barrier.
#[inline]
pub fn crosses_regions(config: &BarrierConfig, field: u64, value: u64) -> bool {
    value != 0 && ((field ^ value) >> config.log_region_size) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_roundtrip() {
        for call in BarrierRuntimeCall::ALL {
            assert_eq!(BarrierRuntimeCall::from_symbol(call.symbol()), Some(call));
        }
        assert_eq!(BarrierRuntimeCall::from_symbol("memcpy"), None);
    }

    #[test]
    fn test_card_address_matches_table() {
        let config = BarrierConfig::default();
        let table = CardTable::new(&config);
        let addr = config.heap_base + 0x1234;
        let index = table.card_index(addr).unwrap();
        assert_eq!(card_address(&config, addr), table.card_address(index));
    }

    #[test]
    fn test_region_crossing() {
        let config = BarrierConfig::default();
        let base = config.heap_base;
        assert!(!crosses_regions(&config, base + 8, base + 0x100));
        assert!(crosses_regions(&config, base + 8, base + (1 << 20)));
        assert!(!crosses_regions(&config, base + 8, 0));
    }
}
