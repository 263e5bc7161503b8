//! Card table.
//!
//! One byte per card. Compiled post barriers address the table through the
//! biased base (`card_start`), so a card byte is found with a single shift
//! and add and without subtracting the heap base.
//!
//! ```text
//!   heap_base                                           heap_base + size
//!   ├──────────┬──────────┬──────────┬──────────┬───────────┤
//!   │  card 0  │  card 1  │  card 2  │  card 3  │    ...    │
//!   └────┬─────┴────┬─────┴────┬─────┴────┬─────┴───────────┘
//!        ▼          ▼          ▼          ▼
//!   [ clean ]  [ dirty ]  [ young ]  [ clean ]  ...
//!     0xff       0x00       0x02       0xff
//! ```

use crate::config::BarrierConfig;
use std::sync::atomic::{AtomicU8, Ordering};

/// Card table covering one contiguous heap.
#[derive(Debug)]
pub struct CardTable {
    cards: Box<[AtomicU8]>,
    heap_base: u64,
    card_shift: u32,
    table_base: u64,
    clean: u8,
    dirty: u8,
    young: u8,
}

impl CardTable {
    /// Create a clean card table for the heap described by `config`.
    pub fn new(config: &BarrierConfig) -> Self {
        let count = config.card_count() as usize;
        let cards: Vec<AtomicU8> = (0..count)
            .map(|_| AtomicU8::new(config.clean_card))
            .collect();
        Self {
            cards: cards.into_boxed_slice(),
            heap_base: config.heap_base,
            card_shift: config.card_shift,
            table_base: config.card_table_base,
            clean: config.clean_card,
            dirty: config.dirty_card,
            young: config.young_card,
        }
    }

    /// Number of cards.
    #[inline]
    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    /// Address of the first card byte.
    #[inline]
    pub fn table_base(&self) -> u64 {
        self.table_base
    }

    /// Card index covering a heap address.
    #[inline]
    pub fn card_index(&self, addr: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.heap_base)?;
        let index = (offset >> self.card_shift) as usize;
        (index < self.cards.len()).then_some(index)
    }

    /// Card index for a card byte address, if it lies in the table.
    #[inline]
    pub fn index_of_card_address(&self, card_addr: u64) -> Option<usize> {
        let index = card_addr.checked_sub(self.table_base)? as usize;
        (index < self.cards.len()).then_some(index)
    }

    /// Address of the card byte at `index`.
    #[inline]
    pub fn card_address(&self, index: usize) -> u64 {
        self.table_base + index as u64
    }

    /// Heap address range `[start, end)` covered by a card.
    pub fn card_address_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.cards.len() {
            return None;
        }
        let start = self.heap_base + ((index as u64) << self.card_shift);
        Some((start, start + (1u64 << self.card_shift)))
    }

    /// Raw card value.
    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.cards.get(index).map(|c| c.load(Ordering::Relaxed))
    }

    /// Store a raw card value. Out-of-range indices are ignored.
    #[inline]
    pub fn set(&self, index: usize, value: u8) {
        if let Some(card) = self.cards.get(index) {
            card.store(value, Ordering::Relaxed);
        }
    }

    /// Dirty the card covering `addr`. Returns true if it was not already dirty.
    pub fn mark_dirty(&self, addr: u64) -> bool {
        match self.card_index(addr) {
            Some(index) => self.cards[index].swap(self.dirty, Ordering::Relaxed) != self.dirty,
            None => false,
        }
    }

    /// Mark every card of the region `[start, start + len)` young.
    pub fn mark_young_region(&self, start: u64, len: u64) {
        let Some(first) = self.card_index(start) else {
            return;
        };
        let last = self
            .card_index(start + len.saturating_sub(1))
            .unwrap_or(self.cards.len() - 1);
        for card in &self.cards[first..=last] {
            card.store(self.young, Ordering::Relaxed);
        }
    }

    /// Whether the card at `index` is dirty.
    #[inline]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.get(index) == Some(self.dirty)
    }

    /// Whether the card at `index` is young.
    #[inline]
    pub fn is_young(&self, index: usize) -> bool {
        self.get(index) == Some(self.young)
    }

    /// Reset a dirty card to clean. Young cards are left alone.
    pub fn clean(&self, index: usize) {
        if let Some(card) = self.cards.get(index) {
            let _ = card.compare_exchange(self.dirty, self.clean, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// Reset every card to clean.
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(self.clean, Ordering::Relaxed);
        }
    }

    /// Indices of dirty cards in ascending order.
    pub fn dirty_card_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let dirty = self.dirty;
        self.cards
            .iter()
            .enumerate()
            .filter_map(move |(i, c)| (c.load(Ordering::Relaxed) == dirty).then_some(i))
    }

    /// Number of dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.dirty_card_indices().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BarrierConfig {
        BarrierConfig {
            heap_base: 0x10000,
            heap_size: 0x10000,
            card_table_base: 0x1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_card_table_creation() {
        let table = CardTable::new(&small_config());
        assert_eq!(table.card_count(), 128);
        assert_eq!(table.dirty_count(), 0);
        assert_eq!(table.get(0), Some(0xff));
    }

    #[test]
    fn test_card_index() {
        let table = CardTable::new(&small_config());
        assert_eq!(table.card_index(0x10000), Some(0));
        assert_eq!(table.card_index(0x101FF), Some(0));
        assert_eq!(table.card_index(0x10200), Some(1));
        assert_eq!(table.card_index(0x5000), None);
        assert_eq!(table.card_index(0x25000), None);
    }

    #[test]
    fn test_card_address_roundtrip() {
        let table = CardTable::new(&small_config());
        let addr = table.card_address(7);
        assert_eq!(addr, 0x1007);
        assert_eq!(table.index_of_card_address(addr), Some(7));
        assert_eq!(table.index_of_card_address(0x1000 + 128), None);
        assert_eq!(table.card_address_range(1), Some((0x10200, 0x10400)));
    }

    #[test]
    fn test_mark_dirty_reports_transition() {
        let table = CardTable::new(&small_config());
        assert!(table.mark_dirty(0x10100));
        assert!(!table.mark_dirty(0x10180));
        assert!(table.is_dirty(0));
        assert!(!table.is_dirty(1));
    }

    #[test]
    fn test_young_region_survives_clean() {
        let table = CardTable::new(&small_config());
        table.mark_young_region(0x10400, 0x400);
        assert!(table.is_young(2));
        assert!(table.is_young(3));
        assert!(!table.is_young(4));

        table.clean(2);
        assert!(table.is_young(2));

        table.mark_dirty(0x10000);
        table.clean(0);
        assert_eq!(table.get(0), Some(0xff));
    }

    #[test]
    fn test_dirty_card_iteration() {
        let table = CardTable::new(&small_config());
        table.set(0, 0);
        table.set(5, 0);
        table.set(10, 0);
        let dirty: Vec<usize> = table.dirty_card_indices().collect();
        assert_eq!(dirty, vec![0, 5, 10]);
        table.clear_all();
        assert_eq!(table.dirty_count(), 0);
    }
}
