//! Simulated heap for running barrier code.
//!
//! [`BarrierHeap`] maps the covered heap, the card table, one thread-local
//! area and that thread's two queue buffers into a flat address space and
//! answers the runtime calls compiled barriers make. It is the memory the
//! graph evaluator runs lowered barrier snippets against.
//!
//! ```text
//!   card_table_base ┌──────────────┐
//!                   │  card table  │
//!   aux_base        ├──────────────┤  (page aligned after the table)
//!                   │ thread area  │
//!                   ├──────────────┤
//!                   │ SATB buffer  │
//!                   ├──────────────┤
//!                   │ card buffer  │
//!                   └──────────────┘
//!   heap_base       ┌──────────────┐
//!                   │     heap     │
//!                   └──────────────┘
//! ```

use crate::barrier::{BarrierRuntimeCall, CardTable, PtrQueue, QueueSet};
use crate::config::{BarrierConfig, ConfigError, ThreadLayout};
use crate::stats::{BarrierStats, BarrierStatsSnapshot};
use kiln_core::{AccessSize, KilnError, KilnResult, RawMemory, RuntimeCalls};

const PAGE: u64 = 4096;

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A contiguous mapped range of bytes.
#[derive(Debug)]
struct Segment {
    base: u64,
    bytes: Vec<u8>,
}

impl Segment {
    fn new(base: u64, len: u64) -> Self {
        Self {
            base,
            bytes: vec![0; len as usize],
        }
    }

    #[inline]
    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

/// Heap, card table and one mutator thread, all in simulated memory.
#[derive(Debug)]
pub struct BarrierHeap {
    config: BarrierConfig,
    layout: ThreadLayout,
    cards: CardTable,
    heap: Segment,
    thread: Segment,
    satb_buffer: Segment,
    card_buffer: Segment,
    satb_queue: PtrQueue,
    card_queue: PtrQueue,
    satb_set: QueueSet,
    card_set: QueueSet,
    stats: BarrierStats,
}

impl BarrierHeap {
    /// Map a heap for `config` with one thread laid out per `layout`.
    pub fn new(config: BarrierConfig, layout: ThreadLayout) -> Result<Self, ConfigError> {
        config.validate()?;
        layout.validate(config.word_size)?;

        let aux_base = align_up(config.card_table_base + config.card_count(), PAGE);
        let thread_base = aux_base;
        let satb_base = align_up(thread_base + layout.size as u64, PAGE);
        let card_buf_base = align_up(satb_base + config.satb_buffer_bytes, PAGE);
        let aux_end = card_buf_base + config.card_buffer_bytes;
        if aux_end > config.heap_base && aux_base < config.heap_base + config.heap_size {
            return Err(ConfigError::OverlappingCardTable);
        }

        let word = word_access(&config);
        let satb_queue = PtrQueue::new(
            thread_base + layout.satb_index_offset as u64,
            thread_base + layout.satb_buffer_offset as u64,
            config.satb_buffer_bytes,
            word,
        );
        let card_queue = PtrQueue::new(
            thread_base + layout.card_index_offset as u64,
            thread_base + layout.card_buffer_offset as u64,
            config.card_buffer_bytes,
            word,
        );

        let mut heap = Self {
            cards: CardTable::new(&config),
            heap: Segment::new(config.heap_base, config.heap_size),
            thread: Segment::new(thread_base, layout.size as u64),
            satb_buffer: Segment::new(satb_base, config.satb_buffer_bytes),
            card_buffer: Segment::new(card_buf_base, config.card_buffer_bytes),
            satb_queue,
            card_queue,
            satb_set: QueueSet::new(),
            card_set: QueueSet::new(),
            stats: BarrierStats::new(),
            config,
            layout,
        };
        satb_queue.install(&mut heap, satb_base);
        card_queue.install(&mut heap, card_buf_base);
        log::debug!(
            "barrier heap: heap={:#x}+{:#x} cards={:#x} thread={:#x}",
            heap.config.heap_base,
            heap.config.heap_size,
            heap.config.card_table_base,
            thread_base
        );
        Ok(heap)
    }

    /// Default geometry and thread layout.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(BarrierConfig::default(), ThreadLayout::default())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Heap configuration.
    #[inline]
    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// Thread-local layout.
    #[inline]
    pub fn layout(&self) -> &ThreadLayout {
        &self.layout
    }

    /// Address of the thread-local area (the thread register's value).
    #[inline]
    pub fn thread_address(&self) -> u64 {
        self.thread.base
    }

    /// Card table.
    #[inline]
    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// The thread's SATB queue.
    #[inline]
    pub fn satb_queue(&self) -> PtrQueue {
        self.satb_queue
    }

    /// The thread's dirty-card queue.
    #[inline]
    pub fn card_queue(&self) -> PtrQueue {
        self.card_queue
    }

    /// Runtime counters.
    pub fn stats(&self) -> BarrierStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of accesses that hit no mapped segment.
    pub fn fault_count(&self) -> u64 {
        self.stats.snapshot().faults
    }

    // =========================================================================
    // Collector Controls
    // =========================================================================

    /// Turn concurrent marking on or off for the thread.
    pub fn set_marking(&mut self, active: bool) {
        let addr = self.thread.base + self.layout.satb_marking_offset as u64;
        self.write(addr, AccessSize::Byte, active as u64);
    }

    /// Whether concurrent marking is active.
    pub fn is_marking(&self) -> bool {
        let addr = self.thread.base + self.layout.satb_marking_offset as u64;
        self.read(addr, AccessSize::Byte) != 0
    }

    /// Mark `[start, start + len)` as a young region.
    pub fn mark_young(&mut self, start: u64, len: u64) {
        self.cards.mark_young_region(start, len);
    }

    /// All values recorded by SATB barriers: flushed buffers first, then
    /// the thread's live buffer. Leaves both empty.
    pub fn drain_satb(&mut self) -> Vec<u64> {
        let queue = self.satb_queue;
        let mut values = self.satb_set.take();
        values.extend(queue.drain(self));
        values
    }

    /// All card addresses recorded by post barriers. Leaves both empty.
    pub fn drain_dirty_cards(&mut self) -> Vec<u64> {
        let queue = self.card_queue;
        let mut cards = self.card_set.take();
        cards.extend(queue.drain(self));
        cards
    }

    /// Number of buffer flushes the runtime performed.
    pub fn flush_counts(&self) -> (usize, usize) {
        (self.satb_set.flush_count(), self.card_set.flush_count())
    }

    // =========================================================================
    // Runtime Paths
    // =========================================================================

    fn satb_enqueue(&mut self, value: u64) {
        BarrierStats::bump(&self.stats.pre_slow_calls);
        BarrierStats::bump(&self.stats.satb_enqueued);
        let queue = self.satb_queue;
        let mut set = std::mem::take(&mut self.satb_set);
        set.enqueue(&queue, self, value);
        self.satb_set = set;
    }

    fn card_enqueue(&mut self, card: u64) {
        BarrierStats::bump(&self.stats.post_slow_calls);
        BarrierStats::bump(&self.stats.cards_enqueued);
        let queue = self.card_queue;
        let mut set = std::mem::take(&mut self.card_set);
        set.enqueue(&queue, self, card);
        self.card_set = set;
    }

    fn segment(&self, address: u64, len: usize) -> Option<(&Segment, std::ops::Range<usize>)> {
        [&self.heap, &self.thread, &self.satb_buffer, &self.card_buffer]
            .into_iter()
            .find_map(|seg| seg.range(address, len).map(|r| (seg, r)))
    }

    fn segment_mut(&mut self, address: u64, len: usize) -> Option<(&mut Segment, std::ops::Range<usize>)> {
        [
            &mut self.heap,
            &mut self.thread,
            &mut self.satb_buffer,
            &mut self.card_buffer,
        ]
        .into_iter()
        .find_map(|seg| seg.range(address, len).map(|r| (seg, r)))
    }
}

#[inline]
fn word_access(config: &BarrierConfig) -> AccessSize {
    if config.word_size == 4 {
        AccessSize::Word
    } else {
        AccessSize::Quad
    }
}

// =============================================================================
// Memory Interface
// =============================================================================

impl RawMemory for BarrierHeap {
    fn read(&self, address: u64, size: AccessSize) -> u64 {
        if size == AccessSize::Byte {
            if let Some(index) = self.cards.index_of_card_address(address) {
                return self.cards.get(index).unwrap_or(0) as u64;
            }
        }
        match self.segment(address, size.bytes()) {
            Some((seg, range)) => {
                let mut buf = [0u8; 8];
                buf[..size.bytes()].copy_from_slice(&seg.bytes[range]);
                u64::from_le_bytes(buf)
            }
            None => {
                BarrierStats::bump(&self.stats.faults);
                log::warn!("unmapped read of {} bytes at {:#x}", size.bytes(), address);
                0
            }
        }
    }

    fn write(&mut self, address: u64, size: AccessSize, value: u64) {
        if size == AccessSize::Byte {
            if let Some(index) = self.cards.index_of_card_address(address) {
                self.cards.set(index, value as u8);
                return;
            }
        }
        match self.segment_mut(address, size.bytes()) {
            Some((seg, range)) => {
                let bytes = value.to_le_bytes();
                seg.bytes[range].copy_from_slice(&bytes[..size.bytes()]);
            }
            None => {
                BarrierStats::bump(&self.stats.faults);
                log::warn!("unmapped write of {} bytes at {:#x}", size.bytes(), address);
            }
        }
    }
}

impl RuntimeCalls for BarrierHeap {
    fn call(&mut self, symbol: &str, args: &[u64]) -> KilnResult<u64> {
        let call = BarrierRuntimeCall::from_symbol(symbol)
            .ok_or_else(|| KilnError::internal(format!("unknown runtime call {symbol}")))?;
        if args.len() != call.arg_count() {
            return Err(KilnError::internal(format!(
                "{symbol} expects {} arguments, got {}",
                call.arg_count(),
                args.len()
            )));
        }
        log::trace!("runtime call {symbol}{args:x?}");
        match call {
            BarrierRuntimeCall::SatbEnqueue => self.satb_enqueue(args[0]),
            BarrierRuntimeCall::CardEnqueue => self.card_enqueue(args[0]),
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> BarrierHeap {
        BarrierHeap::new(
            BarrierConfig {
                heap_size: 4 << 20,
                satb_buffer_bytes: 4 * 8,
                card_buffer_bytes: 2 * 8,
                ..Default::default()
            },
            ThreadLayout::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_heap_words_roundtrip() {
        let mut h = heap();
        let base = h.config().heap_base;
        h.write(base + 16, AccessSize::Quad, 0xdead_beef_0000_0001);
        assert_eq!(h.read(base + 16, AccessSize::Quad), 0xdead_beef_0000_0001);
        assert_eq!(h.read(base + 16, AccessSize::Byte), 1);
        assert_eq!(h.fault_count(), 0);
    }

    #[test]
    fn test_card_bytes_are_mapped() {
        let mut h = heap();
        let card = h.config().card_table_base + 3;
        assert_eq!(h.read(card, AccessSize::Byte), 0xff);
        h.write(card, AccessSize::Byte, 0);
        assert!(h.cards().is_dirty(3));
    }

    #[test]
    fn test_unmapped_access_faults() {
        let mut h = heap();
        assert_eq!(h.read(0x10, AccessSize::Quad), 0);
        h.write(0x10, AccessSize::Word, 1);
        assert_eq!(h.fault_count(), 2);
    }

    #[test]
    fn test_queues_installed_empty() {
        let h = heap();
        assert!(h.satb_queue().is_empty(&h));
        assert_eq!(h.satb_queue().index(&h), 32);
        assert_eq!(h.card_queue().index(&h), 16);
        assert!(!h.is_marking());
    }

    #[test]
    fn test_satb_runtime_call_flushes_full_buffer() {
        let mut h = heap();
        for v in 1..=6 {
            h.call(BarrierRuntimeCall::SatbEnqueue.symbol(), &[v]).unwrap();
        }
        assert_eq!(h.flush_counts().0, 1);
        assert_eq!(h.drain_satb(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(h.stats().pre_slow_calls, 6);
    }

    #[test]
    fn test_unknown_runtime_call_is_internal_error() {
        let mut h = heap();
        let err = h.call("nope", &[]).unwrap_err();
        assert!(err.is_internal());
        assert!(h.call(BarrierRuntimeCall::CardEnqueue.symbol(), &[]).is_err());
    }
}
