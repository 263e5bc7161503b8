//! Thread-local pointer queues.
//!
//! Both the SATB queue (old values overwritten during marking) and the
//! dirty-card queue (card addresses dirtied by post barriers) share one
//! layout inside the thread-local area: a byte index and a buffer pointer.
//! The index counts down from the buffer capacity; compiled fast paths
//! decrement it and store at `buffer + index`. An index of zero means the
//! buffer is full and the fast path calls the runtime instead.
//!
//! ```text
//!   buffer                              buffer + capacity
//!   ├────────┬────────┬────────┬────────┤
//!   │  free  │  free  │ entry1 │ entry0 │
//!   └────────┴────────┴────────┴────────┘
//!                     ▲ index
//! ```

use kiln_core::{AccessSize, RawMemory};

/// Collector-side view of one thread's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrQueue {
    index_addr: u64,
    buffer_field_addr: u64,
    capacity: u64,
    word: AccessSize,
}

impl PtrQueue {
    /// Describe a queue whose index and buffer pointer live at the given
    /// thread-local addresses.
    pub fn new(index_addr: u64, buffer_field_addr: u64, capacity: u64, word: AccessSize) -> Self {
        Self {
            index_addr,
            buffer_field_addr,
            capacity,
            word,
        }
    }

    /// Capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current byte index.
    #[inline]
    pub fn index(&self, mem: &impl RawMemory) -> u64 {
        mem.read(self.index_addr, self.word)
    }

    /// Buffer address.
    #[inline]
    pub fn buffer(&self, mem: &impl RawMemory) -> u64 {
        mem.read(self.buffer_field_addr, self.word)
    }

    /// Number of queued entries.
    pub fn len(&self, mem: &impl RawMemory) -> usize {
        (self.capacity.saturating_sub(self.index(mem)) / self.word.bytes() as u64) as usize
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self, mem: &impl RawMemory) -> bool {
        self.index(mem) >= self.capacity
    }

    /// Whether the fast path must call the runtime.
    pub fn is_full(&self, mem: &impl RawMemory) -> bool {
        self.index(mem) == 0
    }

    /// Attach a buffer and mark it empty.
    pub fn install(&self, mem: &mut impl RawMemory, buffer: u64) {
        mem.write(self.buffer_field_addr, self.word, buffer);
        mem.write(self.index_addr, self.word, self.capacity);
    }

    /// Enqueue like the compiled fast path. Returns false when full.
    pub fn try_enqueue(&self, mem: &mut impl RawMemory, value: u64) -> bool {
        let index = self.index(mem);
        if index == 0 {
            return false;
        }
        let next = index - self.word.bytes() as u64;
        let buffer = self.buffer(mem);
        mem.write(buffer + next, self.word, value);
        mem.write(self.index_addr, self.word, next);
        true
    }

    /// Remove all entries in insertion order and mark the buffer empty.
    pub fn drain(&self, mem: &mut impl RawMemory) -> Vec<u64> {
        let index = self.index(mem);
        let buffer = self.buffer(mem);
        let step = self.word.bytes() as u64;
        let mut entries = Vec::with_capacity(self.len(mem));
        let mut slot = self.capacity;
        while slot > index {
            slot -= step;
            entries.push(mem.read(buffer + slot, self.word));
        }
        mem.write(self.index_addr, self.word, self.capacity);
        entries
    }
}

/// Completed entries handed over by full thread buffers.
#[derive(Debug, Default, Clone)]
pub struct QueueSet {
    completed: Vec<u64>,
    flushes: usize,
}

impl QueueSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a thread's entries into the set.
    pub fn flush(&mut self, queue: &PtrQueue, mem: &mut impl RawMemory) {
        let entries = queue.drain(mem);
        if !entries.is_empty() {
            log::trace!("flushing {} queue entries", entries.len());
            self.completed.extend(entries);
            self.flushes += 1;
        }
    }

    /// Enqueue through the runtime path: flush when full, then append.
    pub fn enqueue(&mut self, queue: &PtrQueue, mem: &mut impl RawMemory, value: u64) {
        if !queue.try_enqueue(mem, value) {
            self.flush(queue, mem);
            let _ = queue.try_enqueue(mem, value);
        }
    }

    /// Entries from all flushed buffers.
    pub fn completed(&self) -> &[u64] {
        &self.completed
    }

    /// Number of non-empty flushes.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Take the completed entries.
    pub fn take(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[derive(Default)]
    struct Words(FxHashMap<u64, u64>);

    impl RawMemory for Words {
        fn read(&self, address: u64, _size: AccessSize) -> u64 {
            self.0.get(&address).copied().unwrap_or(0)
        }
        fn write(&mut self, address: u64, _size: AccessSize, value: u64) {
            self.0.insert(address, value);
        }
    }

    fn queue(mem: &mut Words) -> PtrQueue {
        let q = PtrQueue::new(0x8, 0x10, 32, AccessSize::Quad);
        q.install(mem, 0x1000);
        q
    }

    #[test]
    fn test_enqueue_counts_down() {
        let mut mem = Words::default();
        let q = queue(&mut mem);
        assert!(q.is_empty(&mem));
        assert!(q.try_enqueue(&mut mem, 0xaa));
        assert_eq!(q.index(&mem), 24);
        assert_eq!(mem.read(0x1000 + 24, AccessSize::Quad), 0xaa);
        assert_eq!(q.len(&mem), 1);
    }

    #[test]
    fn test_full_queue_rejects_fast_path() {
        let mut mem = Words::default();
        let q = queue(&mut mem);
        for v in 0..4 {
            assert!(q.try_enqueue(&mut mem, v));
        }
        assert!(q.is_full(&mem));
        assert!(!q.try_enqueue(&mut mem, 99));
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut mem = Words::default();
        let q = queue(&mut mem);
        for v in [3, 1, 4] {
            q.try_enqueue(&mut mem, v);
        }
        assert_eq!(q.drain(&mut mem), vec![3, 1, 4]);
        assert!(q.is_empty(&mem));
    }

    #[test]
    fn test_queue_set_flushes_when_full() {
        let mut mem = Words::default();
        let q = queue(&mut mem);
        let mut set = QueueSet::new();
        for v in 0..5 {
            set.enqueue(&q, &mut mem, v);
        }
        assert_eq!(set.completed(), &[0, 1, 2, 3]);
        assert_eq!(set.flush_count(), 1);
        assert_eq!(q.drain(&mut mem), vec![4]);
    }
}
