//! Barrier configuration.
//!
//! Every constant the barrier snippets fold into compiled code lives here:
//! card geometry, region size, card byte values and the thread-local
//! offsets of the SATB and dirty-card queues. The tables are validated once
//! before the first snippet is built, so consumers never re-check offsets.

use kiln_core::KilnError;
use thiserror::Error;

/// Card table and region geometry for the collector.
///
/// # Example
///
/// ```ignore
/// use kiln_gc::BarrierConfig;
///
/// let config = BarrierConfig {
///     log_region_size: 22, // 4MB regions
///     ..Default::default()
/// };
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierConfig {
    // =========================================================================
    // Heap Geometry
    // =========================================================================
    /// Start address of the covered heap.
    ///
    /// Default: 0x1000_0000
    pub heap_base: u64,

    /// Size of the covered heap in bytes.
    ///
    /// Default: 16MB
    pub heap_size: u64,

    /// Address of the first card byte.
    ///
    /// Default: 0x0800_0000
    pub card_table_base: u64,

    /// log2 of the card size.
    ///
    /// Default: 9 (512-byte cards)
    pub card_shift: u32,

    /// log2 of the region size. Stores whose source and target fall in the
    /// same region need no post barrier.
    ///
    /// Default: 20 (1MB regions)
    pub log_region_size: u32,

    /// Machine word size in bytes.
    ///
    /// Default: 8
    pub word_size: u32,

    // =========================================================================
    // Card Values
    // =========================================================================
    /// Value of a dirty card.
    ///
    /// Default: 0
    pub dirty_card: u8,

    /// Value of a card in a young region; never enqueued.
    ///
    /// Default: 2
    pub young_card: u8,

    /// Value of a clean card.
    ///
    /// Default: 0xff
    pub clean_card: u8,

    // =========================================================================
    // Thread-Local Queues
    // =========================================================================
    /// Capacity of a thread's SATB buffer in bytes.
    ///
    /// Default: 1024 words
    pub satb_buffer_bytes: u64,

    /// Capacity of a thread's dirty-card buffer in bytes.
    ///
    /// Default: 256 words
    pub card_buffer_bytes: u64,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            heap_base: 0x1000_0000,
            heap_size: 16 * 1024 * 1024,
            card_table_base: 0x0800_0000,
            card_shift: 9,
            log_region_size: 20,
            word_size: 8,
            dirty_card: 0,
            young_card: 2,
            clean_card: 0xff,
            satb_buffer_bytes: 1024 * 8,
            card_buffer_bytes: 256 * 8,
        }
    }
}

impl BarrierConfig {
    /// Card size in bytes.
    #[inline]
    pub const fn card_size(&self) -> u64 {
        1 << self.card_shift
    }

    /// Number of cards covering the heap.
    #[inline]
    pub const fn card_count(&self) -> u64 {
        (self.heap_size + self.card_size() - 1) >> self.card_shift
    }

    /// Biased card table base: `card_start + (addr >> card_shift)` is the
    /// address of `addr`'s card byte.
    #[inline]
    pub const fn card_start(&self) -> u64 {
        self.card_table_base
            .wrapping_sub(self.heap_base >> self.card_shift)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(4..=16).contains(&self.card_shift) {
            return Err(ConfigError::InvalidCardShift(self.card_shift));
        }
        if self.log_region_size <= self.card_shift || self.log_region_size > 32 {
            return Err(ConfigError::InvalidRegionSize(self.log_region_size));
        }
        if self.word_size != 4 && self.word_size != 8 {
            return Err(ConfigError::InvalidWordSize(self.word_size));
        }
        if self.dirty_card == self.clean_card || self.dirty_card == self.young_card {
            return Err(ConfigError::AmbiguousCardValues);
        }
        let word = self.word_size as u64;
        if self.satb_buffer_bytes == 0 || self.satb_buffer_bytes % word != 0 {
            return Err(ConfigError::MisalignedBuffer("satb"));
        }
        if self.card_buffer_bytes == 0 || self.card_buffer_bytes % word != 0 {
            return Err(ConfigError::MisalignedBuffer("card"));
        }
        let table_end = self.card_table_base + self.card_count();
        if table_end > self.heap_base && self.card_table_base < self.heap_base + self.heap_size {
            return Err(ConfigError::OverlappingCardTable);
        }
        Ok(())
    }
}

// =============================================================================
// Thread Layout
// =============================================================================

/// Offsets of barrier-related fields inside a thread's local area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadLayout {
    /// Byte flag, non-zero while concurrent marking is active.
    pub satb_marking_offset: i32,
    /// Current SATB queue index (bytes remaining, counts down).
    pub satb_index_offset: i32,
    /// Address of the SATB buffer.
    pub satb_buffer_offset: i32,
    /// Current dirty-card queue index.
    pub card_index_offset: i32,
    /// Address of the dirty-card buffer.
    pub card_buffer_offset: i32,
    /// Pending exception slot (null when none).
    pub pending_exception_offset: i32,
    /// Object result slot written by runtime calls.
    pub object_result_offset: i32,
    /// Last Java stack pointer of the frame anchor.
    pub last_java_sp_offset: i32,
    /// Last Java program counter of the frame anchor.
    pub last_java_pc_offset: i32,
    /// Frame anchor flags word.
    pub frame_anchor_flags_offset: i32,
    /// Total size of the thread-local area in bytes.
    pub size: u32,
}

impl Default for ThreadLayout {
    fn default() -> Self {
        Self {
            satb_marking_offset: 0x00,
            satb_index_offset: 0x08,
            satb_buffer_offset: 0x10,
            card_index_offset: 0x18,
            card_buffer_offset: 0x20,
            pending_exception_offset: 0x28,
            object_result_offset: 0x30,
            last_java_sp_offset: 0x38,
            last_java_pc_offset: 0x40,
            frame_anchor_flags_offset: 0x48,
            size: 0x50,
        }
    }
}

impl ThreadLayout {
    fn word_fields(&self) -> [(&'static str, i32); 9] {
        [
            ("satb_index", self.satb_index_offset),
            ("satb_buffer", self.satb_buffer_offset),
            ("card_index", self.card_index_offset),
            ("card_buffer", self.card_buffer_offset),
            ("pending_exception", self.pending_exception_offset),
            ("object_result", self.object_result_offset),
            ("last_java_sp", self.last_java_sp_offset),
            ("last_java_pc", self.last_java_pc_offset),
            ("frame_anchor_flags", self.frame_anchor_flags_offset),
        ]
    }

    /// Validate that word fields are aligned, in bounds and disjoint.
    pub fn validate(&self, word_size: u32) -> Result<(), ConfigError> {
        let word = word_size as i32;
        let mut spans = vec![(self.satb_marking_offset, 1)];
        for (name, offset) in self.word_fields() {
            if offset < 0 || offset % word != 0 {
                return Err(ConfigError::MisalignedThreadField(name));
            }
            spans.push((offset, word));
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                return Err(ConfigError::OverlappingThreadFields(pair[1].0));
            }
        }
        if let Some(&(last, len)) = spans.last() {
            if (last + len) as u32 > self.size {
                return Err(ConfigError::ThreadAreaTooSmall(self.size));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("card shift must be within 4..=16, got {0}")]
    InvalidCardShift(u32),
    #[error("log region size {0} must exceed the card shift and be at most 32")]
    InvalidRegionSize(u32),
    #[error("word size must be 4 or 8, got {0}")]
    InvalidWordSize(u32),
    #[error("dirty card value must differ from clean and young values")]
    AmbiguousCardValues,
    #[error("{0} buffer size must be a non-zero multiple of the word size")]
    MisalignedBuffer(&'static str),
    #[error("card table overlaps the covered heap")]
    OverlappingCardTable,
    #[error("thread field {0} is not word aligned")]
    MisalignedThreadField(&'static str),
    #[error("thread fields overlap at offset {0:#x}")]
    OverlappingThreadFields(i32),
    #[error("thread area of {0} bytes is too small for its fields")]
    ThreadAreaTooSmall(u32),
}

impl From<ConfigError> for KilnError {
    fn from(err: ConfigError) -> Self {
        KilnError::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BarrierConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.card_size(), 512);
        assert_eq!(config.card_count(), 16 * 1024 * 1024 / 512);
    }

    #[test]
    fn test_card_start_bias() {
        let config = BarrierConfig::default();
        let addr = config.heap_base + 5 * 512 + 17;
        let card = config.card_start().wrapping_add(addr >> config.card_shift);
        assert_eq!(card, config.card_table_base + 5);
    }

    #[test]
    fn test_region_must_exceed_card() {
        let config = BarrierConfig {
            log_region_size: 9,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRegionSize(9)));
    }

    #[test]
    fn test_card_values_must_differ() {
        let config = BarrierConfig {
            young_card: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::AmbiguousCardValues));
    }

    #[test]
    fn test_thread_layout_default_is_valid() {
        assert!(ThreadLayout::default().validate(8).is_ok());
    }

    #[test]
    fn test_thread_layout_overlap_detected() {
        let layout = ThreadLayout {
            card_index_offset: 0x10,
            ..Default::default()
        };
        assert!(matches!(
            layout.validate(8),
            Err(ConfigError::OverlappingThreadFields(_))
        ));
    }

    #[test]
    fn test_config_error_converts() {
        let err: KilnError = ConfigError::InvalidWordSize(3).into();
        assert!(err.to_string().contains("word size"));
    }
}
