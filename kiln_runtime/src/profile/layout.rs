//! Profile record layout.
//!
//! All raw offsets used to read method profiling data come from one
//! [`ProfileLayout`] value. Record offsets are expressed in cells, matching
//! the runtime's own description of its data layout, and converted to bytes
//! here so accessors never do cell arithmetic themselves.

use kiln_core::{DeoptReason, KilnError, KilnResult};

/// Layout of a method's profiling buffer and of each profile record.
///
/// A buffer is a method header followed by the record area:
///
/// ```text
///   0              data_offset                     data_offset + data_size
///   ├── header ────┼── normal records ──────────────┼── extra records ──┤
///                                                                        size
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLayout {
    // =========================================================================
    // Method Header
    // =========================================================================
    /// Offset of the `u32` total buffer size.
    ///
    /// Default: 0
    pub size_offset: usize,

    /// Offset of the `u32` size of the normal record area.
    ///
    /// Default: 4
    pub data_size_offset: usize,

    /// Offset of the `u32` decompile count.
    ///
    /// Default: 8
    pub decompiles_offset: usize,

    /// Offset of the `u32` overflow recompile count.
    ///
    /// Default: 12
    pub overflow_recompiles_offset: usize,

    /// Offset of the `u32` overflow trap count.
    ///
    /// Default: 16
    pub overflow_traps_offset: usize,

    /// Offset of the per-reason trap history bytes.
    ///
    /// Default: 20
    pub trap_history_offset: usize,

    /// Distance from the regular to the OSR trap history bytes.
    ///
    /// Default: `DeoptReason::COUNT`
    pub osr_trap_history_offset: usize,

    /// Offset of the first record.
    ///
    /// Default: 64
    pub data_offset: usize,

    // =========================================================================
    // Record Header
    // =========================================================================
    /// Size of a record header in bytes.
    ///
    /// Default: 8
    pub header_size: usize,

    /// Size of one data cell in bytes.
    ///
    /// Default: 8
    pub cell_size: usize,

    /// Byte offset of the tag within a record header.
    pub tag_offset: usize,
    /// Byte offset of the flags byte.
    pub flags_offset: usize,
    /// Byte offset of the `u16` bci.
    pub bci_offset: usize,
    /// Flag bit recording a null seen at this site.
    pub null_seen_flag: u32,
    /// Flag bit recording an exception seen at this site.
    pub exception_seen_flag: u32,

    // =========================================================================
    // Record Cells
    // =========================================================================
    /// Counter cell of counter-carrying records.
    pub count_cell: usize,
    /// Taken count cell of jump and branch records.
    pub jump_taken_cell: usize,
    /// Displacement cell of jump and branch records.
    pub jump_displacement_cell: usize,
    /// Not-taken count cell of branch records.
    pub branch_not_taken_cell: usize,
    /// Non-profiled count cell of receiver type records.
    pub nonprofiled_count_cell: usize,
    /// First receiver cell of receiver type records.
    pub receiver0_cell: usize,
    /// First receiver count cell.
    pub receiver_count0_cell: usize,
    /// Cells per receiver row.
    pub receiver_row_cells: usize,
    /// Length cell of array records.
    pub array_len_cell: usize,
    /// First element cell of array records.
    pub array_start_cell: usize,
    /// Cells per multi-branch case.
    pub multi_branch_case_cells: usize,

    // =========================================================================
    // Widths
    // =========================================================================
    /// Receiver rows per type profile.
    ///
    /// Default: 2
    pub type_profile_width: usize,

    /// Method rows per virtual call profile.
    ///
    /// Default: 0
    pub method_profile_width: usize,

    /// Rows per `ret` profile.
    ///
    /// Default: 2
    pub bci_profile_width: usize,
}

impl Default for ProfileLayout {
    fn default() -> Self {
        Self {
            size_offset: 0,
            data_size_offset: 4,
            decompiles_offset: 8,
            overflow_recompiles_offset: 12,
            overflow_traps_offset: 16,
            trap_history_offset: 20,
            osr_trap_history_offset: DeoptReason::COUNT,
            data_offset: 64,
            header_size: 8,
            cell_size: 8,
            tag_offset: 0,
            flags_offset: 1,
            bci_offset: 2,
            null_seen_flag: 0,
            exception_seen_flag: 1,
            count_cell: 0,
            jump_taken_cell: 0,
            jump_displacement_cell: 1,
            branch_not_taken_cell: 2,
            nonprofiled_count_cell: 1,
            receiver0_cell: 2,
            receiver_count0_cell: 3,
            receiver_row_cells: 2,
            array_len_cell: 0,
            array_start_cell: 1,
            multi_branch_case_cells: 2,
            type_profile_width: 2,
            method_profile_width: 0,
            bci_profile_width: 2,
        }
    }
}

impl ProfileLayout {
    /// Byte offset of cell `cells` from the start of a record.
    #[inline]
    pub const fn cell_offset(&self, cells: usize) -> usize {
        self.header_size + self.cells_to_bytes(cells)
    }

    /// Bytes spanned by `cells` cells.
    #[inline]
    pub const fn cells_to_bytes(&self, cells: usize) -> usize {
        cells * self.cell_size
    }

    /// Bytes per receiver row.
    #[inline]
    pub const fn receiver_row_size(&self) -> usize {
        self.cells_to_bytes(self.receiver_row_cells)
    }

    /// Byte offset of receiver row `row`'s type cell.
    #[inline]
    pub const fn receiver_offset(&self, row: usize) -> usize {
        self.cell_offset(self.receiver0_cell) + row * self.receiver_row_size()
    }

    /// Byte offset of receiver row `row`'s count cell.
    #[inline]
    pub const fn receiver_count_offset(&self, row: usize) -> usize {
        self.cell_offset(self.receiver_count0_cell) + row * self.receiver_row_size()
    }

    /// Byte offset of method row `row` in a virtual call record.
    #[inline]
    pub const fn method_offset(&self, row: usize) -> usize {
        self.receiver_offset(self.type_profile_width + row)
    }

    /// Byte offset of method row `row`'s count.
    #[inline]
    pub const fn method_count_offset(&self, row: usize) -> usize {
        self.receiver_count_offset(self.type_profile_width + row)
    }

    /// Validate the layout once before any profile is read.
    pub fn validate(&self) -> KilnResult<()> {
        if self.cell_size != 4 && self.cell_size != 8 {
            return Err(KilnError::config(format!(
                "profile cell size must be 4 or 8, got {}",
                self.cell_size
            )));
        }
        if self.header_size < self.bci_offset + 2
            || self.tag_offset >= self.header_size
            || self.flags_offset >= self.header_size
            || self.tag_offset == self.flags_offset
        {
            return Err(KilnError::config("profile record header fields do not fit the header"));
        }
        if self.null_seen_flag >= 8
            || self.exception_seen_flag >= 8
            || self.null_seen_flag == self.exception_seen_flag
        {
            return Err(KilnError::config("profile flag bits must be distinct bits of one byte"));
        }
        if self.receiver_row_cells == 0 || self.multi_branch_case_cells == 0 {
            return Err(KilnError::config("profile rows must span at least one cell"));
        }
        let header_fields = [
            self.size_offset,
            self.data_size_offset,
            self.decompiles_offset,
            self.overflow_recompiles_offset,
            self.overflow_traps_offset,
        ];
        if header_fields.iter().any(|&off| off + 4 > self.trap_history_offset) {
            return Err(KilnError::config("method header counters overlap the trap history"));
        }
        if self.trap_history_offset + self.osr_trap_history_offset + DeoptReason::COUNT > self.data_offset {
            return Err(KilnError::config("trap history overlaps the record area"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_validates() {
        assert!(ProfileLayout::default().validate().is_ok());
    }

    #[test]
    fn test_cell_offsets() {
        let layout = ProfileLayout::default();
        assert_eq!(layout.cell_offset(0), 8);
        assert_eq!(layout.cell_offset(2), 24);
        assert_eq!(layout.receiver_offset(1), 24 + 16);
        assert_eq!(layout.receiver_count_offset(0), 32);
        assert_eq!(layout.method_offset(0), layout.receiver_offset(2));
    }

    #[test]
    fn test_bad_cell_size_rejected() {
        let layout = ProfileLayout {
            cell_size: 6,
            ..Default::default()
        };
        assert!(matches!(layout.validate(), Err(KilnError::Config { .. })));
    }

    #[test]
    fn test_trap_history_must_fit() {
        let layout = ProfileLayout {
            data_offset: 32,
            ..Default::default()
        };
        assert!(layout.validate().is_err());
    }
}
