//! Read view over one method's profiling buffer.

use super::accessor::{DataTag, ProfileAccessor};
use super::layout::ProfileLayout;
use super::table::AccessorTable;
use kiln_core::{DeoptReason, KilnError, KilnResult};
use std::fmt::Write;

/// A record found while walking the buffer.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRecord<'t> {
    /// Byte position within the record area.
    pub position: usize,
    /// Bytecode index the record profiles.
    pub bci: i32,
    /// Accessor decoding the record.
    pub accessor: &'t dyn ProfileAccessor,
}

/// Borrowed view of a profiling buffer.
///
/// Reads never fault: bytes outside the buffer read as zero. Record walks
/// stop at the end of their area.
#[derive(Debug, Clone, Copy)]
pub struct MethodData<'a> {
    bytes: &'a [u8],
    layout: &'a ProfileLayout,
    table: &'a AccessorTable,
}

impl<'a> MethodData<'a> {
    /// Wrap a buffer. Fails if the header describes more data than present.
    pub fn new(bytes: &'a [u8], layout: &'a ProfileLayout, table: &'a AccessorTable) -> KilnResult<Self> {
        let data = Self { bytes, layout, table };
        let declared = data.header_u32(layout.size_offset) as usize;
        if declared > bytes.len() || layout.data_offset + data.normal_data_size() > declared {
            return Err(KilnError::internal(format!(
                "profile buffer of {} bytes declares size {} with {} bytes of normal data",
                bytes.len(),
                declared,
                data.normal_data_size()
            )));
        }
        Ok(data)
    }

    /// Layout used to decode the buffer.
    #[inline]
    pub fn layout(&self) -> &'a ProfileLayout {
        self.layout
    }

    // =========================================================================
    // Raw Reads
    // =========================================================================

    fn bytes_at<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.bytes.get(offset..offset + N) {
            out.copy_from_slice(src);
        }
        out
    }

    fn header_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.bytes_at(offset))
    }

    #[inline]
    fn full_offset(&self, pos: usize, offset: usize) -> usize {
        self.layout.data_offset + pos + offset
    }

    /// Unsigned byte of the record at `pos`.
    pub fn read_u8(&self, pos: usize, offset: usize) -> u8 {
        self.bytes_at::<1>(self.full_offset(pos, offset))[0]
    }

    /// Unsigned 16-bit value of the record at `pos`.
    pub fn read_u16(&self, pos: usize, offset: usize) -> u16 {
        u16::from_le_bytes(self.bytes_at(self.full_offset(pos, offset)))
    }

    /// Whole cell as a raw word.
    pub fn read_word(&self, pos: usize, offset: usize) -> u64 {
        let at = self.full_offset(pos, offset);
        if self.layout.cell_size == 4 {
            u32::from_le_bytes(self.bytes_at(at)) as u64
        } else {
            u64::from_le_bytes(self.bytes_at(at))
        }
    }

    /// Cell as an unsigned 32-bit counter.
    pub fn read_unsigned_int(&self, pos: usize, offset: usize) -> u64 {
        self.read_word(pos, offset) & 0xffff_ffff
    }

    /// Unsigned counter saturated into `i32`.
    pub fn read_unsigned_int_as_signed(&self, pos: usize, offset: usize) -> i32 {
        self.read_unsigned_int(pos, offset).min(i32::MAX as u64) as i32
    }

    /// Cell truncated to a signed 32-bit value.
    pub fn read_int(&self, pos: usize, offset: usize) -> i32 {
        self.read_word(pos, offset) as i32
    }

    // =========================================================================
    // Areas
    // =========================================================================

    /// Bytes of normal (per-bytecode) records.
    pub fn normal_data_size(&self) -> usize {
        self.header_u32(self.layout.data_size_offset) as usize
    }

    /// Bytes of extra records following the normal ones.
    pub fn extra_data_size(&self) -> usize {
        let limit = self.header_u32(self.layout.size_offset) as usize;
        limit.saturating_sub(self.layout.data_offset + self.normal_data_size())
    }

    pub fn has_normal_data(&self) -> bool {
        self.normal_data_size() > 0
    }

    pub fn has_extra_data(&self) -> bool {
        self.extra_data_size() > 0
    }

    /// Position of the first extra record.
    pub fn extra_data_begin(&self) -> usize {
        self.normal_data_size()
    }

    /// Whether `pos` falls inside the record area.
    pub fn is_within(&self, pos: usize) -> bool {
        pos < self.normal_data_size() + self.extra_data_size()
    }

    fn data_at(&self, pos: usize) -> KilnResult<Option<&'a dyn ProfileAccessor>> {
        let tag = self.read_u8(pos, self.layout.tag_offset);
        self.table.lookup(tag, pos)
    }

    /// Accessor for the normal record at `pos`, or `None` past the end.
    pub fn normal_data(&self, pos: usize) -> KilnResult<Option<&'a dyn ProfileAccessor>> {
        if pos >= self.normal_data_size() {
            return Ok(None);
        }
        self.data_at(pos)
    }

    /// Accessor for the extra record at `pos`, or `None` past the end or
    /// at an untagged slot.
    pub fn extra_data(&self, pos: usize) -> KilnResult<Option<&'a dyn ProfileAccessor>> {
        if !self.is_within(pos) {
            return Ok(None);
        }
        self.data_at(pos)
    }

    fn walk(
        &self,
        mut pos: usize,
        next: impl Fn(&Self, usize) -> KilnResult<Option<&'a dyn ProfileAccessor>>,
    ) -> KilnResult<Vec<ProfileRecord<'a>>> {
        let mut records = Vec::new();
        while let Some(accessor) = next(self, pos)? {
            let size = accessor.size(self, pos);
            if size == 0 {
                return Err(KilnError::internal(format!(
                    "zero-sized {} record at position {}",
                    accessor.name(),
                    pos
                )));
            }
            records.push(ProfileRecord {
                position: pos,
                bci: accessor.bci(self, pos),
                accessor,
            });
            pos += size;
        }
        Ok(records)
    }

    /// All normal records in buffer order.
    pub fn normal_records(&self) -> KilnResult<Vec<ProfileRecord<'a>>> {
        self.walk(0, |data, pos| data.normal_data(pos))
    }

    /// All extra records in buffer order.
    pub fn extra_records(&self) -> KilnResult<Vec<ProfileRecord<'a>>> {
        self.walk(self.extra_data_begin(), |data, pos| data.extra_data(pos))
    }

    /// First normal record profiling `bci`.
    pub fn record_for_bci(&self, bci: i32) -> KilnResult<Option<ProfileRecord<'a>>> {
        Ok(self.normal_records()?.into_iter().find(|r| r.bci == bci))
    }

    // =========================================================================
    // Method Counters
    // =========================================================================

    /// Traps recorded for `reason`.
    pub fn deoptimization_count(&self, reason: DeoptReason) -> u32 {
        self.bytes_at::<1>(self.layout.trap_history_offset + reason.index())[0] as u32
    }

    /// On-stack-replacement traps recorded for `reason`.
    pub fn osr_deoptimization_count(&self, reason: DeoptReason) -> u32 {
        let offset = self.layout.trap_history_offset + self.layout.osr_trap_history_offset + reason.index();
        self.bytes_at::<1>(offset)[0] as u32
    }

    pub fn decompile_count(&self) -> u32 {
        self.header_u32(self.layout.decompiles_offset)
    }

    pub fn overflow_recompile_count(&self) -> u32 {
        self.header_u32(self.layout.overflow_recompiles_offset)
    }

    pub fn overflow_trap_count(&self) -> u32 {
        self.header_u32(self.layout.overflow_traps_offset)
    }

    // =========================================================================
    // Convenience
    // =========================================================================

    /// Branch-taken probability of the record at `pos`.
    pub fn branch_taken_probability(&self, pos: usize) -> KilnResult<Option<f64>> {
        Ok(self
            .normal_data(pos)?
            .map(|a| a.branch_taken_probability(self, pos))
            .filter(|&p| p >= 0.0))
    }

    /// Execution count of the record at `pos`.
    pub fn execution_count(&self, pos: usize) -> KilnResult<Option<i32>> {
        Ok(self
            .normal_data(pos)?
            .map(|a| a.execution_count(self, pos))
            .filter(|&c| c >= 0))
    }

    /// Human-readable dump of every record.
    pub fn dump(&self, method_name: &str) -> KilnResult<String> {
        let mut out = String::new();
        let fmt_err = |_| KilnError::internal("formatting profile dump failed");
        writeln!(out, "Raw method data for {}:", method_name).map_err(fmt_err)?;
        writeln!(
            out,
            "nof_decompiles({}) nof_overflow_recompiles({}) nof_overflow_traps({})",
            self.decompile_count(),
            self.overflow_recompile_count(),
            self.overflow_trap_count()
        )
        .map_err(fmt_err)?;

        for (i, record) in self.normal_records()?.iter().enumerate() {
            if i != 0 {
                out.push('\n');
            }
            self.dump_record(&mut out, record).map_err(fmt_err)?;
        }
        for (i, record) in self.extra_records()?.iter().enumerate() {
            if i == 0 {
                out.push_str("\n--- Extra data:");
            }
            out.push('\n');
            self.dump_record(&mut out, record).map_err(fmt_err)?;
        }
        Ok(out)
    }

    fn dump_record(&self, out: &mut String, record: &ProfileRecord<'_>) -> std::fmt::Result {
        write!(
            out,
            "{:<6} bci: {:<6}{:<20}",
            record.position,
            record.bci,
            record.accessor.name()
        )?;
        let mut body = String::new();
        record.accessor.append_to(&mut body, self, record.position)?;
        out.push_str(&body.replace('\n', &format!("\n{:38}", "")));
        Ok(())
    }
}

// =============================================================================
// Buffer Builder
// =============================================================================

/// Builds profiling buffers in the layout [`MethodData`] reads.
///
/// Used by tests and by tools that synthesize profiles.
#[derive(Debug)]
pub struct MethodDataBuilder<'l> {
    layout: &'l ProfileLayout,
    normal: Vec<u8>,
    extra: Vec<u8>,
    decompiles: u32,
    overflow_recompiles: u32,
    overflow_traps: u32,
    traps: Vec<(usize, u8)>,
}

impl<'l> MethodDataBuilder<'l> {
    pub fn new(layout: &'l ProfileLayout) -> Self {
        Self {
            layout,
            normal: Vec::new(),
            extra: Vec::new(),
            decompiles: 0,
            overflow_recompiles: 0,
            overflow_traps: 0,
            traps: Vec::new(),
        }
    }

    fn record(&self, tag: DataTag, bci: u16, flags: u8, cells: &[u64]) -> Vec<u8> {
        let l = self.layout;
        let mut rec = vec![0u8; l.header_size + l.cells_to_bytes(cells.len())];
        rec[l.tag_offset] = tag.as_u8();
        rec[l.flags_offset] = flags;
        rec[l.bci_offset..l.bci_offset + 2].copy_from_slice(&bci.to_le_bytes());
        for (i, &cell) in cells.iter().enumerate() {
            let at = l.header_size + l.cells_to_bytes(i);
            rec[at..at + l.cell_size].copy_from_slice(&cell.to_le_bytes()[..l.cell_size]);
        }
        rec
    }

    /// Append a normal record with raw cells. Returns its position.
    pub fn push(&mut self, tag: DataTag, bci: u16, flags: u8, cells: &[u64]) -> usize {
        let pos = self.normal.len();
        let rec = self.record(tag, bci, flags, cells);
        self.normal.extend(rec);
        pos
    }

    /// Append an extra record with raw cells.
    pub fn push_extra(&mut self, tag: DataTag, bci: u16, flags: u8, cells: &[u64]) {
        let rec = self.record(tag, bci, flags, cells);
        self.extra.extend(rec);
    }

    pub fn counter(&mut self, bci: u16, count: u32) -> usize {
        self.push(DataTag::CounterData, bci, 0, &[count as u64])
    }

    pub fn branch(&mut self, bci: u16, taken: u32, not_taken: u32, displacement: i32) -> usize {
        self.push(
            DataTag::BranchData,
            bci,
            0,
            &[taken as u64, displacement as u32 as u64, not_taken as u64],
        )
    }

    /// Receiver type record; `rows` beyond the profile width are dropped.
    pub fn receiver_type(&mut self, bci: u16, count: u32, nonprofiled: u32, rows: &[(u64, u32)]) -> usize {
        let mut cells = vec![count as u64, nonprofiled as u64];
        for row in 0..self.layout.type_profile_width {
            let (klass, n) = rows.get(row).copied().unwrap_or((0, 0));
            cells.push(klass);
            cells.push(n as u64);
        }
        self.push(DataTag::ReceiverTypeData, bci, 0, &cells)
    }

    /// Switch record; `cases[0]` is the default case.
    pub fn multi_branch(&mut self, bci: u16, cases: &[(u32, i32)]) -> usize {
        let mut cells = vec![(cases.len() * self.layout.multi_branch_case_cells) as u64];
        for &(count, displacement) in cases {
            cells.push(count as u64);
            cells.push(displacement as u32 as u64);
        }
        self.push(DataTag::MultiBranchData, bci, 0, &cells)
    }

    pub fn decompiles(mut self, count: u32) -> Self {
        self.decompiles = count;
        self
    }

    pub fn overflow(mut self, recompiles: u32, traps: u32) -> Self {
        self.overflow_recompiles = recompiles;
        self.overflow_traps = traps;
        self
    }

    pub fn trap(mut self, reason: DeoptReason, count: u8) -> Self {
        self.traps.push((reason.index(), count));
        self
    }

    /// Produce the buffer.
    pub fn build(self) -> Vec<u8> {
        let l = self.layout;
        let total = l.data_offset + self.normal.len() + self.extra.len();
        let mut bytes = vec![0u8; total];
        let mut put = |offset: usize, value: u32| {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        };
        put(l.size_offset, total as u32);
        put(l.data_size_offset, self.normal.len() as u32);
        put(l.decompiles_offset, self.decompiles);
        put(l.overflow_recompiles_offset, self.overflow_recompiles);
        put(l.overflow_traps_offset, self.overflow_traps);
        for (reason, count) in self.traps {
            bytes[l.trap_history_offset + reason] = count;
        }
        let normal_end = l.data_offset + self.normal.len();
        bytes[l.data_offset..normal_end].copy_from_slice(&self.normal);
        bytes[normal_end..].copy_from_slice(&self.extra);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::accessor::TriState;

    #[test]
    fn test_walk_normal_records() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let mut b = MethodDataBuilder::new(&layout);
        let p0 = b.counter(3, 10);
        let p1 = b.branch(7, 30, 10, 12);
        let p2 = b.multi_branch(11, &[(5, 0), (10, 4), (5, 8)]);
        let bytes = b.build();
        let md = MethodData::new(&bytes, &layout, &table).unwrap();

        let records = md.normal_records().unwrap();
        let positions: Vec<usize> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![p0, p1, p2]);
        assert_eq!(records[1].bci, 7);
        assert_eq!(md.execution_count(p0).unwrap(), Some(10));
        assert_eq!(md.branch_taken_probability(p1).unwrap(), Some(0.75));
        assert_eq!(md.execution_count(p2).unwrap(), Some(20));
        assert!(!md.has_extra_data());
    }

    #[test]
    fn test_switch_probabilities_put_default_last() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let mut b = MethodDataBuilder::new(&layout);
        let pos = b.multi_branch(0, &[(2, 0), (6, 4), (2, 8)]);
        let bytes = b.build();
        let md = MethodData::new(&bytes, &layout, &table).unwrap();
        let accessor = md.normal_data(pos).unwrap().unwrap();
        assert_eq!(accessor.switch_probabilities(&md, pos), Some(vec![0.6, 0.2, 0.2]));
    }

    #[test]
    fn test_receiver_type_profile_merges_duplicates() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let mut b = MethodDataBuilder::new(&layout);
        let pos = b.receiver_type(4, 0, 0, &[(0xa0, 3), (0xa0, 1)]);
        let bytes = b.build();
        let md = MethodData::new(&bytes, &layout, &table).unwrap();
        let profile = md.normal_data(pos).unwrap().unwrap().type_profile(&md, pos).unwrap();
        assert_eq!(profile.types.len(), 1);
        assert_eq!(profile.types[0].item, 0xa0);
        assert_eq!(profile.types[0].probability, 1.0);
        assert_eq!(profile.null_seen, TriState::False);
    }

    #[test]
    fn test_unknown_tag_in_buffer_errors() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let mut b = MethodDataBuilder::new(&layout);
        b.counter(0, 1);
        let mut bytes = b.build();
        bytes[layout.data_offset + layout.tag_offset] = 99;
        let md = MethodData::new(&bytes, &layout, &table).unwrap();
        assert!(matches!(
            md.normal_records(),
            Err(KilnError::UnknownProfileTag { tag: 99, position: 0 })
        ));
    }

    #[test]
    fn test_method_counters() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let bytes = MethodDataBuilder::new(&layout)
            .decompiles(2)
            .overflow(1, 4)
            .trap(DeoptReason::NullCheckException, 3)
            .build();
        let md = MethodData::new(&bytes, &layout, &table).unwrap();
        assert_eq!(md.decompile_count(), 2);
        assert_eq!(md.overflow_recompile_count(), 1);
        assert_eq!(md.overflow_trap_count(), 4);
        assert_eq!(md.deoptimization_count(DeoptReason::NullCheckException), 3);
        assert_eq!(md.deoptimization_count(DeoptReason::ClassCastException), 0);
        assert!(!md.has_normal_data());
    }

    #[test]
    fn test_extra_records_and_dump() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let mut b = MethodDataBuilder::new(&layout);
        b.counter(1, 5);
        b.push_extra(DataTag::SpeculativeTrapData, 9, 0, &[1, 0xfeed]);
        let bytes = b.build();
        let md = MethodData::new(&bytes, &layout, &table).unwrap();
        let extra = md.extra_records().unwrap();
        assert_eq!(extra.len(), 1);
        assert_eq!(extra[0].accessor.tag(), DataTag::SpeculativeTrapData);

        let dump = md.dump("Foo.bar()").unwrap();
        assert!(dump.starts_with("Raw method data for Foo.bar():"));
        assert!(dump.contains("CounterData"));
        assert!(dump.contains("count(5)"));
        assert!(dump.contains("--- Extra data:"));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let layout = ProfileLayout::default();
        let table = AccessorTable::standard();
        let mut b = MethodDataBuilder::new(&layout);
        b.counter(0, 1);
        let bytes = b.build();
        assert!(MethodData::new(&bytes[..bytes.len() - 4], &layout, &table).is_err());
    }

    proptest::proptest! {
        #[test]
        fn test_branch_probability_bounded(taken in 0u32..1_000_000, not_taken in 0u32..1_000_000) {
            let layout = ProfileLayout::default();
            let table = AccessorTable::standard();
            let mut b = MethodDataBuilder::new(&layout);
            let pos = b.branch(0, taken, not_taken, 0);
            let bytes = b.build();
            let md = MethodData::new(&bytes, &layout, &table).unwrap();
            match md.branch_taken_probability(pos).unwrap() {
                Some(p) => {
                    proptest::prop_assert!((0.0..=1.0).contains(&p));
                    proptest::prop_assert_eq!(md.execution_count(pos).unwrap(), Some((taken + not_taken) as i32));
                }
                None => proptest::prop_assert_eq!(taken + not_taken, 0),
            }
        }
    }
}
