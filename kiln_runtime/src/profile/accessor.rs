//! Per-tag profile record accessors.
//!
//! Each record kind knows its own size and how to interpret its cells. The
//! record kinds form a small family (a counter record is a bit record with a
//! count, a branch record is a jump record with a not-taken count), so the
//! shared readers live here as free functions and each accessor composes
//! the ones it needs.

use super::layout::ProfileLayout;
use super::method_data::MethodData;
use std::fmt::{self, Write};

// =============================================================================
// Tags
// =============================================================================

/// Record tags in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DataTag {
    NoTag = 0,
    BitData = 1,
    CounterData = 2,
    JumpData = 3,
    ReceiverTypeData = 4,
    VirtualCallData = 5,
    RetData = 6,
    BranchData = 7,
    MultiBranchData = 8,
    ArgInfoData = 9,
    CallTypeData = 10,
    VirtualCallTypeData = 11,
    ParametersTypeData = 12,
    SpeculativeTrapData = 13,
}

impl DataTag {
    /// Number of tags including `NoTag`.
    pub const COUNT: usize = 14;

    /// Decode a tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => DataTag::NoTag,
            1 => DataTag::BitData,
            2 => DataTag::CounterData,
            3 => DataTag::JumpData,
            4 => DataTag::ReceiverTypeData,
            5 => DataTag::VirtualCallData,
            6 => DataTag::RetData,
            7 => DataTag::BranchData,
            8 => DataTag::MultiBranchData,
            9 => DataTag::ArgInfoData,
            10 => DataTag::CallTypeData,
            11 => DataTag::VirtualCallTypeData,
            12 => DataTag::ParametersTypeData,
            13 => DataTag::SpeculativeTrapData,
            _ => return None,
        })
    }

    /// Encoding.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Three-valued profile answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

impl fmt::Display for TriState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriState::True => "TRUE",
            TriState::False => "FALSE",
            TriState::Unknown => "UNKNOWN",
        })
    }
}

// =============================================================================
// Derived Profiles
// =============================================================================

/// One observed receiver type or target method with its probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfiledItem {
    /// Raw metadata word identifying the type or method.
    pub item: u64,
    /// Fraction of executions.
    pub probability: f64,
}

/// Receiver type profile of a call or type-check site.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeProfile {
    pub null_seen: TriState,
    /// Probability of a type outside `types`.
    pub not_recorded_probability: f64,
    /// Most frequent first.
    pub types: Vec<ProfiledItem>,
}

/// Target method profile of a virtual call site.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodProfile {
    pub not_recorded_probability: f64,
    /// Most frequent first.
    pub methods: Vec<ProfiledItem>,
}

struct RawItemProfile {
    items: Vec<u64>,
    counts: Vec<u64>,
    total: u64,
}

impl RawItemProfile {
    fn into_items(self, width: usize) -> Option<(f64, Vec<ProfiledItem>)> {
        if self.items.is_empty() || self.total == 0 {
            return None;
        }
        let mut total_probability = 0.0;
        let mut items: Vec<ProfiledItem> = self
            .items
            .iter()
            .zip(&self.counts)
            .map(|(&item, &count)| {
                let probability = count as f64 / self.total as f64;
                total_probability += probability;
                ProfiledItem { item, probability }
            })
            .collect();
        items.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        let not_recorded = if items.len() < width {
            0.0
        } else {
            (1.0 - total_probability).clamp(0.0, 1.0)
        };
        Some((not_recorded, items))
    }
}

#[inline]
fn truncate_to_int(value: u64) -> i32 {
    value.min(i32::MAX as u64) as i32
}

// =============================================================================
// Accessor Trait
// =============================================================================

/// Reads one kind of profile record.
///
/// `pos` is a record's byte position within the record area.
pub trait ProfileAccessor: Send + Sync + fmt::Debug {
    /// Tag this accessor decodes.
    fn tag(&self) -> DataTag;

    /// Record kind name used in dumps.
    fn name(&self) -> &'static str;

    /// Size known from the layout alone.
    fn static_size(&self, layout: &ProfileLayout) -> usize;

    /// Extra size read from the record itself.
    fn dynamic_size(&self, _data: &MethodData<'_>, _pos: usize) -> usize {
        0
    }

    /// Full record size in bytes.
    fn size(&self, data: &MethodData<'_>, pos: usize) -> usize {
        self.static_size(data.layout()) + self.dynamic_size(data, pos)
    }

    /// Bytecode index of the profiled instruction.
    fn bci(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        data.read_u16(pos, data.layout().bci_offset) as i32
    }

    /// Whether an exception was seen at the site.
    fn exception_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        flag(data, pos, data.layout().exception_seen_flag)
    }

    /// Whether a null was seen at the site.
    fn null_seen(&self, _data: &MethodData<'_>, _pos: usize) -> TriState {
        TriState::Unknown
    }

    /// Execution count, or -1 when the record does not count executions.
    fn execution_count(&self, _data: &MethodData<'_>, _pos: usize) -> i32 {
        -1
    }

    /// Probability that a branch is taken, or -1 when unknown.
    fn branch_taken_probability(&self, _data: &MethodData<'_>, _pos: usize) -> f64 {
        -1.0
    }

    /// Per-case probabilities with the default case last.
    fn switch_probabilities(&self, _data: &MethodData<'_>, _pos: usize) -> Option<Vec<f64>> {
        None
    }

    /// Receiver type profile.
    fn type_profile(&self, _data: &MethodData<'_>, _pos: usize) -> Option<TypeProfile> {
        None
    }

    /// Target method profile.
    fn method_profile(&self, _data: &MethodData<'_>, _pos: usize) -> Option<MethodProfile> {
        None
    }

    /// Append a one-record description to `out`.
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result;
}

fn flag(data: &MethodData<'_>, pos: usize, bit: u32) -> TriState {
    let flags = data.read_u8(pos, data.layout().flags_offset);
    TriState::from(flags & (1 << bit) != 0)
}

fn null_seen(data: &MethodData<'_>, pos: usize) -> TriState {
    flag(data, pos, data.layout().null_seen_flag)
}

fn counter_value(data: &MethodData<'_>, pos: usize) -> i32 {
    let layout = data.layout();
    data.read_unsigned_int_as_signed(pos, layout.cell_offset(layout.count_cell))
}

fn taken_count(data: &MethodData<'_>, pos: usize) -> u64 {
    let layout = data.layout();
    data.read_unsigned_int(pos, layout.cell_offset(layout.jump_taken_cell))
}

fn taken_displacement(data: &MethodData<'_>, pos: usize) -> i32 {
    let layout = data.layout();
    data.read_int(pos, layout.cell_offset(layout.jump_displacement_cell))
}

fn nonprofiled_count(data: &MethodData<'_>, pos: usize) -> i32 {
    let layout = data.layout();
    data.read_unsigned_int_as_signed(pos, layout.cell_offset(layout.nonprofiled_count_cell))
}

fn array_length(data: &MethodData<'_>, pos: usize) -> usize {
    let layout = data.layout();
    data.read_int(pos, layout.cell_offset(layout.array_len_cell)).max(0) as usize
}

fn type_check_size(layout: &ProfileLayout) -> usize {
    layout.cell_offset(2) + layout.receiver_row_size() * layout.type_profile_width
}

fn virtual_call_size(layout: &ProfileLayout) -> usize {
    layout.cell_offset(2)
        + layout.receiver_row_size() * (layout.type_profile_width + layout.method_profile_width)
}

/// Receiver rows, duplicates merged. `not_recorded` is added to the total.
fn raw_type_profile(data: &MethodData<'_>, pos: usize, not_recorded: u64) -> RawItemProfile {
    let layout = data.layout();
    let mut profile = RawItemProfile {
        items: Vec::with_capacity(layout.type_profile_width),
        counts: Vec::with_capacity(layout.type_profile_width),
        total: 0,
    };
    for row in 0..layout.type_profile_width {
        let klass = data.read_word(pos, layout.receiver_offset(row));
        if klass == 0 {
            continue;
        }
        let count = data.read_unsigned_int(pos, layout.receiver_count_offset(row));
        profile.total += count;
        // Profile races can record one type in two rows.
        match profile.items.iter().position(|&k| k == klass) {
            Some(existing) => profile.counts[existing] += count,
            None => {
                profile.items.push(klass);
                profile.counts.push(count);
            }
        }
    }
    profile.total += not_recorded;
    profile
}

fn raw_method_profile(data: &MethodData<'_>, pos: usize) -> RawItemProfile {
    let layout = data.layout();
    let mut profile = RawItemProfile {
        items: Vec::new(),
        counts: Vec::new(),
        total: 0,
    };
    for row in 0..layout.method_profile_width {
        let method = data.read_word(pos, layout.method_offset(row));
        if method == 0 {
            continue;
        }
        let count = data.read_unsigned_int(pos, layout.method_count_offset(row));
        profile.items.push(method);
        profile.counts.push(count);
        profile.total += count;
    }
    profile.total += nonprofiled_count(data, pos).max(0) as u64;
    // A statically bindable site may only count through the first row.
    if profile.items.len() == 1 {
        profile.counts[0] = profile.total;
    }
    profile
}

fn append_type_rows(out: &mut String, data: &MethodData<'_>, pos: usize, not_recorded: u64) -> fmt::Result {
    let profile = raw_type_profile(data, pos, not_recorded);
    write!(
        out,
        "count({}) null_seen({}) exception_seen({}) nonprofiled_count({}) entries({})",
        counter_value(data, pos),
        null_seen(data, pos),
        flag(data, pos, data.layout().exception_seen_flag),
        nonprofiled_count(data, pos),
        profile.items.len()
    )?;
    for (item, count) in profile.items.iter().zip(&profile.counts) {
        let share = if profile.total == 0 {
            0.0
        } else {
            *count as f64 / profile.total as f64
        };
        write!(out, "\n  {:#x} ({}, {:4.2})", item, count, share)?;
    }
    Ok(())
}

// =============================================================================
// Accessors
// =============================================================================

/// Placeholder for sites without a record.
#[derive(Debug, Clone, Copy)]
pub struct NoData {
    pub exception_seen: TriState,
}

impl ProfileAccessor for NoData {
    fn tag(&self) -> DataTag {
        DataTag::NoTag
    }
    fn name(&self) -> &'static str {
        "NoMethodData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(0)
    }
    fn bci(&self, _data: &MethodData<'_>, _pos: usize) -> i32 {
        -1
    }
    fn exception_seen(&self, _data: &MethodData<'_>, _pos: usize) -> TriState {
        self.exception_seen
    }
    fn append_to(&self, _out: &mut String, _data: &MethodData<'_>, _pos: usize) -> fmt::Result {
        Ok(())
    }
}

/// Flags only.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitData;

impl ProfileAccessor for BitData {
    fn tag(&self) -> DataTag {
        DataTag::BitData
    }
    fn name(&self) -> &'static str {
        "BitData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(0)
    }
    fn null_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        null_seen(data, pos)
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        write!(out, "exception_seen({})", self.exception_seen(data, pos))
    }
}

/// Flags plus an execution counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterData;

impl ProfileAccessor for CounterData {
    fn tag(&self) -> DataTag {
        DataTag::CounterData
    }
    fn name(&self) -> &'static str {
        "CounterData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(1)
    }
    fn null_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        null_seen(data, pos)
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        counter_value(data, pos)
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        write!(
            out,
            "count({}) null_seen({}) exception_seen({})",
            counter_value(data, pos),
            null_seen(data, pos),
            self.exception_seen(data, pos)
        )
    }
}

/// Unconditional jump: taken count and displacement.
#[derive(Debug, Clone, Copy, Default)]
pub struct JumpData;

impl ProfileAccessor for JumpData {
    fn tag(&self) -> DataTag {
        DataTag::JumpData
    }
    fn name(&self) -> &'static str {
        "JumpData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(2)
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        truncate_to_int(taken_count(data, pos))
    }
    fn branch_taken_probability(&self, data: &MethodData<'_>, pos: usize) -> f64 {
        if self.execution_count(data, pos) != 0 {
            1.0
        } else {
            0.0
        }
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        write!(
            out,
            "taken({}) displacement({})",
            self.execution_count(data, pos),
            taken_displacement(data, pos)
        )
    }
}

/// Conditional branch: taken and not-taken counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchData;

impl BranchData {
    fn counts(data: &MethodData<'_>, pos: usize) -> (u64, u64) {
        let layout = data.layout();
        let not_taken = data.read_unsigned_int(pos, layout.cell_offset(layout.branch_not_taken_cell));
        (taken_count(data, pos), not_taken)
    }
}

impl ProfileAccessor for BranchData {
    fn tag(&self) -> DataTag {
        DataTag::BranchData
    }
    fn name(&self) -> &'static str {
        "BranchData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(3)
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        let (taken, not_taken) = Self::counts(data, pos);
        truncate_to_int(taken + not_taken)
    }
    fn branch_taken_probability(&self, data: &MethodData<'_>, pos: usize) -> f64 {
        let (taken, not_taken) = Self::counts(data, pos);
        let total = taken + not_taken;
        if total == 0 {
            -1.0
        } else {
            taken as f64 / total as f64
        }
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        let (taken, not_taken) = Self::counts(data, pos);
        let p = self.branch_taken_probability(data, pos);
        write!(
            out,
            "taken({}, {:4.2}) not_taken({}, {:4.2}) displacement({})",
            taken,
            p,
            not_taken,
            1.0 - p,
            taken_displacement(data, pos)
        )
    }
}

/// Type-check site: receiver rows plus a non-profiled count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverTypeData;

impl ProfileAccessor for ReceiverTypeData {
    fn tag(&self) -> DataTag {
        DataTag::ReceiverTypeData
    }
    fn name(&self) -> &'static str {
        "ReceiverTypeData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        type_check_size(layout)
    }
    fn null_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        null_seen(data, pos)
    }
    fn type_profile(&self, data: &MethodData<'_>, pos: usize) -> Option<TypeProfile> {
        let not_recorded = nonprofiled_count(data, pos).max(0) as u64;
        let (not_recorded_probability, types) =
            raw_type_profile(data, pos, not_recorded).into_items(data.layout().type_profile_width)?;
        Some(TypeProfile {
            null_seen: null_seen(data, pos),
            not_recorded_probability,
            types,
        })
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        append_type_rows(out, data, pos, nonprofiled_count(data, pos).max(0) as u64)
    }
}

/// Virtual call site: receiver rows, method rows and a call counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualCallData;

impl VirtualCallData {
    fn execution_count_of(data: &MethodData<'_>, pos: usize) -> i32 {
        let layout = data.layout();
        let rows: u64 = (0..layout.type_profile_width)
            .map(|row| data.read_unsigned_int(pos, layout.receiver_count_offset(row)))
            .sum();
        truncate_to_int(rows + counter_value(data, pos).max(0) as u64)
    }

    fn type_profile_of(data: &MethodData<'_>, pos: usize) -> Option<TypeProfile> {
        let not_recorded = counter_value(data, pos).max(0) as u64;
        let (not_recorded_probability, types) =
            raw_type_profile(data, pos, not_recorded).into_items(data.layout().type_profile_width)?;
        Some(TypeProfile {
            null_seen: null_seen(data, pos),
            not_recorded_probability,
            types,
        })
    }

    fn method_profile_of(data: &MethodData<'_>, pos: usize) -> Option<MethodProfile> {
        let (not_recorded_probability, methods) =
            raw_method_profile(data, pos).into_items(data.layout().method_profile_width)?;
        Some(MethodProfile {
            not_recorded_probability,
            methods,
        })
    }

    fn append(out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        write!(out, "exception_seen({}) ", flag(data, pos, data.layout().exception_seen_flag))?;
        append_type_rows(out, data, pos, counter_value(data, pos).max(0) as u64)?;
        let methods = raw_method_profile(data, pos);
        write!(out, "\nmethod_entries({})", methods.items.len())?;
        for (item, count) in methods.items.iter().zip(&methods.counts) {
            let share = if methods.total == 0 {
                0.0
            } else {
                *count as f64 / methods.total as f64
            };
            write!(out, "\n  {:#x} ({}, {:4.2})", item, count, share)?;
        }
        Ok(())
    }
}

impl ProfileAccessor for VirtualCallData {
    fn tag(&self) -> DataTag {
        DataTag::VirtualCallData
    }
    fn name(&self) -> &'static str {
        "VirtualCallData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        virtual_call_size(layout)
    }
    fn null_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        null_seen(data, pos)
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        Self::execution_count_of(data, pos)
    }
    fn type_profile(&self, data: &MethodData<'_>, pos: usize) -> Option<TypeProfile> {
        Self::type_profile_of(data, pos)
    }
    fn method_profile(&self, data: &MethodData<'_>, pos: usize) -> Option<MethodProfile> {
        Self::method_profile_of(data, pos)
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        Self::append(out, data, pos)
    }
}

/// Virtual call site followed by argument/return type cells.
///
/// The trailing part is self-describing: the first cell after the virtual
/// call part holds the number of cells that follow it.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualCallTypeData;

impl ProfileAccessor for VirtualCallTypeData {
    fn tag(&self) -> DataTag {
        DataTag::VirtualCallTypeData
    }
    fn name(&self) -> &'static str {
        "VirtualCallTypeData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        virtual_call_size(layout)
    }
    fn dynamic_size(&self, data: &MethodData<'_>, pos: usize) -> usize {
        let layout = data.layout();
        let extra = data.read_int(pos, virtual_call_size(layout)).max(0) as usize;
        layout.cells_to_bytes(1 + extra)
    }
    fn null_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        null_seen(data, pos)
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        VirtualCallData::execution_count_of(data, pos)
    }
    fn type_profile(&self, data: &MethodData<'_>, pos: usize) -> Option<TypeProfile> {
        VirtualCallData::type_profile_of(data, pos)
    }
    fn method_profile(&self, data: &MethodData<'_>, pos: usize) -> Option<MethodProfile> {
        VirtualCallData::method_profile_of(data, pos)
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        VirtualCallData::append(out, data, pos)
    }
}

/// `ret` site: counter plus `bci_profile_width` rows of three cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetData;

impl ProfileAccessor for RetData {
    fn tag(&self) -> DataTag {
        DataTag::RetData
    }
    fn name(&self) -> &'static str {
        "RetData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(1) + layout.cells_to_bytes(3) * layout.bci_profile_width
    }
    fn null_seen(&self, data: &MethodData<'_>, pos: usize) -> TriState {
        null_seen(data, pos)
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        counter_value(data, pos)
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        write!(
            out,
            "count({}) null_seen({}) exception_seen({})",
            counter_value(data, pos),
            null_seen(data, pos),
            self.exception_seen(data, pos)
        )
    }
}

/// Switch site: one (count, displacement) row per case, default first.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiBranchData;

impl MultiBranchData {
    fn case_count(data: &MethodData<'_>, pos: usize) -> usize {
        array_length(data, pos) / data.layout().multi_branch_case_cells
    }

    fn count_offset(layout: &ProfileLayout, case: usize) -> usize {
        layout.cell_offset(layout.array_start_cell)
            + case * layout.cells_to_bytes(layout.multi_branch_case_cells)
    }

    fn displacement_offset(layout: &ProfileLayout, case: usize) -> usize {
        Self::count_offset(layout, case) + layout.cell_size
    }
}

impl ProfileAccessor for MultiBranchData {
    fn tag(&self) -> DataTag {
        DataTag::MultiBranchData
    }
    fn name(&self) -> &'static str {
        "MultiBranchData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(1)
    }
    fn dynamic_size(&self, data: &MethodData<'_>, pos: usize) -> usize {
        data.layout().cells_to_bytes(array_length(data, pos))
    }
    fn execution_count(&self, data: &MethodData<'_>, pos: usize) -> i32 {
        let layout = data.layout();
        let total: u64 = (0..Self::case_count(data, pos))
            .map(|case| data.read_unsigned_int(pos, Self::count_offset(layout, case)))
            .sum();
        truncate_to_int(total)
    }
    fn switch_probabilities(&self, data: &MethodData<'_>, pos: usize) -> Option<Vec<f64>> {
        let layout = data.layout();
        let cases = Self::case_count(data, pos);
        if cases == 0 {
            return None;
        }
        let counts: Vec<u64> = (0..cases)
            .map(|case| data.read_unsigned_int(pos, Self::count_offset(layout, case)))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return None;
        }
        // The runtime stores the default case first; callers expect it last.
        let mut result: Vec<f64> = counts[1..].iter().map(|&c| c as f64 / total as f64).collect();
        result.push(counts[0] as f64 / total as f64);
        Some(result)
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        let layout = data.layout();
        let cases = Self::case_count(data, pos);
        write!(out, "entries({})", cases)?;
        for case in 0..cases {
            write!(
                out,
                "\n  {}: count({}) displacement({})",
                case,
                data.read_unsigned_int(pos, Self::count_offset(layout, case)),
                data.read_unsigned_int(pos, Self::displacement_offset(layout, case))
            )?;
        }
        Ok(())
    }
}

/// Per-argument flags of the method.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgInfoData;

impl ProfileAccessor for ArgInfoData {
    fn tag(&self) -> DataTag {
        DataTag::ArgInfoData
    }
    fn name(&self) -> &'static str {
        "ArgInfoData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(1)
    }
    fn dynamic_size(&self, data: &MethodData<'_>, pos: usize) -> usize {
        data.layout().cells_to_bytes(array_length(data, pos))
    }
    fn append_to(&self, out: &mut String, data: &MethodData<'_>, pos: usize) -> fmt::Result {
        write!(out, "length({})", array_length(data, pos))
    }
}

/// Records whose contents the compiler does not interpret. Only their size
/// matters, taken from the cell following the header.
#[derive(Debug, Clone, Copy)]
pub struct OpaqueData {
    pub tag: DataTag,
}

impl ProfileAccessor for OpaqueData {
    fn tag(&self) -> DataTag {
        self.tag
    }
    fn name(&self) -> &'static str {
        "UnknownProfileData"
    }
    fn static_size(&self, layout: &ProfileLayout) -> usize {
        layout.cell_offset(0)
    }
    fn dynamic_size(&self, data: &MethodData<'_>, pos: usize) -> usize {
        let layout = data.layout();
        let extra = data.read_int(pos, layout.cell_offset(0)).max(0) as usize;
        layout.cells_to_bytes(1 + extra)
    }
    fn append_to(&self, out: &mut String, _data: &MethodData<'_>, _pos: usize) -> fmt::Result {
        write!(out, "unknown profile data with tag: {}", self.tag.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_decoding() {
        for tag in 0..DataTag::COUNT as u8 {
            assert_eq!(DataTag::from_u8(tag).map(DataTag::as_u8), Some(tag));
        }
        assert_eq!(DataTag::from_u8(14), None);
    }

    #[test]
    fn test_static_sizes() {
        let layout = ProfileLayout::default();
        assert_eq!(BitData.static_size(&layout), 8);
        assert_eq!(CounterData.static_size(&layout), 16);
        assert_eq!(JumpData.static_size(&layout), 24);
        assert_eq!(BranchData.static_size(&layout), 32);
        // header + count + nonprofiled + 2 rows of 2 cells
        assert_eq!(ReceiverTypeData.static_size(&layout), 8 + 16 + 32);
        assert_eq!(RetData.static_size(&layout), 16 + 48);
    }

    #[test]
    fn test_raw_profile_items_sorted() {
        let raw = RawItemProfile {
            items: vec![0x10, 0x20],
            counts: vec![1, 3],
            total: 4,
        };
        let (not_recorded, items) = raw.into_items(2).unwrap();
        assert_eq!(items[0].item, 0x20);
        assert!((items[0].probability - 0.75).abs() < 1e-9);
        assert_eq!(not_recorded, 0.0);
    }

    #[test]
    fn test_empty_raw_profile() {
        let raw = RawItemProfile {
            items: vec![],
            counts: vec![],
            total: 10,
        };
        assert!(raw.into_items(2).is_none());
    }
}
