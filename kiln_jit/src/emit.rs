//! Code buffers and compilation results.
//!
//! Emitters append instruction bytes to a [`CodeBuffer`], reference blocks
//! and local targets through [`Label`]s and constants through the data
//! section. [`CodeBuffer::finish`] places the data section after the code,
//! aligned to 16 bytes, resolves every fixup and produces a
//! [`CompilationResult`].
//!
//! Calls into the runtime are left unresolved and recorded as
//! [`RelocationEntry`] records against a symbol table.

use crate::backend::Target;
use crate::ir::kinds::DeoptInfo;
use crate::ir::source_position::NodeSourcePosition;
use kiln_core::{Constant, KilnError, KilnResult};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Alignment of the data section.
pub const DATA_ALIGNMENT: u32 = 16;

// =============================================================================
// Relocations
// =============================================================================

/// A relocation record: patch `offset` with the address of symbol `symbol`
/// using the target-defined relocation `kind`.
///
/// Serialized as 10 little-endian bytes:
///
/// ```text
/// 0..4   offset
/// 4..8   symbol index
/// 8..10  kind
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelocationEntry {
    pub offset: u32,
    pub symbol: u32,
    pub kind: u16,
}

impl RelocationEntry {
    pub const ENCODED_SIZE: usize = 10;

    #[inline]
    pub const fn new(offset: u32, symbol: u32, kind: u16) -> Self {
        RelocationEntry { offset, symbol, kind }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.symbol.to_le_bytes());
        out[8..10].copy_from_slice(&self.kind.to_le_bytes());
        out
    }

    /// Decode one record from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> KilnResult<Self> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(KilnError::emission(format!(
                "relocation record needs {} bytes, got {}",
                Self::ENCODED_SIZE,
                bytes.len()
            )));
        }
        let offset = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let symbol = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let kind = u16::from_le_bytes([bytes[8], bytes[9]]);
        Ok(RelocationEntry { offset, symbol, kind })
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Why an infopoint was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfopointReason {
    /// Return address of a runtime call.
    Call,
    /// Call into the deoptimization handler.
    Deopt,
    /// A faulting instruction that stands for an explicit check.
    ImplicitException,
}

/// A code position with the deoptimization state that applies there.
#[derive(Debug, Clone, PartialEq)]
pub struct Infopoint {
    pub pc_offset: u32,
    pub reason: InfopointReason,
    pub deopt: DeoptInfo,
    pub position: Option<Arc<NodeSourcePosition>>,
}

/// An instruction whose fault is turned into a deoptimization.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionSite {
    pub pc_offset: u32,
    pub deopt: DeoptInfo,
}

// =============================================================================
// Labels and Fixups
// =============================================================================

/// A code position that may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// What a fixup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupTarget {
    Label(Label),
    /// Byte offset into the data section.
    Data(u32),
}

/// How a resolved displacement is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// Signed 32-bit byte displacement from the end of the 4-byte field.
    Rel32,
    /// Signed 26-bit word displacement in bits 0..26 of the instruction.
    Imm26,
    /// Signed 19-bit word displacement in bits 5..24 of the instruction.
    Imm19,
    /// Signed 22-bit word displacement in bits 0..22 of the instruction.
    Disp22,
    /// Signed 19-bit word displacement in bits 0..19 of the instruction.
    Disp19,
    /// Bits 10..32 of `target - anchor` in bits 0..22 of a `sethi`.
    Hi22 { anchor: u32 },
    /// Bits 0..10 of `target - anchor` in the immediate of an `or`.
    Lo10 { anchor: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: u32,
    target: FixupTarget,
    kind: FixupKind,
}

fn field_error(kind: FixupKind, at: u32, displacement: i64) -> KilnError {
    KilnError::emission(format!("{kind:?} displacement {displacement} at {at:#x} out of range"))
}

/// Insert a signed word displacement of `bits` bits at bit `shift`.
fn insert_words(word: u32, kind: FixupKind, at: u32, displacement: i64, bits: u32, shift: u32) -> KilnResult<u32> {
    if displacement & 3 != 0 {
        return Err(KilnError::emission(format!("{kind:?} target at {at:#x} is not word aligned")));
    }
    let words = displacement >> 2;
    let limit = 1i64 << (bits - 1);
    if words < -limit || words >= limit {
        return Err(field_error(kind, at, displacement));
    }
    let mask = ((1u32 << bits) - 1) << shift;
    Ok((word & !mask) | (((words as u32) << shift) & mask))
}

// =============================================================================
// Data Section
// =============================================================================

/// Deduplicated constant table placed after the code.
#[derive(Debug, Clone, Default)]
struct DataSection {
    bytes: Vec<u8>,
    offsets: FxHashMap<Constant, u32>,
}

impl DataSection {
    fn add(&mut self, constant: Constant, big_endian: bool) -> u32 {
        if let Some(&offset) = self.offsets.get(&constant) {
            return offset;
        }
        let size = constant.table_size();
        while self.bytes.len() % size != 0 {
            self.bytes.push(0);
        }
        let offset = self.bytes.len() as u32;
        let mut bytes = constant.to_le_bytes();
        if big_endian {
            bytes.reverse();
        }
        self.bytes.extend_from_slice(&bytes);
        self.offsets.insert(constant, offset);
        offset
    }
}

// =============================================================================
// Code Buffer
// =============================================================================

/// Growable machine code with labels, fixups and metadata.
#[derive(Debug)]
pub struct CodeBuffer {
    code: Vec<u8>,
    big_endian: bool,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    data: DataSection,
    symbols: Vec<String>,
    symbol_index: FxHashMap<String, u32>,
    relocations: Vec<RelocationEntry>,
    exception_sites: Vec<ExceptionSite>,
    infopoints: Vec<Infopoint>,
}

impl CodeBuffer {
    /// Buffer writing instruction words in the byte order of `target`.
    pub fn new(target: Target) -> Self {
        CodeBuffer {
            code: Vec::with_capacity(256),
            big_endian: target.is_big_endian(),
            labels: Vec::new(),
            fixups: Vec::new(),
            data: DataSection::default(),
            symbols: Vec::new(),
            symbol_index: FxHashMap::default(),
            relocations: Vec::new(),
            exception_sites: Vec::new(),
            infopoints: Vec::new(),
        }
    }

    /// Offset of the next byte.
    #[inline]
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Append a 32-bit instruction word or field.
    #[inline]
    pub fn emit_u32(&mut self, word: u32) {
        let bytes = if self.big_endian {
            word.to_be_bytes()
        } else {
            word.to_le_bytes()
        };
        self.code.extend_from_slice(&bytes);
    }

    pub fn read_u32(&self, at: u32) -> KilnResult<u32> {
        let at = at as usize;
        let bytes: [u8; 4] = self
            .code
            .get(at..at + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| KilnError::emission(format!("read past end of code at {at:#x}")))?;
        Ok(if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    pub fn patch_u32(&mut self, at: u32, word: u32) -> KilnResult<()> {
        let bytes = if self.big_endian {
            word.to_be_bytes()
        } else {
            word.to_le_bytes()
        };
        let at = at as usize;
        let slot = self
            .code
            .get_mut(at..at + 4)
            .ok_or_else(|| KilnError::emission(format!("patch past end of code at {at:#x}")))?;
        slot.copy_from_slice(&bytes);
        Ok(())
    }

    /// Pad with `filler` to a multiple of `alignment`.
    pub fn align(&mut self, alignment: u32, filler: u8) {
        while self.position() % alignment != 0 {
            self.code.push(filler);
        }
    }

    // =========================================================================
    // Labels
    // =========================================================================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) -> KilnResult<()> {
        let position = self.position();
        match self.labels.get_mut(label.0 as usize) {
            Some(slot @ None) => {
                *slot = Some(position);
                Ok(())
            }
            Some(Some(_)) => Err(KilnError::emission(format!("label {} bound twice", label.0))),
            None => Err(KilnError::emission(format!("unknown label {}", label.0))),
        }
    }

    pub fn label_position(&self, label: Label) -> Option<u32> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Resolve the field at `at` against `target` when the buffer finishes.
    pub fn add_fixup(&mut self, at: u32, target: FixupTarget, kind: FixupKind) {
        self.fixups.push(Fixup { at, target, kind });
    }

    /// Offset of `constant` in the data section.
    pub fn data_constant(&mut self, constant: Constant) -> u32 {
        self.data.add(constant, self.big_endian)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Index of `name` in the symbol table.
    pub fn symbol(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.symbol_index.get(name) {
            return index;
        }
        let index = self.symbols.len() as u32;
        self.symbols.push(name.to_string());
        self.symbol_index.insert(name.to_string(), index);
        index
    }

    /// Record that the field at `at` refers to `name`.
    pub fn relocate(&mut self, at: u32, name: &str, kind: u16) {
        let symbol = self.symbol(name);
        self.relocations.push(RelocationEntry::new(at, symbol, kind));
    }

    pub fn exception_site(&mut self, pc_offset: u32, deopt: DeoptInfo) {
        self.exception_sites.push(ExceptionSite { pc_offset, deopt });
    }

    pub fn infopoint(
        &mut self,
        pc_offset: u32,
        reason: InfopointReason,
        deopt: DeoptInfo,
        position: Option<Arc<NodeSourcePosition>>,
    ) {
        self.infopoints.push(Infopoint {
            pc_offset,
            reason,
            deopt,
            position,
        });
    }

    // =========================================================================
    // Finishing
    // =========================================================================

    fn target_offset(&self, target: FixupTarget, data_start: u32) -> KilnResult<u32> {
        match target {
            FixupTarget::Label(label) => self
                .label_position(label)
                .ok_or_else(|| KilnError::emission(format!("label {} never bound", label.0))),
            FixupTarget::Data(offset) => Ok(data_start + offset),
        }
    }

    fn apply(&mut self, fixup: Fixup, target: u32) -> KilnResult<()> {
        let at = fixup.at;
        match fixup.kind {
            FixupKind::Rel32 => {
                let displacement = target as i64 - (at as i64 + 4);
                let value = i32::try_from(displacement).map_err(|_| field_error(fixup.kind, at, displacement))?;
                let at = at as usize;
                let slot = self
                    .code
                    .get_mut(at..at + 4)
                    .ok_or_else(|| KilnError::emission(format!("rel32 field past end at {at:#x}")))?;
                slot.copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
            kind => {
                let displacement = target as i64 - at as i64;
                let word = self.read_u32(at)?;
                let patched = match kind {
                    FixupKind::Imm26 => insert_words(word, kind, at, displacement, 26, 0)?,
                    FixupKind::Imm19 => insert_words(word, kind, at, displacement, 19, 5)?,
                    FixupKind::Disp22 => insert_words(word, kind, at, displacement, 22, 0)?,
                    FixupKind::Disp19 => insert_words(word, kind, at, displacement, 19, 0)?,
                    FixupKind::Hi22 { anchor } => {
                        let value = (target as i64 - anchor as i64) as u32;
                        (word & !0x003f_ffff) | (value >> 10)
                    }
                    FixupKind::Lo10 { anchor } => {
                        let value = (target as i64 - anchor as i64) as u32;
                        (word & !0x3ff) | (value & 0x3ff)
                    }
                    FixupKind::Rel32 => word,
                };
                self.patch_u32(at, patched)
            }
        }
    }

    /// Resolve fixups and package the result.
    pub fn finish(mut self, target: Target, frame_size: u32) -> KilnResult<CompilationResult> {
        let data_start = self.position().div_ceil(DATA_ALIGNMENT) * DATA_ALIGNMENT;
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in fixups {
            let offset = self.target_offset(fixup.target, data_start)?;
            self.apply(fixup, offset)?;
        }
        log::debug!(
            "{target}: {} code bytes, {} data bytes, {} relocations, {} infopoints",
            self.code.len(),
            self.data.bytes.len(),
            self.relocations.len(),
            self.infopoints.len()
        );
        Ok(CompilationResult {
            target,
            code: self.code,
            data: self.data.bytes,
            data_offset: data_start,
            frame_size,
            symbols: self.symbols,
            relocations: self.relocations,
            exception_sites: self.exception_sites,
            infopoints: self.infopoints,
        })
    }
}

// =============================================================================
// Compilation Result
// =============================================================================

/// Machine code and metadata of one compilation unit.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub target: Target,
    pub code: Vec<u8>,
    /// Constant table.
    pub data: Vec<u8>,
    /// Offset of the data section from the start of the code.
    pub data_offset: u32,
    pub frame_size: u32,
    pub symbols: Vec<String>,
    pub relocations: Vec<RelocationEntry>,
    pub exception_sites: Vec<ExceptionSite>,
    pub infopoints: Vec<Infopoint>,
}

impl CompilationResult {
    /// Code, padding and data laid out as they are installed.
    pub fn image(&self) -> Vec<u8> {
        let mut image = self.code.clone();
        image.resize(self.data_offset as usize, 0);
        image.extend_from_slice(&self.data);
        image
    }

    pub fn symbol(&self, index: u32) -> Option<&str> {
        self.symbols.get(index as usize).map(String::as_str)
    }

    /// Relocations against the symbol called `name`.
    pub fn relocations_to<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RelocationEntry> + 'a {
        self.relocations
            .iter()
            .filter(move |r| self.symbol(r.symbol) == Some(name))
    }

    /// All relocation records, serialized back to back.
    pub fn encoded_relocations(&self) -> Vec<u8> {
        self.relocations.iter().flat_map(|r| r.encode()).collect()
    }
}

impl fmt::Display for CompilationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes code, {} bytes data, frame {}",
            self.target,
            self.code.len(),
            self.data.len(),
            self.frame_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocation_layout() {
        let entry = RelocationEntry::new(0x1000, 5, 3);
        let bytes = entry.encode();
        assert_eq!(bytes, [0x00, 0x10, 0, 0, 5, 0, 0, 0, 3, 0]);
        assert_eq!(RelocationEntry::decode(&bytes).unwrap(), entry);
        assert!(RelocationEntry::decode(&bytes[..9]).is_err());
    }

    #[test]
    fn test_rel32_fixup_and_data_placement() {
        let mut buf = CodeBuffer::new(Target::Amd64);
        let label = buf.new_label();
        buf.emit_u8(0xE9);
        let at = buf.position();
        buf.emit_u32(0);
        buf.add_fixup(at, FixupTarget::Label(label), FixupKind::Rel32);
        buf.emit_u8(0x90);
        buf.bind(label).unwrap();
        let offset = buf.data_constant(Constant::Long(7));
        assert_eq!(buf.data_constant(Constant::Long(7)), offset);
        let result = buf.finish(Target::Amd64, 0).unwrap();
        assert_eq!(&result.code[1..5], &1i32.to_le_bytes());
        assert_eq!(result.data_offset, 16);
        assert_eq!(result.image().len(), 24);
    }

    #[test]
    fn test_word_fixups() {
        let mut buf = CodeBuffer::new(Target::AArch64);
        let label = buf.new_label();
        buf.bind(label).unwrap();
        buf.emit_u32(0xd503_201f);
        let at = buf.position();
        buf.emit_u32(0x1400_0000);
        buf.add_fixup(at, FixupTarget::Label(label), FixupKind::Imm26);
        let result = buf.finish(Target::AArch64, 0).unwrap();
        let word = u32::from_le_bytes([result.code[4], result.code[5], result.code[6], result.code[7]]);
        assert_eq!(word, 0x17ff_ffff);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut buf = CodeBuffer::new(Target::Amd64);
        let label = buf.new_label();
        buf.emit_u32(0);
        buf.add_fixup(0, FixupTarget::Label(label), FixupKind::Rel32);
        assert!(buf.finish(Target::Amd64, 0).is_err());
    }

    #[test]
    fn test_big_endian_words() {
        let mut buf = CodeBuffer::new(Target::Sparc);
        buf.emit_u32(0x0100_0000);
        assert_eq!(buf.code(), &[1, 0, 0, 0]);
        assert_eq!(buf.read_u32(0).unwrap(), 0x0100_0000);
    }
}
