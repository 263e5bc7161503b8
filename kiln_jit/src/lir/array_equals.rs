//! Tiered array equality.
//!
//! Compares `length` elements at two element addresses and yields 0 or 1.
//! The machine code works in byte units:
//!
//! ```text
//! result = length * element_size
//!
//! vector stage (AVX 32 / SSE 16, when selected)
//!     bulk = result & ~(w - 1); result &= w - 1
//!     bulk == 0            -> fall through to the word stage
//!     xor-and-test each w-byte chunk of the bulk
//!     result == 0          -> equal
//!     compare the last full w bytes, aligned to the end  (re-reads bytes)
//!
//! word stage (8 bytes), same shape on what is left
//!
//! tails, element size <= 4: 4-byte, then 2-byte, then 1-byte compare
//! ```
//!
//! For `float` and `double` elements a failed bitwise compare is re-checked
//! element by element: two NaNs compare equal here. [`ArrayEqualsOp::evaluate`]
//! walks exactly this control flow on host memory so the tiers can be
//! checked against each other without executing generated code.

use crate::backend::amd64::features::{cpu_features, CpuFeatures};
use kiln_core::ValueKind;
use std::fmt;

/// Size in bytes of the scalar stage.
pub const WORD_BYTES: usize = 8;

// =============================================================================
// Tier
// =============================================================================

/// Bulk comparison width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArrayEqualsTier {
    /// 8-byte general register compares only.
    Word,
    /// 16-byte `pxor`/`ptest` loop, then the word stage.
    Sse,
    /// 32-byte `vpxor`/`vptest` loop, then the word stage.
    Avx,
}

impl ArrayEqualsTier {
    pub const ALL: [ArrayEqualsTier; 3] = [ArrayEqualsTier::Word, ArrayEqualsTier::Sse, ArrayEqualsTier::Avx];

    /// Width of the vector stage, if there is one.
    #[inline]
    pub const fn vector_bytes(self) -> Option<usize> {
        match self {
            ArrayEqualsTier::Word => None,
            ArrayEqualsTier::Sse => Some(16),
            ArrayEqualsTier::Avx => Some(32),
        }
    }

    /// Widest tier `features` support, no wider than `max_vector_bytes`.
    pub fn select(features: CpuFeatures, max_vector_bytes: u32) -> Self {
        if max_vector_bytes >= 32 && features.contains(CpuFeatures::AVX2) {
            ArrayEqualsTier::Avx
        } else if max_vector_bytes >= 16 && features.contains(CpuFeatures::SSE4_1) {
            ArrayEqualsTier::Sse
        } else {
            ArrayEqualsTier::Word
        }
    }
}

impl fmt::Display for ArrayEqualsTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArrayEqualsTier::Word => "word",
            ArrayEqualsTier::Sse => "sse",
            ArrayEqualsTier::Avx => "avx",
        })
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Array equality for one element kind at one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayEqualsOp {
    pub kind: ValueKind,
    pub tier: ArrayEqualsTier,
}

impl ArrayEqualsOp {
    pub const fn new(kind: ValueKind, tier: ArrayEqualsTier) -> Self {
        ArrayEqualsOp { kind, tier }
    }

    /// Operation at the widest tier the host CPU supports.
    pub fn for_host(kind: ValueKind) -> Self {
        Self::new(kind, ArrayEqualsTier::select(cpu_features(), 32))
    }

    #[inline]
    pub fn element_bytes(&self) -> usize {
        self.kind.byte_size() as usize
    }

    /// Whether mismatches need the NaN re-check.
    #[inline]
    pub fn needs_nan_check(&self) -> bool {
        self.kind.is_float()
    }

    /// Compare the first `length` elements of two byte images.
    ///
    /// Images shorter than `length` elements compare unequal.
    pub fn evaluate(&self, array1: &[u8], array2: &[u8], length: usize) -> bool {
        let byte_length = length.saturating_mul(self.element_bytes());
        let (Some(a), Some(b)) = (array1.get(..byte_length), array2.get(..byte_length)) else {
            return false;
        };
        let mut position = 0;
        let mut remaining = byte_length;
        if let Some(width) = self.tier.vector_bytes() {
            if let Some(equal) = self.bulk_stage(a, b, &mut position, &mut remaining, width) {
                return equal;
            }
        }
        if let Some(equal) = self.bulk_stage(a, b, &mut position, &mut remaining, WORD_BYTES) {
            return equal;
        }
        self.tail_stage(a, b, position, remaining)
    }

    /// One bulk stage. Returns the answer when the stage decides it, or
    /// leaves `remaining` for the next stage when the bulk is empty.
    fn bulk_stage(
        &self,
        a: &[u8],
        b: &[u8],
        position: &mut usize,
        remaining: &mut usize,
        width: usize,
    ) -> Option<bool> {
        let tail = *remaining & (width - 1);
        let bulk = *remaining & !(width - 1);
        if bulk == 0 {
            *remaining = tail;
            return None;
        }
        let end = *position + bulk;
        let mut offset = *position;
        while offset < end {
            if !self.chunk_equal(&a[offset..offset + width], &b[offset..offset + width]) {
                return Some(false);
            }
            offset += width;
        }
        if tail == 0 {
            return Some(true);
        }
        let last = end + tail - width;
        Some(self.chunk_equal(&a[last..last + width], &b[last..last + width]))
    }

    fn tail_stage(&self, a: &[u8], b: &[u8], mut position: usize, remaining: usize) -> bool {
        let size = self.element_bytes();
        if size > 4 {
            return true;
        }
        if remaining & 4 != 0 {
            let (x, y) = (&a[position..position + 4], &b[position..position + 4]);
            if self.kind == ValueKind::Float {
                // A float tail is exactly the last element.
                return x == y || elements_equal(ValueKind::Float, x, y);
            }
            if x != y {
                return false;
            }
            if size <= 2 {
                position += 4;
            }
        }
        if size <= 2 && remaining & 2 != 0 {
            if a[position..position + 2] != b[position..position + 2] {
                return false;
            }
            if size <= 1 {
                position += 2;
            }
        }
        if size <= 1 && remaining & 1 != 0 && a[position] != b[position] {
            return false;
        }
        true
    }

    fn chunk_equal(&self, x: &[u8], y: &[u8]) -> bool {
        x == y || (self.needs_nan_check() && elements_equal(self.kind, x, y))
    }
}

impl fmt::Display for ArrayEqualsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array_equals[{}, {}]", self.kind, self.tier)
    }
}

/// Element-wise float equality where NaN equals NaN.
fn elements_equal(kind: ValueKind, x: &[u8], y: &[u8]) -> bool {
    match kind {
        ValueKind::Float => x.chunks_exact(4).zip(y.chunks_exact(4)).all(|(p, q)| {
            let (p, q) = (read_u32(p), read_u32(q));
            p == q || (f32::from_bits(p).is_nan() && f32::from_bits(q).is_nan())
        }),
        ValueKind::Double => x.chunks_exact(8).zip(y.chunks_exact(8)).all(|(p, q)| {
            let (p, q) = (read_u64(p), read_u64(q));
            p == q || (f64::from_bits(p).is_nan() && f64::from_bits(q).is_nan())
        }),
        _ => x == y,
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tiers(kind: ValueKind) -> impl Iterator<Item = ArrayEqualsOp> {
        ArrayEqualsTier::ALL.into_iter().map(move |t| ArrayEqualsOp::new(kind, t))
    }

    #[test]
    fn test_select_clamps_to_option() {
        let all = CpuFeatures::SSE2 | CpuFeatures::SSE4_1 | CpuFeatures::AVX | CpuFeatures::AVX2;
        assert_eq!(ArrayEqualsTier::select(all, 32), ArrayEqualsTier::Avx);
        assert_eq!(ArrayEqualsTier::select(all, 16), ArrayEqualsTier::Sse);
        assert_eq!(ArrayEqualsTier::select(all, 8), ArrayEqualsTier::Word);
        assert_eq!(ArrayEqualsTier::select(CpuFeatures::SSE2, 32), ArrayEqualsTier::Word);
    }

    #[test]
    fn test_byte_lengths_straddling_widths() {
        for len in [0usize, 1, 7, 8, 9, 31, 32, 33, 47, 64, 65] {
            let a: Vec<u8> = (0..len as u8).collect();
            for op in all_tiers(ValueKind::Byte) {
                assert!(op.evaluate(&a, &a.clone(), len), "{op} len {len}");
                if len > 0 {
                    let mut b = a.clone();
                    b[len - 1] ^= 0x80;
                    assert!(!op.evaluate(&a, &b, len), "{op} len {len} last");
                    let mut c = a.clone();
                    c[0] ^= 1;
                    assert!(!op.evaluate(&a, &c, len), "{op} len {len} first");
                }
            }
        }
    }

    #[test]
    fn test_only_length_prefix_is_compared() {
        let a = [1u8, 2, 3, 4, 5];
        let b = [1u8, 2, 3, 4, 9];
        for op in all_tiers(ValueKind::Byte) {
            assert!(op.evaluate(&a, &b, 4));
            assert!(!op.evaluate(&a, &b, 5));
        }
    }

    #[test]
    fn test_nan_equals_nan() {
        let mut x: Vec<u8> = Vec::new();
        let mut y: Vec<u8> = Vec::new();
        for i in 0..9 {
            let v = if i == 5 { f32::NAN } else { i as f32 };
            x.extend_from_slice(&v.to_le_bytes());
            // Different NaN payload, same position.
            let w = if i == 5 { f32::from_bits(0x7fc0_0001) } else { i as f32 };
            y.extend_from_slice(&w.to_le_bytes());
        }
        for op in all_tiers(ValueKind::Float) {
            assert!(op.evaluate(&x, &y, 9), "{op}");
        }
        let mut z = y.clone();
        z[20..24].copy_from_slice(&1.5f32.to_le_bytes());
        for op in all_tiers(ValueKind::Float) {
            assert!(!op.evaluate(&x, &z, 9), "{op}");
        }
    }

    #[test]
    fn test_double_nan_in_tail_vector() {
        let values = [0.5f64, f64::NAN, 2.0, 3.0, 4.0];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut other = bytes.clone();
        other[32..40].copy_from_slice(&f64::NAN.to_le_bytes());
        for op in all_tiers(ValueKind::Double) {
            assert!(op.evaluate(&bytes, &bytes, 5), "{op}");
            assert!(!op.evaluate(&bytes, &other, 5), "{op}");
        }
    }

    #[test]
    fn test_short_image_is_unequal() {
        let op = ArrayEqualsOp::new(ValueKind::Int, ArrayEqualsTier::Word);
        assert!(!op.evaluate(&[0; 4], &[0; 8], 2));
    }
}
