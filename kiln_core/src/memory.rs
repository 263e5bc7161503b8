//! Byte-addressable memory interface.
//!
//! Low-tier graphs read and write raw words (card table bytes, thread-local
//! queue slots, object fields). Anything that can answer those accesses can
//! back the graph evaluator: a simulated heap in tests, or a real runtime.

use crate::error::KilnResult;

/// Width of a raw memory access in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessSize {
    Byte = 1,
    Half = 2,
    Word = 4,
    Quad = 8,
}

impl AccessSize {
    /// Number of bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Size for a byte count, if it is a supported width.
    pub const fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(AccessSize::Byte),
            2 => Some(AccessSize::Half),
            4 => Some(AccessSize::Word),
            8 => Some(AccessSize::Quad),
            _ => None,
        }
    }

    /// Mask covering the low `bytes()` bytes.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            AccessSize::Quad => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }
}

/// Raw memory the evaluator and runtime stubs operate on.
///
/// Reads return the value zero-extended to 64 bits.
pub trait RawMemory {
    /// Read `size` bytes at `address`.
    fn read(&self, address: u64, size: AccessSize) -> u64;

    /// Write the low `size` bytes of `value` at `address`.
    fn write(&mut self, address: u64, size: AccessSize, value: u64);

    /// Full two-way fence. Simulated memories are sequentially consistent.
    fn fence(&mut self) {}
}

/// Memory that can also service calls into the runtime.
///
/// Foreign calls in a graph name their target by symbol; implementations
/// dispatch on it and reject symbols they do not provide.
pub trait RuntimeCalls: RawMemory {
    /// Invoke `symbol` with raw word arguments, returning the raw result
    /// (0 for void targets).
    fn call(&mut self, symbol: &str, args: &[u64]) -> KilnResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_size_masks() {
        assert_eq!(AccessSize::Byte.mask(), 0xff);
        assert_eq!(AccessSize::Half.mask(), 0xffff);
        assert_eq!(AccessSize::Word.mask(), 0xffff_ffff);
        assert_eq!(AccessSize::Quad.mask(), u64::MAX);
        assert_eq!(AccessSize::from_bytes(3), None);
    }
}
