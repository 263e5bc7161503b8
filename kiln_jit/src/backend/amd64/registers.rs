//! AMD64 registers and the System V calling convention.
//!
//! Register roles:
//!
//! | Register      | Role                                  |
//! |---------------|---------------------------------------|
//! | `rsp`, `rbp`  | stack and frame pointer               |
//! | `r15`         | current thread                        |
//! | `r10`, `r11`  | spill scratch, never allocated        |
//! | `xmm14/15`    | float spill scratch, never allocated  |
//! | `rbx`, `r12`-`r14` | callee-saved, allocatable        |

use crate::lir::value::{Register, RegisterCategory};
use crate::regalloc::RegisterConfig;
use kiln_core::{KilnError, KilnResult};
use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// General-purpose register with its hardware encoding.
///
/// Bits 0-2 go into ModR/M, SIB or the opcode; bit 3 into a REX prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// RSP and R12 share the SIB escape encoding as a base.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP and R13 mean `[disp32]` / RIP-relative without a displacement.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    /// Byte access to SPL, BPL, SIL or DIL needs a REX prefix.
    #[inline(always)]
    pub const fn byte_needs_rex(self) -> bool {
        matches!(self, Gpr::Rsp | Gpr::Rbp | Gpr::Rsi | Gpr::Rdi)
    }

    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        if enc < 16 {
            Some(Self::ALL[enc as usize])
        } else {
            None
        }
    }

    #[inline]
    pub const fn reg(self) -> Register {
        Register::general(self as u8)
    }

    pub fn from_register(register: Register) -> KilnResult<Gpr> {
        match register.category {
            RegisterCategory::General => Gpr::from_encoding(register.encoding),
            RegisterCategory::Float => None,
        }
        .ok_or_else(|| KilnError::emission(format!("{register} is not an amd64 general register")))
    }

    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// XMM Registers
// =============================================================================

/// SSE register; its low 128 bits are the matching YMM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(u8);

impl Xmm {
    pub const XMM0: Xmm = Xmm(0);
    pub const XMM14: Xmm = Xmm(14);
    pub const XMM15: Xmm = Xmm(15);

    pub const fn new(encoding: u8) -> Option<Xmm> {
        if encoding < 16 {
            Some(Xmm(encoding))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn reg(self) -> Register {
        Register::float(self.0)
    }

    pub fn from_register(register: Register) -> KilnResult<Xmm> {
        match register.category {
            RegisterCategory::Float => Xmm::new(register.encoding),
            RegisterCategory::General => None,
        }
        .ok_or_else(|| KilnError::emission(format!("{register} is not an amd64 xmm register")))
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

// =============================================================================
// Calling Convention
// =============================================================================

/// Integer argument registers, in order.
pub const ARG_GPRS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Float argument registers, in order.
pub const ARG_XMMS: [Xmm; 8] = [Xmm(0), Xmm(1), Xmm(2), Xmm(3), Xmm(4), Xmm(5), Xmm(6), Xmm(7)];

pub const RETURN_GPR: Gpr = Gpr::Rax;
pub const RETURN_XMM: Xmm = Xmm::XMM0;

pub const THREAD: Gpr = Gpr::R15;
pub const STACK_POINTER: Gpr = Gpr::Rsp;
pub const FRAME_POINTER: Gpr = Gpr::Rbp;
pub const SCRATCH: [Gpr; 2] = [Gpr::R10, Gpr::R11];
pub const FLOAT_SCRATCH: [Xmm; 2] = [Xmm::XMM14, Xmm::XMM15];

/// Allocatable general registers, caller-saved first.
pub const ALLOCATABLE_GPRS: [Gpr; 11] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::Rbx,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
];

pub const CALLEE_SAVED_GPRS: [Gpr; 4] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14];

/// Register file handed to the allocator. All XMM registers are
/// caller-saved under System V.
pub fn register_config() -> RegisterConfig {
    let mut allocatable: Vec<Register> = ALLOCATABLE_GPRS.iter().map(|r| r.reg()).collect();
    allocatable.extend((0..14).map(Register::float));
    RegisterConfig {
        allocatable,
        callee_saved: CALLEE_SAVED_GPRS.iter().map(|r| r.reg()).collect(),
        scratch_general: [SCRATCH[0].reg(), SCRATCH[1].reg()],
        scratch_float: [FLOAT_SCRATCH[0].reg(), FLOAT_SCRATCH[1].reg()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_registers_not_allocatable() {
        let config = register_config();
        for reserved in [Gpr::Rsp, Gpr::Rbp, THREAD, SCRATCH[0], SCRATCH[1]] {
            assert!(!config.allocatable.contains(&reserved.reg()), "{reserved}");
        }
        assert!(!config.allocatable.contains(&FLOAT_SCRATCH[1].reg()));
        assert!(config.is_callee_saved(Gpr::R12.reg()));
        assert!(!config.is_callee_saved(Gpr::Rax.reg()));
    }

    #[test]
    fn test_encoding_properties() {
        assert!(Gpr::R12.needs_sib_as_base());
        assert!(Gpr::R13.needs_displacement());
        assert!(Gpr::R9.high_bit());
        assert_eq!(Gpr::from_encoding(11), Some(Gpr::R11));
        assert!(Gpr::from_register(Register::float(1)).is_err());
    }
}
