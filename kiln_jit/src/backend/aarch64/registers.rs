//! AArch64 registers and the AAPCS64 calling convention.
//!
//! | Register    | Role                                    |
//! |-------------|-----------------------------------------|
//! | `x0`-`x7`   | arguments, `x0` result                  |
//! | `x8`, `x9`  | emitter temporaries, never allocated    |
//! | `x16`,`x17` | spill scratch (IP0/IP1)                 |
//! | `x18`       | platform register, untouched            |
//! | `x19`-`x27` | callee-saved, allocatable               |
//! | `x28`       | current thread                          |
//! | `x29`,`x30` | frame pointer, link register            |
//! | `v30`,`v31` | float spill scratch                     |

use crate::lir::value::{Register, RegisterCategory};
use crate::regalloc::RegisterConfig;
use kiln_core::{KilnError, KilnResult};
use std::fmt;

/// General register `x0`-`x30`. Encoding 31 is the zero register or the
/// stack pointer depending on the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XReg(u8);

impl XReg {
    pub const X0: XReg = XReg(0);
    pub const X8: XReg = XReg(8);
    pub const X9: XReg = XReg(9);
    pub const X16: XReg = XReg(16);
    pub const X17: XReg = XReg(17);
    pub const X28: XReg = XReg(28);
    pub const FP: XReg = XReg(29);
    pub const LR: XReg = XReg(30);
    /// `xzr` or `sp`, by context.
    pub const ZR: XReg = XReg(31);
    pub const SP: XReg = XReg(31);

    pub const fn new(encoding: u8) -> Option<XReg> {
        if encoding < 32 {
            Some(XReg(encoding))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn encoding(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn reg(self) -> Register {
        Register::general(self.0)
    }

    pub fn from_register(register: Register) -> KilnResult<XReg> {
        match register.category {
            RegisterCategory::General if register.encoding < 31 => Ok(XReg(register.encoding)),
            _ => Err(KilnError::emission(format!("{register} is not an aarch64 general register"))),
        }
    }
}

impl fmt::Display for XReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            29 => f.write_str("fp"),
            30 => f.write_str("lr"),
            31 => f.write_str("zr"),
            n => write!(f, "x{n}"),
        }
    }
}

/// SIMD and floating-point register `v0`-`v31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(u8);

impl VReg {
    pub const V0: VReg = VReg(0);
    pub const V30: VReg = VReg(30);
    pub const V31: VReg = VReg(31);

    #[inline(always)]
    pub const fn encoding(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn reg(self) -> Register {
        Register::float(self.0)
    }

    pub fn from_register(register: Register) -> KilnResult<VReg> {
        match register.category {
            RegisterCategory::Float if register.encoding < 32 => Ok(VReg(register.encoding)),
            _ => Err(KilnError::emission(format!("{register} is not an aarch64 vector register"))),
        }
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

pub const ARG_XREGS: [XReg; 8] = [XReg(0), XReg(1), XReg(2), XReg(3), XReg(4), XReg(5), XReg(6), XReg(7)];
pub const ARG_VREGS: [VReg; 8] = [VReg(0), VReg(1), VReg(2), VReg(3), VReg(4), VReg(5), VReg(6), VReg(7)];
pub const RETURN_XREG: XReg = XReg::X0;
pub const RETURN_VREG: VReg = VReg::V0;

pub const THREAD: XReg = XReg::X28;
pub const SCRATCH: [XReg; 2] = [XReg::X16, XReg::X17];
pub const FLOAT_SCRATCH: [VReg; 2] = [VReg::V30, VReg::V31];
/// Temporaries the emitter uses inside a single instruction.
pub const TEMPS: [XReg; 2] = [XReg::X8, XReg::X9];

/// Register file handed to the allocator.
pub fn register_config() -> RegisterConfig {
    let general = (0..8).chain(10..16).chain(19..28).map(Register::general);
    let float = (0..30).map(Register::float);
    RegisterConfig {
        allocatable: general.chain(float).collect(),
        callee_saved: (19..28).map(Register::general).chain((8..16).map(Register::float)).collect(),
        scratch_general: [SCRATCH[0].reg(), SCRATCH[1].reg()],
        scratch_float: [FLOAT_SCRATCH[0].reg(), FLOAT_SCRATCH[1].reg()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_registers() {
        let config = register_config();
        for reserved in [TEMPS[0], TEMPS[1], SCRATCH[0], SCRATCH[1], THREAD, XReg::FP, XReg::LR] {
            assert!(!config.allocatable.contains(&reserved.reg()), "{reserved}");
        }
        assert!(!config.allocatable.contains(&Register::general(18)));
        assert!(config.is_callee_saved(Register::float(8)));
        assert!(!config.is_callee_saved(Register::float(16)));
        assert!(XReg::from_register(Register::general(31)).is_err());
    }
}
