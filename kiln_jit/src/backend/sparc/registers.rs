//! SPARC V9 registers.
//!
//! Integer registers are numbered `g0`-`g7` (0-7), `o0`-`o7` (8-15),
//! `l0`-`l7` (16-23) and `i0`-`i7` (24-31). After `save`, the caller's
//! `o` registers are this frame's `i` registers.
//!
//! | Register  | Role                                        |
//! |-----------|---------------------------------------------|
//! | `g1`,`g3` | spill scratch                               |
//! | `g2`      | current thread                              |
//! | `g4`,`g5` | emitter temporaries                         |
//! | `o0`-`o5` | outgoing arguments, `o0` call result        |
//! | `o6`,`o7` | `sp`, call return address                   |
//! | `l7`      | constant table base                         |
//! | `i0`-`i5` | incoming arguments, `i0` return value       |
//! | `i6`,`i7` | `fp`, return address                        |
//! | `f28`,`f30` | float spill scratch                       |

use crate::lir::value::{Register, RegisterCategory};
use crate::regalloc::RegisterConfig;
use kiln_core::{KilnError, KilnResult};
use std::fmt;

/// Bias added to `%sp` and `%fp` in 64-bit mode.
pub const STACK_BIAS: i32 = 2047;
/// Register window save area plus the six outgoing argument words.
pub const WINDOW_SAVE_AREA: i32 = 176;

/// Integer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SReg(u8);

impl SReg {
    pub const G0: SReg = SReg(0);
    pub const G1: SReg = SReg(1);
    pub const G2: SReg = SReg(2);
    pub const G3: SReg = SReg(3);
    pub const G4: SReg = SReg(4);
    pub const G5: SReg = SReg(5);
    pub const O0: SReg = SReg(8);
    pub const SP: SReg = SReg(14);
    pub const O7: SReg = SReg(15);
    pub const L7: SReg = SReg(23);
    pub const I0: SReg = SReg(24);
    pub const FP: SReg = SReg(30);
    pub const I7: SReg = SReg(31);

    #[inline(always)]
    pub const fn encoding(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn reg(self) -> Register {
        Register::general(self.0)
    }

    pub fn from_register(register: Register) -> KilnResult<SReg> {
        match register.category {
            RegisterCategory::General if register.encoding < 32 => Ok(SReg(register.encoding)),
            _ => Err(KilnError::emission(format!("{register} is not a sparc integer register"))),
        }
    }
}

impl fmt::Display for SReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            14 => f.write_str("%sp"),
            30 => f.write_str("%fp"),
            n => {
                let bank = ["g", "o", "l", "i"][(n / 8) as usize];
                write!(f, "%{bank}{}", n % 8)
            }
        }
    }
}

/// Floating-point register `f0`-`f31`. Doubles use even numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FReg(u8);

impl FReg {
    pub const F0: FReg = FReg(0);
    pub const F28: FReg = FReg(28);
    pub const F30: FReg = FReg(30);

    #[inline(always)]
    pub const fn encoding(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn reg(self) -> Register {
        Register::float(self.0)
    }

    pub fn from_register(register: Register) -> KilnResult<FReg> {
        match register.category {
            RegisterCategory::Float if register.encoding < 32 => Ok(FReg(register.encoding)),
            _ => Err(KilnError::emission(format!("{register} is not a sparc float register"))),
        }
    }
}

impl fmt::Display for FReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%f{}", self.0)
    }
}

/// Outgoing arguments, as seen by the caller.
pub const ARG_OUT: [SReg; 6] = [SReg(8), SReg(9), SReg(10), SReg(11), SReg(12), SReg(13)];
/// Incoming arguments, as seen by the callee.
pub const ARG_IN: [SReg; 6] = [SReg(24), SReg(25), SReg(26), SReg(27), SReg(28), SReg(29)];
pub const ARG_FREGS: [FReg; 8] = [FReg(0), FReg(2), FReg(4), FReg(6), FReg(8), FReg(10), FReg(12), FReg(14)];
pub const RETURN_FREG: FReg = FReg::F0;

pub const THREAD: SReg = SReg::G2;
pub const CONSTANT_TABLE_BASE: SReg = SReg::L7;
pub const SCRATCH: [SReg; 2] = [SReg::G1, SReg::G3];
pub const FLOAT_SCRATCH: [FReg; 2] = [FReg::F28, FReg::F30];
/// Temporaries the emitter uses inside a single instruction.
pub const TEMPS: [SReg; 2] = [SReg::G4, SReg::G5];

/// Register file handed to the allocator. Window registers survive calls
/// without being saved by the prologue.
pub fn register_config() -> RegisterConfig {
    let general = (8..14).chain(16..23).chain(24..30).map(Register::general);
    let float = (0..28).step_by(2).map(Register::float);
    RegisterConfig {
        allocatable: general.chain(float).collect(),
        callee_saved: (16..23).chain(24..30).map(Register::general).collect(),
        scratch_general: [SCRATCH[0].reg(), SCRATCH[1].reg()],
        scratch_float: [FLOAT_SCRATCH[0].reg(), FLOAT_SCRATCH[1].reg()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_registers() {
        let config = register_config();
        assert!(config.allocatable.contains(&Register::general(8)));
        assert!(!config.allocatable.contains(&SReg::SP.reg()));
        assert!(!config.allocatable.contains(&CONSTANT_TABLE_BASE.reg()));
        assert!(!config.allocatable.contains(&THREAD.reg()));
        assert!(!config.allocatable.contains(&Register::float(3)));
        assert!(config.is_callee_saved(Register::general(16)));
        assert!(!config.is_callee_saved(Register::general(8)));
        assert_eq!(SReg::L7.to_string(), "%l7");
        assert_eq!(SReg::I0.to_string(), "%i0");
    }
}
