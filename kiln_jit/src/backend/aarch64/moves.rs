//! AArch64 move factory.

use super::encoder::is_arith_imm;
use crate::lir::MoveFactory;
use kiln_core::Constant;

/// Immediates are `ADD`/`SUB` immediates; zero of any kind is `zr`.
/// Non-zero constants never go to the stack without a register.
#[derive(Debug, Clone, Copy, Default)]
pub struct AArch64MoveFactory;

impl MoveFactory for AArch64MoveFactory {
    fn can_inline_constant(&self, constant: &Constant) -> bool {
        match *constant {
            Constant::Null => true,
            Constant::Int(_) | Constant::Long(_) => is_arith_imm(constant.as_i64().unsigned_abs()),
            Constant::Float(_) | Constant::Double(_) => constant.is_default(),
            Constant::Object(_) => false,
        }
    }

    fn allow_constant_to_stack_move(&self, constant: &Constant) -> bool {
        constant.is_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_immediates() {
        let f = AArch64MoveFactory;
        assert!(f.can_inline_constant(&Constant::Int(4095)));
        assert!(f.can_inline_constant(&Constant::Int(-4095)));
        assert!(f.can_inline_constant(&Constant::Long(0x7FF_000)));
        assert!(!f.can_inline_constant(&Constant::Int(4097)));
        assert!(f.can_inline_constant(&Constant::Null));
        assert!(!f.can_inline_constant(&Constant::float(1.0)));
    }

    #[test]
    fn test_only_zero_goes_to_stack() {
        let f = AArch64MoveFactory;
        assert!(f.allow_constant_to_stack_move(&Constant::Long(0)));
        assert!(f.allow_constant_to_stack_move(&Constant::Null));
        assert!(f.allow_constant_to_stack_move(&Constant::double(0.0)));
        assert!(!f.allow_constant_to_stack_move(&Constant::double(-0.0)));
        assert!(!f.allow_constant_to_stack_move(&Constant::Int(1)));
    }
}
