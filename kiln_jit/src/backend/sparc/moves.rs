//! SPARC move factory.

use super::encoder::is_simm13;
use super::registers::CONSTANT_TABLE_BASE;
use crate::lir::value::Value;
use crate::lir::MoveFactory;
use kiln_core::{Constant, ValueKind};

/// Integers that fit `simm13` and null are immediates. Everything else,
/// float zero included, comes from the constant table addressed through
/// `%l7`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparcMoveFactory;

impl MoveFactory for SparcMoveFactory {
    fn can_inline_constant(&self, constant: &Constant) -> bool {
        match *constant {
            Constant::Null => true,
            Constant::Int(v) => is_simm13(v as i64),
            Constant::Long(v) => is_simm13(v),
            Constant::Float(_) | Constant::Double(_) | Constant::Object(_) => false,
        }
    }

    fn allow_constant_to_stack_move(&self, _constant: &Constant) -> bool {
        false
    }

    fn constant_table_base(&self) -> Value {
        CONSTANT_TABLE_BASE.reg().as_value(ValueKind::Long)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::LirOp;

    #[test]
    fn test_simm13_immediates() {
        let f = SparcMoveFactory;
        assert!(f.can_inline_constant(&Constant::Int(4095)));
        assert!(f.can_inline_constant(&Constant::Long(-4096)));
        assert!(!f.can_inline_constant(&Constant::Int(4096)));
        assert!(!f.can_inline_constant(&Constant::double(0.0)));
        assert!(f.can_inline_constant(&Constant::Null));
        assert!(!f.allow_constant_to_stack_move(&Constant::Int(0)));
    }

    #[test]
    fn test_table_load_reads_l7() {
        let f = SparcMoveFactory;
        let dst = crate::lir::value::Register::general(16).as_value(ValueKind::Long);
        let load = f.create_load(dst, Constant::Long(1 << 20)).unwrap();
        assert!(matches!(load.op, LirOp::LoadConstantFromTable(_)));
        assert_eq!(load.value(1), CONSTANT_TABLE_BASE.reg().as_value(ValueKind::Long));
    }
}
