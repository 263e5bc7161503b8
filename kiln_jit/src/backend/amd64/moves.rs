//! AMD64 move factory.

use crate::lir::MoveFactory;
use kiln_core::Constant;

/// Immediates are 32-bit sign-extended; floats only inline as zero
/// (`xorps`). Everything else is loaded RIP-relative from the data section.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amd64MoveFactory;

/// Whether `value` survives sign extension from 32 bits.
#[inline]
pub(crate) fn is_imm32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

impl MoveFactory for Amd64MoveFactory {
    fn can_inline_constant(&self, constant: &Constant) -> bool {
        match *constant {
            Constant::Null | Constant::Int(_) => true,
            Constant::Long(v) => is_imm32(v),
            Constant::Float(_) | Constant::Double(_) => constant.is_default(),
            Constant::Object(_) => false,
        }
    }

    fn allow_constant_to_stack_move(&self, constant: &Constant) -> bool {
        match *constant {
            Constant::Null | Constant::Int(_) | Constant::Float(_) => true,
            Constant::Long(v) => is_imm32(v),
            Constant::Double(bits) => is_imm32(bits as i64),
            Constant::Object(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirOp, Value, VirtualStackSlot};
    use kiln_core::ValueKind;

    #[test]
    fn test_inline_ranges() {
        let f = Amd64MoveFactory;
        assert!(f.can_inline_constant(&Constant::Long(i32::MIN as i64)));
        assert!(!f.can_inline_constant(&Constant::Long(1 << 32)));
        assert!(f.can_inline_constant(&Constant::Null));
        assert!(!f.can_inline_constant(&Constant::Object(0x1000)));
        assert!(f.can_inline_constant(&Constant::double(0.0)));
        assert!(!f.can_inline_constant(&Constant::double(1.5)));
    }

    #[test]
    fn test_wide_constant_loads_from_table() {
        let f = Amd64MoveFactory;
        let slot = Value::VirtualStack(VirtualStackSlot {
            id: 0,
            size: 8,
            kind: ValueKind::Long,
        });
        assert!(f.create_load(slot, Constant::Long(1 << 40)).is_err());
        let ok = f.create_load(slot, Constant::Long(7)).unwrap();
        assert!(matches!(ok.op, LirOp::LoadConstant(Constant::Long(7))));
        let reg = crate::lir::Register::general(0).as_value(ValueKind::Long);
        let table = f.create_load(reg, Constant::Long(1 << 40)).unwrap();
        assert!(matches!(table.op, LirOp::LoadConstantFromTable(_)));
        assert!(table.value(1).is_illegal());
    }
}
