//! Compile-time constants.

use crate::meta::ValueKind;
use std::fmt;

/// A constant value known at compile time.
///
/// Floating-point payloads are stored as raw bits so constants can be
/// hashed and compared bitwise (`NaN` payloads stay distinct).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    /// The null reference.
    Null,
    /// 32-bit integer (also boolean, byte, short, char).
    Int(i32),
    /// 64-bit integer; also used for machine words.
    Long(i64),
    /// 32-bit float bits.
    Float(u32),
    /// 64-bit float bits.
    Double(u64),
    /// Non-null object, identified by an opaque handle.
    Object(u64),
}

impl Constant {
    /// Create a float constant.
    #[inline]
    pub fn float(value: f32) -> Self {
        Constant::Float(value.to_bits())
    }

    /// Create a double constant.
    #[inline]
    pub fn double(value: f64) -> Self {
        Constant::Double(value.to_bits())
    }

    /// Create a boolean (as `Int` 0/1).
    #[inline]
    pub const fn boolean(value: bool) -> Self {
        Constant::Int(value as i32)
    }

    /// Kind of this constant.
    pub const fn kind(self) -> ValueKind {
        match self {
            Constant::Null | Constant::Object(_) => ValueKind::Object,
            Constant::Int(_) => ValueKind::Int,
            Constant::Long(_) => ValueKind::Long,
            Constant::Float(_) => ValueKind::Float,
            Constant::Double(_) => ValueKind::Double,
        }
    }

    /// Integral value, sign-extended. Null is 0 and objects yield their handle.
    /// Floats yield their raw bits.
    pub const fn as_i64(self) -> i64 {
        match self {
            Constant::Null => 0,
            Constant::Int(v) => v as i64,
            Constant::Long(v) => v,
            Constant::Float(bits) => bits as i64,
            Constant::Double(bits) => bits as i64,
            Constant::Object(handle) => handle as i64,
        }
    }

    /// Integral value if this is an `Int` or `Long`.
    pub const fn as_integer(self) -> Option<i64> {
        match self {
            Constant::Int(v) => Some(v as i64),
            Constant::Long(v) => Some(v),
            _ => None,
        }
    }

    /// Value as `f64` for floating-point constants.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Constant::Float(bits) => Some(f32::from_bits(bits) as f64),
            Constant::Double(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        matches!(self, Constant::Null)
    }

    /// Whether this is the default value for its kind (all bits zero).
    pub const fn is_default(self) -> bool {
        match self {
            Constant::Null => true,
            Constant::Int(v) => v == 0,
            Constant::Long(v) => v == 0,
            Constant::Float(bits) => bits == 0,
            Constant::Double(bits) => bits == 0,
            Constant::Object(_) => false,
        }
    }

    /// Size in bytes when placed in a constant table.
    pub const fn table_size(self) -> usize {
        match self {
            Constant::Int(_) | Constant::Float(_) => 4,
            _ => 8,
        }
    }

    /// Little-endian bytes for a constant table entry.
    pub fn to_le_bytes(self) -> Vec<u8> {
        match self {
            Constant::Int(v) => v.to_le_bytes().to_vec(),
            Constant::Float(bits) => bits.to_le_bytes().to_vec(),
            Constant::Long(v) => v.to_le_bytes().to_vec(),
            Constant::Double(bits) => bits.to_le_bytes().to_vec(),
            Constant::Null => 0u64.to_le_bytes().to_vec(),
            Constant::Object(handle) => handle.to_le_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Int(v) => write!(f, "{}i", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Float(bits) => write!(f, "{}f", f32::from_bits(*bits)),
            Constant::Double(bits) => write!(f, "{}d", f64::from_bits(*bits)),
            Constant::Object(handle) => write!(f, "Object@{:#x}", handle),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_kinds() {
        assert_eq!(Constant::Null.kind(), ValueKind::Object);
        assert_eq!(Constant::Int(1).kind(), ValueKind::Int);
        assert_eq!(Constant::double(1.5).kind(), ValueKind::Double);
    }

    #[test]
    fn test_default_values() {
        assert!(Constant::Null.is_default());
        assert!(Constant::Long(0).is_default());
        assert!(!Constant::float(-0.0).is_default());
        assert!(!Constant::Object(0x10).is_default());
    }

    #[test]
    fn test_nan_constants_compare_bitwise() {
        let a = Constant::double(f64::NAN);
        let b = Constant::double(f64::NAN);
        assert_eq!(a, b);
        assert!(a.as_f64().is_some_and(f64::is_nan));
    }
}
