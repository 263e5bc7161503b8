//! Stamps: the abstract value of a node.
//!
//! A stamp says what kind of value a node produces and what is known about
//! it. Integer stamps carry signed bounds, object stamps carry nullness and
//! float stamps track whether NaN is possible. Logic nodes and pure control
//! have [`Stamp::Void`].

use kiln_core::{Constant, ValueKind};
use std::fmt;

/// Abstract value of a node's result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stamp {
    /// No value: control, logic, side effects.
    Void,
    /// Integer of `bits` width (1..=64) with inclusive signed bounds.
    Int { bits: u32, lo: i64, hi: i64 },
    /// IEEE float; `double` selects 64-bit.
    Float { double: bool, non_nan: bool },
    /// Object reference.
    Object { non_null: bool, always_null: bool },
}

impl Stamp {
    /// Unrestricted integer of `bits` width.
    pub fn int(bits: u32) -> Self {
        let (lo, hi) = signed_range(bits);
        Stamp::Int { bits, lo, hi }
    }

    /// Integer stamp holding exactly `value`.
    pub fn int_constant(bits: u32, value: i64) -> Self {
        let value = sign_normalize(bits, value);
        Stamp::Int {
            bits,
            lo: value,
            hi: value,
        }
    }

    /// Integer stamp with explicit bounds, clamped to the width.
    pub fn int_range(bits: u32, lo: i64, hi: i64) -> Self {
        let (min, max) = signed_range(bits);
        Stamp::Int {
            bits,
            lo: lo.max(min),
            hi: hi.min(max),
        }
    }

    /// Raw machine word (addresses, thread register values).
    pub fn word() -> Self {
        Self::int(64)
    }

    /// Boolean materialized as a 32-bit 0/1 value.
    pub fn boolean() -> Self {
        Self::int_range(32, 0, 1)
    }

    /// Any object reference.
    pub const fn object() -> Self {
        Stamp::Object {
            non_null: false,
            always_null: false,
        }
    }

    /// Non-null object reference.
    pub const fn object_non_null() -> Self {
        Stamp::Object {
            non_null: true,
            always_null: false,
        }
    }

    /// The null reference.
    pub const fn null() -> Self {
        Stamp::Object {
            non_null: false,
            always_null: true,
        }
    }

    /// Stamp of a value of `kind` with nothing else known.
    pub fn for_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Boolean => Self::int_range(32, 0, 1),
            ValueKind::Byte => Self::int_range(32, i8::MIN as i64, i8::MAX as i64),
            ValueKind::Short => Self::int_range(32, i16::MIN as i64, i16::MAX as i64),
            ValueKind::Char => Self::int_range(32, 0, u16::MAX as i64),
            ValueKind::Int => Self::int(32),
            ValueKind::Long => Self::int(64),
            ValueKind::Float => Stamp::Float {
                double: false,
                non_nan: false,
            },
            ValueKind::Double => Stamp::Float {
                double: true,
                non_nan: false,
            },
            ValueKind::Object => Self::object(),
            ValueKind::Void => Stamp::Void,
        }
    }

    /// Exact stamp of a constant.
    pub fn for_constant(constant: Constant) -> Self {
        match constant {
            Constant::Null => Self::null(),
            Constant::Object(_) => Self::object_non_null(),
            Constant::Int(v) => Self::int_constant(32, v as i64),
            Constant::Long(v) => Self::int_constant(64, v),
            Constant::Float(bits) => Stamp::Float {
                double: false,
                non_nan: !f32::from_bits(bits).is_nan(),
            },
            Constant::Double(bits) => Stamp::Float {
                double: true,
                non_nan: !f64::from_bits(bits).is_nan(),
            },
        }
    }

    /// Stack kind of values with this stamp.
    pub fn kind(&self) -> ValueKind {
        match *self {
            Stamp::Void => ValueKind::Void,
            Stamp::Int { bits, .. } if bits > 32 => ValueKind::Long,
            Stamp::Int { .. } => ValueKind::Int,
            Stamp::Float { double: true, .. } => ValueKind::Double,
            Stamp::Float { double: false, .. } => ValueKind::Float,
            Stamp::Object { .. } => ValueKind::Object,
        }
    }

    /// Width in bits of values with this stamp. Objects are word sized.
    pub fn bits(&self) -> u32 {
        match *self {
            Stamp::Void => 0,
            Stamp::Int { bits, .. } => bits,
            Stamp::Float { double, .. } => {
                if double {
                    64
                } else {
                    32
                }
            }
            Stamp::Object { .. } => 64,
        }
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        matches!(self, Stamp::Void)
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, Stamp::Int { .. })
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, Stamp::Object { .. })
    }

    /// Whether the value is known to be non-null.
    pub fn is_non_null(&self) -> bool {
        matches!(self, Stamp::Object { non_null: true, .. })
    }

    /// Whether the value is known to be null.
    pub fn is_always_null(&self) -> bool {
        matches!(self, Stamp::Object { always_null: true, .. })
    }

    /// The single integer value this stamp admits.
    pub fn as_integer_constant(&self) -> Option<i64> {
        match *self {
            Stamp::Int { lo, hi, .. } if lo == hi => Some(lo),
            _ => None,
        }
    }

    /// Whether `value` (sign-normalized to the width) fits the bounds.
    pub fn contains(&self, value: i64) -> bool {
        match *self {
            Stamp::Int { bits, lo, hi } => {
                let v = sign_normalize(bits, value);
                lo <= v && v <= hi
            }
            _ => false,
        }
    }

    /// Least upper bound: a stamp admitting every value of both.
    pub fn meet(&self, other: &Stamp) -> Stamp {
        match (*self, *other) {
            (Stamp::Void, s) | (s, Stamp::Void) => s,
            (
                Stamp::Int { bits: b1, lo: l1, hi: h1 },
                Stamp::Int { bits: b2, lo: l2, hi: h2 },
            ) => Stamp::Int {
                bits: b1.max(b2),
                lo: l1.min(l2),
                hi: h1.max(h2),
            },
            (
                Stamp::Float { double: d1, non_nan: n1 },
                Stamp::Float { double: d2, non_nan: n2 },
            ) => Stamp::Float {
                double: d1 || d2,
                non_nan: n1 && n2,
            },
            (
                Stamp::Object { non_null: n1, always_null: a1 },
                Stamp::Object { non_null: n2, always_null: a2 },
            ) => Stamp::Object {
                non_null: n1 && n2,
                always_null: a1 && a2,
            },
            // Mixed kinds only meet through raw words.
            (a, b) => Stamp::int(a.bits().max(b.bits()).max(1)),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Stamp::Void => f.write_str("void"),
            Stamp::Int { bits, lo, hi } => {
                let (min, max) = signed_range(bits);
                if lo == min && hi == max {
                    write!(f, "i{bits}")
                } else {
                    write!(f, "i{bits} [{lo} - {hi}]")
                }
            }
            Stamp::Float { double, non_nan } => {
                write!(f, "{}", if double { "f64" } else { "f32" })?;
                if non_nan {
                    f.write_str(" !NaN")?;
                }
                Ok(())
            }
            Stamp::Object { non_null, always_null } => {
                f.write_str("a")?;
                if non_null {
                    f.write_str(" !null")?;
                } else if always_null {
                    f.write_str(" null")?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Width Helpers
// =============================================================================

/// Signed bounds of a `bits`-wide integer.
pub fn signed_range(bits: u32) -> (i64, i64) {
    match bits {
        0 => (0, 0),
        b if b >= 64 => (i64::MIN, i64::MAX),
        b => (-(1i64 << (b - 1)), (1i64 << (b - 1)) - 1),
    }
}

/// Truncate `value` to `bits` and sign-extend back to 64 bits.
#[inline]
pub fn sign_normalize(bits: u32, value: i64) -> i64 {
    if bits == 0 || bits >= 64 {
        value
    } else {
        let shift = 64 - bits;
        (value << shift) >> shift
    }
}

/// Truncate `value` to `bits`, zero-extending.
#[inline]
pub fn zero_normalize(bits: u32, value: i64) -> u64 {
    if bits == 0 || bits >= 64 {
        value as u64
    } else {
        (value as u64) & ((1u64 << bits) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_normalize_wraps_int() {
        assert_eq!(sign_normalize(32, 0x8000_0000), i32::MIN as i64);
        assert_eq!(sign_normalize(8, 0xff), -1);
        assert_eq!(sign_normalize(64, -5), -5);
        assert_eq!(zero_normalize(8, -1), 0xff);
    }

    #[test]
    fn test_constant_stamps() {
        assert_eq!(Stamp::for_constant(Constant::Int(7)).as_integer_constant(), Some(7));
        assert!(Stamp::for_constant(Constant::Null).is_always_null());
        assert!(Stamp::for_constant(Constant::Object(0x10)).is_non_null());
        assert_eq!(Stamp::for_constant(Constant::Long(1)).kind(), ValueKind::Long);
    }

    #[test]
    fn test_meet_widens_bounds() {
        let a = Stamp::int_constant(32, 1);
        let b = Stamp::int_constant(32, 9);
        assert_eq!(a.meet(&b), Stamp::Int { bits: 32, lo: 1, hi: 9 });
        let o = Stamp::object_non_null().meet(&Stamp::null());
        assert!(!o.is_non_null() && !o.is_always_null());
    }

    #[test]
    fn test_sub_int_kinds_have_narrow_bounds() {
        assert!(Stamp::for_kind(ValueKind::Byte).contains(-128));
        assert!(!Stamp::for_kind(ValueKind::Byte).contains(200));
        assert!(Stamp::for_kind(ValueKind::Char).contains(65535));
    }

    #[test]
    fn test_display() {
        assert_eq!(Stamp::int(32).to_string(), "i32");
        assert_eq!(Stamp::boolean().to_string(), "i32 [0 - 1]");
        assert_eq!(Stamp::object_non_null().to_string(), "a !null");
    }
}
