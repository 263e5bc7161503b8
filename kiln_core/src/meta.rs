//! Read-only view of the metadata the front end supplies.
//!
//! The backend never owns method or type descriptors. It holds cheap
//! reference-counted handles whose equality is structural (holder, name,
//! signature), so two handles for the same method compare equal even when
//! they were resolved separately.

use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// =============================================================================
// Value Kinds
// =============================================================================

/// Primitive kind of a value as seen by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueKind {
    Boolean = 0,
    Byte = 1,
    Short = 2,
    Char = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    Object = 8,
    Void = 9,
}

impl ValueKind {
    /// Size in bytes of an array element of this kind.
    pub const fn byte_size(self) -> u32 {
        match self {
            ValueKind::Boolean | ValueKind::Byte => 1,
            ValueKind::Short | ValueKind::Char => 2,
            ValueKind::Int | ValueKind::Float => 4,
            ValueKind::Long | ValueKind::Double => 8,
            ValueKind::Object => 8,
            ValueKind::Void => 0,
        }
    }

    /// log2 of [`Self::byte_size`]. Void maps to 0.
    pub const fn log2_size(self) -> u32 {
        match self.byte_size() {
            0 | 1 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        }
    }

    /// Whether values of this kind live in floating-point registers.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, ValueKind::Float | ValueKind::Double)
    }

    /// Whether this is an integral kind (including boolean and char).
    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            ValueKind::Boolean
                | ValueKind::Byte
                | ValueKind::Short
                | ValueKind::Char
                | ValueKind::Int
                | ValueKind::Long
        )
    }

    /// Whether this is an object reference.
    #[inline]
    pub const fn is_object(self) -> bool {
        matches!(self, ValueKind::Object)
    }

    /// Descriptor character.
    pub const fn type_char(self) -> char {
        match self {
            ValueKind::Boolean => 'Z',
            ValueKind::Byte => 'B',
            ValueKind::Short => 'S',
            ValueKind::Char => 'C',
            ValueKind::Int => 'I',
            ValueKind::Long => 'J',
            ValueKind::Float => 'F',
            ValueKind::Double => 'D',
            ValueKind::Object => 'L',
            ValueKind::Void => 'V',
        }
    }

    /// Kind used once the value sits in a register: sub-int kinds widen to Int.
    pub const fn stack_kind(self) -> ValueKind {
        match self {
            ValueKind::Boolean | ValueKind::Byte | ValueKind::Short | ValueKind::Char => {
                ValueKind::Int
            }
            other => other,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Byte => "byte",
            ValueKind::Short => "short",
            ValueKind::Char => "char",
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::Float => "float",
            ValueKind::Double => "double",
            ValueKind::Object => "Object",
            ValueKind::Void => "void",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Types
// =============================================================================

/// Handle to a resolved type, identified by its internal name
/// (`Ljava/lang/String;` style).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(Arc<str>);

impl TypeRef {
    /// Create a type handle from its internal name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        TypeRef(name.into())
    }

    /// Internal name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Human-readable name: `Ljava/lang/String;` becomes `java.lang.String`.
    pub fn java_name(&self) -> String {
        let raw = self.0.as_ref();
        let trimmed = raw
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .unwrap_or(raw);
        trimmed.replace('/', ".")
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Methods
// =============================================================================

#[derive(PartialEq, Eq, Hash)]
struct MethodInfo {
    holder: TypeRef,
    name: Arc<str>,
    signature: Arc<str>,
}

/// Handle to a resolved method.
///
/// Equality and hashing cover holder, name and signature. The hash is
/// computed once at construction.
#[derive(Clone)]
pub struct MethodRef {
    info: Arc<MethodInfo>,
    hash: u32,
}

impl MethodRef {
    /// Create a method handle.
    pub fn new(holder: TypeRef, name: impl Into<Arc<str>>, signature: impl Into<Arc<str>>) -> Self {
        let info = MethodInfo {
            holder,
            name: name.into(),
            signature: signature.into(),
        };
        let mut hasher = FxHasher::default();
        info.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        MethodRef {
            info: Arc::new(info),
            hash,
        }
    }

    /// Declaring type.
    #[inline]
    pub fn holder(&self) -> &TypeRef {
        &self.info.holder
    }

    /// Simple name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Method descriptor, e.g. `([B[B)Z`.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.info.signature
    }

    /// Precomputed structural hash.
    #[inline]
    pub fn structural_hash(&self) -> u32 {
        self.hash
    }

    /// Whether name and signature both match `other`.
    pub fn same_name_and_signature(&self, other: &MethodRef) -> bool {
        self.name() == other.name() && self.signature() == other.signature()
    }

    /// `Holder.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.holder().java_name(), self.name())
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && (Arc::ptr_eq(&self.info, &other.info) || self.info == other.info)
    }
}

impl Eq for MethodRef {}

impl Hash for MethodRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.qualified_name(), self.signature())
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

// =============================================================================
// Bytecode Access
// =============================================================================

/// The few opcodes the backend inspects when validating call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    InvokeVirtual,
    InvokeSpecial,
    InvokeStatic,
    InvokeInterface,
    InvokeDynamic,
    /// Any non-invoke bytecode, by raw value.
    Other(u8),
}

impl Opcode {
    /// Whether this opcode performs a call.
    #[inline]
    pub const fn is_invoke(self) -> bool {
        !matches!(self, Opcode::Other(_))
    }
}

/// Read access to method bytecode.
pub trait BytecodeProvider: Send + Sync {
    /// Opcode at `bci`, or `None` if the bytecode is not available.
    fn opcode_at(&self, method: &MethodRef, bci: i32) -> Option<Opcode>;

    /// Method referenced by the invoke at `bci`, if that bytecode is an invoke.
    fn invoked_method_at(&self, method: &MethodRef, bci: i32) -> Option<MethodRef>;
}

/// Provider that knows nothing; call-site checks pass vacuously.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBytecode;

impl BytecodeProvider for NoBytecode {
    fn opcode_at(&self, _method: &MethodRef, _bci: i32) -> Option<Opcode> {
        None
    }

    fn invoked_method_at(&self, _method: &MethodRef, _bci: i32) -> Option<MethodRef> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_equals() -> MethodRef {
        MethodRef::new(
            TypeRef::new("Ljava/lang/String;"),
            "equals",
            "(Ljava/lang/Object;)Z",
        )
    }

    #[test]
    fn test_method_structural_equality() {
        let a = string_equals();
        let b = string_equals();
        assert_eq!(a, b);
        assert_eq!(a.structural_hash(), b.structural_hash());
        assert_eq!(a.qualified_name(), "java.lang.String.equals");
    }

    #[test]
    fn test_method_inequality() {
        let a = string_equals();
        let b = MethodRef::new(TypeRef::new("Ljava/lang/String;"), "hashCode", "()I");
        assert_ne!(a, b);
        assert!(!a.same_name_and_signature(&b));
    }

    #[test]
    fn test_kind_sizes() {
        assert_eq!(ValueKind::Char.byte_size(), 2);
        assert_eq!(ValueKind::Double.log2_size(), 3);
        assert_eq!(ValueKind::Byte.stack_kind(), ValueKind::Int);
        assert!(ValueKind::Float.is_float());
    }

    #[test]
    fn test_opcode_is_invoke() {
        assert!(Opcode::InvokeDynamic.is_invoke());
        assert!(!Opcode::Other(0x60).is_invoke());
    }
}
