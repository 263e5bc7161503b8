//! Foreign call descriptors.

use kiln_core::ValueKind;
use smallvec::SmallVec;
use std::fmt;

/// Linkage of a call from compiled code into the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignCallDescriptor {
    name: String,
    params: SmallVec<[ValueKind; 4]>,
    result: ValueKind,
    prepend_thread: bool,
    reexecutable: bool,
}

impl ForeignCallDescriptor {
    pub fn new(name: impl Into<String>, params: &[ValueKind], result: ValueKind) -> Self {
        Self {
            name: name.into(),
            params: SmallVec::from_slice(params),
            result,
            prepend_thread: false,
            reexecutable: false,
        }
    }

    /// The runtime entry takes the current thread as a hidden first
    /// argument.
    pub fn with_thread(mut self) -> Self {
        self.prepend_thread = true;
        self
    }

    /// The call may be re-executed after a deoptimization.
    pub fn reexecutable(mut self) -> Self {
        self.reexecutable = true;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    #[inline]
    pub fn result(&self) -> ValueKind {
        self.result
    }

    #[inline]
    pub fn prepends_thread(&self) -> bool {
        self.prepend_thread
    }

    #[inline]
    pub fn is_reexecutable(&self) -> bool {
        self.reexecutable
    }

    /// Descriptor of the C entry point a stub for `self` calls: the thread
    /// is an explicit argument and the name carries a `:C` suffix.
    pub fn c_target(&self) -> Self {
        let mut params: SmallVec<[ValueKind; 4]> = SmallVec::new();
        if self.prepend_thread {
            params.push(ValueKind::Long);
        }
        params.extend_from_slice(&self.params);
        Self {
            name: format!("{}:C", self.name),
            params,
            result: self.result,
            prepend_thread: false,
            reexecutable: self.reexecutable,
        }
    }
}

impl fmt::Display for ForeignCallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p:?}")?;
        }
        write!(f, ") -> {:?}", self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_target_prepends_thread() {
        let d = ForeignCallDescriptor::new("new_instance", &[ValueKind::Object], ValueKind::Object).with_thread();
        let c = d.c_target();
        assert_eq!(c.name(), "new_instance:C");
        assert_eq!(c.params(), &[ValueKind::Long, ValueKind::Object]);
        assert!(!c.prepends_thread());
        assert_eq!(c.result(), ValueKind::Object);
    }

    #[test]
    fn test_display() {
        let d = ForeignCallDescriptor::new("g1_card_enqueue", &[ValueKind::Long], ValueKind::Void);
        assert_eq!(d.to_string(), "g1_card_enqueue(Long) -> Void");
    }
}
