//! Inlining-aware source positions.
//!
//! A [`NodeSourcePosition`] is an immutable chain of `(method, bci)` frames,
//! innermost first, linked through `caller`. Chains are shared through
//! `Arc`; every "modification" builds new frames and leaves the old chain
//! intact, so two nodes may safely hold the same chain.
//!
//! Frames created for snippets and intrinsics carry a [`Marker`] so they can
//! be stripped again with [`NodeSourcePosition::trim`] before positions are
//! reported to the runtime.

use kiln_core::{BytecodeProvider, KilnError, KilnResult, MethodRef, Opcode};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// bci of a frame that has no bytecode position of its own.
pub const INVALID_FRAMESTATE_BCI: i32 = -6;

/// Whether `bci` is one of the synthetic (negative) frame-state bcis.
#[inline]
pub const fn is_placeholder_bci(bci: i32) -> bool {
    bci < 0
}

/// Kind of synthetic frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// A real bytecode position.
    None,
    /// Stand-in root of a graph built before its caller is known.
    Placeholder,
    /// Frame of a snippet or intrinsic substitution.
    Substitution,
}

/// Position in a guest source language, when the bytecode came from one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLanguagePosition {
    /// Source file name.
    pub file: Arc<str>,
    /// 1-based line.
    pub line: u32,
}

impl SourceLanguagePosition {
    /// `file:line`.
    pub fn to_short_string(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }
}

/// Call-site check applied when inlining splices chains together.
///
/// With `strict` off, every splice is accepted.
#[derive(Clone, Copy)]
pub struct CallerCheck<'a> {
    /// Enforce the call-site check.
    pub strict: bool,
    /// Bytecode of the caller methods.
    pub bytecode: &'a dyn BytecodeProvider,
}

impl fmt::Debug for CallerCheck<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerCheck").field("strict", &self.strict).finish()
    }
}

/// One frame of an inlining chain.
pub struct NodeSourcePosition {
    method: MethodRef,
    bci: i32,
    caller: Option<Arc<NodeSourcePosition>>,
    marker: Marker,
    language: Option<SourceLanguagePosition>,
    hash: i32,
}

impl NodeSourcePosition {
    /// Create a frame.
    pub fn new(caller: Option<Arc<Self>>, method: MethodRef, bci: i32) -> Arc<Self> {
        Self::build(None, caller, method, bci, Marker::None)
    }

    /// Create a frame with a source-language position.
    pub fn with_language(
        language: SourceLanguagePosition,
        caller: Option<Arc<Self>>,
        method: MethodRef,
        bci: i32,
    ) -> Arc<Self> {
        Self::build(Some(language), caller, method, bci, Marker::None)
    }

    /// Root frame standing in for a caller that is not known yet.
    pub fn placeholder(method: MethodRef) -> Arc<Self> {
        Self::build(None, None, method, INVALID_FRAMESTATE_BCI, Marker::Placeholder)
    }

    /// Frame for code substituted for `method` (snippets, intrinsics).
    pub fn substitution(caller: Option<Arc<Self>>, method: MethodRef) -> Arc<Self> {
        Self::build(None, caller, method, INVALID_FRAMESTATE_BCI, Marker::Substitution)
    }

    fn build(
        language: Option<SourceLanguagePosition>,
        caller: Option<Arc<Self>>,
        method: MethodRef,
        bci: i32,
        marker: Marker,
    ) -> Arc<Self> {
        let method_hash = method.structural_hash() as i32;
        let local = bci.wrapping_mul(31).wrapping_add(method_hash);
        let hash = match &caller {
            Some(caller) => caller.hash.wrapping_mul(7).wrapping_add(local),
            None => local,
        };
        Arc::new(Self {
            method,
            bci,
            caller,
            marker,
            language,
            hash,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Method of this frame.
    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// Bytecode index in [`method`](Self::method).
    #[inline]
    pub fn bci(&self) -> i32 {
        self.bci
    }

    /// Calling frame.
    #[inline]
    pub fn caller(&self) -> Option<&Arc<Self>> {
        self.caller.as_ref()
    }

    /// Marker of this frame.
    #[inline]
    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Source-language position of this frame.
    #[inline]
    pub fn source_language(&self) -> Option<&SourceLanguagePosition> {
        self.language.as_ref()
    }

    /// Whether this is a placeholder frame.
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.marker == Marker::Placeholder
    }

    /// Whether this is a substitution frame.
    #[inline]
    pub fn is_substitution(&self) -> bool {
        self.marker == Marker::Substitution
    }

    /// Precomputed structural hash.
    #[inline]
    pub fn structural_hash(&self) -> i32 {
        self.hash
    }

    /// Number of frames in the chain.
    pub fn depth(&self) -> usize {
        self.frames().count()
    }

    /// Frames from this one out to the root.
    pub fn frames(&self) -> impl Iterator<Item = &NodeSourcePosition> {
        std::iter::successors(Some(self), |pos| pos.caller.as_deref())
    }

    /// Method of the outermost frame.
    pub fn root_method(&self) -> &MethodRef {
        let mut current = self;
        while let Some(caller) = current.caller.as_deref() {
            current = caller;
        }
        &current.method
    }

    /// Check that the chain is rooted in `root`, comparing holder, name and
    /// signature.
    pub fn verify_root_method(&self, root: &MethodRef) -> KilnResult<()> {
        let current = self.root_method();
        if current == root
            || (current.same_name_and_signature(root) && current.holder() == root.holder())
        {
            Ok(())
        } else {
            Err(KilnError::internal(format!(
                "position rooted in {:?}, expected {:?}",
                current, root
            )))
        }
    }

    // =========================================================================
    // Chain Edits
    // =========================================================================

    /// Strip a marker frame. Returns `None` if this frame is a marker,
    /// otherwise this chain with every marker-headed caller cut off. Frames
    /// are shared when nothing changes.
    pub fn trim(self: &Arc<Self>) -> Option<Arc<Self>> {
        if self.marker != Marker::None {
            return None;
        }
        let trimmed = self.caller.as_ref().and_then(|caller| caller.trim());
        let unchanged = match (&trimmed, &self.caller) {
            (Some(new), Some(old)) => Arc::ptr_eq(new, old),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            Some(Arc::clone(self))
        } else {
            Some(Self::new(trimmed, self.method.clone(), self.bci))
        }
    }

    /// Append `link` as the caller of the outermost frame, without a
    /// call-site check.
    pub fn add_caller(self: &Arc<Self>, link: Option<Arc<Self>>) -> Arc<Self> {
        self.splice(link)
    }

    /// [`add_caller`](Self::add_caller) with `link` moved to call site `bci`.
    pub fn add_caller_with_bci(self: &Arc<Self>, link: &Arc<Self>, bci: i32) -> Arc<Self> {
        let relinked = Self::build(
            link.language.clone(),
            link.caller.clone(),
            link.method.clone(),
            bci,
            link.marker,
        );
        self.splice(Some(relinked))
    }

    /// Append `link` as the caller of the outermost frame, checking the
    /// call site against the caller's bytecode when `check.strict` is set.
    pub fn add_caller_checked(
        self: &Arc<Self>,
        link: Option<Arc<Self>>,
        check: &CallerCheck<'_>,
    ) -> KilnResult<Arc<Self>> {
        match &link {
            Some(caller) if check.strict => self.splice_checked(caller, check)?,
            _ => {}
        }
        Ok(self.splice(link))
    }

    fn splice_checked(self: &Arc<Self>, link: &Arc<Self>, check: &CallerCheck<'_>) -> KilnResult<()> {
        let mut current = self.as_ref();
        while let Some(caller) = current.caller.as_deref() {
            current = caller;
        }
        if current.is_placeholder() || current.is_substitution() {
            return Ok(());
        }
        verify_caller(current, link, check)
    }

    fn splice(self: &Arc<Self>, link: Option<Arc<Self>>) -> Arc<Self> {
        match &self.caller {
            None if self.is_placeholder() => {
                Self::build(self.language.clone(), link, self.method.clone(), 0, Marker::None)
            }
            None => Self::build(self.language.clone(), link, self.method.clone(), self.bci, Marker::None),
            Some(caller) => Self::new(Some(caller.splice(link)), self.method.clone(), self.bci),
        }
    }

    /// Check every caller link in the chain.
    pub fn verify(&self, check: &CallerCheck<'_>) -> KilnResult<()> {
        if !check.strict {
            return Ok(());
        }
        let mut current = self;
        while let Some(caller) = current.caller.as_deref() {
            verify_caller(current, caller, check)?;
            current = caller;
        }
        Ok(())
    }

    fn write_frame(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}({})", self.method.qualified_name(), self.bci)?;
        if let Some(language) = &self.language {
            write!(f, " source={}", language.to_short_string())?;
        }
        Ok(())
    }
}

/// Method-handle linkage and call intrinsics whose invoke bytecode never
/// names the inlined callee.
fn is_signature_polymorphic_site(current: &NodeSourcePosition, caller: &NodeSourcePosition) -> bool {
    let caller_name = caller.method.name();
    caller_name.starts_with("linkTo")
        || caller_name == "invokeBasic"
        || caller
            .method
            .holder()
            .name()
            .starts_with("Ljava/lang/invoke/LambdaForm$")
        || current.method.name() == "callInlined"
}

fn verify_caller(
    current: &NodeSourcePosition,
    caller: &NodeSourcePosition,
    check: &CallerCheck<'_>,
) -> KilnResult<()> {
    if !check.strict || is_placeholder_bci(caller.bci) {
        return Ok(());
    }
    let opcode = check.bytecode.opcode_at(&caller.method, caller.bci);
    if opcode == Some(Opcode::InvokeDynamic) || is_signature_polymorphic_site(current, caller) {
        return Ok(());
    }
    match opcode {
        None => Ok(()),
        Some(op) if !op.is_invoke() => Err(KilnError::internal(format!(
            "caller {}@{} is not an invoke while inlining {}",
            caller.method, caller.bci, current.method
        ))),
        Some(_) => match check.bytecode.invoked_method_at(&caller.method, caller.bci) {
            Some(invoked) if !invoked.same_name_and_signature(&current.method) => {
                Err(KilnError::internal(format!(
                    "expected {:?} at {}@{} but found {:?}",
                    invoked, caller.method, caller.bci, current.method
                )))
            }
            _ => Ok(()),
        },
    }
}

impl PartialEq for NodeSourcePosition {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.hash == other.hash
            && self.bci == other.bci
            && self.method == other.method
            && self.language == other.language
            && match (&self.caller, &other.caller) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
                (None, None) => true,
                _ => false,
            }
    }
}

impl Eq for NodeSourcePosition {}

impl Hash for NodeSourcePosition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for NodeSourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            frame.write_frame(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeSourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames: Vec<String> = self
            .frames()
            .map(|p| format!("{}@{}", p.method.qualified_name(), p.bci))
            .collect();
        write!(f, "[{}]", frames.join(" <- "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{NoBytecode, TypeRef};

    fn method(name: &str) -> MethodRef {
        MethodRef::new(TypeRef::new("Lapp/Main;"), name, "()V")
    }

    struct OneInvoke {
        at: i32,
        target: MethodRef,
    }

    impl BytecodeProvider for OneInvoke {
        fn opcode_at(&self, _method: &MethodRef, bci: i32) -> Option<Opcode> {
            Some(if bci == self.at {
                Opcode::InvokeStatic
            } else {
                Opcode::Other(0x60)
            })
        }

        fn invoked_method_at(&self, _method: &MethodRef, bci: i32) -> Option<MethodRef> {
            (bci == self.at).then(|| self.target.clone())
        }
    }

    #[test]
    fn test_hash_formula() {
        let m = method("a");
        let root = NodeSourcePosition::new(None, m.clone(), 4);
        let h = m.structural_hash() as i32;
        assert_eq!(root.structural_hash(), 4i32.wrapping_mul(31).wrapping_add(h));
        let inner = NodeSourcePosition::new(Some(root.clone()), m, 2);
        assert_eq!(
            inner.structural_hash(),
            root.structural_hash().wrapping_mul(7).wrapping_add(62).wrapping_add(h)
        );
    }

    #[test]
    fn test_structural_equality() {
        let a = NodeSourcePosition::new(Some(NodeSourcePosition::new(None, method("r"), 1)), method("c"), 5);
        let b = NodeSourcePosition::new(Some(NodeSourcePosition::new(None, method("r"), 1)), method("c"), 5);
        let c = NodeSourcePosition::new(Some(NodeSourcePosition::new(None, method("r"), 2)), method("c"), 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.depth(), 2);
        assert_eq!(a.root_method(), &method("r"));
    }

    #[test]
    fn test_trim_marker_head_is_none() {
        let sub = NodeSourcePosition::substitution(None, method("equals"));
        assert!(sub.trim().is_none());
        assert!(NodeSourcePosition::placeholder(method("p")).trim().is_none());
    }

    #[test]
    fn test_trim_shares_unchanged_chain() {
        let chain = NodeSourcePosition::new(Some(NodeSourcePosition::new(None, method("r"), 1)), method("c"), 5);
        let trimmed = chain.trim().unwrap();
        assert!(Arc::ptr_eq(&chain, &trimmed));
    }

    #[test]
    fn test_trim_cuts_marker_caller() {
        let sub = NodeSourcePosition::substitution(None, method("snippet"));
        let chain = NodeSourcePosition::new(Some(sub), method("c"), 5);
        let trimmed = chain.trim().unwrap();
        assert_eq!(trimmed.depth(), 1);
        assert_eq!(trimmed.bci(), 5);
    }

    #[test]
    fn test_placeholder_becomes_bci_zero() {
        let callee = NodeSourcePosition::placeholder(method("callee"));
        let link = NodeSourcePosition::new(None, method("caller"), 9);
        let spliced = callee.add_caller(Some(link.clone()));
        assert_eq!(spliced.bci(), 0);
        assert_eq!(spliced.marker(), Marker::None);
        assert_eq!(spliced.caller(), Some(&link));
    }

    #[test]
    fn test_add_caller_appends_to_outermost() {
        let callee = NodeSourcePosition::new(Some(NodeSourcePosition::new(None, method("mid"), 3)), method("leaf"), 1);
        let link = NodeSourcePosition::new(None, method("top"), 7);
        let spliced = callee.add_caller(Some(link));
        let frames: Vec<_> = spliced.frames().map(|p| (p.method().name().to_string(), p.bci())).collect();
        assert_eq!(
            frames,
            vec![("leaf".into(), 1), ("mid".into(), 3), ("top".into(), 7)]
        );
    }

    #[test]
    fn test_add_caller_with_bci_moves_call_site() {
        let callee = NodeSourcePosition::new(None, method("leaf"), 1);
        let link = NodeSourcePosition::new(None, method("top"), 7);
        let spliced = callee.add_caller_with_bci(&link, 12);
        assert_eq!(spliced.caller().map(|c| c.bci()), Some(12));
    }

    #[test]
    fn test_strict_check_rejects_wrong_callee() {
        let provider = OneInvoke {
            at: 4,
            target: method("expected"),
        };
        let check = CallerCheck {
            strict: true,
            bytecode: &provider,
        };
        let callee = NodeSourcePosition::new(None, method("other"), 0);
        let link = NodeSourcePosition::new(None, method("caller"), 4);
        assert!(callee.add_caller_checked(Some(link.clone()), &check).is_err());

        let good = NodeSourcePosition::new(None, method("expected"), 0);
        assert!(good.add_caller_checked(Some(link), &check).is_ok());

        let not_invoke = NodeSourcePosition::new(None, method("caller"), 5);
        assert!(good.add_caller_checked(Some(not_invoke), &check).is_err());
    }

    #[test]
    fn test_strict_check_exemptions() {
        let provider = OneInvoke {
            at: 4,
            target: method("expected"),
        };
        let check = CallerCheck {
            strict: true,
            bytecode: &provider,
        };
        let call_inlined = NodeSourcePosition::new(None, method("callInlined"), 0);
        let link = NodeSourcePosition::new(None, method("caller"), 4);
        assert!(call_inlined.add_caller_checked(Some(link.clone()), &check).is_ok());

        let sub = NodeSourcePosition::substitution(None, method("other"));
        assert!(sub.add_caller_checked(Some(link), &check).is_ok());

        let placeholder_site = NodeSourcePosition::new(None, method("caller"), INVALID_FRAMESTATE_BCI);
        let callee = NodeSourcePosition::new(None, method("other"), 0);
        assert!(callee.add_caller_checked(Some(placeholder_site), &check).is_ok());
    }

    #[test]
    fn test_lenient_check_accepts_anything() {
        let check = CallerCheck {
            strict: false,
            bytecode: &NoBytecode,
        };
        let callee = NodeSourcePosition::new(None, method("x"), 0);
        let link = NodeSourcePosition::new(None, method("y"), 4);
        assert!(callee.add_caller_checked(Some(link), &check).is_ok());
    }

    #[test]
    fn test_display_innermost_first() {
        let chain = NodeSourcePosition::new(Some(NodeSourcePosition::new(None, method("outer"), 2)), method("inner"), 8);
        assert_eq!(chain.to_string(), "at app.Main.inner(8)\nat app.Main.outer(2)");
    }
}
