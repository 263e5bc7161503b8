//! Properties of inlining chains under splicing and trimming.

use kiln_core::{MethodRef, TypeRef};
use kiln_jit::ir::NodeSourcePosition;
use proptest::prelude::*;
use std::sync::Arc;

fn method(name: &str) -> MethodRef {
    MethodRef::new(TypeRef::new("Lapp/Chain;"), name, "()V")
}

/// Frames innermost first, as `(method name, bci)`.
fn frames_strategy() -> impl Strategy<Value = Vec<(String, i32)>> {
    proptest::collection::vec(("[a-d]", 0i32..64), 1..6)
}

fn chain(frames: &[(String, i32)]) -> Arc<NodeSourcePosition> {
    let mut caller = None;
    for (name, bci) in frames.iter().rev() {
        caller = Some(NodeSourcePosition::new(caller, method(name), *bci));
    }
    caller.expect("frames are non-empty")
}

fn flatten(position: &NodeSourcePosition) -> Vec<(String, i32)> {
    position
        .frames()
        .map(|p| (p.method().name().to_string(), p.bci()))
        .collect()
}

proptest! {
    #[test]
    fn test_chain_reconstructs_frames(frames in frames_strategy()) {
        let position = chain(&frames);
        prop_assert_eq!(position.depth(), frames.len());
        prop_assert_eq!(flatten(&position), frames.clone());
        prop_assert_eq!(position.root_method(), &method(&frames[frames.len() - 1].0));
    }

    #[test]
    fn test_equal_chains_hash_equal(frames in frames_strategy()) {
        let a = chain(&frames);
        let b = chain(&frames);
        prop_assert!(!Arc::ptr_eq(&a, &b));
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_add_caller_concatenates(callee in frames_strategy(), caller in frames_strategy()) {
        let spliced = chain(&callee).add_caller(Some(chain(&caller)));
        let mut expected = callee.clone();
        expected.extend(caller.iter().cloned());
        prop_assert_eq!(spliced.depth(), callee.len() + caller.len());
        prop_assert_eq!(flatten(&spliced), expected.clone());
        prop_assert_eq!(&spliced, &chain(&expected));
        prop_assert_eq!(spliced.structural_hash(), chain(&expected).structural_hash());
    }

    #[test]
    fn test_trim_keeps_plain_chains(frames in frames_strategy()) {
        let position = chain(&frames);
        let trimmed = position.trim().unwrap();
        prop_assert!(Arc::ptr_eq(&position, &trimmed));
    }

    #[test]
    fn test_trim_drops_substitution_callers(frames in frames_strategy(), bci in 0i32..64) {
        let substitution = NodeSourcePosition::substitution(Some(chain(&frames)), method("intrinsic"));
        let position = NodeSourcePosition::new(Some(substitution), method("leaf"), bci);
        let trimmed = position.trim().unwrap();
        prop_assert_eq!(trimmed.depth(), 1);
        prop_assert_eq!(trimmed.bci(), bci);
        prop_assert!(trimmed.caller().is_none());
    }
}
