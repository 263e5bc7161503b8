//! Foreign call stubs.
//!
//! A stub is the trampoline compiled code calls instead of a runtime entry
//! point directly. Its graph always has the same shape:
//!
//! ```text
//! Start
//!   -> ReadRegister(thread)
//!   -> ForeignCall(name:C, [thread,] params...)
//!   -> handle_pending_exception(thread, is_object_result)
//!   -> get_and_clear_object_result(thread)     object results only
//!   -> verify_object(result)                   object results only
//!   -> Return(result)
//! ```
//!
//! The three helpers are built as `Invoke`s and then replaced by their
//! snippet bodies, so the finished graph contains no calls other than the
//! foreign call itself (and `verify_oop` when enabled).

use super::descriptor::ForeignCallDescriptor;
use crate::ir::builder::GraphBuilder;
use crate::ir::graph::Graph;
use crate::ir::kinds::{CompareOp, DeoptInfo, LocationIdentity, MemoryAccess, NodeKind, RegisterRole};
use crate::ir::node::NodeId;
use crate::ir::stamp::Stamp;
use crate::lowering::snippet::{SnippetArguments, SnippetCache, SnippetParameter, SnippetTemplate};
use kiln_core::{
    CompilerOptions, DeoptAction, DeoptReason, KilnError, KilnResult, MethodRef, TypeRef, ValueKind,
};
use kiln_gc::ThreadLayout;
use std::sync::Arc;

/// Class declaring the stub helper methods.
pub const STUB_HELPERS_CLASS: &str = "Lkiln/stubs/StubHelpers;";

const HANDLE_PENDING_EXCEPTION: &str = "handle_pending_exception";
const GET_AND_CLEAR_OBJECT_RESULT: &str = "get_and_clear_object_result";
const VERIFY_OBJECT: &str = "verify_object";

/// Runtime routine checking an object reference.
pub const VERIFY_OOP: &str = "verify_oop";

/// Deoptimization taken when the runtime call left an exception pending.
pub const PENDING_EXCEPTION_DEOPT: DeoptInfo =
    DeoptInfo::new(DeoptReason::RuntimeConstraint, DeoptAction::InvalidateReprofile);

/// Deoptimization is unlikely in a stub.
const PENDING_EXCEPTION_PROBABILITY: f64 = 0.01;

fn helper(name: &str, signature: &str) -> MethodRef {
    MethodRef::new(TypeRef::new(STUB_HELPERS_CLASS), name, signature)
}

fn verify_oop_descriptor() -> Arc<ForeignCallDescriptor> {
    Arc::new(ForeignCallDescriptor::new(VERIFY_OOP, &[ValueKind::Object], ValueKind::Object))
}

// =============================================================================
// Helpers
// =============================================================================

/// Snippet bodies of the stub helper methods for one thread layout.
#[derive(Debug)]
pub struct StubHelpers {
    layout: ThreadLayout,
    verify_oops: bool,
    cache: SnippetCache,
}

impl StubHelpers {
    pub fn new(layout: ThreadLayout, verify_oops: bool) -> Self {
        Self {
            layout,
            verify_oops,
            cache: SnippetCache::new(),
        }
    }

    #[inline]
    pub fn layout(&self) -> &ThreadLayout {
        &self.layout
    }

    #[inline]
    pub fn cache(&self) -> &SnippetCache {
        &self.cache
    }

    fn template(&self, name: &str) -> KilnResult<Arc<SnippetTemplate>> {
        let layout = self.layout.clone();
        match name {
            HANDLE_PENDING_EXCEPTION => self
                .cache
                .get_or_build(HANDLE_PENDING_EXCEPTION, || build_handle_pending_exception(&layout)),
            GET_AND_CLEAR_OBJECT_RESULT => self
                .cache
                .get_or_build(GET_AND_CLEAR_OBJECT_RESULT, || build_get_and_clear_object_result(&layout)),
            VERIFY_OBJECT => {
                let verify = self.verify_oops;
                self.cache.get_or_build(VERIFY_OBJECT, || build_verify_object(verify))
            }
            other => Err(KilnError::internal(format!("no stub helper named {other}"))),
        }
    }

    /// Replace one helper invoke with its body. Returns false for invokes
    /// of anything else.
    pub fn inline(&self, graph: &mut Graph, invoke: NodeId) -> KilnResult<bool> {
        let NodeKind::Invoke { target } = graph.kind(invoke) else {
            return Ok(false);
        };
        if target.holder().name() != STUB_HELPERS_CLASS {
            return Ok(false);
        }
        let target = target.clone();
        let template = self.template(target.name())?;
        let node = graph.node(invoke);
        let mut args = SnippetArguments::new();
        match (target.name(), node.input(0), node.input(1)) {
            (HANDLE_PENDING_EXCEPTION, Some(thread), Some(flag)) => {
                let is_object_result = graph.as_constant(flag).ok_or_else(|| {
                    KilnError::internal_at(invoke.index(), "is_object_result must be a constant")
                })?;
                args.bind_value("thread", thread)
                    .bind_constant("is_object_result", is_object_result);
            }
            (GET_AND_CLEAR_OBJECT_RESULT, Some(thread), None) => {
                args.bind_value("thread", thread);
            }
            (VERIFY_OBJECT, Some(object), None) => {
                args.bind_value("object", object);
            }
            _ => {
                return Err(KilnError::internal_at(
                    invoke.index(),
                    format!("bad arguments for {target}"),
                ))
            }
        }
        template.instantiate(graph, invoke, &args)?;
        log::trace!("inlined {} at {:?}", target, invoke);
        Ok(true)
    }
}

impl Default for StubHelpers {
    fn default() -> Self {
        Self::new(ThreadLayout::default(), false)
    }
}

fn thread_field(b: &mut GraphBuilder<'_>, thread: NodeId, offset: i32) -> NodeId {
    let offset = b.long(i64::from(offset));
    b.add(NodeKind::OffsetAddress, &[thread, offset])
}

/// `object_result` is read, cleared and returned.
fn get_and_clear(b: &mut GraphBuilder<'_>, layout: &ThreadLayout, thread: NodeId) -> KilnResult<NodeId> {
    let address = thread_field(b, thread, layout.object_result_offset);
    let result = b.read(LocationIdentity::THREAD, MemoryAccess::OBJECT, address)?;
    let null = b.graph().null();
    b.write(LocationIdentity::THREAD, MemoryAccess::OBJECT, address, null)?;
    Ok(result)
}

/// ```text
/// if thread.pending_exception != null {
///     if is_object_result { thread.object_result = null }
///     deoptimize(InvalidateReprofile, RuntimeConstraint)
/// }
/// ```
fn build_handle_pending_exception(layout: &ThreadLayout) -> KilnResult<SnippetTemplate> {
    let params = [
        SnippetParameter::value("thread", Stamp::word()),
        SnippetParameter::constant("is_object_result", Stamp::boolean()),
    ];
    SnippetTemplate::build(HANDLE_PENDING_EXCEPTION, &params, |b, p| {
        let (thread, is_object_result) = (p[0], p[1]);
        let address = thread_field(b, thread, layout.pending_exception_offset);
        let exception = b.read(LocationIdentity::THREAD, MemoryAccess::OBJECT, address)?;
        let clear = b.add(NodeKind::IsNull, &[exception]);
        let mut pending = b.begin_if(clear, 1.0 - PENDING_EXCEPTION_PROBABILITY)?;
        b.else_branch(&mut pending)?;

        let zero = b.int(0);
        let primitive = b.add(
            NodeKind::Compare(CompareOp::IntegerEquals),
            &[is_object_result, zero],
        );
        let mut object = b.begin_if(primitive, 0.5)?;
        b.else_branch(&mut object)?;
        get_and_clear(b, layout, thread)?;
        b.end_if(object)?;
        b.append_deopt(PENDING_EXCEPTION_DEOPT)?;

        b.end_if(pending)?;
        b.append_return(None)?;
        Ok(())
    })
}

fn build_get_and_clear_object_result(layout: &ThreadLayout) -> KilnResult<SnippetTemplate> {
    let params = [SnippetParameter::value("thread", Stamp::word())];
    SnippetTemplate::build(GET_AND_CLEAR_OBJECT_RESULT, &params, |b, p| {
        let result = get_and_clear(b, layout, p[0])?;
        b.append_return(Some(result))?;
        Ok(())
    })
}

fn build_verify_object(verify: bool) -> KilnResult<SnippetTemplate> {
    let params = [SnippetParameter::value("object", Stamp::object())];
    SnippetTemplate::build(VERIFY_OBJECT, &params, |b, p| {
        let result = if verify {
            b.append_with_stamp(
                NodeKind::ForeignCall {
                    descriptor: verify_oop_descriptor(),
                },
                &[p[0]],
                Stamp::object(),
            )?
        } else {
            p[0]
        };
        b.append_return(Some(result))?;
        Ok(())
    })
}

// =============================================================================
// Stub
// =============================================================================

/// Builds the graph of the stub for one foreign call descriptor.
#[derive(Debug, Clone)]
pub struct ForeignCallStub {
    descriptor: Arc<ForeignCallDescriptor>,
    target: Arc<ForeignCallDescriptor>,
    options: CompilerOptions,
    helpers: Arc<StubHelpers>,
}

impl ForeignCallStub {
    /// Stub for `descriptor` against the default thread layout.
    pub fn new(descriptor: Arc<ForeignCallDescriptor>, options: CompilerOptions) -> Self {
        let helpers = Arc::new(StubHelpers::new(ThreadLayout::default(), options.verify_oops));
        Self::with_helpers(descriptor, options, helpers)
    }

    /// Stub sharing already built helper snippets.
    pub fn with_helpers(
        descriptor: Arc<ForeignCallDescriptor>,
        options: CompilerOptions,
        helpers: Arc<StubHelpers>,
    ) -> Self {
        let target = Arc::new(descriptor.c_target());
        Self {
            descriptor,
            target,
            options,
            helpers,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &Arc<ForeignCallDescriptor> {
        &self.descriptor
    }

    /// The C entry point the stub calls.
    #[inline]
    pub fn target(&self) -> &Arc<ForeignCallDescriptor> {
        &self.target
    }

    fn is_object_result(&self) -> bool {
        self.descriptor.result() == ValueKind::Object
    }

    /// Build the stub graph with every helper invoke inlined.
    pub fn build_graph(&self) -> KilnResult<Graph> {
        let mut graph = Graph::new();
        let invokes = self.build_skeleton(&mut graph)?;
        for invoke in invokes {
            self.helpers.inline(&mut graph, invoke)?;
        }
        if let Some((id, node)) = graph.iter().find(|(_, n)| matches!(n.kind, NodeKind::Invoke { .. })) {
            return Err(KilnError::internal_at(
                id.index(),
                format!("stub {} still calls {}", self.descriptor.name(), node.kind.name()),
            ));
        }
        if self.options.verify_graphs {
            crate::opt::verify::verify_integrity(&graph)?;
        }
        log::debug!("stub {}: {} nodes", self.descriptor, graph.live_count());
        Ok(graph)
    }

    /// The graph before inlining, and its helper invokes in order.
    fn build_skeleton(&self, graph: &mut Graph) -> KilnResult<Vec<NodeId>> {
        let mut b = GraphBuilder::new(graph);
        let params: Vec<NodeId> = self
            .descriptor
            .params()
            .iter()
            .enumerate()
            .map(|(i, &kind)| b.parameter(i as u32, Stamp::for_kind(kind)))
            .collect();
        let thread = b.append_with_stamp(NodeKind::ReadRegister(RegisterRole::Thread), &[], Stamp::word())?;

        let mut args = Vec::with_capacity(params.len() + 1);
        if self.descriptor.prepends_thread() {
            args.push(thread);
        }
        args.extend_from_slice(&params);
        let call = b.append_with_stamp(
            NodeKind::ForeignCall {
                descriptor: Arc::clone(&self.target),
            },
            &args,
            Stamp::for_kind(self.target.result()),
        )?;

        let mut invokes = Vec::with_capacity(3);
        let object_result = self.is_object_result();
        let flag = b.int(i32::from(object_result));
        invokes.push(b.append_with_stamp(
            NodeKind::Invoke {
                target: helper(HANDLE_PENDING_EXCEPTION, "(JZ)V"),
            },
            &[thread, flag],
            Stamp::Void,
        )?);

        let result = if object_result {
            let fetched = b.append_with_stamp(
                NodeKind::Invoke {
                    target: helper(GET_AND_CLEAR_OBJECT_RESULT, "(J)Ljava/lang/Object;"),
                },
                &[thread],
                Stamp::object(),
            )?;
            let verified = b.append_with_stamp(
                NodeKind::Invoke {
                    target: helper(VERIFY_OBJECT, "(Ljava/lang/Object;)Ljava/lang/Object;"),
                },
                &[fetched],
                Stamp::object(),
            )?;
            invokes.push(fetched);
            invokes.push(verified);
            Some(verified)
        } else if self.descriptor.result() == ValueKind::Void {
            None
        } else {
            Some(call)
        };
        b.append_return(result)?;
        Ok(invokes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::{EvalOutcome, Evaluator};
    use kiln_core::{AccessSize, RawMemory, RuntimeCalls};
    use rustc_hash::FxHashMap;

    const THREAD: u64 = 0x1000;

    /// Word memory with a scripted runtime.
    #[derive(Default)]
    struct Runtime {
        words: FxHashMap<u64, u64>,
        calls: Vec<(String, Vec<u64>)>,
        /// (pending exception, object result) left behind by the next call.
        outcome: (u64, u64),
        returns: u64,
    }

    impl RawMemory for Runtime {
        fn read(&self, address: u64, size: AccessSize) -> u64 {
            self.words.get(&address).copied().unwrap_or(0) & size.mask()
        }
        fn write(&mut self, address: u64, size: AccessSize, value: u64) {
            self.words.insert(address, value & size.mask());
        }
    }

    impl RuntimeCalls for Runtime {
        fn call(&mut self, symbol: &str, args: &[u64]) -> KilnResult<u64> {
            self.calls.push((symbol.to_owned(), args.to_vec()));
            if symbol == VERIFY_OOP {
                return Ok(args[0]);
            }
            let layout = ThreadLayout::default();
            let (exception, object) = self.outcome;
            self.words.insert(THREAD + layout.pending_exception_offset as u64, exception);
            self.words.insert(THREAD + layout.object_result_offset as u64, object);
            Ok(self.returns)
        }
    }

    fn run(graph: &Graph, args: &[u64], runtime: &mut Runtime) -> EvalOutcome {
        Evaluator::new(graph).unwrap().with_thread(THREAD).run(args, runtime).unwrap()
    }

    fn object_result_slot() -> u64 {
        THREAD + ThreadLayout::default().object_result_offset as u64
    }

    #[test]
    fn test_graph_shape() {
        let d = ForeignCallDescriptor::new("new_array", &[ValueKind::Object, ValueKind::Int], ValueKind::Object).with_thread();
        let graph = ForeignCallStub::new(Arc::new(d), CompilerOptions::default())
            .build_graph()
            .unwrap();
        assert!(!graph.iter().any(|(_, n)| matches!(n.kind, NodeKind::Invoke { .. })));
        let calls: Vec<_> = graph
            .iter()
            .filter_map(|(_, n)| match &n.kind {
                NodeKind::ForeignCall { descriptor } => Some((descriptor.name().to_owned(), n.inputs().len())),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec![("new_array:C".to_owned(), 3)]);
        assert_eq!(
            graph.iter().filter(|(_, n)| matches!(n.kind, NodeKind::Deoptimize(_))).count(),
            1
        );
        assert_eq!(graph.iter().filter(|(_, n)| matches!(n.kind, NodeKind::Parameter(_))).count(), 2);
    }

    #[test]
    fn test_object_result_is_fetched_and_cleared() {
        let d = ForeignCallDescriptor::new("new_instance", &[ValueKind::Object], ValueKind::Object).with_thread();
        let graph = ForeignCallStub::new(Arc::new(d), CompilerOptions::default())
            .build_graph()
            .unwrap();
        let mut rt = Runtime {
            outcome: (0, 0xBEEF0),
            ..Default::default()
        };
        assert_eq!(run(&graph, &[0x7000], &mut rt), EvalOutcome::Returned(Some(0xBEEF0)));
        assert_eq!(rt.calls, vec![("new_instance:C".to_owned(), vec![THREAD, 0x7000])]);
        assert_eq!(rt.read(object_result_slot(), AccessSize::Quad), 0);
    }

    #[test]
    fn test_pending_exception_deoptimizes() {
        let d = ForeignCallDescriptor::new("new_instance", &[ValueKind::Object], ValueKind::Object).with_thread();
        let graph = ForeignCallStub::new(Arc::new(d), CompilerOptions::default())
            .build_graph()
            .unwrap();
        let mut rt = Runtime {
            outcome: (0xE000, 0xBEEF0),
            ..Default::default()
        };
        assert_eq!(run(&graph, &[0x7000], &mut rt), EvalOutcome::Deoptimized(PENDING_EXCEPTION_DEOPT));
        assert_eq!(rt.read(object_result_slot(), AccessSize::Quad), 0);
    }

    #[test]
    fn test_primitive_result_passes_through() {
        let d = ForeignCallDescriptor::new("identity_hash", &[ValueKind::Object], ValueKind::Int);
        let graph = ForeignCallStub::new(Arc::new(d), CompilerOptions::default())
            .build_graph()
            .unwrap();
        let mut rt = Runtime {
            returns: 42,
            outcome: (0, 0x5555),
            ..Default::default()
        };
        assert_eq!(run(&graph, &[0x7000], &mut rt), EvalOutcome::Returned(Some(42)));
        assert_eq!(rt.calls[0].1, vec![0x7000]);
        // Only object stubs touch the object result.
        assert_eq!(rt.read(object_result_slot(), AccessSize::Quad), 0x5555);

        rt.outcome = (0xE000, 0x5555);
        assert!(run(&graph, &[0x7000], &mut rt).is_deopt());
        assert_eq!(rt.read(object_result_slot(), AccessSize::Quad), 0x5555);
    }

    #[test]
    fn test_void_stub_returns_nothing() {
        let d = ForeignCallDescriptor::new("log_printf", &[ValueKind::Long, ValueKind::Long], ValueKind::Void).with_thread();
        let graph = ForeignCallStub::new(Arc::new(d), CompilerOptions::default())
            .build_graph()
            .unwrap();
        let mut rt = Runtime::default();
        assert_eq!(run(&graph, &[1, 2], &mut rt), EvalOutcome::Returned(None));
        assert_eq!(rt.calls[0].1, vec![THREAD, 1, 2]);
    }

    #[test]
    fn test_verify_oops_calls_runtime() {
        let d = ForeignCallDescriptor::new("new_instance", &[ValueKind::Object], ValueKind::Object).with_thread();
        let options = CompilerOptions {
            verify_oops: true,
            ..Default::default()
        };
        let graph = ForeignCallStub::new(Arc::new(d), options).build_graph().unwrap();
        let mut rt = Runtime {
            outcome: (0, 0xBEEF0),
            ..Default::default()
        };
        assert_eq!(run(&graph, &[0x7000], &mut rt), EvalOutcome::Returned(Some(0xBEEF0)));
        assert_eq!(rt.calls.len(), 2);
        assert_eq!(rt.calls[1], (VERIFY_OOP.to_owned(), vec![0xBEEF0]));
    }

    #[test]
    fn test_unknown_helper_is_internal_error() {
        let helpers = StubHelpers::default();
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let invoke = b
            .append_with_stamp(NodeKind::Invoke { target: helper("resolve", "()V") }, &[], Stamp::Void)
            .unwrap();
        b.append_return(None).unwrap();
        let err = helpers.inline(&mut graph, invoke).unwrap_err();
        assert!(err.is_internal());
    }
}
