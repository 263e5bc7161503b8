//! Runtime call stubs.
//!
//! - [`descriptor`]: linkage of a call into the runtime
//! - [`foreign_call`]: the stub graph for one descriptor
//!
//! [`StubCache`] builds each stub graph once per descriptor name and shares
//! it between compilations.

pub mod descriptor;
pub mod foreign_call;

pub use descriptor::ForeignCallDescriptor;
pub use foreign_call::{ForeignCallStub, StubHelpers, PENDING_EXCEPTION_DEOPT, STUB_HELPERS_CLASS, VERIFY_OOP};

use crate::ir::graph::Graph;
use dashmap::DashMap;
use kiln_core::{CompilerOptions, KilnError, KilnResult};
use kiln_gc::ThreadLayout;
use std::sync::Arc;

/// Stub graphs keyed by descriptor name.
///
/// Graphs are built outside the map; when two compilations race on the same
/// descriptor the first insert wins and the other graph is dropped.
#[derive(Debug)]
pub struct StubCache {
    options: CompilerOptions,
    helpers: Arc<StubHelpers>,
    stubs: DashMap<String, Arc<Graph>>,
}

impl StubCache {
    pub fn new(options: CompilerOptions, layout: ThreadLayout) -> Self {
        let helpers = Arc::new(StubHelpers::new(layout, options.verify_oops));
        Self {
            options,
            helpers,
            stubs: DashMap::new(),
        }
    }

    /// The stub graph for `descriptor`, building it on first use.
    pub fn get_or_build(&self, descriptor: &Arc<ForeignCallDescriptor>) -> KilnResult<Arc<Graph>> {
        if let Some(graph) = self.stubs.get(descriptor.name()) {
            return Ok(Arc::clone(graph.value()));
        }
        let stub = ForeignCallStub::with_helpers(
            Arc::clone(descriptor),
            self.options.clone(),
            Arc::clone(&self.helpers),
        );
        let built = Arc::new(stub.build_graph()?);
        let graph = self
            .stubs
            .entry(descriptor.name().to_owned())
            .or_insert(built);
        Ok(Arc::clone(graph.value()))
    }

    /// Register a stub graph built elsewhere.
    pub fn insert(&self, name: &str, graph: Graph) -> KilnResult<()> {
        if self.stubs.contains_key(name) {
            return Err(KilnError::internal(format!("stub {name} already built")));
        }
        self.stubs.insert(name.to_owned(), Arc::new(graph));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Graph>> {
        self.stubs.get(name).map(|g| Arc::clone(g.value()))
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

impl Default for StubCache {
    fn default() -> Self {
        Self::new(CompilerOptions::default(), ThreadLayout::default())
    }
}
