//! Snippet templates.
//!
//! A snippet is a small graph written once with [`GraphBuilder`] and
//! stamped into other graphs in place of a single fixed node. Instantiation
//! works in three phases:
//!
//! 1. **Bind**: every declared parameter gets either a value node of the
//!    target graph or a compile-time constant.
//! 2. **Copy**: template nodes are allocated in the target first and wired
//!    afterwards, so loop phis can refer forward.
//! 3. **Splice**: the copied control path replaces the replacee, its usages
//!    move to the template's return value, and a local canonicalization
//!    folds branches that constant bindings decided.

use crate::ir::builder::GraphBuilder;
use crate::ir::graph::Graph;
use crate::ir::kinds::NodeKind;
use crate::ir::node::{InputList, Node, NodeFlags, NodeId};
use crate::ir::source_position::NodeSourcePosition;
use crate::ir::stamp::Stamp;
use crate::opt::canonicalize::Canonicalizer;
use kiln_core::{Constant, KilnError, KilnResult};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

// =============================================================================
// Parameters and Arguments
// =============================================================================

/// How a snippet parameter is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// A node of the target graph.
    Value,
    /// A constant known at instantiation.
    Constant,
}

/// A declared snippet parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnippetParameter {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub stamp: Stamp,
}

impl SnippetParameter {
    pub const fn value(name: &'static str, stamp: Stamp) -> Self {
        Self {
            name,
            kind: ParameterKind::Value,
            stamp,
        }
    }

    pub const fn constant(name: &'static str, stamp: Stamp) -> Self {
        Self {
            name,
            kind: ParameterKind::Constant,
            stamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Binding {
    Value(NodeId),
    Constant(Constant),
}

/// Arguments for one instantiation.
#[derive(Debug, Clone, Default)]
pub struct SnippetArguments {
    bindings: Vec<(&'static str, Binding)>,
}

impl SnippetArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a `Value` parameter to a node of the target graph.
    pub fn bind_value(&mut self, name: &'static str, node: NodeId) -> &mut Self {
        self.bindings.push((name, Binding::Value(node)));
        self
    }

    /// Bind a `Constant` parameter.
    pub fn bind_constant(&mut self, name: &'static str, value: Constant) -> &mut Self {
        self.bindings.push((name, Binding::Constant(value)));
        self
    }

    fn get(&self, name: &str) -> Option<Binding> {
        self.bindings.iter().find(|(n, _)| *n == name).map(|&(_, b)| b)
    }
}

// =============================================================================
// Template
// =============================================================================

/// An immutable snippet body.
#[derive(Debug)]
pub struct SnippetTemplate {
    name: &'static str,
    parameters: Vec<SnippetParameter>,
    graph: Graph,
    /// The single `Return` of the body.
    ret: NodeId,
}

impl SnippetTemplate {
    /// Build a template. `body` receives the parameter nodes in declaration
    /// order and must end the control path with exactly one `Return`.
    pub fn build<F>(name: &'static str, parameters: &[SnippetParameter], body: F) -> KilnResult<Self>
    where
        F: FnOnce(&mut GraphBuilder<'_>, &[NodeId]) -> KilnResult<()>,
    {
        let mut graph = Graph::new();
        {
            let mut builder = GraphBuilder::new(&mut graph);
            let params: Vec<NodeId> = parameters
                .iter()
                .enumerate()
                .map(|(i, p)| builder.parameter(i as u32, p.stamp))
                .collect();
            body(&mut builder, &params)?;
        }
        let returns: Vec<NodeId> = graph
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Return))
            .map(|(id, _)| id)
            .collect();
        let [ret] = returns[..] else {
            return Err(KilnError::snippet(
                name,
                format!("expected one Return, found {}", returns.len()),
            ));
        };
        let mut names: Vec<&str> = parameters.iter().map(|p| p.name).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(KilnError::snippet(name, "duplicate parameter name"));
        }
        log::debug!("snippet {}: {} nodes", name, graph.live_count());
        Ok(Self {
            name,
            parameters: parameters.to_vec(),
            graph,
            ret,
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn parameters(&self) -> &[SnippetParameter] {
        &self.parameters
    }

    /// The template body.
    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn check_arguments(&self, args: &SnippetArguments) -> KilnResult<Vec<Binding>> {
        for (name, _) in &args.bindings {
            if !self.parameters.iter().any(|p| p.name == *name) {
                return Err(KilnError::snippet(self.name, format!("no parameter `{name}`")));
            }
        }
        self.parameters
            .iter()
            .map(|p| match (p.kind, args.get(p.name)) {
                (ParameterKind::Value, Some(b @ Binding::Value(_)))
                | (ParameterKind::Constant, Some(b @ Binding::Constant(_))) => Ok(b),
                (_, None) => Err(KilnError::snippet(self.name, format!("`{}` is not bound", p.name))),
                (ParameterKind::Value, Some(_)) => Err(KilnError::snippet(
                    self.name,
                    format!("`{}` is a value parameter but was bound to a constant", p.name),
                )),
                (ParameterKind::Constant, Some(_)) => Err(KilnError::snippet(
                    self.name,
                    format!("`{}` is a constant parameter but was bound to a value", p.name),
                )),
            })
            .collect()
    }

    /// Replace fixed node `replacee` of `target` with a copy of the body.
    /// Returns the node the template returned, which now stands for
    /// `replacee` at all its usages.
    pub fn instantiate(
        &self,
        target: &mut Graph,
        replacee: NodeId,
        args: &SnippetArguments,
    ) -> KilnResult<Option<NodeId>> {
        let position = target.node(replacee).position.clone();
        self.instantiate_at(target, replacee, args, position)
    }

    /// Like [`instantiate`](Self::instantiate), giving every copied node
    /// `position` instead of the replacee's.
    pub fn instantiate_at(
        &self,
        target: &mut Graph,
        replacee: NodeId,
        args: &SnippetArguments,
        position: Option<Arc<NodeSourcePosition>>,
    ) -> KilnResult<Option<NodeId>> {
        let bindings = self.check_arguments(args)?;
        if !target.kind(replacee).has_next() {
            return Err(KilnError::snippet(
                self.name,
                format!("cannot replace {}", target.kind(replacee).name()),
            ));
        }
        let template = &self.graph;
        let anchor = target
            .prev_begin(replacee)
            .ok_or_else(|| KilnError::snippet(self.name, "replacee has no anchoring begin"))?;
        let mut map: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        map.insert(template.start(), anchor);
        let mut copied = Vec::new();

        // Allocation.
        for (id, node) in template.iter() {
            if id == template.start() || id == self.ret {
                continue;
            }
            let new = match node.kind {
                NodeKind::Parameter(index) => match bindings[index as usize] {
                    Binding::Value(value) => value,
                    Binding::Constant(c) => {
                        let c = target.constant(c);
                        copied.push(c);
                        c
                    }
                },
                _ => {
                    let mut fresh = Node::new(node.kind.clone(), InputList::empty(), node.stamp);
                    fresh.flags = node.flags | NodeFlags::FROM_SNIPPET;
                    fresh.position = position.clone();
                    let fresh = target.add_raw(fresh);
                    copied.push(fresh);
                    fresh
                }
            };
            map.insert(id, new);
        }
        let lookup = |id: NodeId| -> KilnResult<NodeId> {
            map.get(&id)
                .copied()
                .ok_or_else(|| KilnError::snippet(self.name, format!("template node {:?} not copied", id)))
        };

        // Wiring.
        for (id, node) in template.iter() {
            if matches!(node.kind, NodeKind::Parameter(_)) || id == template.start() || id == self.ret {
                continue;
            }
            let new = lookup(id)?;
            let inputs = node.inputs().iter().map(&lookup).collect::<KilnResult<Vec<_>>>()?;
            target.set_inputs(new, &inputs);
            target.set_guard(new, node.guard().map(&lookup).transpose()?);
            target.set_memory(new, node.memory().map(&lookup).transpose()?);
            for (slot, &succ) in node.successors().iter().enumerate() {
                if succ.is_valid() && succ != self.ret {
                    target.set_successor(new, slot, Some(lookup(succ)?));
                }
            }
        }

        // Splice.
        let pred = target
            .predecessor(replacee)
            .ok_or_else(|| KilnError::snippet(self.name, "replacee is not linked"))?;
        let slot = target
            .successors(pred)
            .iter()
            .position(|&s| s == replacee)
            .ok_or_else(|| KilnError::internal_at(replacee.index(), "predecessor does not list replacee"))?;
        let next = target.next(replacee);
        target.set_next(replacee, None);

        let body_first = template.next(template.start());
        let ret_pred = template.predecessor(self.ret);
        match (body_first, ret_pred) {
            (Some(first), _) if first == self.ret => target.set_successor(pred, slot, next),
            (Some(first), Some(last)) => {
                target.set_successor(pred, slot, Some(lookup(first)?));
                let last_slot = template
                    .successors(last)
                    .iter()
                    .position(|&s| s == self.ret)
                    .unwrap_or(0);
                target.set_successor(lookup(last)?, last_slot, next);
            }
            _ => return Err(KilnError::snippet(self.name, "body does not reach its Return")),
        }

        let result = template
            .node(self.ret)
            .input(0)
            .map(&lookup)
            .transpose()?;
        target.replace_at_usages(replacee, result)?;
        target.kill_with_unused_inputs(replacee);

        // Folding may replace the result; a consumer edge follows it.
        let consumer = result.and_then(|r| {
            target.usages(r).iter().find_map(|&user| {
                let slot = target.node(user).inputs().iter().position(|input| input == r)?;
                Some((user, slot))
            })
        });
        Canonicalizer::with_max_steps(copied.len().max(1) * 64).canonicalize_nodes(target, &copied)?;
        let result = match consumer {
            Some((user, slot)) if target.is_alive(user) => target.node(user).input(slot),
            _ => result.filter(|&r| target.is_alive(r)),
        };
        log::trace!("instantiated {} for {:?}", self.name, replacee);
        Ok(result)
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Process-wide template cache. Templates are built outside the lock; when
/// two threads race, the first insert wins and the other copy is dropped.
#[derive(Debug, Default)]
pub struct SnippetCache {
    templates: RwLock<FxHashMap<&'static str, Arc<SnippetTemplate>>>,
}

impl SnippetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The template named `name`, building it with `build` on first use.
    pub fn get_or_build<F>(&self, name: &'static str, build: F) -> KilnResult<Arc<SnippetTemplate>>
    where
        F: FnOnce() -> KilnResult<SnippetTemplate>,
    {
        if let Some(template) = self.templates.read().get(name) {
            return Ok(Arc::clone(template));
        }
        let built = Arc::new(build()?);
        let mut templates = self.templates.write();
        Ok(Arc::clone(templates.entry(name).or_insert(built)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<SnippetTemplate>> {
        self.templates.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::kinds::{BinaryOp, CompareOp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// return flag != 0 ? x + 1 : x
    fn increment_if() -> SnippetTemplate {
        SnippetTemplate::build(
            "increment_if",
            &[
                SnippetParameter::value("x", Stamp::int(32)),
                SnippetParameter::constant("flag", Stamp::int(32)),
            ],
            |b, p| {
                let zero = b.int(0);
                let one = b.int(1);
                let is_zero = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[p[1], zero]);
                let mut scope = b.begin_if(is_zero, 0.5)?;
                b.else_branch(&mut scope)?;
                let plus = b.add(NodeKind::Binary(BinaryOp::Add), &[p[0], one]);
                let join = b.end_if(scope)?;
                let v = b.merge_value(&join, p[0], plus);
                b.append_return(Some(v))?;
                Ok(())
            },
        )
        .unwrap()
    }

    /// start -> Invoke placeholder -> return placeholder
    fn host() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let x = b.parameter(0, Stamp::int(32));
        let call = b
            .append_with_stamp(NodeKind::Alloca { slots: 0 }, &[], Stamp::int(32))
            .unwrap();
        let ret = b.append_return(Some(call)).unwrap();
        (g, x, call, ret)
    }

    #[test]
    fn test_constant_binding_folds_branch() {
        let template = increment_if();
        let (mut g, x, call, ret) = host();
        let mut args = SnippetArguments::new();
        args.bind_value("x", x).bind_constant("flag", Constant::Int(1));
        let result = template.instantiate(&mut g, call, &args).unwrap().unwrap();

        assert!(!g.is_alive(call));
        assert_eq!(g.node(ret).input(0), Some(result));
        assert!(matches!(g.kind(result), NodeKind::Binary(BinaryOp::Add)));
        assert!(!g.iter().any(|(_, n)| matches!(n.kind, NodeKind::If { .. } | NodeKind::Merge)));
        assert!(g.node(result).flags.contains(NodeFlags::FROM_SNIPPET));
        assert!(g.dangling_inputs().is_empty());
        assert!(g.usage_index_consistent());
    }

    #[test]
    fn test_constant_binding_folds_to_argument() {
        let template = increment_if();
        let (mut g, x, call, ret) = host();
        let mut args = SnippetArguments::new();
        args.bind_value("x", x).bind_constant("flag", Constant::Int(0));
        let result = template.instantiate(&mut g, call, &args).unwrap();

        assert_eq!(result, Some(x));
        assert_eq!(g.node(ret).input(0), Some(x));
        assert!(!g.iter().any(|(_, n)| matches!(n.kind, NodeKind::Phi | NodeKind::Merge)));
        assert!(g.usage_index_consistent());
    }

    #[test]
    fn test_missing_binding_rejected() {
        let template = increment_if();
        let (mut g, x, call, _) = host();
        let mut args = SnippetArguments::new();
        args.bind_value("x", x);
        let err = template.instantiate(&mut g, call, &args).unwrap_err();
        assert!(matches!(err, KilnError::SnippetBinding { .. }));
        assert!(g.is_alive(call));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let template = increment_if();
        let (mut g, x, call, _) = host();
        let mut args = SnippetArguments::new();
        args.bind_value("x", x).bind_value("flag", x);
        assert!(matches!(
            template.instantiate(&mut g, call, &args),
            Err(KilnError::SnippetBinding { .. })
        ));
        let mut args = SnippetArguments::new();
        args.bind_value("x", x)
            .bind_constant("flag", Constant::Int(0))
            .bind_constant("extra", Constant::Int(0));
        assert!(template.instantiate(&mut g, call, &args).is_err());
    }

    #[test]
    fn test_template_needs_single_return() {
        let err = SnippetTemplate::build("empty", &[], |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, KilnError::SnippetBinding { .. }));
    }

    #[test]
    fn test_cache_builds_once() {
        let cache = SnippetCache::new();
        let builds = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_build("increment_if", || {
                    builds.fetch_add(1, Ordering::Relaxed);
                    Ok(increment_if())
                })
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("increment_if").is_some());
    }
}
