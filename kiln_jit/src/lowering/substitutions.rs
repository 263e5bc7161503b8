//! Intrinsic substitutions.
//!
//! Calls to a few library methods are replaced by graphs that use
//! dedicated nodes. `Arrays.equals` over primitive arrays becomes:
//!
//! ```text
//! a == b                 -> true
//! a == null || b == null -> false
//! a.length != b.length   -> false
//! otherwise              -> ArrayEquals(&a[0], &b[0], a.length)
//! ```
//!
//! Substituted nodes carry a `Substitution` source position whose caller is
//! the replaced invoke's position.

use super::snippet::{SnippetArguments, SnippetCache, SnippetParameter, SnippetTemplate};
use crate::ir::graph::Graph;
use crate::ir::kinds::{CompareOp, LocationIdentity, MemoryAccess, NodeKind};
use crate::ir::node::NodeId;
use crate::ir::source_position::NodeSourcePosition;
use crate::ir::stamp::Stamp;
use crate::opt::Phase;
use kiln_core::{KilnError, KilnResult, MethodRef, ValueKind};
use rustc_hash::FxHashMap;

/// Internal name of the class declaring the substituted methods.
pub const ARRAYS_CLASS: &str = "Ljava/util/Arrays;";

/// Offsets of the array header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    pub length_offset: i32,
    pub base_offset: i32,
}

impl Default for ArrayLayout {
    fn default() -> Self {
        Self {
            length_offset: 12,
            base_offset: 16,
        }
    }
}

/// Replacement table: `(holder, name, signature)` to element kind.
#[derive(Debug, Clone)]
pub struct SubstitutionTable {
    entries: FxHashMap<(String, String, String), ValueKind>,
}

impl Default for SubstitutionTable {
    fn default() -> Self {
        let mut table = Self {
            entries: FxHashMap::default(),
        };
        for (descriptor, kind) in [
            ('Z', ValueKind::Boolean),
            ('B', ValueKind::Byte),
            ('C', ValueKind::Char),
            ('S', ValueKind::Short),
            ('I', ValueKind::Int),
            ('J', ValueKind::Long),
            ('F', ValueKind::Float),
            ('D', ValueKind::Double),
        ] {
            table.register(
                ARRAYS_CLASS,
                "equals",
                &format!("([{descriptor}[{descriptor})Z"),
                kind,
            );
        }
        table
    }
}

impl SubstitutionTable {
    pub fn empty() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, holder: &str, name: &str, signature: &str, kind: ValueKind) {
        self.entries
            .insert((holder.to_owned(), name.to_owned(), signature.to_owned()), kind);
    }

    /// Element kind compared by `method`, if it is substituted.
    pub fn lookup(&self, method: &MethodRef) -> Option<ValueKind> {
        self.entries
            .get(&(
                method.holder().name().to_owned(),
                method.name().to_owned(),
                method.signature().to_owned(),
            ))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn template_name(kind: ValueKind) -> KilnResult<&'static str> {
    Ok(match kind {
        ValueKind::Boolean => "arrays_equals_boolean",
        ValueKind::Byte => "arrays_equals_byte",
        ValueKind::Char => "arrays_equals_char",
        ValueKind::Short => "arrays_equals_short",
        ValueKind::Int => "arrays_equals_int",
        ValueKind::Long => "arrays_equals_long",
        ValueKind::Float => "arrays_equals_float",
        ValueKind::Double => "arrays_equals_double",
        other => return Err(KilnError::internal(format!("no array equals for {other:?}"))),
    })
}

fn build_arrays_equals(name: &'static str, kind: ValueKind, layout: ArrayLayout) -> KilnResult<SnippetTemplate> {
    let params = [
        SnippetParameter::value("a", Stamp::object()),
        SnippetParameter::value("b", Stamp::object()),
    ];
    SnippetTemplate::build(name, &params, |b, p| {
        let (a, c) = (p[0], p[1]);
        let one = b.int(1);
        let zero = b.int(0);

        let same = b.add(NodeKind::Compare(CompareOp::ObjectEquals), &[a, c]);
        let mut identical = b.begin_if(same, 0.1)?;
        b.else_branch(&mut identical)?;

        let a_null = b.add(NodeKind::IsNull, &[a]);
        let c_null = b.add(NodeKind::IsNull, &[c]);
        let either_null = b.add(
            NodeKind::ShortCircuitOr {
                x_negated: false,
                y_negated: false,
            },
            &[a_null, c_null],
        );
        let mut nulls = b.begin_if(either_null, 0.01)?;
        b.else_branch(&mut nulls)?;

        let length_offset = b.long(i64::from(layout.length_offset));
        let access = MemoryAccess::for_kind(ValueKind::Int);
        let location = LocationIdentity::Named("ArrayLength");
        let a_length_address = b.add(NodeKind::OffsetAddress, &[a, length_offset]);
        let a_length = b.read(location.clone(), access, a_length_address)?;
        let c_length_address = b.add(NodeKind::OffsetAddress, &[c, length_offset]);
        let c_length = b.read(location, access, c_length_address)?;
        let same_length = b.add(NodeKind::Compare(CompareOp::IntegerEquals), &[a_length, c_length]);
        let mut lengths = b.begin_if(same_length, 0.9)?;
        let base = b.long(i64::from(layout.base_offset));
        let a_first = b.add(NodeKind::OffsetAddress, &[a, base]);
        let c_first = b.add(NodeKind::OffsetAddress, &[c, base]);
        let equal = b.append(NodeKind::ArrayEquals { kind }, &[a_first, c_first, a_length])?;
        b.else_branch(&mut lengths)?;

        let join = b.end_if(lengths)?;
        let compared = b.merge_value(&join, equal, zero);
        let join = b.end_if(nulls)?;
        let checked = b.merge_value(&join, zero, compared);
        let join = b.end_if(identical)?;
        let result = b.merge_value(&join, one, checked);
        b.append_return(Some(result))?;
        Ok(())
    })
}

// =============================================================================
// Substitution Phase
// =============================================================================

/// Replaces substitutable invokes at the high tier.
#[derive(Debug)]
pub struct SubstitutionPhase {
    table: SubstitutionTable,
    layout: ArrayLayout,
    cache: SnippetCache,
}

impl SubstitutionPhase {
    pub fn new(table: SubstitutionTable, layout: ArrayLayout) -> Self {
        Self {
            table,
            layout,
            cache: SnippetCache::new(),
        }
    }

    /// Substitute one invoke. Returns false when its target has no entry.
    pub fn substitute(&self, graph: &mut Graph, invoke: NodeId) -> KilnResult<bool> {
        let NodeKind::Invoke { target } = graph.kind(invoke) else {
            return Ok(false);
        };
        let target = target.clone();
        let Some(kind) = self.table.lookup(&target) else {
            return Ok(false);
        };
        let name = template_name(kind)?;
        let layout = self.layout;
        let template = self.cache.get_or_build(name, || build_arrays_equals(name, kind, layout))?;

        let node = graph.node(invoke);
        let (a, b) = match (node.input(0), node.input(1)) {
            (Some(a), Some(b)) if node.inputs().len() == 2 => (a, b),
            _ => {
                return Err(KilnError::internal_at(
                    invoke.index(),
                    format!("{target} expects two arguments"),
                ))
            }
        };
        let caller = node.position.clone();
        let position = NodeSourcePosition::substitution(caller, target.clone());

        let mut args = SnippetArguments::new();
        args.bind_value("a", a).bind_value("b", b);
        template.instantiate_at(graph, invoke, &args, Some(position))?;
        log::trace!("substituted {} at {:?}", target, invoke);
        Ok(true)
    }
}

impl Default for SubstitutionPhase {
    fn default() -> Self {
        Self::new(SubstitutionTable::default(), ArrayLayout::default())
    }
}

impl Phase for SubstitutionPhase {
    fn name(&self) -> &'static str {
        "IntrinsicSubstitution"
    }

    fn run(&mut self, graph: &mut Graph) -> KilnResult<bool> {
        let invokes: Vec<NodeId> = graph
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Invoke { .. }))
            .map(|(id, _)| id)
            .collect();
        let mut count = 0;
        for invoke in invokes {
            if self.substitute(graph, invoke)? {
                count += 1;
            }
        }
        log::debug!("intrinsic substitution: {} calls", count);
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::eval::evaluate;
    use kiln_core::{AccessSize, KilnResult, RawMemory, RuntimeCalls, TypeRef};

    /// Byte-addressed memory.
    #[derive(Default)]
    struct Flat(FxHashMap<u64, u8>);

    impl Flat {
        fn array(&mut self, at: u64, elements: &[i32]) {
            let layout = ArrayLayout::default();
            self.write(at + layout.length_offset as u64, AccessSize::Word, elements.len() as u64);
            for (i, e) in elements.iter().enumerate() {
                self.write(at + layout.base_offset as u64 + 4 * i as u64, AccessSize::Word, *e as u32 as u64);
            }
        }
    }

    impl RawMemory for Flat {
        fn read(&self, addr: u64, size: AccessSize) -> u64 {
            (0..size.bytes() as u64).fold(0, |acc, i| acc | (u64::from(*self.0.get(&(addr + i)).unwrap_or(&0)) << (8 * i)))
        }
        fn write(&mut self, addr: u64, size: AccessSize, value: u64) {
            for i in 0..size.bytes() as u64 {
                self.0.insert(addr + i, (value >> (8 * i)) as u8);
            }
        }
    }

    impl RuntimeCalls for Flat {
        fn call(&mut self, name: &str, _: &[u64]) -> KilnResult<u64> {
            Err(KilnError::internal(format!("unexpected call {name}")))
        }
    }

    fn equals_method(signature: &str) -> MethodRef {
        MethodRef::new(TypeRef::new(ARRAYS_CLASS), "equals", signature)
    }

    fn calling(method: MethodRef) -> (Graph, NodeId) {
        let mut g = Graph::new();
        let mut b = GraphBuilder::new(&mut g);
        let a = b.parameter(0, Stamp::object());
        let c = b.parameter(1, Stamp::object());
        let call = b
            .append_with_stamp(NodeKind::Invoke { target: method }, &[a, c], Stamp::boolean())
            .unwrap();
        b.append_return(Some(call)).unwrap();
        (g, call)
    }

    #[test]
    fn test_table_covers_primitive_arrays() {
        let table = SubstitutionTable::default();
        assert_eq!(table.len(), 8);
        assert_eq!(table.lookup(&equals_method("([I[I)Z")), Some(ValueKind::Int));
        assert_eq!(table.lookup(&equals_method("([Ljava/lang/Object;[Ljava/lang/Object;)Z")), None);
    }

    #[test]
    fn test_int_arrays_equals() {
        let (mut g, call) = calling(equals_method("([I[I)Z"));
        assert!(SubstitutionPhase::default().run(&mut g).unwrap());
        assert!(!g.is_alive(call));

        let arrays_equals: Vec<_> = g
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::ArrayEquals { kind: ValueKind::Int }))
            .collect();
        assert_eq!(arrays_equals.len(), 1);
        let position = arrays_equals[0].1.position.as_ref().unwrap();
        assert!(position.is_substitution());

        let mut mem = Flat::default();
        mem.array(0x100, &[1, 2, 3]);
        mem.array(0x200, &[1, 2, 3]);
        mem.array(0x300, &[1, 2, 4]);
        mem.array(0x400, &[1, 2]);
        let run = |mem: &mut Flat, a: u64, b: u64| evaluate(&g, &[a, b], mem).unwrap().value();
        assert_eq!(run(&mut mem, 0x100, 0x200), Some(1));
        assert_eq!(run(&mut mem, 0x100, 0x300), Some(0));
        assert_eq!(run(&mut mem, 0x100, 0x400), Some(0));
        assert_eq!(run(&mut mem, 0x100, 0), Some(0));
        assert_eq!(run(&mut mem, 0x100, 0x100), Some(1));
    }

    #[test]
    fn test_other_invokes_untouched() {
        let (mut g, call) = calling(MethodRef::new(TypeRef::new("LFoo;"), "equals", "([I[I)Z"));
        assert!(!SubstitutionPhase::default().run(&mut g).unwrap());
        assert!(g.is_alive(call));
    }
}
