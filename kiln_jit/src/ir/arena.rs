//! Index-based storage for graph nodes.
//!
//! Nodes live in a flat [`Arena`] and refer to one another by [`Id`], a
//! typed `u32` index. Nothing is freed individually: removed nodes are
//! flagged dead and stay in the arena until the graph is dropped, so an id
//! never dangles in the memory-safety sense. Side tables keyed by id use
//! [`SecondaryMap`]; visited sets use [`BitSet`].

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Typed ID
// =============================================================================

/// Typed index into an [`Arena`].
///
/// The marker keeps ids of different arenas apart. Trait impls are written
/// by hand so `Id<T>` is `Copy + Eq + Hash` whatever `T` is.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> Id<T> {
    /// Sentinel for "no id".
    pub const INVALID: Self = Id {
        index: u32::MAX,
        _marker: PhantomData,
    };

    /// Create an id from a raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    /// Create an id from a `usize` position.
    #[inline]
    pub const fn from_usize(index: usize) -> Self {
        Self::new(index as u32)
    }

    /// Raw index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Index as `usize`.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }

    /// Whether this is not the sentinel.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#INVALID")
        }
    }
}

impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Append-only storage addressed by [`Id`].
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[inline]
    pub fn new() -> Self {
        Arena { items: Vec::new() }
    }

    /// Create an arena with room for `capacity` items.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Store `item` and return its id.
    #[inline]
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let id = Id::from_usize(self.items.len());
        self.items.push(item);
        id
    }

    /// Item for `id`, if in range.
    #[inline]
    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.as_usize())
    }

    /// Mutable item for `id`, if in range.
    #[inline]
    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(id.as_usize())
    }

    /// Whether `id` indexes an allocated item.
    #[inline]
    pub fn contains(&self, id: Id<T>) -> bool {
        id.as_usize() < self.items.len()
    }

    /// Number of items ever allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing was allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items with their ids, in allocation order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::from_usize(i), item))
    }

    /// All ids, in allocation order.
    #[inline]
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.items.len()).map(Id::from_usize)
    }

    /// Id the next allocation will receive.
    #[inline]
    pub fn next_id(&self) -> Id<T> {
        Id::from_usize(self.items.len())
    }

    /// Reserve room for `additional` items.
    #[inline]
    pub fn reserve(&mut self, additional: usize) {
        self.items.reserve(additional);
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &Self::Output {
        &self.items[id.as_usize()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut Self::Output {
        &mut self.items[id.as_usize()]
    }
}

// =============================================================================
// Secondary Map
// =============================================================================

/// Dense side table keyed by arena id. Missing entries read as `V::default()`.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    values: Vec<V>,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V: Default + Clone> SecondaryMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        SecondaryMap {
            values: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Create a map pre-sized for `len` ids.
    pub fn with_len(len: usize) -> Self {
        SecondaryMap {
            values: vec![V::default(); len],
            _marker: PhantomData,
        }
    }

    /// Grow so ids below `len` are addressable.
    pub fn resize(&mut self, len: usize) {
        if len > self.values.len() {
            self.values.resize(len, V::default());
        }
    }

    /// Number of addressable ids.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map holds no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value for `id`, if its slot exists.
    #[inline]
    pub fn get(&self, id: Id<K>) -> Option<&V> {
        self.values.get(id.as_usize())
    }

    /// Mutable value for `id`, if its slot exists.
    #[inline]
    pub fn get_mut(&mut self, id: Id<K>) -> Option<&mut V> {
        self.values.get_mut(id.as_usize())
    }

    /// Mutable value for `id`, growing the map when needed.
    pub fn entry(&mut self, id: Id<K>) -> &mut V {
        self.resize(id.as_usize() + 1);
        &mut self.values[id.as_usize()]
    }

    /// Store `value` for `id`.
    pub fn set(&mut self, id: Id<K>, value: V) {
        *self.entry(id) = value;
    }

    /// Reset every slot to the default.
    pub fn clear(&mut self) {
        for value in &mut self.values {
            *value = V::default();
        }
    }

    /// Slots with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (Id<K>, &V)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (Id::from_usize(i), v))
    }
}

impl<K, V: Default + Clone> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Default + Clone> Index<Id<K>> for SecondaryMap<K, V> {
    type Output = V;

    fn index(&self, id: Id<K>) -> &Self::Output {
        &self.values[id.as_usize()]
    }
}

impl<K, V: Default + Clone> IndexMut<Id<K>> for SecondaryMap<K, V> {
    fn index_mut(&mut self, id: Id<K>) -> &mut Self::Output {
        self.entry(id)
    }
}

// =============================================================================
// Bit Set
// =============================================================================

/// Growable bit set over dense indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Create an empty set.
    pub fn new() -> Self {
        BitSet { words: Vec::new() }
    }

    /// Create a set sized for indices below `n`.
    pub fn with_capacity(n: usize) -> Self {
        BitSet {
            words: vec![0; n.div_ceil(64)],
        }
    }

    fn grow(&mut self, index: usize) {
        let needed = index / 64 + 1;
        if needed > self.words.len() {
            self.words.resize(needed, 0);
        }
    }

    /// Add `index`. Returns true if it was not present.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        self.grow(index);
        let (word, mask) = (index / 64, 1u64 << (index % 64));
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    /// Remove `index`. Returns true if it was present.
    #[inline]
    pub fn remove(&mut self, index: usize) -> bool {
        let (word, mask) = (index / 64, 1u64 << (index % 64));
        match self.words.get_mut(word) {
            Some(w) if *w & mask != 0 => {
                *w &= !mask;
                true
            }
            _ => false,
        }
    }

    /// Whether `index` is present.
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// `self |= other`. Returns true if `self` changed.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            let merged = *mine | theirs;
            changed |= merged != *mine;
            *mine = merged;
        }
        changed
    }

    /// Whether no index is present.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of present indices.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Present indices in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * 64 + bit)
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item(u8);

    #[test]
    fn test_arena_ids_are_dense() {
        let mut arena: Arena<Item> = Arena::new();
        let a = arena.alloc(Item(1));
        let b = arena.alloc(Item(2));
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(arena.next_id().index(), 2);
        arena[b].0 = 20;
        assert_eq!(arena[b].0, 20);
        assert!(arena.contains(a));
        assert!(!arena.contains(Id::new(7)));
    }

    #[test]
    fn test_invalid_id() {
        let id: Id<Item> = Id::default();
        assert!(!id.is_valid());
        assert_eq!(format!("{:?}", id), "#INVALID");
        assert_eq!(format!("{:?}", Id::<Item>::new(3)), "#3");
    }

    #[test]
    fn test_secondary_map_grows_on_write() {
        let mut map: SecondaryMap<Item, u32> = SecondaryMap::new();
        assert_eq!(map.get(Id::new(4)), None);
        map.set(Id::new(4), 9);
        assert_eq!(map[Id::new(4)], 9);
        assert_eq!(map[Id::new(2)], 0);
        *map.entry(Id::new(10)) += 1;
        assert_eq!(map.len(), 11);
    }

    #[test]
    fn test_bit_set_insert_reports_novelty() {
        let mut set = BitSet::new();
        assert!(set.insert(64));
        assert!(!set.insert(64));
        assert!(set.insert(3));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64]);
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_bit_set_union_reports_change() {
        let mut a = BitSet::new();
        a.insert(1);
        let mut b = BitSet::new();
        b.insert(1);
        assert!(!a.union_with(&b));
        b.insert(130);
        assert!(a.union_with(&b));
        assert!(a.contains(130));
    }
}
