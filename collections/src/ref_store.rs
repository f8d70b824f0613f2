use itertools::Itertools;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::{Debug, Error, Formatter};
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Types that can serve as dense integer keys into the stores of this module.
pub trait Ref: Into<usize> + From<usize> + Copy + PartialEq {}

impl<X> Ref for X where X: Into<usize> + From<usize> + Copy + PartialEq {}

/// Declares a copyable newtype over `NonZeroU32` usable as a key of `RefMap`/`RefStore`
/// and as an index into a `Vec`.
///
/// The niche of `NonZeroU32` keeps `Option<Id>` at four bytes. Generated types are
/// serde-serializable since identifiers routinely travel inside wire messages.
#[macro_export]
macro_rules! ref_type {
    ($type_name:ident) => {
        #[derive(
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Clone,
            Copy,
            Hash,
            Debug,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $type_name(std::num::NonZeroU32);

        impl $type_name {
            pub const fn to_u32(self) -> u32 {
                self.0.get() - 1
            }
            pub const fn from_u32(u: u32) -> Self {
                match std::num::NonZeroU32::new(u + 1) {
                    Some(nz) => $type_name(nz),
                    None => panic!("id overflow"),
                }
            }
        }
        impl From<usize> for $type_name {
            fn from(u: usize) -> Self {
                Self::from_u32(u as u32)
            }
        }
        impl From<$type_name> for usize {
            fn from(v: $type_name) -> Self {
                (v.0.get() - 1) as usize
            }
        }
        impl From<u32> for $type_name {
            fn from(u: u32) -> Self {
                Self::from_u32(u)
            }
        }
        impl From<$type_name> for u32 {
            fn from(v: $type_name) -> Self {
                v.to_u32()
            }
        }

        impl<V> std::ops::Index<$type_name> for Vec<V> {
            type Output = V;

            fn index(&self, index: $type_name) -> &Self::Output {
                &self[usize::from(index)]
            }
        }

        impl<V> std::ops::IndexMut<$type_name> for Vec<V> {
            fn index_mut(&mut self, index: $type_name) -> &mut Self::Output {
                &mut self[usize::from(index)]
            }
        }
    };
}

/// A partial map from a dense integer key to a value, backed by a vector.
///
/// Lookups are plain indexing; the map grows on insertion to accommodate the key.
#[derive(Clone)]
pub struct RefMap<K, V> {
    entries: Vec<Option<V>>,
    phantom: PhantomData<K>,
}

impl<K, V> Default for RefMap<K, V> {
    fn default() -> Self {
        RefMap {
            entries: Vec::new(),
            phantom: PhantomData,
        }
    }
}

impl<K: Ref, V> RefMap<K, V> {
    pub fn insert(&mut self, k: K, v: V) {
        let i = k.into();
        if i >= self.entries.len() {
            self.entries.resize_with(i + 1, || None);
        }
        self.entries[i] = Some(v);
    }

    pub fn remove(&mut self, k: K) -> Option<V> {
        let i: usize = k.into();
        if i < self.entries.len() {
            self.entries[i].take()
        } else {
            None
        }
    }

    pub fn contains(&self, k: K) -> bool {
        self.get(k).is_some()
    }

    pub fn get(&self, k: K) -> Option<&V> {
        let i: usize = k.into();
        self.entries.get(i).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, k: K) -> Option<&mut V> {
        let i: usize = k.into();
        self.entries.get_mut(i).and_then(|e| e.as_mut())
    }

    /// Returns the value for `k`, inserting the result of `f` first if absent.
    pub fn get_or_insert_with(&mut self, k: K, f: impl FnOnce() -> V) -> &mut V {
        if !self.contains(k) {
            self.insert(k, f());
        }
        self.get_mut(k).unwrap()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| K::from(i)))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }

    pub fn entries(&self) -> impl Iterator<Item = (K, &V)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (K::from(i), v)))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Ref, V> Index<K> for RefMap<K, V> {
    type Output = V;

    fn index(&self, k: K) -> &Self::Output {
        self.get(k).expect("No value for this key")
    }
}

impl<K: Ref, V> IndexMut<K> for RefMap<K, V> {
    fn index_mut(&mut self, k: K) -> &mut Self::Output {
        self.get_mut(k).expect("No value for this key")
    }
}

impl<K: Ref, V: Debug> Debug for RefMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "{:?}",
            self.entries.iter().enumerate().filter(|(_, e)| e.is_some()).format(", ")
        )
    }
}

/// A store that generates a fresh key for each pushed value.
#[derive(Clone)]
pub struct RefStore<K, V> {
    values: Vec<V>,
    phantom: PhantomData<K>,
}

impl<K, V> Default for RefStore<K, V> {
    fn default() -> Self {
        RefStore {
            values: Vec::new(),
            phantom: PhantomData,
        }
    }
}

impl<K: Ref, V> RefStore<K, V> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn initialized(len: usize, v: V) -> Self
    where
        V: Clone,
    {
        RefStore {
            values: vec![v; len],
            phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, v: V) -> K {
        let k: K = self.values.len().into();
        self.values.push(v);
        k
    }

    pub fn keys(&self) -> impl Iterator<Item = K> {
        (0..self.len()).map(K::from)
    }

    pub fn entries(&self) -> impl Iterator<Item = (K, &V)> {
        self.keys().map(move |k| (k, &self[k]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.values.iter()
    }
}

impl<K: Ref, V> Index<K> for RefStore<K, V> {
    type Output = V;

    fn index(&self, k: K) -> &Self::Output {
        &self.values[k.into()]
    }
}

impl<K: Ref, V> IndexMut<K> for RefStore<K, V> {
    fn index_mut(&mut self, k: K) -> &mut Self::Output {
        &mut self.values[k.into()]
    }
}

impl<K: Ref, V: Debug> Debug for RefStore<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{:?}", self.values.iter().enumerate().format(", "))
    }
}

/// An interning pool: pushing a value returns its key, and the key of an already
/// interned value can be retrieved from the value itself.
#[derive(Clone)]
pub struct RefPool<K, V> {
    values: Vec<V>,
    rev: HashMap<V, K>,
}

impl<K, V: Hash + Eq> Default for RefPool<K, V> {
    fn default() -> Self {
        RefPool {
            values: Vec::new(),
            rev: HashMap::new(),
        }
    }
}

impl<K: Ref, V: Hash + Eq + Clone> RefPool<K, V> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Interns `v`, returning the existing key when the value was pushed before.
    pub fn intern(&mut self, v: V) -> K {
        match self.rev.get(&v) {
            Some(&k) => k,
            None => {
                let k: K = self.values.len().into();
                self.rev.insert(v.clone(), k);
                self.values.push(v);
                k
            }
        }
    }

    pub fn key_of<W: ?Sized>(&self, v: &W) -> Option<K>
    where
        W: Eq + Hash,
        V: Borrow<W>,
    {
        self.rev.get(v).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> {
        (0..self.len()).map(K::from)
    }
}

impl<K: Ref, V: Hash + Eq + Clone> Index<K> for RefPool<K, V> {
    type Output = V;

    fn index(&self, k: K) -> &Self::Output {
        &self.values[k.into()]
    }
}
