//! Ordered hash index.
//!
//! [`BPlusTree`] is the single-threaded structure; [`HashIndex`] puts one
//! coarse lock around it so splits, merges and borrows never interleave.

pub mod bplustree;

pub use bplustree::{BPlusTree, MIN_ORDER};

use crate::error::Result;
use crate::hash::Hash;
use parking_lot::RwLock;

pub const DEFAULT_ORDER: usize = 100;

pub struct HashIndex<V> {
    tree: RwLock<BPlusTree<V>>,
}

impl<V: Clone> HashIndex<V> {
    pub fn new(order: usize) -> Result<Self> {
        Ok(Self {
            tree: RwLock::new(BPlusTree::new(order)?),
        })
    }

    pub fn from_sorted<I>(order: usize, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Hash, V)>,
    {
        Ok(Self {
            tree: RwLock::new(BPlusTree::from_sorted(order, pairs)?),
        })
    }

    pub fn order(&self) -> usize {
        self.tree.read().order()
    }

    pub fn count(&self) -> usize {
        self.tree.read().count()
    }

    pub fn add_or_find(&self, hash: Hash, value: V) -> Option<V> {
        self.tree.write().add_or_find(hash, value)
    }

    pub fn remove(&self, hash: &Hash) -> bool {
        self.tree.write().remove(hash)
    }

    pub fn get_record(&self, hash: &Hash) -> Option<V> {
        self.tree.read().get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.tree.read().contains_key(hash)
    }

    /// Mutate an existing value in place under the write lock.
    pub fn update<R>(&self, hash: &Hash, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.tree.write().get_mut(hash).map(f)
    }

    /// Insert or overwrite.
    pub fn upsert(&self, hash: Hash, value: V) {
        let mut tree = self.tree.write();
        match tree.get_mut(&hash) {
            Some(slot) => *slot = value,
            None => {
                tree.add_or_find(hash, value);
            }
        }
    }

    /// Ordered copy of every entry, taken under the read lock.
    pub fn entries(&self) -> Vec<(Hash, V)> {
        self.tree
            .read()
            .iter()
            .map(|(hash, value)| (hash, value.clone()))
            .collect()
    }

    /// Visit every entry in hash order without copying values.
    pub fn scan(&self, mut f: impl FnMut(&Hash, &V)) {
        let tree = self.tree.read();
        for (hash, value) in tree.iter() {
            f(&hash, value);
        }
    }
}
