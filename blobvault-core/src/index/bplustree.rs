//! B+Tree keyed by [`Hash`].
//!
//! Nodes live in an arena (`Vec<Node<V>>` plus a free list); child and
//! sibling links are arena indices. There are no parent links: mutations
//! record the descent path and walk it back up for splits and merges.
//!
//! With order `m`, every node holds at most `m - 1` keys and every non-root
//! node holds at least `ceil(m / 2) - 1`. Interior node `keys[i]` is the
//! smallest key reachable through `children[i + 1]`.

use crate::error::{Result, VaultError};
use crate::hash::Hash;

pub const MIN_ORDER: usize = 3;

type NodeId = usize;

#[derive(Debug)]
enum Node<V> {
    Leaf {
        keys: Vec<Hash>,
        values: Vec<V>,
        next: Option<NodeId>,
    },
    Interior {
        keys: Vec<Hash>,
        children: Vec<NodeId>,
    },
    Free,
}

/// Entry or subtree moving between siblings during a borrow.
enum Moved<V> {
    Entry(Hash, V),
    Child(Hash, NodeId),
}

impl<V> Node<V> {
    fn key_count(&self) -> usize {
        match self {
            Node::Leaf { keys, .. } | Node::Interior { keys, .. } => keys.len(),
            Node::Free => 0,
        }
    }
}

#[derive(Debug)]
pub struct BPlusTree<V> {
    order: usize,
    nodes: Vec<Node<V>>,
    free: Vec<NodeId>,
    root: NodeId,
    first_leaf: NodeId,
    count: usize,
}

impl<V: Clone> BPlusTree<V> {
    pub fn new(order: usize) -> Result<Self> {
        check_order(order)?;
        Ok(Self {
            order,
            nodes: vec![Node::Leaf {
                keys: Vec::new(),
                values: Vec::new(),
                next: None,
            }],
            free: Vec::new(),
            root: 0,
            first_leaf: 0,
            count: 0,
        })
    }

    /// Build a tree from pairs already sorted by strictly ascending key,
    /// filling leaves left to right without descent.
    pub fn from_sorted<I>(order: usize, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Hash, V)>,
    {
        check_order(order)?;
        let pairs: Vec<(Hash, V)> = pairs.into_iter().collect();
        if pairs.is_empty() {
            return Self::new(order);
        }
        for window in pairs.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(VaultError::CorruptIndex(format!(
                    "index entries out of order at {}",
                    window[1].0
                )));
            }
        }

        let mut tree = Self {
            order,
            nodes: Vec::new(),
            free: Vec::new(),
            root: 0,
            first_leaf: 0,
            count: pairs.len(),
        };

        let max_keys = order - 1;
        let min_keys = tree.min_keys();
        let mut level: Vec<(NodeId, Hash)> = Vec::new();
        let mut remaining = pairs.into_iter();
        for size in partition(tree.count, max_keys, min_keys) {
            let (keys, values): (Vec<Hash>, Vec<V>) = remaining.by_ref().take(size).unzip();
            let low = keys[0];
            let id = tree.alloc(Node::Leaf {
                keys,
                values,
                next: None,
            });
            if let Some(&(prev, _)) = level.last() {
                if let Node::Leaf { next, .. } = &mut tree.nodes[prev] {
                    *next = Some(id);
                }
            }
            level.push((id, low));
        }
        tree.first_leaf = level[0].0;

        while level.len() > 1 {
            let mut parents = Vec::new();
            let mut remaining = level.into_iter();
            let total = remaining.len();
            for size in partition(total, order, min_keys + 1) {
                let group: Vec<(NodeId, Hash)> = remaining.by_ref().take(size).collect();
                let low = group[0].1;
                let keys = group.iter().skip(1).map(|(_, k)| *k).collect();
                let children = group.iter().map(|(id, _)| *id).collect();
                parents.push((tree.alloc(Node::Interior { keys, children }), low));
            }
            level = parents;
        }
        tree.root = level[0].0;
        Ok(tree)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root;
        while let Node::Interior { children, .. } = &self.nodes[node] {
            node = children[0];
            height += 1;
        }
        height
    }

    pub fn get(&self, key: &Hash) -> Option<&V> {
        let leaf = self.find_leaf(key);
        match &self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => keys.binary_search(key).ok().map(|i| &values[i]),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &Hash) -> Option<&mut V> {
        let leaf = self.find_leaf(key);
        match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => match keys.binary_search(key) {
                Ok(i) => Some(&mut values[i]),
                Err(_) => None,
            },
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &Hash) -> bool {
        self.get(key).is_some()
    }

    /// Insert `value` under `key` unless the key is present, in which case
    /// the existing value is returned and the tree is left untouched.
    pub fn add_or_find(&mut self, key: Hash, value: V) -> Option<V> {
        let mut path = Vec::new();
        let leaf = self.descend(&key, &mut path);

        let overflow = match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => match keys.binary_search(&key) {
                Ok(i) => return Some(values[i].clone()),
                Err(i) => {
                    keys.insert(i, key);
                    values.insert(i, value);
                    keys.len() > self.order - 1
                }
            },
            _ => unreachable!("descent always ends at a leaf"),
        };
        self.count += 1;

        if overflow {
            let split = self.split_leaf(leaf);
            self.propagate_split(path, split);
        }
        None
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&mut self, key: &Hash) -> bool {
        self.take(key).is_some()
    }

    /// Remove `key` and return its value.
    pub fn take(&mut self, key: &Hash) -> Option<V> {
        let mut path = Vec::new();
        let leaf = self.descend(key, &mut path);

        let removed = match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => match keys.binary_search(key) {
                Ok(i) => {
                    keys.remove(i);
                    values.remove(i)
                }
                Err(_) => return None,
            },
            _ => unreachable!("descent always ends at a leaf"),
        };
        self.count -= 1;
        self.rebalance(leaf, path);
        Some(removed)
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            tree: self,
            leaf: Some(self.first_leaf),
            pos: 0,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = Hash> + '_ {
        self.iter().map(|(k, _)| k)
    }

    fn min_keys(&self) -> usize {
        self.order.div_ceil(2) - 1
    }

    fn find_leaf(&self, key: &Hash) -> NodeId {
        let mut node = self.root;
        while let Node::Interior { keys, children } = &self.nodes[node] {
            node = children[child_index(keys, key)];
        }
        node
    }

    fn descend(&self, key: &Hash, path: &mut Vec<(NodeId, usize)>) -> NodeId {
        let mut node = self.root;
        while let Node::Interior { keys, children } = &self.nodes[node] {
            let idx = child_index(keys, key);
            path.push((node, idx));
            node = children[idx];
        }
        node
    }

    fn alloc(&mut self, node: Node<V>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Node<V> {
        self.free.push(id);
        std::mem::replace(&mut self.nodes[id], Node::Free)
    }

    fn split_leaf(&mut self, leaf: NodeId) -> (Hash, NodeId) {
        let (right_keys, right_values, old_next) = match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, next } => {
                let mid = keys.len() / 2;
                (keys.split_off(mid), values.split_off(mid), next.take())
            }
            _ => unreachable!("split_leaf on interior node"),
        };
        let separator = right_keys[0];
        let right = self.alloc(Node::Leaf {
            keys: right_keys,
            values: right_values,
            next: old_next,
        });
        if let Node::Leaf { next, .. } = &mut self.nodes[leaf] {
            *next = Some(right);
        }
        (separator, right)
    }

    fn split_interior(&mut self, node: NodeId) -> (Hash, NodeId) {
        let (separator, right_keys, right_children) = match &mut self.nodes[node] {
            Node::Interior { keys, children } => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.pop().expect("interior node has a middle key");
                let right_children = children.split_off(mid + 1);
                (separator, right_keys, right_children)
            }
            _ => unreachable!("split_interior on leaf"),
        };
        let right = self.alloc(Node::Interior {
            keys: right_keys,
            children: right_children,
        });
        (separator, right)
    }

    fn propagate_split(&mut self, mut path: Vec<(NodeId, usize)>, split: (Hash, NodeId)) {
        let mut pending = Some(split);
        while let Some((separator, right)) = pending.take() {
            match path.pop() {
                Some((parent, idx)) => {
                    let overflow = match &mut self.nodes[parent] {
                        Node::Interior { keys, children } => {
                            keys.insert(idx, separator);
                            children.insert(idx + 1, right);
                            keys.len() > self.order - 1
                        }
                        _ => unreachable!("path holds interior nodes"),
                    };
                    if overflow {
                        pending = Some(self.split_interior(parent));
                    }
                }
                None => {
                    let old_root = self.root;
                    self.root = self.alloc(Node::Interior {
                        keys: vec![separator],
                        children: vec![old_root, right],
                    });
                }
            }
        }
    }

    fn rebalance(&mut self, mut node: NodeId, mut path: Vec<(NodeId, usize)>) {
        let min_keys = self.min_keys();
        loop {
            if node == self.root {
                let collapse = match &self.nodes[node] {
                    Node::Interior { keys, children } if keys.is_empty() => Some(children[0]),
                    _ => None,
                };
                if let Some(child) = collapse {
                    self.release(node);
                    self.root = child;
                }
                return;
            }
            if self.nodes[node].key_count() >= min_keys {
                return;
            }

            let (parent, idx) = path.pop().expect("non-root node has a parent on the path");
            let siblings = match &self.nodes[parent] {
                Node::Interior { children, .. } => children.clone(),
                _ => unreachable!("path holds interior nodes"),
            };

            if idx > 0 && self.nodes[siblings[idx - 1]].key_count() > min_keys {
                self.borrow_from_left(parent, idx, siblings[idx - 1], node);
                return;
            }
            if idx + 1 < siblings.len() && self.nodes[siblings[idx + 1]].key_count() > min_keys {
                self.borrow_from_right(parent, idx, node, siblings[idx + 1]);
                return;
            }

            if idx > 0 {
                self.merge(parent, idx - 1, siblings[idx - 1], node);
            } else {
                self.merge(parent, idx, node, siblings[idx + 1]);
            }
            node = parent;
        }
    }

    fn borrow_from_left(&mut self, parent: NodeId, idx: usize, left: NodeId, node: NodeId) {
        let separator = self.parent_key(parent, idx - 1);
        let moved = match &mut self.nodes[left] {
            Node::Leaf { keys, values, .. } => match (keys.pop(), values.pop()) {
                (Some(key), Some(value)) => Moved::Entry(key, value),
                _ => return,
            },
            Node::Interior { keys, children } => match (keys.pop(), children.pop()) {
                (Some(key), Some(child)) => Moved::Child(key, child),
                _ => return,
            },
            Node::Free => return,
        };
        let new_separator = match (moved, &mut self.nodes[node]) {
            (Moved::Entry(key, value), Node::Leaf { keys, values, .. }) => {
                keys.insert(0, key);
                values.insert(0, value);
                key
            }
            (Moved::Child(key, child), Node::Interior { keys, children }) => {
                keys.insert(0, separator);
                children.insert(0, child);
                key
            }
            _ => unreachable!("siblings share a level"),
        };
        self.set_parent_key(parent, idx - 1, new_separator);
    }

    fn borrow_from_right(&mut self, parent: NodeId, idx: usize, node: NodeId, right: NodeId) {
        let separator = self.parent_key(parent, idx);
        let (moved, new_separator) = match &mut self.nodes[right] {
            Node::Leaf { keys, values, .. } => {
                let key = keys.remove(0);
                let value = values.remove(0);
                (Moved::Entry(key, value), keys[0])
            }
            Node::Interior { keys, children } => {
                let key = keys.remove(0);
                let child = children.remove(0);
                (Moved::Child(separator, child), key)
            }
            Node::Free => return,
        };
        match (moved, &mut self.nodes[node]) {
            (Moved::Entry(key, value), Node::Leaf { keys, values, .. }) => {
                keys.push(key);
                values.push(value);
            }
            (Moved::Child(key, child), Node::Interior { keys, children }) => {
                keys.push(key);
                children.push(child);
            }
            _ => unreachable!("siblings share a level"),
        }
        self.set_parent_key(parent, idx, new_separator);
    }

    /// Fold `right` into `left`; `pos` is the separator index between them.
    fn merge(&mut self, parent: NodeId, pos: usize, left: NodeId, right: NodeId) {
        let separator = match &mut self.nodes[parent] {
            Node::Interior { keys, children } => {
                children.remove(pos + 1);
                keys.remove(pos)
            }
            _ => unreachable!("path holds interior nodes"),
        };
        match self.release(right) {
            Node::Leaf {
                keys: right_keys,
                values: right_values,
                next: right_next,
            } => {
                if let Node::Leaf { keys, values, next } = &mut self.nodes[left] {
                    keys.extend(right_keys);
                    values.extend(right_values);
                    *next = right_next;
                }
            }
            Node::Interior {
                keys: right_keys,
                children: right_children,
            } => {
                if let Node::Interior { keys, children } = &mut self.nodes[left] {
                    keys.push(separator);
                    keys.extend(right_keys);
                    children.extend(right_children);
                }
            }
            Node::Free => unreachable!("sibling is live"),
        }
    }

    fn parent_key(&self, parent: NodeId, pos: usize) -> Hash {
        match &self.nodes[parent] {
            Node::Interior { keys, .. } => keys[pos],
            _ => unreachable!("path holds interior nodes"),
        }
    }

    fn set_parent_key(&mut self, parent: NodeId, pos: usize, key: Hash) {
        if let Node::Interior { keys, .. } = &mut self.nodes[parent] {
            keys[pos] = key;
        }
    }

    /// Walk the whole structure and report the first broken invariant.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut leaves = Vec::new();
        let depth = self.check_node(self.root, None, None, true, &mut leaves)?;
        if depth != self.height() {
            return Err("height mismatch".into());
        }
        let mut chained = Vec::new();
        let mut cursor = Some(self.first_leaf);
        while let Some(id) = cursor {
            chained.push(id);
            cursor = match &self.nodes[id] {
                Node::Leaf { next, .. } => *next,
                _ => return Err("leaf chain reaches interior node".into()),
            };
        }
        if chained != leaves {
            return Err("leaf chain does not match in-order leaves".into());
        }
        let keys: Vec<Hash> = self.keys().collect();
        if keys.len() != self.count {
            return Err(format!("count {} but {} keys", self.count, keys.len()));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err("keys not strictly ascending".into());
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_node(
        &self,
        id: NodeId,
        low: Option<Hash>,
        high: Option<Hash>,
        is_root: bool,
        leaves: &mut Vec<NodeId>,
    ) -> std::result::Result<usize, String> {
        let node = &self.nodes[id];
        let count = node.key_count();
        if count > self.order - 1 {
            return Err(format!("node {} overflows with {} keys", id, count));
        }
        if !is_root && count < self.min_keys() {
            return Err(format!("node {} underflows with {} keys", id, count));
        }
        match node {
            Node::Leaf { keys, values, .. } => {
                if keys.len() != values.len() {
                    return Err("leaf keys and values differ in length".into());
                }
                for key in keys {
                    if low.is_some_and(|l| *key < l) || high.is_some_and(|h| *key >= h) {
                        return Err(format!("key {} outside separator bounds", key));
                    }
                }
                leaves.push(id);
                Ok(1)
            }
            Node::Interior { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err("interior child count mismatch".into());
                }
                let mut depth = None;
                for (i, child) in children.iter().enumerate() {
                    let child_low = if i == 0 { low } else { Some(keys[i - 1]) };
                    let child_high = if i == keys.len() { high } else { Some(keys[i]) };
                    let d = self.check_node(*child, child_low, child_high, false, leaves)?;
                    if depth.is_some_and(|prev| prev != d) {
                        return Err("leaves at different depths".into());
                    }
                    depth = Some(d);
                }
                Ok(depth.unwrap_or(0) + 1)
            }
            Node::Free => Err(format!("node {} is free but reachable", id)),
        }
    }
}

/// In-order iterator over the leaf chain.
pub struct Iter<'a, V> {
    tree: &'a BPlusTree<V>,
    leaf: Option<NodeId>,
    pos: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Hash, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.leaf?;
            match &self.tree.nodes[id] {
                Node::Leaf { keys, values, next } => {
                    if self.pos < keys.len() {
                        let item = (keys[self.pos], &values[self.pos]);
                        self.pos += 1;
                        return Some(item);
                    }
                    self.leaf = *next;
                    self.pos = 0;
                }
                _ => return None,
            }
        }
    }
}

fn check_order(order: usize) -> Result<()> {
    if order < MIN_ORDER {
        return Err(VaultError::InvalidRequest(format!(
            "b+tree order must be at least {}, got {}",
            MIN_ORDER, order
        )));
    }
    Ok(())
}

/// Index of the child to follow: the first whose separator exceeds `key`.
fn child_index(keys: &[Hash], key: &Hash) -> usize {
    keys.partition_point(|k| k <= key)
}

/// Split `total` items into runs of at most `max`, keeping the last run at
/// or above `min` by evening out the final two.
fn partition(total: usize, max: usize, min: usize) -> Vec<usize> {
    let mut sizes = vec![max; total / max];
    if total % max != 0 {
        sizes.push(total % max);
    }
    let n = sizes.len();
    if n >= 2 && sizes[n - 1] < min {
        let pair = sizes[n - 2] + sizes[n - 1];
        sizes[n - 1] = pair / 2;
        sizes[n - 2] = pair - pair / 2;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn random_key(rng: &mut StdRng) -> Hash {
        let mut bytes = [0u8; 20];
        rng.fill(&mut bytes);
        Hash::from_bytes(bytes)
    }

    fn key(n: u32) -> Hash {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        Hash::from_bytes(bytes)
    }

    #[test]
    fn test_rejects_tiny_order() {
        assert!(BPlusTree::<u32>::new(2).is_err());
        assert!(BPlusTree::<u32>::new(3).is_ok());
    }

    #[test]
    fn test_add_or_find_is_idempotent() {
        let mut tree = BPlusTree::new(4).unwrap();
        assert_eq!(tree.add_or_find(key(1), "first"), None);
        assert_eq!(tree.add_or_find(key(1), "second"), Some("first"));
        assert_eq!(tree.get(&key(1)), Some(&"first"));
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn test_sequential_inserts_grow_height() {
        let mut tree = BPlusTree::new(4).unwrap();
        for n in 0..200 {
            tree.add_or_find(key(n), n);
            tree.check_invariants().unwrap();
        }
        assert!(tree.height() > 2);
        assert_eq!(tree.count(), 200);
        let values: Vec<u32> = tree.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_insert_remove_order_100() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = BPlusTree::new(100).unwrap();
        let mut pairs: Vec<(Hash, u64)> = (0..107).map(|i| (random_key(&mut rng), i)).collect();
        for (k, v) in &pairs {
            assert_eq!(tree.add_or_find(*k, *v), None);
        }
        tree.check_invariants().unwrap();
        assert_eq!(tree.count(), 107);

        pairs.shuffle(&mut rng);
        while let Some((k, _)) = pairs.pop() {
            assert!(tree.remove(&k));
            assert!(!tree.remove(&k));
            tree.check_invariants().unwrap();
            assert_eq!(tree.count(), pairs.len());
            for (rk, rv) in &pairs {
                assert_eq!(tree.get(rk), Some(rv));
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_small_order_churn() {
        let mut rng = StdRng::seed_from_u64(7);
        for order in [3, 4, 5, 8] {
            let mut tree = BPlusTree::new(order).unwrap();
            let mut live = std::collections::BTreeMap::new();
            for step in 0..2000u32 {
                let k = key(rng.gen_range(0..300));
                if rng.gen_bool(0.6) {
                    let existing = tree.add_or_find(k, step);
                    assert_eq!(existing, live.get(&k).copied());
                    live.entry(k).or_insert(step);
                } else {
                    assert_eq!(tree.remove(&k), live.remove(&k).is_some());
                }
            }
            tree.check_invariants().unwrap();
            let expected: Vec<(Hash, u32)> = live.into_iter().collect();
            let actual: Vec<(Hash, u32)> = tree.iter().map(|(k, v)| (k, *v)).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_remove_then_reinsert_restores_enumeration() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut tree = BPlusTree::new(5).unwrap();
        let keys: Vec<Hash> = (0..64).map(|_| random_key(&mut rng)).collect();
        for (i, k) in keys.iter().enumerate() {
            tree.add_or_find(*k, i);
        }
        let before: Vec<(Hash, usize)> = tree.iter().map(|(k, v)| (k, *v)).collect();

        for (i, k) in keys.iter().enumerate().step_by(3) {
            assert_eq!(tree.take(k), Some(i));
        }
        for (i, k) in keys.iter().enumerate().step_by(3) {
            tree.add_or_find(*k, i);
        }
        tree.check_invariants().unwrap();
        let after: Vec<(Hash, usize)> = tree.iter().map(|(k, v)| (k, *v)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut tree = BPlusTree::new(4).unwrap();
        for n in 0..20 {
            tree.add_or_find(key(n), n);
        }
        *tree.get_mut(&key(7)).unwrap() += 100;
        assert_eq!(tree.get(&key(7)), Some(&107));
        assert!(tree.get_mut(&key(99)).is_none());
    }

    #[test]
    fn test_from_sorted_builds_valid_tree() {
        for order in [3, 4, 7, 100] {
            for total in [0usize, 1, 2, 6, 99, 100, 101, 513] {
                let pairs: Vec<(Hash, usize)> = (0..total).map(|n| (key(n as u32), n)).collect();
                let mut tree = BPlusTree::from_sorted(order, pairs.clone()).unwrap();
                tree.check_invariants().unwrap();
                let listed: Vec<(Hash, usize)> = tree.iter().map(|(k, v)| (k, *v)).collect();
                assert_eq!(listed, pairs);

                tree.add_or_find(key(1_000_000), 0);
                for (k, _) in pairs.iter().step_by(2) {
                    assert!(tree.remove(k));
                }
                tree.check_invariants().unwrap();
            }
        }
    }

    #[test]
    fn test_from_sorted_rejects_unsorted() {
        let pairs = vec![(key(2), 0), (key(1), 1)];
        assert!(BPlusTree::from_sorted(4, pairs).is_err());
        let dupes = vec![(key(1), 0), (key(1), 1)];
        assert!(BPlusTree::from_sorted(4, dupes).is_err());
    }
}
