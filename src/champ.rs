//! A persistent hash map on a CHAMP trie.

mod iter;
mod node;

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::hashing;

pub use iter::{Iter, Keys, Values};
use node::Node;

/// A persistent hash map.
///
/// Lookup, insertion and removal run in O(log32 n). Cloning is an O(1)
/// reference-count bump; mutating operations copy only the nodes on the
/// hash path they touch, and mutate in place whenever this map is the
/// sole owner of a node.
///
/// Iteration order is stable for a given map but is not the insertion
/// order.
#[derive(Clone)]
pub struct HashMap<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
    hash: OnceLock<u64>,
}

impl<K, V> HashMap<K, V> {
    /// The canonical empty map.
    pub const fn new() -> Self {
        HashMap {
            root: None,
            len: 0,
            hash: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self.root.as_deref(), self.len)
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { inner: self.iter() }
    }

    pub fn values(&self) -> Values<'_, K, V> {
        Values { inner: self.iter() }
    }

    /// True when both maps share the same root node. Sharing implies
    /// equal contents; the converse does not hold.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).map(|(_, v)| v)
    }

    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = hashing::trie_hash(key);
        self.root.as_deref()?.get(hash, 0, key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).is_some()
    }

    fn dirty(&mut self) {
        self.hash.take();
    }
}

impl<K, V> HashMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Inserts or replaces, returning the displaced value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.dirty();
        let hash = hashing::trie_hash(&key);
        match self.root.as_mut() {
            None => {
                self.root = Some(Arc::new(Node::Data { hash, key, value }));
                self.len = 1;
                None
            }
            Some(root) => {
                let displaced = Arc::make_mut(root).insert(hash, 0, key, value);
                if displaced.is_none() {
                    self.len += 1;
                }
                displaced
            }
        }
    }

    /// Removes `key`, returning its value. A miss leaves the map (and
    /// its root identity) untouched.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.contains_key(key) {
            return None;
        }
        self.dirty();
        let hash = hashing::trie_hash(key);
        // A single-entry map keeps its entry in a root data node.
        let root_is_data = matches!(self.root.as_deref(), Some(Node::Data { .. }));
        if root_is_data {
            let root = self.root.take().expect("data root present");
            let node = Arc::try_unwrap(root).unwrap_or_else(|shared| shared.as_ref().clone());
            let Node::Data { value, .. } = node else {
                unreachable!()
            };
            self.len = 0;
            return Some(value);
        }
        let root = self.root.as_mut()?;
        let value = Arc::make_mut(root).remove(hash, 0, key)?;
        self.len -= 1;
        self.shrink_root();
        Some(value)
    }

    /// Exclusive access to the value under `key`, copying shared nodes
    /// along the hash path first.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = hashing::trie_hash(key);
        self.dirty();
        self.root
            .as_mut()
            .and_then(|root| Arc::make_mut(root).get_mut(hash, 0, key))
    }

    /// Persistent insert: a map with the entry added or replaced.
    pub fn update(&self, key: K, value: V) -> Self {
        let mut out = self.clone();
        out.insert(key, value);
        out
    }

    /// Persistent remove: a map without `key`. Removing an absent key
    /// returns a map sharing this root.
    pub fn without<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut out = self.clone();
        out.remove(key);
        out
    }

    /// Rewrites the entry for `key` through `f`: the closure receives
    /// the current value (if any) and returns the new value, or `None`
    /// to remove the entry. Absent in, `None` out is a no-op.
    pub fn alter<F>(&mut self, key: K, f: F)
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let current = self.get(&key).cloned();
        let had_entry = current.is_some();
        match f(current) {
            Some(value) => {
                self.insert(key, value);
            }
            None if had_entry => {
                self.remove(&key);
            }
            None => {}
        }
    }

    /// Returns the value for `key`, inserting `default()` first when
    /// the key is absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, default: F) -> &V
    where
        F: FnOnce() -> V,
    {
        if !self.contains_key(&key) {
            let value = default();
            self.insert(key.clone(), value);
        }
        self.get(&key).expect("entry just ensured")
    }

    /// Adds every entry of `other`, replacing on key conflicts.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.insert(key.clone(), value.clone());
        }
    }

    /// Keeps only the entries satisfying `pred`.
    pub fn retain<F>(&mut self, mut pred: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .iter()
            .filter(|&(k, v)| !pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
    }

    pub fn clear(&mut self) {
        self.dirty();
        self.root = None;
        self.len = 0;
    }

    /// Collapses a root reduced to a single entry back to a data node
    /// and drops an emptied root.
    fn shrink_root(&mut self) {
        let replacement = match self.root.as_deref() {
            Some(Node::Sparse(b)) if b.children.is_empty() && b.pairs.is_empty() => Some(None),
            Some(Node::Sparse(b)) if b.children.is_empty() && b.pairs.len() == 1 => {
                let (key, value) = b.pairs[0].clone();
                let hash = hashing::trie_hash(&key);
                Some(Some(Arc::new(Node::Data { hash, key, value })))
            }
            Some(Node::Collision(c)) if c.entries.len() == 1 => {
                let (key, value) = c.entries[0].clone();
                Some(Some(Arc::new(Node::Data {
                    hash: c.hash,
                    key,
                    value,
                })))
            }
            _ => None,
        };
        if let Some(root) = replacement {
            self.root = root;
        }
    }
}

impl<K, V> Default for HashMap<K, V> {
    fn default() -> Self {
        HashMap::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for HashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Eq + Hash, V: PartialEq> PartialEq for HashMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        if self.ptr_eq(other) {
            return true;
        }
        self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Eq + Hash, V: Eq> Eq for HashMap<K, V> {}

impl<K: Hash, V: Hash> Hash for HashMap<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let content = *self.hash.get_or_init(|| {
            // Order-independent fold: mix each entry, xor the results.
            let mut acc = 0u64;
            for (k, v) in self.iter() {
                acc ^= hashing::avalanche(
                    hashing::hash_one(k) ^ hashing::hash_one(v).rotate_left(32),
                );
            }
            hashing::avalanche(acc ^ self.len as u64)
        });
        state.write_u64(content);
    }
}

impl<K: Eq + Hash + Clone, V: Clone> FromIterator<(K, V)> for HashMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HashMap::new();
        map.extend(iter);
        map
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Extend<(K, V)> for HashMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> From<std::collections::HashMap<K, V>> for HashMap<K, V> {
    fn from(map: std::collections::HashMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

impl<'a, K, V> IntoIterator for &'a HashMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

#[cfg(test)]
impl<K: Eq + Hash + Clone, V: Clone> HashMap<K, V> {
    fn check(&self) {
        match self.root.as_deref() {
            None => assert_eq!(self.len, 0),
            Some(root) => {
                root.check_invariants(0, 0);
                assert_eq!(root.entry_count(), self.len);
            }
        }
    }
}
