use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use crate::bits::{flag, frag, index_below, BITS};
use crate::hashing;

/// Child-count threshold separating the Sparse and Array bitmap
/// variants. The two layouts are identical; crossing the threshold only
/// retags the node.
pub(crate) const SPARSE_MAX_CHILDREN: usize = 8;

/// Hash bits the trie consumes before falling back to collision
/// buckets.
const HASH_BITS: usize = 32;

/// One node of the CHAMP trie. Interior edges are `Arc`s: a node is
/// mutated in place exactly while the running operation is its sole
/// owner, otherwise `Arc::make_mut` copies it onto the operation's path
/// first.
#[derive(Debug, Clone)]
pub(crate) enum Node<K, V> {
    /// A single entry carrying its full hash. Appears only at the root;
    /// below the root single entries live inline in their parent.
    Data { hash: u32, key: K, value: V },
    /// Bitmap node with at most [`SPARSE_MAX_CHILDREN`] children.
    Sparse(Bitmap<K, V>),
    /// Bitmap node past the threshold.
    Array(Bitmap<K, V>),
    /// Entries whose hashes agree on every fragment.
    Collision(Collision<K, V>),
}

/// The bitmap node body. `data_map` and `node_map` are disjoint bitmaps
/// over the 32 slots; the conceptual content array is split at the
/// pair/child boundary.
#[derive(Debug, Clone)]
pub(crate) struct Bitmap<K, V> {
    pub(crate) data_map: u32,
    pub(crate) node_map: u32,
    /// Inline pairs in ascending slot order, the front of the content.
    pub(crate) pairs: Vec<(K, V)>,
    /// Child nodes in reverse slot order, the back of the content:
    /// child `i` (ascending slot order) lives at
    /// `children[children.len() - 1 - i]`.
    pub(crate) children: Vec<Arc<Node<K, V>>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Collision<K, V> {
    pub(crate) hash: u32,
    pub(crate) entries: Vec<(K, V)>,
}

impl<K, V> Default for Bitmap<K, V> {
    fn default() -> Self {
        Bitmap {
            data_map: 0,
            node_map: 0,
            pairs: Vec::new(),
            children: Vec::new(),
        }
    }
}

impl<K, V> Node<K, V> {
    pub(crate) fn get<'a, Q>(&'a self, hash: u32, shift: usize, key: &Q) -> Option<(&'a K, &'a V)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match self {
            Node::Data {
                hash: h,
                key: k,
                value,
            } => {
                if *h == hash && k.borrow() == key {
                    Some((k, value))
                } else {
                    None
                }
            }
            Node::Collision(c) => c.get(hash, key),
            Node::Sparse(b) | Node::Array(b) => b.get(hash, shift, key),
        }
    }

    /// Re-derives the Sparse/Array tag after the child count changed.
    fn retag(&mut self) {
        let swapped = match self {
            Node::Sparse(b) if b.children.len() > SPARSE_MAX_CHILDREN => {
                Some(Node::Array(std::mem::take(b)))
            }
            Node::Array(b) if b.children.len() <= SPARSE_MAX_CHILDREN => {
                Some(Node::Sparse(std::mem::take(b)))
            }
            _ => None,
        };
        if let Some(node) = swapped {
            *self = node;
        }
    }
}

impl<K, V> Node<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Inserts or replaces, returning the displaced value.
    pub(crate) fn insert(&mut self, hash: u32, shift: usize, key: K, value: V) -> Option<V> {
        let displaced = match self {
            Node::Data {
                hash: h,
                key: k,
                value: v,
            } if *k == key => {
                debug_assert_eq!(*h, hash);
                Some(std::mem::replace(v, value))
            }
            Node::Data {
                hash: h,
                key: k,
                value: v,
            } => {
                let merged = merge_entries(shift, *h, k.clone(), v.clone(), hash, key, value);
                *self = merged;
                None
            }
            Node::Collision(c) => c.insert(key, value),
            Node::Sparse(b) | Node::Array(b) => b.insert(hash, shift, key, value),
        };
        self.retag();
        displaced
    }

    /// Exclusive access to the value under `key`, copying shared nodes
    /// along the hash path first.
    pub(crate) fn get_mut<'a, Q>(
        &'a mut self,
        hash: u32,
        shift: usize,
        key: &Q,
    ) -> Option<&'a mut V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match self {
            Node::Data {
                hash: h,
                key: k,
                value,
            } => {
                if *h == hash && (*k).borrow() == key {
                    Some(value)
                } else {
                    None
                }
            }
            Node::Collision(c) => {
                if c.hash != hash {
                    return None;
                }
                c.entries
                    .iter_mut()
                    .find(|(k, _)| k.borrow() == key)
                    .map(|(_, v)| v)
            }
            Node::Sparse(b) | Node::Array(b) => {
                let f = flag(frag(hash, shift));
                if b.data_map & f != 0 {
                    let (k, v) = &mut b.pairs[index_below(b.data_map, f)];
                    if (*k).borrow() == key {
                        Some(v)
                    } else {
                        None
                    }
                } else if b.node_map & f != 0 {
                    let at = b.children.len() - 1 - index_below(b.node_map, f);
                    Arc::make_mut(&mut b.children[at]).get_mut(hash, shift + BITS, key)
                } else {
                    None
                }
            }
        }
    }

    /// Removes `key`, returning its value. The caller guarantees the key
    /// is present somewhere in the tree before descending.
    pub(crate) fn remove<Q>(&mut self, hash: u32, shift: usize, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let removed = match self {
            Node::Data { .. } => unreachable!("data node below the root"),
            Node::Collision(c) => c.remove(key),
            Node::Sparse(b) | Node::Array(b) => b.remove(hash, shift, key),
        };
        self.retag();
        removed
    }
}

impl<K, V> Bitmap<K, V> {
    /// Child at the given ascending node index, resolved from the end
    /// of the content.
    pub(crate) fn child(&self, node_index: usize) -> &Arc<Node<K, V>> {
        &self.children[self.children.len() - 1 - node_index]
    }

    fn child_mut(&mut self, node_index: usize) -> &mut Arc<Node<K, V>> {
        let at = self.children.len() - 1 - node_index;
        &mut self.children[at]
    }

    fn get<'a, Q>(&'a self, hash: u32, shift: usize, key: &Q) -> Option<(&'a K, &'a V)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let f = flag(frag(hash, shift));
        if self.data_map & f != 0 {
            let (k, v) = &self.pairs[index_below(self.data_map, f)];
            if k.borrow() == key {
                Some((k, v))
            } else {
                None
            }
        } else if self.node_map & f != 0 {
            self.child(index_below(self.node_map, f))
                .get(hash, shift + BITS, key)
        } else {
            None
        }
    }
}

impl<K, V> Bitmap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn insert(&mut self, hash: u32, shift: usize, key: K, value: V) -> Option<V> {
        let f = flag(frag(hash, shift));
        if self.data_map & f != 0 {
            let data_index = index_below(self.data_map, f);
            if self.pairs[data_index].0 == key {
                return Some(std::mem::replace(&mut self.pairs[data_index].1, value));
            }
            // Distinct keys share the slot: push both entries one level
            // down and convert the slot to a child reference.
            let (old_key, old_value) = self.pairs.remove(data_index);
            let old_hash = hashing::trie_hash(&old_key);
            let sub = merge_entries(shift + BITS, old_hash, old_key, old_value, hash, key, value);
            self.data_map &= !f;
            self.node_map |= f;
            let node_index = index_below(self.node_map, f);
            let at = self.children.len() - node_index;
            self.children.insert(at, Arc::new(sub));
            None
        } else if self.node_map & f != 0 {
            let node_index = index_below(self.node_map, f);
            Arc::make_mut(self.child_mut(node_index)).insert(hash, shift + BITS, key, value)
        } else {
            self.data_map |= f;
            let data_index = index_below(self.data_map, f);
            self.pairs.insert(data_index, (key, value));
            None
        }
    }

    fn remove<Q>(&mut self, hash: u32, shift: usize, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let f = flag(frag(hash, shift));
        if self.data_map & f != 0 {
            let data_index = index_below(self.data_map, f);
            if self.pairs[data_index].0.borrow() != key {
                return None;
            }
            self.data_map &= !f;
            Some(self.pairs.remove(data_index).1)
        } else if self.node_map & f != 0 {
            let node_index = index_below(self.node_map, f);
            let value =
                Arc::make_mut(self.child_mut(node_index)).remove(hash, shift + BITS, key)?;
            self.inline_collapsed_child(f, node_index);
            Some(value)
        } else {
            None
        }
    }

    /// Promote-and-inline: a child reduced to a single entry is replaced
    /// by an inline pair, flipping its slot from `node_map` to
    /// `data_map`.
    fn inline_collapsed_child(&mut self, f: u32, node_index: usize) {
        let at = self.children.len() - 1 - node_index;
        let single = match self.children[at].as_ref() {
            Node::Sparse(b) => b.children.is_empty() && b.pairs.len() == 1,
            Node::Collision(c) => c.entries.len() == 1,
            _ => false,
        };
        if !single {
            return;
        }
        let child = self.children.remove(at);
        let child = Arc::try_unwrap(child).unwrap_or_else(|shared| shared.as_ref().clone());
        let (k, v) = match child {
            Node::Sparse(mut b) => b.pairs.pop().expect("single-pair bitmap"),
            Node::Collision(mut c) => c.entries.pop().expect("single-entry collision"),
            _ => unreachable!(),
        };
        self.node_map &= !f;
        self.data_map |= f;
        let data_index = index_below(self.data_map, f);
        self.pairs.insert(data_index, (k, v));
    }
}

impl<K, V> Collision<K, V> {
    fn get<'a, Q>(&'a self, hash: u32, key: &Q) -> Option<(&'a K, &'a V)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.hash != hash {
            return None;
        }
        self.entries
            .iter()
            .find(|(k, _)| k.borrow() == key)
            .map(|(k, v)| (k, v))
    }

    fn insert(&mut self, key: K, value: V) -> Option<V>
    where
        K: Eq,
    {
        if let Some((_, v)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(v, value));
        }
        self.entries.push((key, value));
        None
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let at = self.entries.iter().position(|(k, _)| k.borrow() == key)?;
        Some(self.entries.remove(at).1)
    }
}

/// Builds the subtree holding two distinct entries whose hashes agree
/// on every fragment below `shift`, chaining single-child nodes while
/// the fragments keep matching.
fn merge_entries<K, V>(shift: usize, h1: u32, k1: K, v1: V, h2: u32, k2: K, v2: V) -> Node<K, V> {
    if shift >= HASH_BITS {
        debug_assert_eq!(h1, h2);
        return Node::Collision(Collision {
            hash: h1,
            entries: vec![(k1, v1), (k2, v2)],
        });
    }
    let (f1, f2) = (frag(h1, shift), frag(h2, shift));
    if f1 == f2 {
        let sub = merge_entries(shift + BITS, h1, k1, v1, h2, k2, v2);
        return Node::Sparse(Bitmap {
            data_map: 0,
            node_map: flag(f1),
            pairs: Vec::new(),
            children: vec![Arc::new(sub)],
        });
    }
    let pairs = if f1 < f2 {
        vec![(k1, v1), (k2, v2)]
    } else {
        vec![(k2, v2), (k1, v1)]
    };
    Node::Sparse(Bitmap {
        data_map: flag(f1) | flag(f2),
        node_map: 0,
        pairs,
        children: Vec::new(),
    })
}

#[cfg(test)]
impl<K, V> Node<K, V> {
    pub(crate) fn entry_count(&self) -> usize {
        match self {
            Node::Data { .. } => 1,
            Node::Collision(c) => c.entries.len(),
            Node::Sparse(b) | Node::Array(b) => {
                b.pairs.len() + b.children.iter().map(|c| c.entry_count()).sum::<usize>()
            }
        }
    }
}

#[cfg(test)]
impl<K: Hash, V> Node<K, V> {
    /// Deep validation: bitmap/storage coherence, variant thresholds,
    /// hash-path consistency, canonical compression.
    pub(crate) fn check_invariants(&self, shift: usize, prefix: u32) {
        let prefix_mask = if shift >= HASH_BITS {
            u32::MAX
        } else {
            (1u32 << shift) - 1
        };
        match self {
            Node::Data { hash, key, .. } => {
                assert_eq!(shift, 0, "data node below the root");
                assert_eq!(*hash, hashing::trie_hash(key));
            }
            Node::Collision(c) => {
                assert!(shift >= HASH_BITS, "collision bucket above max depth");
                assert!(c.entries.len() >= 2, "degenerate collision bucket");
                assert_eq!(c.hash, prefix, "collision bucket on the wrong path");
                for (k, _) in &c.entries {
                    assert_eq!(hashing::trie_hash(k), c.hash);
                }
            }
            Node::Sparse(b) | Node::Array(b) => {
                assert_eq!(b.data_map & b.node_map, 0, "overlapping bitmaps");
                assert_eq!(b.pairs.len(), b.data_map.count_ones() as usize);
                assert_eq!(b.children.len(), b.node_map.count_ones() as usize);
                if matches!(self, Node::Sparse(_)) {
                    assert!(b.children.len() <= SPARSE_MAX_CHILDREN);
                } else {
                    assert!(b.children.len() > SPARSE_MAX_CHILDREN);
                }
                assert!(self.entry_count() >= 2, "undersized bitmap node");
                let mut pair_cursor = 0;
                for slot in 0..32u32 {
                    let f = flag(slot);
                    if b.data_map & f != 0 {
                        let (k, _) = &b.pairs[pair_cursor];
                        pair_cursor += 1;
                        let h = hashing::trie_hash(k);
                        assert_eq!(h & prefix_mask, prefix, "pair on the wrong path");
                        assert_eq!(frag(h, shift), slot, "pair in the wrong slot");
                    }
                    if b.node_map & f != 0 {
                        let child = b.child(index_below(b.node_map, f));
                        match child.as_ref() {
                            Node::Data { .. } => panic!("data node as a child"),
                            Node::Sparse(cb) if cb.children.is_empty() && cb.pairs.len() <= 1 => {
                                panic!("child should have been inlined")
                            }
                            _ => {}
                        }
                        child.check_invariants(shift + BITS, prefix | (slot << shift));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(hash: u32, key: u32) -> Node<u32, u32> {
        Node::Data {
            hash,
            key,
            value: key,
        }
    }

    #[test]
    fn full_hash_collisions_form_a_bucket() {
        let mut node = data(7, 1);
        assert_eq!(node.insert(7, 0, 2, 2), None);
        assert_eq!(node.entry_count(), 2);
        assert_eq!(node.get(7, 0, &1), Some((&1, &1)));
        assert_eq!(node.get(7, 0, &2), Some((&2, &2)));
        assert_eq!(node.get(7, 0, &3), None);

        // The single-child chain bottoms out in a collision bucket.
        let mut cursor = &node;
        let mut depth = 0;
        loop {
            match cursor {
                Node::Sparse(b) => {
                    assert!(b.pairs.is_empty());
                    assert_eq!(b.children.len(), 1);
                    cursor = b.children[0].as_ref();
                    depth += 1;
                }
                Node::Collision(c) => {
                    assert_eq!(c.entries.len(), 2);
                    assert_eq!(c.hash, 7);
                    break;
                }
                other => panic!("unexpected node {other:?}"),
            }
        }
        assert_eq!(depth, 7);
    }

    #[test]
    fn replacing_a_collision_entry_keeps_the_bucket() {
        let mut node = data(7, 1);
        node.insert(7, 0, 2, 2);
        assert_eq!(node.insert(7, 0, 2, 20), Some(2));
        assert_eq!(node.entry_count(), 2);
        assert_eq!(node.get(7, 0, &2), Some((&2, &20)));
    }

    #[test]
    fn divergent_hashes_split_into_pairs() {
        let mut node = data(0b00001, 1);
        assert_eq!(node.insert(0b00010, 0, 2, 2), None);
        match &node {
            Node::Sparse(b) => {
                assert_eq!(b.data_map, 0b110);
                assert_eq!(b.node_map, 0);
                assert_eq!(b.pairs, vec![(1, 1), (2, 2)]);
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn shared_fragment_chains_one_level() {
        let mut node = data(0, 1);
        node.insert(1 << 5, 0, 2, 2);
        match &node {
            Node::Sparse(b) => {
                assert_eq!(b.node_map, 1);
                assert!(b.pairs.is_empty());
                match b.children[0].as_ref() {
                    Node::Sparse(inner) => {
                        assert_eq!(inner.data_map, 0b11);
                        assert_eq!(inner.pairs, vec![(1, 1), (2, 2)]);
                    }
                    other => panic!("unexpected node {other:?}"),
                }
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn removal_inlines_a_single_entry_child() {
        let mut node = data(0, 1);
        node.insert(1 << 5, 0, 2, 2);
        node.insert(2 << 5, 0, 3, 3);
        assert_eq!(node.entry_count(), 3);

        assert_eq!(node.remove(1 << 5, 0, &2), Some(2));
        assert_eq!(node.entry_count(), 2);
        // Two entries left below the slot: the child node survives.
        assert!(matches!(&node, Node::Sparse(b) if b.node_map == 1));

        assert_eq!(node.remove(2 << 5, 0, &3), Some(3));
        match &node {
            Node::Sparse(b) => {
                assert_eq!(b.data_map, 1);
                assert_eq!(b.node_map, 0);
                assert_eq!(b.pairs, vec![(1, 1)]);
                assert!(b.children.is_empty());
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn removing_a_missing_key_is_a_no_op() {
        let mut node = data(0, 1);
        node.insert(1, 0, 2, 2);
        assert_eq!(node.remove(9 << 5, 0, &9), None);
        assert_eq!(node.remove(1, 0, &9), None);
        assert_eq!(node.entry_count(), 2);
    }

    #[test]
    fn threshold_crossing_retags() {
        let mut node = data(0, 0);
        node.insert(1 << 5, 0, 100, 100);
        for slot in 1..9u32 {
            node.insert(slot, 0, slot, slot);
            node.insert(slot | (1 << 5), 0, slot + 100, slot + 100);
        }
        assert_eq!(node.entry_count(), 18);
        assert!(matches!(&node, Node::Array(_)));

        // Collapsing one slot's child back to an inline pair drops the
        // child count to the threshold and demotes the node.
        assert_eq!(node.remove(8, 0, &8), Some(8));
        assert!(matches!(&node, Node::Sparse(_)));
        assert_eq!(node.get(8 | (1 << 5), 0, &108), Some((&108, &108)));
    }

    #[test]
    fn children_sit_reversed_at_the_end() {
        let mut node = data(1, 1);
        node.insert(1 | (1 << 5), 0, 101, 101);
        node.insert(2, 0, 2, 2);
        node.insert(2 | (1 << 5), 0, 102, 102);
        match &node {
            Node::Sparse(b) => {
                assert_eq!(b.node_map, 0b110);
                // Ascending node index 0 (slot 1) resolves from the end.
                assert!(b.child(0).get(1, 5, &1).is_some());
                assert!(b.child(1).get(2, 5, &2).is_some());
            }
            other => panic!("unexpected node {other:?}"),
        }
    }
}
