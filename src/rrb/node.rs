use std::sync::Arc;

use arrayvec::ArrayVec;
use itertools::Itertools;

use crate::bits::{BITS, BRANCHING};

/// One node of the RRB-Tree. Leaves hold elements, branches hold
/// children one level down. Interior edges are `Arc`s: a node is
/// mutable in place exactly while the running operation is its sole
/// owner, otherwise `Arc::make_mut` copies it onto the operation's
/// path first.
#[derive(Debug, Clone)]
pub(crate) enum Node<E> {
    Leaf(ArrayVec<E, BRANCHING>),
    Branch(Branch<E>),
}

/// A branch is *strict* while `sizes` is `None`: every non-last child
/// subtree is completely full for its height and plain radix indexing
/// applies. A relaxed branch carries the cumulative size table instead.
#[derive(Debug, Clone)]
pub(crate) struct Branch<E> {
    pub(crate) height: usize,
    pub(crate) count: usize,
    pub(crate) sizes: Option<Vec<usize>>,
    pub(crate) children: ArrayVec<Arc<Node<E>>, BRANCHING>,
}

/// Element capacity of a complete subtree of the given height.
fn full_count(height: usize) -> usize {
    1usize
        .checked_shl((BITS * (height + 1)) as u32)
        .unwrap_or(usize::MAX)
}

fn cumulative<E>(children: &[Arc<Node<E>>]) -> Vec<usize> {
    let mut acc = 0;
    children
        .iter()
        .map(|child| {
            acc += child.len();
            acc
        })
        .collect()
}

impl<E> Node<E> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Leaf(elems) => elems.len(),
            Node::Branch(b) => b.count,
        }
    }

    pub(crate) fn height(&self) -> usize {
        match self {
            Node::Leaf(_) => 0,
            Node::Branch(b) => b.height,
        }
    }

    /// Direct occupancy: elements of a leaf, children of a branch.
    fn slot_count(&self) -> usize {
        match self {
            Node::Leaf(elems) => elems.len(),
            Node::Branch(b) => b.children.len(),
        }
    }

    fn is_dense(&self) -> bool {
        self.len() == full_count(self.height())
    }

    pub(crate) fn get(&self, index: usize) -> &E {
        match self {
            Node::Leaf(elems) => &elems[index],
            Node::Branch(b) => {
                let (slot, sub) = b.position(index);
                b.children[slot].get(sub)
            }
        }
    }
}

impl<E: Clone> Node<E> {
    pub(crate) fn unit(value: E) -> Node<E> {
        let mut elems = ArrayVec::new();
        elems.push(value);
        Node::Leaf(elems)
    }

    pub(crate) fn set(&mut self, index: usize, value: E) -> E {
        match self {
            Node::Leaf(elems) => std::mem::replace(&mut elems[index], value),
            Node::Branch(b) => {
                let (slot, sub) = b.position(index);
                Arc::make_mut(&mut b.children[slot]).set(sub, value)
            }
        }
    }

    /// Exclusive access to one element, copying shared nodes on the way
    /// down.
    pub(crate) fn get_mut(&mut self, index: usize) -> &mut E {
        match self {
            Node::Leaf(elems) => &mut elems[index],
            Node::Branch(b) => {
                let (slot, sub) = b.position(index);
                Arc::make_mut(&mut b.children[slot]).get_mut(sub)
            }
        }
    }

    /// Appends at the very end. Returns a spill node of the same height
    /// when this subtree is full; the parent absorbs it as a sibling.
    pub(crate) fn push_back(&mut self, value: E) -> Option<Node<E>> {
        match self {
            Node::Leaf(elems) => {
                if elems.len() < BRANCHING {
                    elems.push(value);
                    None
                } else {
                    Some(Node::unit(value))
                }
            }
            Node::Branch(b) => {
                let last = b.children.len() - 1;
                match Arc::make_mut(&mut b.children[last]).push_back(value) {
                    None => {
                        b.count += 1;
                        if let Some(sizes) = &mut b.sizes {
                            sizes[last] += 1;
                        }
                        None
                    }
                    Some(spill) => {
                        if b.children.len() < BRANCHING {
                            // A strict branch can only gain a sibling after an
                            // undersized last child by turning relaxed.
                            if b.sizes.is_none() && !b.children[last].is_dense() {
                                b.sizes = Some(cumulative(&b.children));
                            }
                            b.count += spill.len();
                            b.children.push(Arc::new(spill));
                            if let Some(sizes) = &mut b.sizes {
                                sizes.push(b.count);
                            }
                            None
                        } else {
                            Some(Node::Branch(Branch {
                                height: b.height,
                                count: spill.len(),
                                sizes: None,
                                children: std::iter::once(Arc::new(spill)).collect(),
                            }))
                        }
                    }
                }
            }
        }
    }

    /// Prepend counterpart of [`Node::push_back`]. A branch that gains a
    /// front sibling always turns relaxed, its new first child being
    /// undersized.
    pub(crate) fn push_front(&mut self, value: E) -> Option<Node<E>> {
        match self {
            Node::Leaf(elems) => {
                if elems.len() < BRANCHING {
                    elems.insert(0, value);
                    None
                } else {
                    Some(Node::unit(value))
                }
            }
            Node::Branch(b) => {
                match Arc::make_mut(&mut b.children[0]).push_front(value) {
                    None => {
                        // The first child changed size; it may have reached or
                        // left full occupancy, so re-derive the size table.
                        b.reindex();
                        None
                    }
                    Some(spill) => {
                        if b.children.len() < BRANCHING {
                            b.children.insert(0, Arc::new(spill));
                            b.reindex();
                            None
                        } else {
                            Some(Node::Branch(Branch {
                                height: b.height,
                                count: spill.len(),
                                sizes: None,
                                children: std::iter::once(Arc::new(spill)).collect(),
                            }))
                        }
                    }
                }
            }
        }
    }

    /// Removes the last element of a non-empty subtree. Emptied children
    /// are deleted on the way back up; the root is normalized by the
    /// facade.
    pub(crate) fn pop_back(&mut self) -> E {
        match self {
            Node::Leaf(elems) => elems.pop().expect("pop on an empty leaf"),
            Node::Branch(b) => {
                let last = b.children.len() - 1;
                let child = Arc::make_mut(&mut b.children[last]);
                let value = child.pop_back();
                if child.len() == 0 {
                    b.children.pop();
                    b.reindex();
                } else {
                    b.count -= 1;
                    if let Some(sizes) = &mut b.sizes {
                        sizes[last] -= 1;
                    }
                }
                value
            }
        }
    }

    pub(crate) fn pop_front(&mut self) -> E {
        match self {
            Node::Leaf(elems) => {
                if elems.is_empty() {
                    panic!("pop on an empty leaf");
                }
                elems.remove(0)
            }
            Node::Branch(b) => {
                let value = Arc::make_mut(&mut b.children[0]).pop_front();
                if b.children[0].len() == 0 {
                    b.children.remove(0);
                    b.reindex();
                } else {
                    b.count -= 1;
                    if let Some(sizes) = &mut b.sizes {
                        for s in sizes.iter_mut() {
                            *s -= 1;
                        }
                    } else if b.children.len() > 1 {
                        // The first child just went undersized.
                        b.sizes = Some(cumulative(&b.children));
                    }
                }
                value
            }
        }
    }

    /// Removes the element at `index`, deleting the child slot if it
    /// empties and rebuilding the size table of every touched branch.
    pub(crate) fn remove(&mut self, index: usize) -> E {
        match self {
            Node::Leaf(elems) => elems.remove(index),
            Node::Branch(b) => {
                let (slot, sub) = b.position(index);
                let child = Arc::make_mut(&mut b.children[slot]);
                let value = child.remove(sub);
                if child.len() == 0 {
                    b.children.remove(slot);
                }
                b.reindex();
                value
            }
        }
    }

    /// Truncates the subtree to its first `new_len` elements,
    /// `1 <= new_len <= len`.
    pub(crate) fn take(&mut self, new_len: usize) {
        match self {
            Node::Leaf(elems) => elems.truncate(new_len),
            Node::Branch(b) => {
                let (slot, sub) = b.position(new_len - 1);
                b.children.truncate(slot + 1);
                let keep = sub + 1;
                if keep < b.children[slot].len() {
                    Arc::make_mut(&mut b.children[slot]).take(keep);
                }
                b.reindex();
            }
        }
    }

    /// Drops the first `n` elements, `1 <= n < len`.
    pub(crate) fn skip(&mut self, n: usize) {
        match self {
            Node::Leaf(elems) => {
                elems.drain(..n);
            }
            Node::Branch(b) => {
                let (slot, sub) = b.position(n);
                b.children.drain(..slot);
                if sub > 0 {
                    Arc::make_mut(&mut b.children[0]).skip(sub);
                }
                b.reindex();
            }
        }
    }
}

impl<E> Branch<E> {
    pub(crate) fn from_children(
        height: usize,
        children: ArrayVec<Arc<Node<E>>, BRANCHING>,
    ) -> Branch<E> {
        debug_assert!(!children.is_empty());
        let mut branch = Branch {
            height,
            count: 0,
            sizes: None,
            children,
        };
        branch.reindex();
        branch
    }

    /// Locates `index`: the child slot holding it and the index within
    /// that child. Strict branches use pure radix arithmetic; relaxed
    /// branches start from the radix guess (always at or before the true
    /// slot) and advance through the size table.
    pub(crate) fn position(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.count);
        let shift = BITS * self.height;
        match &self.sizes {
            None => (index >> shift, index & ((1usize << shift) - 1)),
            Some(sizes) => {
                let mut slot = index >> shift;
                while sizes[slot] <= index {
                    slot += 1;
                }
                let before = if slot == 0 { 0 } else { sizes[slot - 1] };
                (slot, index - before)
            }
        }
    }

    /// Recomputes `count` and the size table from the children, dropping
    /// the table again when every non-last child is full.
    fn reindex(&mut self) {
        self.count = self.children.iter().map(|c| c.len()).sum();
        let full = full_count(self.height - 1);
        let strict = self
            .children
            .iter()
            .take(self.children.len().saturating_sub(1))
            .all(|c| c.len() == full);
        self.sizes = if strict {
            None
        } else {
            Some(cumulative(&self.children))
        };
    }
}

/// Merges two non-empty trees, preserving element order. The result is
/// a branch one level above the taller input holding one or two
/// children; the caller collapses it while it has a single child.
pub(crate) fn merge<E: Clone>(left: &Arc<Node<E>>, right: &Arc<Node<E>>) -> Branch<E> {
    let (lh, rh) = (left.height(), right.height());
    if lh == 0 && rh == 0 {
        let packed = plan(vec![Arc::clone(left), Arc::clone(right)], 0);
        return branch_of(1, packed);
    }
    if lh > rh {
        let Node::Branch(lb) = left.as_ref() else {
            unreachable!("a leaf cannot out-grow a branch")
        };
        let mid = merge(lb.children.last().expect("branch without children"), right);
        let mut items: Vec<Arc<Node<E>>> = lb.children[..lb.children.len() - 1].to_vec();
        items.extend(mid.children);
        pack_level(items, lh - 1)
    } else if lh < rh {
        let Node::Branch(rb) = right.as_ref() else {
            unreachable!("a leaf cannot out-grow a branch")
        };
        let mid = merge(left, &rb.children[0]);
        let mut items: Vec<Arc<Node<E>>> = mid.children.into_iter().collect();
        items.extend(rb.children[1..].iter().cloned());
        pack_level(items, rh - 1)
    } else {
        let (Node::Branch(lb), Node::Branch(rb)) = (left.as_ref(), right.as_ref()) else {
            unreachable!("equal-height interior nodes must be branches")
        };
        let mid = merge(lb.children.last().expect("branch without children"), &rb.children[0]);
        let mut items: Vec<Arc<Node<E>>> = lb.children[..lb.children.len() - 1].to_vec();
        items.extend(mid.children);
        items.extend(rb.children[1..].iter().cloned());
        pack_level(items, lh - 1)
    }
}

/// Packs a merged level of nodes (all at `item_height`) under one or
/// two parents and lifts them into a branch two levels up.
fn pack_level<E: Clone>(items: Vec<Arc<Node<E>>>, item_height: usize) -> Branch<E> {
    let packed = plan(items, item_height);
    debug_assert!(packed.len() <= 2 * BRANCHING);
    let parents: Vec<Arc<Node<E>>> = packed
        .chunks(BRANCHING)
        .map(|chunk| {
            let children: ArrayVec<Arc<Node<E>>, BRANCHING> = chunk.iter().cloned().collect();
            Arc::new(Node::Branch(Branch::from_children(item_height + 1, children)))
        })
        .collect();
    branch_of(item_height + 2, parents)
}

/// The concat rebalance plan. When the level can be expressed with
/// fewer nodes, its sub-items are redistributed into nodes of exactly
/// `BRANCHING` slots (the last may run short), yielding the minimal
/// `ceil(total / BRANCHING)` outputs. A level that is already minimal
/// is returned untouched so dense merges keep full structural sharing.
fn plan<E: Clone>(items: Vec<Arc<Node<E>>>, item_height: usize) -> Vec<Arc<Node<E>>> {
    let total: usize = items.iter().map(|n| n.slot_count()).sum();
    let optimal = total.div_ceil(BRANCHING);
    if items.len() <= optimal {
        return items;
    }
    if item_height == 0 {
        let chunks = items
            .iter()
            .flat_map(|item| match item.as_ref() {
                Node::Leaf(elems) => elems.iter(),
                Node::Branch(_) => unreachable!("branch among leaves"),
            })
            .cloned()
            .chunks(BRANCHING);
        (&chunks)
            .into_iter()
            .map(|chunk| Arc::new(Node::Leaf(chunk.collect())))
            .collect()
    } else {
        let chunks = items
            .iter()
            .flat_map(|item| match item.as_ref() {
                Node::Branch(b) => b.children.iter(),
                Node::Leaf(_) => unreachable!("leaf among branches"),
            })
            .cloned()
            .chunks(BRANCHING);
        (&chunks)
            .into_iter()
            .map(|chunk| {
                Arc::new(Node::Branch(Branch::from_children(
                    item_height,
                    chunk.collect(),
                )))
            })
            .collect()
    }
}

fn branch_of<E>(height: usize, nodes: impl IntoIterator<Item = Arc<Node<E>>>) -> Branch<E> {
    let mut children: ArrayVec<Arc<Node<E>>, BRANCHING> = ArrayVec::new();
    children.extend(nodes);
    Branch::from_children(height, children)
}

#[cfg(test)]
impl<E> Node<E> {
    /// Deep structural validation, used by the test suites.
    pub(crate) fn check_invariants(&self) {
        match self {
            Node::Leaf(elems) => {
                assert!(!elems.is_empty(), "empty leaf in a live tree");
            }
            Node::Branch(b) => {
                assert!(b.height >= 1);
                assert!(
                    (1..=BRANCHING).contains(&b.children.len()),
                    "branch with {} children",
                    b.children.len()
                );
                let mut total = 0;
                for child in &b.children {
                    assert_eq!(child.height(), b.height - 1, "height skew below a branch");
                    total += child.len();
                    child.check_invariants();
                }
                assert_eq!(total, b.count, "branch count out of sync");
                let full = full_count(b.height - 1);
                match &b.sizes {
                    None => {
                        for child in b.children.iter().take(b.children.len() - 1) {
                            assert_eq!(child.len(), full, "undersized child of a strict branch");
                        }
                    }
                    Some(sizes) => {
                        assert_eq!(sizes.len(), b.children.len());
                        let mut acc = 0;
                        for (child, entry) in b.children.iter().zip(sizes.iter()) {
                            acc += child.len();
                            assert_eq!(acc, *entry, "size table out of sync");
                        }
                        assert_eq!(*sizes.last().unwrap(), b.count);
                        let undersized = b
                            .children
                            .iter()
                            .take(b.children.len() - 1)
                            .any(|c| c.len() != full);
                        assert!(undersized, "relaxed branch with only full children");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(range: std::ops::Range<usize>) -> Arc<Node<usize>> {
        Arc::new(Node::Leaf(range.collect()))
    }

    #[test]
    fn from_children_detects_strictness() {
        let strict = Branch::from_children(1, [leaf(0..32), leaf(32..40)].into_iter().collect());
        assert!(strict.sizes.is_none());
        assert_eq!(strict.count, 40);

        let relaxed = Branch::from_children(1, [leaf(0..8), leaf(8..40)].into_iter().collect());
        assert_eq!(relaxed.sizes, Some(vec![8, 40]));
        assert_eq!(relaxed.count, 40);
    }

    #[test]
    fn position_on_relaxed_branches() {
        let branch = Branch::from_children(
            1,
            [leaf(0..8), leaf(8..20), leaf(20..52)].into_iter().collect(),
        );
        assert_eq!(branch.position(0), (0, 0));
        assert_eq!(branch.position(7), (0, 7));
        assert_eq!(branch.position(8), (1, 0));
        assert_eq!(branch.position(19), (1, 11));
        assert_eq!(branch.position(20), (2, 0));
        assert_eq!(branch.position(51), (2, 31));
    }

    #[test]
    fn plan_leaves_minimal_levels_alone() {
        let items = vec![leaf(0..32), leaf(32..40)];
        let packed = plan(items.clone(), 0);
        assert_eq!(packed.len(), 2);
        assert!(Arc::ptr_eq(&packed[0], &items[0]));
    }

    #[test]
    fn plan_coalesces_undersized_runs() {
        let items = vec![leaf(0..8), leaf(8..16), leaf(16..24), leaf(24..40)];
        let packed = plan(items, 0);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].len(), BRANCHING);
        assert_eq!(packed[1].len(), 8);
    }

    #[test]
    fn merge_of_two_leaves() {
        let merged = Node::Branch(merge(&leaf(0..20), &leaf(20..30)));
        merged.check_invariants();
        assert_eq!(merged.len(), 30);
        for i in 0..30 {
            assert_eq!(*merged.get(i), i);
        }
    }
}
