//! K-bucket: a bounded binary search tree of records keyed by NodeId.
//!
//! Tree nodes live in an arena (`Vec`) and link to their children by index.
//! The first record inserted becomes the tree root, and the root's id is what
//! the routing ring sorts buckets by.

use crate::dht::{Distance, Keyed, NodeId};
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct TreeNode<R> {
    record: R,
    left: Option<usize>,
    right: Option<usize>,
}

/// Bounded container of up to `capacity` records.
#[derive(Debug, Clone)]
pub struct KBucket<R> {
    nodes: Vec<TreeNode<R>>,
    root: Option<usize>,
    capacity: usize,
}

impl<R: Keyed> KBucket<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            root: None,
            capacity,
        }
    }

    /// Builds a bucket by inserting `records` in iteration order.
    pub fn with_records(capacity: usize, records: impl IntoIterator<Item = R>) -> Self {
        let mut bucket = Self::new(capacity);
        for record in records {
            bucket.add(record);
        }
        bucket
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    /// The record at the root of the tree.
    pub fn root(&self) -> Option<&R> {
        self.root.map(|idx| &self.nodes[idx].record)
    }

    pub fn root_id(&self) -> Option<&NodeId> {
        self.root().map(|record| record.key())
    }

    /// Inserts `record` by BST descent. Returns `false` and leaves the
    /// existing entry untouched when the id is already present.
    pub fn add(&mut self, record: R) -> bool {
        let key = *record.key();
        let mut current = match self.root {
            Some(idx) => idx,
            None => {
                self.root = Some(self.push(record));
                return true;
            }
        };

        loop {
            let current_key = *self.nodes[current].record.key();
            if key < current_key {
                match self.nodes[current].left {
                    Some(left) => current = left,
                    None => {
                        let idx = self.push(record);
                        self.nodes[current].left = Some(idx);
                        return true;
                    }
                }
            } else if key > current_key {
                match self.nodes[current].right {
                    Some(right) => current = right,
                    None => {
                        let idx = self.push(record);
                        self.nodes[current].right = Some(idx);
                        return true;
                    }
                }
            } else {
                return false;
            }
        }
    }

    fn push(&mut self, record: R) -> usize {
        self.nodes.push(TreeNode {
            record,
            left: None,
            right: None,
        });
        self.nodes.len() - 1
    }

    fn locate(&self, id: &NodeId) -> Option<usize> {
        let mut current = self.root;
        while let Some(idx) = current {
            let key = self.nodes[idx].record.key();
            current = if id < key {
                self.nodes[idx].left
            } else if id > key {
                self.nodes[idx].right
            } else {
                return Some(idx);
            };
        }
        None
    }

    /// Exact match by BST descent.
    pub fn find(&self, id: &NodeId) -> Option<&R> {
        self.locate(id).map(|idx| &self.nodes[idx].record)
    }

    pub fn find_mut(&mut self, id: &NodeId) -> Option<&mut R> {
        self.locate(id).map(move |idx| &mut self.nodes[idx].record)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.locate(id).is_some()
    }

    /// Refreshes the last-seen time of an existing entry.
    pub fn touch(&mut self, id: &NodeId, now: u64) -> bool {
        match self.find_mut(id) {
            Some(record) => {
                record.touch(now);
                true
            }
            None => false,
        }
    }

    /// Removes the entry with `id`. The remaining records are re-inserted in
    /// pre-order, which keeps the rest of the tree shape intact.
    pub fn delete(&mut self, id: &NodeId) -> Option<R> {
        let target = self.locate(id)?;
        let order = self.preorder_indices();

        let mut slots: Vec<Option<R>> = std::mem::take(&mut self.nodes)
            .into_iter()
            .map(|node| Some(node.record))
            .collect();
        self.root = None;

        let removed = slots[target].take();
        for idx in order {
            if let Some(record) = slots[idx].take() {
                self.add(record);
            }
        }
        removed
    }

    /// Walks the single downward path from the root (left child when there
    /// is one, right otherwise) and returns the visited record closest to
    /// `target`. This is not a minimum over the whole tree; use
    /// [`KBucket::find_alpha_closest`] for an exact ranking.
    pub fn find_closest(&self, target: &NodeId) -> Option<&R> {
        let mut current = self.root?;
        let mut best: Option<(Distance, usize)> = None;

        loop {
            let distance = self.nodes[current].record.key().distance(target);
            if best.map_or(true, |(best_distance, _)| distance < best_distance) {
                best = Some((distance, current));
            }

            let node = &self.nodes[current];
            match node.left.or(node.right) {
                Some(next) => current = next,
                None => break,
            }
        }

        best.map(|(_, idx)| &self.nodes[idx].record)
    }

    /// Up to `alpha` records ranked by true XOR distance to `target`,
    /// selected by repeated scan-and-remove over the in-order list.
    pub fn find_alpha_closest(&self, target: &NodeId, alpha: usize) -> Vec<&R> {
        let mut candidates = self.inorder();
        let mut closest = Vec::with_capacity(alpha.min(candidates.len()));

        while closest.len() < alpha {
            let nearest = candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, record)| record.key().distance(target))
                .map(|(pos, _)| pos);

            match nearest {
                Some(pos) => closest.push(candidates.remove(pos)),
                None => break,
            }
        }

        closest
    }

    /// The least recently seen entry.
    pub fn oldest(&self) -> Option<&R> {
        let records = self.inorder();
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = records
            .iter()
            .enumerate()
            .map(|(pos, record)| Reverse((record.last_seen(), pos)))
            .collect();

        heap.pop().map(|Reverse((_, pos))| records[pos])
    }

    /// Splits the in-order sequence at the median into two new buckets.
    /// Each half is re-rooted at its own median; the remaining records are
    /// shuffled before insertion. Returns `None` for fewer than two records.
    pub fn split(&self) -> Option<(KBucket<R>, KBucket<R>)> {
        if self.size() < 2 {
            return None;
        }

        let mut lower: Vec<R> = self.inorder().into_iter().cloned().collect();
        let upper = lower.split_off(lower.len() / 2);

        Some((
            Self::rooted_at_median(self.capacity, lower),
            Self::rooted_at_median(self.capacity, upper),
        ))
    }

    fn rooted_at_median(capacity: usize, mut records: Vec<R>) -> Self {
        let head = records.remove(records.len() / 2);
        records.shuffle(&mut rand::thread_rng());

        let mut bucket = Self::new(capacity);
        bucket.add(head);
        for record in records {
            bucket.add(record);
        }
        bucket
    }

    /// Height of the tree; `None` when empty, `Some(0)` for a lone root.
    pub fn height(&self) -> Option<usize> {
        fn depth<R>(nodes: &[TreeNode<R>], idx: Option<usize>) -> isize {
            match idx {
                None => -1,
                Some(i) => 1 + depth(nodes, nodes[i].left).max(depth(nodes, nodes[i].right)),
            }
        }

        let height = depth(&self.nodes, self.root);
        usize::try_from(height).ok()
    }

    pub fn min(&self) -> Option<&R> {
        let mut current = self.root?;
        while let Some(left) = self.nodes[current].left {
            current = left;
        }
        Some(&self.nodes[current].record)
    }

    pub fn max(&self) -> Option<&R> {
        let mut current = self.root?;
        while let Some(right) = self.nodes[current].right {
            current = right;
        }
        Some(&self.nodes[current].record)
    }

    fn preorder_indices(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(idx) = stack.pop() {
            order.push(idx);
            // Right first so the left subtree is visited first.
            stack.extend(self.nodes[idx].right);
            stack.extend(self.nodes[idx].left);
        }
        order
    }

    pub fn preorder(&self) -> Vec<&R> {
        self.preorder_indices()
            .into_iter()
            .map(|idx| &self.nodes[idx].record)
            .collect()
    }

    pub fn inorder(&self) -> Vec<&R> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::new();
        let mut current = self.root;

        while current.is_some() || !stack.is_empty() {
            while let Some(idx) = current {
                stack.push(idx);
                current = self.nodes[idx].left;
            }
            if let Some(idx) = stack.pop() {
                order.push(&self.nodes[idx].record);
                current = self.nodes[idx].right;
            }
        }
        order
    }

    pub fn postorder(&self) -> Vec<&R> {
        fn walk<'a, R>(nodes: &'a [TreeNode<R>], idx: Option<usize>, out: &mut Vec<&'a R>) {
            if let Some(i) = idx {
                walk(nodes, nodes[i].left, out);
                walk(nodes, nodes[i].right, out);
                out.push(&nodes[i].record);
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        walk(&self.nodes, self.root, &mut order);
        order
    }

    /// Consumes the bucket, yielding records in ascending id order.
    pub fn into_sorted(self) -> Vec<R> {
        let mut records: Vec<R> = self.nodes.into_iter().map(|node| node.record).collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }
}
