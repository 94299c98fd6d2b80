//! Routing ring: k-buckets kept in ascending order of their root ids.
//!
//! The ring partitions the id space. Neighbours are circular, so the last
//! bucket's successor is the first one. The same structure backs both the
//! routing table (peers) and the storage table (file descriptors).

use crate::dht::{KBucket, Keyed, NodeId, PeerRecord, PeerTuple};
use rand::seq::SliceRandom;

/// Result of [`RoutingRing::add_node`].
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome<R> {
    /// The record went into a bucket with spare capacity.
    Inserted,
    /// A record with the same id is already present; nothing changed.
    Duplicate,
    /// The target bucket was full and has been split to make room.
    Split,
    /// The target bucket is full and its oldest entry is stale. The caller
    /// must ping `oldest` and hand the answer to [`RoutingRing::resolve_probe`].
    ProbeOldest { oldest: R, candidate: R },
}

#[derive(Debug, Clone)]
pub struct RoutingRing<R> {
    buckets: Vec<KBucket<R>>,
    k: usize,
    stale_after: Option<u64>,
}

impl<R: Keyed> RoutingRing<R> {
    /// `stale_after` is the age (seconds) past which a full bucket's oldest
    /// entry gets a liveness probe; `None` disables probing.
    pub fn new(k: usize, stale_after: Option<u64>) -> Self {
        Self {
            buckets: Vec::new(),
            k,
            stale_after,
        }
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of records across all buckets.
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(KBucket::size).sum()
    }

    pub fn buckets(&self) -> &[KBucket<R>] {
        &self.buckets
    }

    fn roots(&self) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.root_id().copied())
            .collect()
    }

    /// Inserts a bucket at its sorted position. Empty buckets are dropped,
    /// and a bucket whose root equals an existing root goes after it.
    pub fn insert(&mut self, bucket: KBucket<R>) {
        let root = match bucket.root_id() {
            Some(root) => *root,
            None => return,
        };

        let position = self
            .buckets
            .iter()
            .position(|existing| existing.root_id().map_or(false, |r| *r > root))
            .unwrap_or(self.buckets.len());
        self.buckets.insert(position, bucket);
    }

    /// Removes the first bucket rooted at `root_id`.
    pub fn delete_bucket(&mut self, root_id: &NodeId) -> Option<KBucket<R>> {
        let position = self
            .buckets
            .iter()
            .position(|bucket| bucket.root_id() == Some(root_id))?;
        Some(self.buckets.remove(position))
    }

    /// Walks the ring from its head comparing `target` with each bucket's
    /// root and its successor's root. A target inside `[root, next_root)`
    /// picks the nearer of the two by XOR distance; the wrap-around from
    /// the last bucket to the first is the fallback.
    fn closest_index(&self, target: &NodeId) -> Option<usize> {
        let roots = self.roots();
        let n = roots.len();
        if n == 0 {
            return None;
        }

        for i in 0..n {
            let next = (i + 1) % n;
            let left_distance = roots[i].distance(target);
            let right_distance = roots[next].distance(target);

            if roots[i] <= *target && *target < roots[next] {
                return Some(if left_distance < right_distance { i } else { next });
            }

            if i == n - 1 {
                return Some(if left_distance <= right_distance { i } else { next });
            }
        }

        None
    }

    pub fn find_closest_bucket(&self, target: &NodeId) -> Option<&KBucket<R>> {
        self.closest_index(target).map(|idx| &self.buckets[idx])
    }

    /// The closest record of the closest bucket, per [`KBucket::find_closest`].
    pub fn find_closest(&self, target: &NodeId) -> Option<&R> {
        self.find_closest_bucket(target)
            .and_then(|bucket| bucket.find_closest(target))
    }

    /// Index of the bucket holding `id`: the closest bucket, then its two
    /// ring neighbours, then a full scan.
    fn bucket_index_of(&self, id: &NodeId) -> Option<usize> {
        let closest = self.closest_index(id)?;
        let n = self.buckets.len();
        let neighbours = [closest, (closest + n - 1) % n, (closest + 1) % n];

        neighbours
            .iter()
            .copied()
            .find(|&idx| self.buckets[idx].contains(id))
            .or_else(|| self.buckets.iter().position(|bucket| bucket.contains(id)))
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&R> {
        self.bucket_index_of(id)
            .and_then(|idx| self.buckets[idx].find(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.bucket_index_of(id).is_some()
    }

    /// Refreshes the last-seen time of a known record.
    pub fn touch(&mut self, id: &NodeId, now: u64) -> bool {
        match self.bucket_index_of(id) {
            Some(idx) => self.buckets[idx].touch(id, now),
            None => false,
        }
    }

    /// Adds a record to the closest bucket. A full bucket either asks for a
    /// liveness probe of its stale oldest entry or is split in two.
    pub fn add_node(&mut self, record: R, now: u64) -> AddOutcome<R> {
        self.place(record, true, now)
    }

    /// Completes an [`AddOutcome::ProbeOldest`]. A dead `oldest` is evicted
    /// and the candidate takes its place; a live one keeps its slot and the
    /// bucket splits instead.
    pub fn resolve_probe(&mut self, oldest: &NodeId, candidate: R, alive: bool, now: u64) -> AddOutcome<R> {
        if !alive {
            self.remove_node(oldest);
        }
        self.place(candidate, false, now)
    }

    fn place(&mut self, record: R, allow_probe: bool, now: u64) -> AddOutcome<R> {
        let idx = match self.closest_index(record.key()) {
            Some(idx) => idx,
            None => {
                self.insert(KBucket::with_records(self.k, [record]));
                return AddOutcome::Inserted;
            }
        };

        if self.contains(record.key()) {
            return AddOutcome::Duplicate;
        }

        let bucket = &mut self.buckets[idx];
        if !bucket.is_full() {
            bucket.add(record);
            return AddOutcome::Inserted;
        }

        if allow_probe {
            if let (Some(limit), Some(oldest)) = (self.stale_after, bucket.oldest()) {
                if oldest.is_older_than(limit, now) {
                    return AddOutcome::ProbeOldest {
                        oldest: oldest.clone(),
                        candidate: record,
                    };
                }
            }
        }

        self.split_insert(idx, record);
        AddOutcome::Split
    }

    fn split_insert(&mut self, idx: usize, record: R) {
        let bucket = self.buckets.remove(idx);

        match bucket.split() {
            Some((mut low, mut high)) => {
                let low_distance = low.root_id().map(|root| root.distance(record.key()));
                let high_distance = high.root_id().map(|root| root.distance(record.key()));
                if low_distance < high_distance {
                    low.add(record);
                } else {
                    high.add(record);
                }
                self.insert(low);
                self.insert(high);
            }
            None => {
                // Capacity below two: nothing to split, the bucket just grows.
                let mut bucket = bucket;
                bucket.add(record);
                self.insert(bucket);
            }
        }
    }

    /// Removes a record wherever it lives. Buckets left empty are dropped
    /// and a bucket whose root changed is moved back into sorted position.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<R> {
        let idx = self.bucket_index_of(id)?;
        let mut bucket = self.buckets.remove(idx);
        let removed = bucket.delete(id);
        self.insert(bucket);
        removed
    }

    /// Drops every bucket whose root repeats an earlier bucket's root.
    pub fn remove_duplicates(&mut self) {
        self.buckets.dedup_by(|later, earlier| later.root_id() == earlier.root_id());
    }

    /// Flattens all records, sorts them by id and regroups them into fresh
    /// buckets of `k` (each chunk shuffled before insertion).
    pub fn sort(&self) -> RoutingRing<R> {
        let mut records: Vec<R> = self.list_nodes().into_iter().cloned().collect();
        records.sort_unstable_by(|a, b| a.key().cmp(b.key()));

        let mut ring = RoutingRing::new(self.k, self.stale_after);
        let mut rng = rand::thread_rng();
        for chunk in records.chunks(self.k.max(1)) {
            let mut chunk = chunk.to_vec();
            chunk.shuffle(&mut rng);
            ring.insert(KBucket::with_records(self.k, chunk));
        }
        ring
    }

    /// Bisects the ring by position: the first half stays, the second half
    /// is returned as a new ring. `None` when there is nothing to split.
    pub fn split_list(&mut self) -> Option<RoutingRing<R>> {
        if self.buckets.len() < 2 {
            return None;
        }

        let tail = self.buckets.split_off(self.buckets.len() / 2);
        Some(RoutingRing {
            buckets: tail,
            k: self.k,
            stale_after: self.stale_after,
        })
    }

    /// All records, bucket by bucket in ring order, in-order within a bucket.
    pub fn list_nodes(&self) -> Vec<&R> {
        self.buckets.iter().flat_map(|bucket| bucket.inorder()).collect()
    }

    pub fn is_sorted(&self) -> bool {
        self.roots().windows(2).all(|pair| pair[0] <= pair[1])
    }
}

impl RoutingRing<PeerRecord> {
    /// Wire tuples of every peer, pre-order within each bucket.
    pub fn as_tuples(&self) -> Vec<PeerTuple> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.preorder())
            .map(PeerRecord::to_tuple)
            .collect()
    }
}
