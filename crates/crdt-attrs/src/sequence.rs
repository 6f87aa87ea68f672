use std::collections::{BTreeMap, BTreeSet};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::clock::{Clock, ItemId, VersionVector};
use crate::version::{self, CodecError, PayloadKind};
use crate::Crdt;

/// Map from parent id to the ids inserted directly after it.
type ChildrenMap<'a> = BTreeMap<Option<&'a ItemId>, Vec<&'a ItemId>>;

/// Error raised by positional access to a [`Sequence`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    /// The addressed run does not fit inside the live sequence.
    #[error("range {index}..{index}+{count} out of bounds for length {len}")]
    OutOfRange {
        /// First addressed position.
        index: usize,
        /// Number of addressed positions.
        count: usize,
        /// Live length at the time of the call.
        len: usize,
    },
}

/// A Replicated Growable Array: the ordered sequence CRDT everything else
/// in this crate is built on.
///
/// Each element gets a unique [`ItemId`] from the caller's [`Clock`] and
/// remembers the element it was inserted after. Deleting an element only
/// tombstones it, so the element keeps anchoring later inserts and merges
/// keep agreeing on where everything goes. Tombstones are never dropped by
/// the sequence itself; the only way to shed them is to build a fresh
/// sequence from a live snapshot.
///
/// # Example
///
/// ```
/// use crdt_attrs::clock::Clock;
/// use crdt_attrs::{Crdt, Sequence};
///
/// let mut clock_a = Clock::new("a");
/// let mut list_a = Sequence::new();
/// list_a.push_batch(&mut clock_a, ['H', 'i']);
///
/// let mut clock_b = Clock::new("b");
/// let mut list_b = Sequence::new();
/// list_b.push_batch(&mut clock_b, ['!']);
///
/// list_a.merge(&list_b);
/// list_b.merge(&list_a);
///
/// assert_eq!(list_a.to_vec(), list_b.to_vec());
/// assert_eq!(list_a.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "SequenceState<T>",
    bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de> + Clone")
)]
pub struct Sequence<T: Clone> {
    nodes: BTreeMap<ItemId, Node<T>>,
    tombstones: BTreeSet<ItemId>,
    /// Linear order of live nodes. Derived from `nodes` and `tombstones`.
    #[serde(skip)]
    live: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Node<T> {
    value: T,
    /// The node this one was inserted after; `None` for a head insert.
    parent: Option<ItemId>,
}

/// Wire shape of a sequence, without the derived live order.
#[derive(Deserialize)]
struct SequenceState<T> {
    nodes: BTreeMap<ItemId, Node<T>>,
    tombstones: BTreeSet<ItemId>,
}

impl<T: Clone> From<SequenceState<T>> for Sequence<T> {
    fn from(state: SequenceState<T>) -> Self {
        let mut seq = Self {
            nodes: state.nodes,
            tombstones: state.tombstones,
            live: Vec::new(),
        };
        seq.rebuild_order();
        seq
    }
}

impl<T: Clone> Default for Sequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Sequence<T> {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            live: Vec::new(),
        }
    }

    /// Insert `items` as one contiguous run so that the first of them ends
    /// up at live position `index`.
    ///
    /// Returns the ids assigned to the inserted items, in order. Fails
    /// without side effects if `index > len()`.
    pub fn insert_batch(
        &mut self,
        clock: &mut Clock,
        index: usize,
        items: impl IntoIterator<Item = T>,
    ) -> Result<Vec<ItemId>, SequenceError> {
        if index > self.live.len() {
            return Err(SequenceError::OutOfRange {
                index,
                count: 0,
                len: self.live.len(),
            });
        }

        let parent = index.checked_sub(1).map(|i| self.live[i].clone());
        Ok(self.insert_run(clock, parent, items))
    }

    /// Append `items` as one contiguous run at the end.
    pub fn push_batch(
        &mut self,
        clock: &mut Clock,
        items: impl IntoIterator<Item = T>,
    ) -> Vec<ItemId> {
        let parent = self.live.last().cloned();
        self.insert_run(clock, parent, items)
    }

    /// Tombstone `count` live elements starting at live position `index`.
    ///
    /// The whole run is validated before anything is removed: an
    /// out-of-range call leaves the sequence untouched.
    pub fn delete_range(&mut self, index: usize, count: usize) -> Result<(), SequenceError> {
        let len = self.live.len();
        match index.checked_add(count) {
            Some(end) if end <= len => {}
            _ => return Err(SequenceError::OutOfRange { index, count, len }),
        }
        if count == 0 {
            return Ok(());
        }

        for id in self.live.drain(index..index + count) {
            self.tombstones.insert(id);
        }
        Ok(())
    }

    /// Get the element at live position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.live
            .get(index)
            .and_then(|id| self.nodes.get(id))
            .map(|node| &node.value)
    }

    /// Number of live (non-tombstoned) elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether there are no live elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of tombstoned elements retained for merging.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Iterate over live elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.live
            .iter()
            .filter_map(move |id| self.nodes.get(id).map(|node| &node.value))
    }

    /// Iterate over live elements together with their identities.
    pub fn iter_with_ids(&self) -> impl Iterator<Item = (&ItemId, &T)> {
        self.live
            .iter()
            .filter_map(move |id| self.nodes.get(id).map(|node| (id, &node.value)))
    }

    /// Iterate over tombstoned elements with their identities, in id order.
    pub fn iter_removed(&self) -> impl Iterator<Item = (&ItemId, &T)> {
        self.tombstones
            .iter()
            .filter_map(move |id| self.nodes.get(id).map(|node| (id, &node.value)))
    }

    /// Identities of live elements, in order.
    #[must_use]
    pub fn ids(&self) -> &[ItemId] {
        &self.live
    }

    /// Collect live elements into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Every identity this sequence has ever held, live or tombstoned.
    #[must_use]
    pub fn version_vector(&self) -> VersionVector {
        self.nodes.keys().collect()
    }

    /// Highest Lamport counter among all nodes, or 0 if empty.
    #[must_use]
    pub fn max_counter(&self) -> u64 {
        self.nodes.keys().map(|id| id.counter).max().unwrap_or(0)
    }

    /// Chain `items` after `parent`, each one anchored on its predecessor.
    fn insert_run(
        &mut self,
        clock: &mut Clock,
        mut parent: Option<ItemId>,
        items: impl IntoIterator<Item = T>,
    ) -> Vec<ItemId> {
        let mut inserted = Vec::new();
        for value in items {
            let id = clock.next();
            self.nodes.insert(
                id.clone(),
                Node {
                    value,
                    parent: parent.replace(id.clone()),
                },
            );
            inserted.push(id);
        }

        if !inserted.is_empty() {
            self.rebuild_order();
        }
        inserted
    }

    /// Rebuild the linear order from the insertion tree.
    ///
    /// Nodes are grouped by parent and walked depth first from the head.
    /// Siblings are visited highest id first, so that of two inserts at the
    /// same position the causally later (or, if concurrent, the one with
    /// the larger id) comes first on every replica.
    fn rebuild_order(&mut self) {
        let mut children: ChildrenMap<'_> = BTreeMap::new();
        for (id, node) in &self.nodes {
            children.entry(node.parent.as_ref()).or_default().push(id);
        }

        let mut live = Vec::with_capacity(self.nodes.len().saturating_sub(self.tombstones.len()));
        let mut stack: Vec<&ItemId> = Vec::new();

        // BTreeMap iteration yields siblings in ascending order; pushing them
        // as-is means the highest id is popped first.
        if let Some(roots) = children.get(&None) {
            stack.extend(roots.iter().copied());
        }
        while let Some(id) = stack.pop() {
            if !self.tombstones.contains(id) {
                live.push(id.clone());
            }
            if let Some(kids) = children.get(&Some(id)) {
                stack.extend(kids.iter().copied());
            }
        }

        self.live = live;
    }
}

impl<T: Clone + Serialize + DeserializeOwned> Sequence<T> {
    /// Encode the full replicated state (tombstones included) as an update.
    pub fn export_update(&self) -> Result<Vec<u8>, CodecError> {
        version::encode(PayloadKind::Sequence, self)
    }

    /// Merge an update produced by [`export_update`](Self::export_update)
    /// on any replica. Applying the same update again has no effect.
    pub fn merge_update(&mut self, clock: &mut Clock, payload: &[u8]) -> Result<(), CodecError> {
        let remote: Self = version::decode(PayloadKind::Sequence, payload)?;
        clock.observe(remote.max_counter());
        self.merge(&remote);
        Ok(())
    }
}

impl<T: Clone> Crdt for Sequence<T> {
    fn merge(&mut self, other: &Self) {
        let mut changed = false;
        for (id, node) in &other.nodes {
            if !self.nodes.contains_key(id) {
                self.nodes.insert(id.clone(), node.clone());
                changed = true;
            }
        }
        for id in &other.tombstones {
            changed |= self.tombstones.insert(id.clone());
        }

        if changed {
            self.rebuild_order();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_of<T: Clone>(clock: &mut Clock, items: impl IntoIterator<Item = T>) -> Sequence<T> {
        let mut seq = Sequence::new();
        seq.push_batch(clock, items);
        seq
    }

    #[test]
    fn new_sequence_is_empty() {
        let seq = Sequence::<String>::new();
        assert!(seq.is_empty());
        assert_eq!(seq.len(), 0);
        assert_eq!(seq.get(0), None);
    }

    #[test]
    fn push_batch_keeps_order() {
        let mut clock = Clock::new("a");
        let seq = seq_of(&mut clock, [1, 2, 3]);
        assert_eq!(seq.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn insert_batch_in_middle_stays_contiguous() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, ['a', 'd']);
        seq.insert_batch(&mut clock, 1, ['b', 'c']).unwrap();
        assert_eq!(seq.to_vec(), vec!['a', 'b', 'c', 'd']);
    }

    #[test]
    fn insert_batch_at_head() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, ['c']);
        seq.insert_batch(&mut clock, 0, ['a', 'b']).unwrap();
        assert_eq!(seq.to_vec(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn insert_batch_out_of_range_is_rejected() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, ['x']);
        let err = seq.insert_batch(&mut clock, 5, ['y']).unwrap_err();
        assert_eq!(
            err,
            SequenceError::OutOfRange {
                index: 5,
                count: 0,
                len: 1
            }
        );
        assert_eq!(seq.to_vec(), vec!['x']);
    }

    #[test]
    fn delete_range_tombstones_run() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, [10, 20, 30, 40]);
        seq.delete_range(1, 2).unwrap();
        assert_eq!(seq.to_vec(), vec![10, 40]);
        assert_eq!(seq.tombstone_count(), 2);

        let removed: Vec<i32> = seq.iter_removed().map(|(_, v)| *v).collect();
        assert_eq!(removed, vec![20, 30]);
    }

    #[test]
    fn delete_range_out_of_range_leaves_sequence_untouched() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, [1, 2, 3]);
        let before = seq.clone();

        assert!(seq.delete_range(2, 2).is_err());
        assert!(seq.delete_range(usize::MAX, 2).is_err());
        assert_eq!(seq, before);
    }

    #[test]
    fn delete_zero_items_is_a_no_op() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, [1]);
        seq.delete_range(1, 0).unwrap();
        assert_eq!(seq.to_vec(), vec![1]);
        assert_eq!(seq.tombstone_count(), 0);
    }

    #[test]
    fn insert_after_tombstone_anchors_correctly() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, ['a', 'b', 'c']);
        seq.delete_range(1, 1).unwrap();
        seq.insert_batch(&mut clock, 1, ['x']).unwrap();
        assert_eq!(seq.to_vec(), vec!['a', 'x', 'c']);
    }

    #[test]
    fn ids_follow_live_order() {
        let mut clock = Clock::new("a");
        let seq = seq_of(&mut clock, ["x", "y"]);
        let pairs: Vec<(u64, &str)> = seq
            .iter_with_ids()
            .map(|(id, v)| (id.counter, *v))
            .collect();
        assert_eq!(pairs, vec![(1, "x"), (2, "y")]);
        assert_eq!(seq.ids().len(), 2);
    }

    // --- Merge tests ---

    #[test]
    fn merge_concurrent_appends_converges() {
        let mut clock_a = Clock::new("a");
        let base = seq_of(&mut clock_a, ['H', 'e']);

        let mut clock_b = Clock::new("b");
        clock_b.observe(base.max_counter());

        let mut left = base.clone();
        left.push_batch(&mut clock_a, ['X']);
        let mut right = base.clone();
        right.push_batch(&mut clock_b, ['Y']);

        let mut lr = left.clone();
        lr.merge(&right);
        let mut rl = right.clone();
        rl.merge(&left);

        assert_eq!(lr.to_vec(), rl.to_vec());
        assert_eq!(lr.len(), 4);
        assert_eq!(&lr.to_vec()[..2], &['H', 'e']);
    }

    #[test]
    fn merge_applies_remote_deletions() {
        let mut clock_a = Clock::new("a");
        let mut left = seq_of(&mut clock_a, ['a', 'b', 'c']);

        let mut clock_b = Clock::new("b");
        clock_b.observe(left.max_counter());
        let mut right = left.clone();

        left.delete_range(1, 1).unwrap();
        right.push_batch(&mut clock_b, ['d']);

        left.merge(&right);
        assert_eq!(left.to_vec(), vec!['a', 'c', 'd']);
    }

    #[test]
    fn concurrent_delete_of_same_element_collapses() {
        let mut clock = Clock::new("a");
        let mut left = seq_of(&mut clock, ['x', 'y']);
        let mut right = left.clone();

        left.delete_range(0, 1).unwrap();
        right.delete_range(0, 1).unwrap();

        left.merge(&right);
        assert_eq!(left.to_vec(), vec!['y']);
        assert_eq!(left.tombstone_count(), 1);
    }

    #[test]
    fn merge_is_associative() {
        let mut r1 = seq_of(&mut Clock::new("a"), ['A']);
        let r2 = seq_of(&mut Clock::new("b"), ['B']);
        let r3 = seq_of(&mut Clock::new("c"), ['C']);

        let mut left = r1.clone();
        left.merge(&r2);
        left.merge(&r3);

        let mut r2_r3 = r2.clone();
        r2_r3.merge(&r3);
        r1.merge(&r2_r3);

        assert_eq!(left.to_vec(), r1.to_vec());
    }

    #[test]
    fn merge_self_is_idempotent() {
        let mut clock = Clock::new("a");
        let mut seq = seq_of(&mut clock, [1, 2, 3]);
        seq.delete_range(0, 1).unwrap();

        let snapshot = seq.clone();
        seq.merge(&snapshot);
        assert_eq!(seq, snapshot);
    }

    #[test]
    fn local_insert_before_concurrent_sibling_keeps_position() {
        // A later local insert at the same spot must land before the earlier
        // one, even when the earlier one came from a "larger" actor name.
        let mut clock_z = Clock::new("z");
        let mut seq = seq_of(&mut clock_z, ['a', 'c']);

        let mut clock_b = Clock::new("b");
        clock_b.observe(seq.max_counter());
        seq.insert_batch(&mut clock_b, 1, ['b']).unwrap();

        assert_eq!(seq.to_vec(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn export_then_merge_update_round_trips_state() {
        let mut clock_a = Clock::new("a");
        let mut seq = seq_of(&mut clock_a, ["w".to_string(), "h".to_string()]);
        seq.delete_range(0, 1).unwrap();

        let payload = seq.export_update().unwrap();

        let mut clock_b = Clock::new("b");
        let mut replica: Sequence<String> = Sequence::new();
        replica.merge_update(&mut clock_b, &payload).unwrap();

        assert_eq!(replica, seq);
        assert_eq!(replica.tombstone_count(), 1);
        assert_eq!(clock_b.counter(), 2);
    }

    #[test]
    fn merge_update_twice_is_idempotent() {
        let mut clock_a = Clock::new("a");
        let remote = seq_of(&mut clock_a, [7u32, 8]);
        let payload = remote.export_update().unwrap();

        let mut clock_b = Clock::new("b");
        let mut local = seq_of(&mut clock_b, [1u32]);
        local.merge_update(&mut clock_b, &payload).unwrap();
        let once = local.clone();
        local.merge_update(&mut clock_b, &payload).unwrap();

        assert_eq!(local, once);
    }
}
