//! Key-value attribute lists stored in a replicated sequence.
//!
//! An [`AttributeList`] is a [`Sequence`] of [`Entry`] pairs used as a
//! small key-value map (`width`, `height`, ...). Edits go through
//! [`AttributeList::patch`], which deletes every entry for the touched keys
//! and appends the replacements at the tail.
//!
//! Keys are unique after every local patch, but not after a merge: two
//! replicas patching the same key concurrently each append their own entry,
//! and both survive. Readers that want one value per key use
//! [`AttributeList::resolve`] (last entry in sequence order wins).

use std::collections::{BTreeSet, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, ItemId, VersionVector};
use crate::compact::compact_indices;
use crate::sequence::{Sequence, SequenceError};
use crate::Crdt;

/// One `(key, value)` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entry {
    /// Attribute name. Never empty.
    pub key: String,
    /// Attribute value.
    pub value: String,
}

impl Entry {
    /// Build an entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> From<(K, V)> for Entry {
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// Error returned by attribute-list operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    /// A patch named the empty string as a key.
    #[error("attribute keys must not be empty")]
    EmptyKey,
    /// Positional access failed.
    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

/// What a patch does to one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Replace every entry for the key with this value.
    Set(String),
    /// Remove every entry for the key.
    Delete,
}

/// An ordered set of per-key edits applied as one local operation.
///
/// Replacements are appended in insertion order. Setting a key twice keeps
/// its original position and the latest operation.
///
/// ```
/// use crdt_attrs::PatchRequest;
///
/// let request = PatchRequest::new()
///     .set("width", "200")
///     .delete("border");
/// assert_eq!(request.len(), 2);
/// assert!(request.contains_key("border"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRequest {
    ops: IndexMap<String, PatchOp>,
}

impl PatchRequest {
    /// An empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: upsert `key` to `value`.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, PatchOp::Set(value.into()));
        self
    }

    /// Builder: delete `key`.
    #[must_use]
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.insert(key, PatchOp::Delete);
        self
    }

    /// Add or overwrite the operation for `key`.
    pub fn insert(&mut self, key: impl Into<String>, op: PatchOp) {
        self.ops.insert(key.into(), op);
    }

    /// Whether the request touches `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.ops.contains_key(key)
    }

    /// Operation for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PatchOp> {
        self.ops.get(key)
    }

    /// Number of keys touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no keys are touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterate over `(key, op)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PatchOp)> {
        self.ops.iter().map(|(k, op)| (k.as_str(), op))
    }

    /// Entries to append for upserted keys, in insertion order.
    pub fn upserts(&self) -> impl Iterator<Item = Entry> + '_ {
        self.ops.iter().filter_map(|(key, op)| match op {
            PatchOp::Set(value) => Some(Entry::new(key.clone(), value.clone())),
            PatchOp::Delete => None,
        })
    }

    pub(crate) fn validate(&self) -> Result<(), AttributeError> {
        if self.ops.keys().any(String::is_empty) {
            return Err(AttributeError::EmptyKey);
        }
        Ok(())
    }
}

impl<K: Into<String>> FromIterator<(K, PatchOp)> for PatchRequest {
    fn from_iter<I: IntoIterator<Item = (K, PatchOp)>>(iter: I) -> Self {
        let mut request = Self::new();
        for (key, op) in iter {
            request.insert(key, op);
        }
        request
    }
}

impl<K: Into<String>> FromIterator<(K, Option<String>)> for PatchRequest {
    /// `None` values become deletes.
    fn from_iter<I: IntoIterator<Item = (K, Option<String>)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(key, value)| (key, value.map_or(PatchOp::Delete, PatchOp::Set)))
            .collect()
    }
}

/// Whether a list currently maps every key to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Every key appears at most once.
    Unique,
    /// At least one key appears more than once, typically after merging a
    /// concurrent patch of the same key. Valid data, not an error.
    Ambiguous,
}

/// Tombstone-free copy of a list's live entries, used to seed a
/// replacement list. Carries no causal link to its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionSnapshot {
    entries: Vec<Entry>,
    seen: VersionVector,
    copied: BTreeSet<ItemId>,
}

impl CompactionSnapshot {
    /// Live entries at the time of the snapshot, in order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Every identity the source list held when the snapshot was taken.
    #[must_use]
    pub fn seen(&self) -> &VersionVector {
        &self.seen
    }

    /// Identities of the source entries the snapshot copied.
    #[must_use]
    pub fn copied(&self) -> &BTreeSet<ItemId> {
        &self.copied
    }

    /// Build a brand-new list holding the snapshot's entries as one batch.
    pub fn into_list(self, clock: &mut Clock) -> AttributeList {
        AttributeList::with_entries(clock, self.entries)
    }
}

/// A replicated, ordered list of attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeList {
    seq: Sequence<Entry>,
}

impl AttributeList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// A list populated with `entries` in a single batch.
    pub fn with_entries(clock: &mut Clock, entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut list = Self::new();
        list.seq.push_batch(clock, entries);
        list
    }

    /// All live entries in order. Keys may repeat after a merge.
    #[must_use]
    pub fn get_all(&self) -> Vec<Entry> {
        self.seq.to_vec()
    }

    /// Iterate over live entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.seq.iter()
    }

    /// Iterate over live entries with their identities.
    pub fn iter_with_ids(&self) -> impl Iterator<Item = (&ItemId, &Entry)> {
        self.seq.iter_with_ids()
    }

    /// Iterate over deleted entries with their identities.
    pub fn iter_removed(&self) -> impl Iterator<Item = (&ItemId, &Entry)> {
        self.seq.iter_removed()
    }

    /// Number of live entries, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    /// Whether there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Number of deleted entries still retained.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.seq.tombstone_count()
    }

    /// Every identity this list has ever held.
    #[must_use]
    pub fn version_vector(&self) -> VersionVector {
        self.seq.version_vector()
    }

    /// Highest Lamport counter used inside this list.
    #[must_use]
    pub fn max_counter(&self) -> u64 {
        self.seq.max_counter()
    }

    /// The underlying sequence.
    #[must_use]
    pub fn sequence(&self) -> &Sequence<Entry> {
        &self.seq
    }

    /// Resolved value for `key`: the last entry for it in sequence order.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.seq
            .iter()
            .filter(|entry| entry.key == key)
            .last()
            .map(|entry| entry.value.as_str())
    }

    /// One value per key, last entry in sequence order winning.
    ///
    /// Keys are ordered by the position of their winning entry, so for a
    /// list without duplicates this is exactly [`get_all`](Self::get_all).
    #[must_use]
    pub fn resolve(&self) -> IndexMap<String, String> {
        let mut winners: IndexMap<&str, usize> = IndexMap::new();
        let entries: Vec<&Entry> = self.seq.iter().collect();
        for (position, entry) in entries.iter().enumerate() {
            winners.shift_remove(entry.key.as_str());
            winners.insert(entry.key.as_str(), position);
        }
        winners
            .into_iter()
            .map(|(key, position)| (key.to_string(), entries[position].value.clone()))
            .collect()
    }

    /// Keys that currently have more than one live entry, in order of
    /// their first appearance.
    #[must_use]
    pub fn duplicate_keys(&self) -> Vec<String> {
        let mut counts: IndexMap<&str, usize> = IndexMap::new();
        for entry in self.seq.iter() {
            *counts.entry(entry.key.as_str()).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Whether every key maps to exactly one entry.
    #[must_use]
    pub fn state(&self) -> ListState {
        let mut keys = HashSet::new();
        if self.seq.iter().all(|entry| keys.insert(entry.key.as_str())) {
            ListState::Unique
        } else {
            ListState::Ambiguous
        }
    }

    /// Apply `request` as one local edit.
    ///
    /// Every live entry whose key the request names is removed, then one
    /// entry per upserted key is appended in request order. Entries for
    /// other keys keep their relative order. Positions are read once, up
    /// front, and the resulting ranges are removed back to front so that no
    /// removal shifts the positions of a later one.
    pub fn patch(
        &mut self,
        clock: &mut Clock,
        request: &PatchRequest,
    ) -> Result<(), AttributeError> {
        request.validate()?;

        let positions: Vec<usize> = self
            .seq
            .iter()
            .enumerate()
            .filter(|(_, entry)| request.contains_key(&entry.key))
            .map(|(position, _)| position)
            .collect();
        let ranges = compact_indices(&positions);
        debug_assert!(ranges.last().map_or(true, |last| last.end() <= self.seq.len()));

        for range in ranges.iter().rev() {
            self.seq.delete_range(range.start, range.count)?;
        }

        let appended = self.seq.push_batch(clock, request.upserts());

        tracing::trace!(
            removed = positions.len(),
            ranges = ranges.len(),
            appended = appended.len(),
            "patched attribute list"
        );
        Ok(())
    }

    /// Collapse every duplicated key to its resolved value.
    ///
    /// Returns the number of keys rewritten. A list that is already
    /// [`ListState::Unique`] is left untouched.
    pub fn resolve_duplicates(&mut self, clock: &mut Clock) -> Result<usize, AttributeError> {
        let duplicates = self.duplicate_keys();
        if duplicates.is_empty() {
            return Ok(0);
        }

        let resolved = self.resolve();
        let request: PatchRequest = duplicates
            .iter()
            .map(|key| (key.as_str(), resolved.get(key).cloned()))
            .collect();
        self.patch(clock, &request)?;
        Ok(duplicates.len())
    }

    /// Tombstone-free copy of the live entries.
    #[must_use]
    pub fn snapshot(&self) -> CompactionSnapshot {
        CompactionSnapshot {
            entries: self.get_all(),
            seen: self.version_vector(),
            copied: self.seq.ids().iter().cloned().collect(),
        }
    }

    /// A brand-new list holding this list's live entries and no tombstones.
    ///
    /// The new list shares no identities with this one: to every replica it
    /// is an unrelated object. Installing it in place of this one, and
    /// dealing with edits other replicas make to this one in the meantime,
    /// is up to the caller.
    #[must_use]
    pub fn compact_replace(&self, clock: &mut Clock) -> AttributeList {
        self.snapshot().into_list(clock)
    }
}

impl Crdt for AttributeList {
    fn merge(&mut self, other: &Self) {
        self.seq.merge(&other.seq);
    }
}
