//! Lamport identities and the per-document operation context.
//!
//! Every element inserted into a sequence, every created object and every
//! register write is stamped with an [`ItemId`]. Ids are minted by a
//! [`Clock`], which each document owns exactly once and passes explicitly
//! to the operations that need it.
//!
//! # Example
//!
//! ```
//! use crdt_attrs::clock::{Clock, VersionVector};
//!
//! let mut clock = Clock::new("replica-a");
//! let first = clock.next();
//! let second = clock.next();
//! assert!(second > first);
//!
//! // A remote counter pushes the local clock forward.
//! clock.observe(41);
//! assert_eq!(clock.next().counter, 42);
//!
//! let mut seen = VersionVector::new();
//! seen.observe(&first);
//! assert!(seen.covers(&first));
//! assert!(!seen.covers(&second));
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Crdt;

/// Globally unique identity: a Lamport counter plus the minting actor.
///
/// Ordered by counter first and actor second, which gives a total order
/// consistent with causality: anything a replica mints after observing an
/// id compares greater than that id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    /// Lamport counter.
    pub counter: u64,
    /// Replica that minted the id.
    pub actor: String,
}

impl ItemId {
    /// Build an id from its parts.
    pub fn new(counter: u64, actor: impl Into<String>) -> Self {
        Self {
            counter,
            actor: actor.into(),
        }
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.actor.cmp(&other.actor))
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.actor)
    }
}

/// Lamport clock for one replica.
///
/// This is the explicit context object threaded through every mutation.
/// One clock belongs to one open document; it is never shared or global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    actor: String,
    counter: u64,
}

impl Clock {
    /// Create a clock for the given actor, starting at zero.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            counter: 0,
        }
    }

    /// Mint a fresh id, strictly greater than anything observed so far.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> ItemId {
        self.counter += 1;
        ItemId {
            counter: self.counter,
            actor: self.actor.clone(),
        }
    }

    /// Raise the counter to at least `counter` after receiving remote state.
    pub fn observe(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    /// The replica's actor id.
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// The highest counter minted or observed.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Per-actor maximum counter: a compact summary of which ids have been seen.
///
/// Because each replica mints counters monotonically and state is shipped
/// whole, having seen `(n, actor)` implies having seen every id of that
/// actor with a smaller counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    /// An empty vector that covers nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` has been seen.
    pub fn observe(&mut self, id: &ItemId) {
        let slot = self.0.entry(id.actor.clone()).or_insert(0);
        *slot = (*slot).max(id.counter);
    }

    /// Whether `id` is at or below the recorded maximum for its actor.
    #[must_use]
    pub fn covers(&self, id: &ItemId) -> bool {
        self.0.get(&id.actor).is_some_and(|max| id.counter <= *max)
    }

    /// Maximum counter recorded for an actor.
    #[must_use]
    pub fn get(&self, actor: &str) -> Option<u64> {
        self.0.get(actor).copied()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<&'a ItemId> for VersionVector {
    fn from_iter<I: IntoIterator<Item = &'a ItemId>>(iter: I) -> Self {
        let mut vv = Self::new();
        for id in iter {
            vv.observe(id);
        }
        vv
    }
}

impl Crdt for VersionVector {
    fn merge(&mut self, other: &Self) {
        for (actor, counter) in &other.0 {
            let slot = self.0.entry(actor.clone()).or_insert(0);
            *slot = (*slot).max(*counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_monotonic() {
        let mut clock = Clock::new("a");
        let ids: Vec<ItemId> = (0..5).map(|_| clock.next()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert_eq!(clock.counter(), 5);
    }

    #[test]
    fn observe_never_goes_backward() {
        let mut clock = Clock::new("a");
        clock.observe(10);
        clock.observe(3);
        assert_eq!(clock.counter(), 10);
        assert_eq!(clock.next(), ItemId::new(11, "a"));
    }

    #[test]
    fn ordering_is_counter_then_actor() {
        assert!(ItemId::new(2, "a") > ItemId::new(1, "z"));
        assert!(ItemId::new(1, "b") > ItemId::new(1, "a"));
    }

    #[test]
    fn version_vector_covers_prefix() {
        let mut vv = VersionVector::new();
        vv.observe(&ItemId::new(4, "a"));
        assert!(vv.covers(&ItemId::new(1, "a")));
        assert!(vv.covers(&ItemId::new(4, "a")));
        assert!(!vv.covers(&ItemId::new(5, "a")));
        assert!(!vv.covers(&ItemId::new(1, "b")));
    }

    #[test]
    fn version_vector_merge_is_pointwise_max() {
        let mut left: VersionVector = [ItemId::new(3, "a"), ItemId::new(1, "b")].iter().collect();
        let right: VersionVector = [ItemId::new(1, "a"), ItemId::new(7, "b")].iter().collect();

        left.merge(&right);
        assert_eq!(left.get("a"), Some(3));
        assert_eq!(left.get("b"), Some(7));

        let snapshot = left.clone();
        left.merge(&snapshot);
        assert_eq!(left, snapshot);
    }
}
