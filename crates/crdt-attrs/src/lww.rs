use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attributes::{PatchOp, PatchRequest};
use crate::clock::{Clock, ItemId};
use crate::Crdt;

/// A last-writer-wins register stamped with an [`ItemId`].
///
/// Concurrent writes resolve to the larger stamp. Because stamps order by
/// Lamport counter first and actor second, a write made after observing
/// another always wins over it, and ties between concurrent writes break
/// the same way on every replica.
///
/// # Example
///
/// ```
/// use crdt_attrs::clock::Clock;
/// use crdt_attrs::{Crdt, LwwRegister};
///
/// let mut clock_a = Clock::new("a");
/// let mut clock_b = Clock::new("b");
///
/// let mut r1 = LwwRegister::new(&mut clock_a, "hello");
/// let r2 = LwwRegister::new(&mut clock_b, "world");
///
/// // Same counter, so the larger actor wins.
/// r1.merge(&r2);
/// assert_eq!(*r1.value(), "world");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: ItemId,
}

impl<T: Clone> LwwRegister<T> {
    /// Create a register holding `value`, stamped by `clock`.
    pub fn new(clock: &mut Clock, value: T) -> Self {
        Self::with_stamp(value, clock.next())
    }

    /// Create a register with an explicit stamp.
    pub fn with_stamp(value: T, stamp: ItemId) -> Self {
        Self { value, stamp }
    }

    /// Overwrite the value with a fresh stamp.
    pub fn set(&mut self, clock: &mut Clock, value: T) {
        self.set_with_stamp(value, clock.next());
    }

    /// Overwrite the value if `stamp` is newer than the current one.
    pub fn set_with_stamp(&mut self, value: T, stamp: ItemId) {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
        }
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Stamp of the current value.
    #[must_use]
    pub fn stamp(&self) -> &ItemId {
        &self.stamp
    }
}

impl<T: Clone> Crdt for LwwRegister<T> {
    fn merge(&mut self, other: &Self) {
        if other.stamp > self.stamp {
            self.value = other.value.clone();
            self.stamp = other.stamp.clone();
        }
    }
}

/// A map of independent last-writer-wins attributes.
///
/// Each key is its own register, so concurrent writes to different keys
/// never interfere and concurrent writes to the same key resolve to one
/// value. Deletes are kept as `None` so that they can win over older sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwMap {
    slots: BTreeMap<String, LwwRegister<Option<String>>>,
}

impl LwwMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every operation of `request` under a single stamp.
    pub fn apply_patch(&mut self, clock: &mut Clock, request: &PatchRequest) {
        let stamp = clock.next();
        for (key, op) in request.iter() {
            let value = match op {
                PatchOp::Set(value) => Some(value.clone()),
                PatchOp::Delete => None,
            };
            self.write(key, value, stamp.clone());
        }
    }

    /// Value for `key`, if set and not deleted.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.slots.get(key).and_then(|slot| slot.value().as_deref())
    }

    /// Live `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.slots
            .iter()
            .filter_map(|(key, slot)| slot.value().as_deref().map(|v| (key.as_str(), v)))
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no key is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest counter among all stamps, or 0 if empty.
    #[must_use]
    pub fn max_counter(&self) -> u64 {
        self.slots
            .values()
            .map(|slot| slot.stamp().counter)
            .max()
            .unwrap_or(0)
    }

    fn write(&mut self, key: &str, value: Option<String>, stamp: ItemId) {
        match self.slots.get_mut(key) {
            Some(slot) => slot.set_with_stamp(value, stamp),
            None => {
                self.slots
                    .insert(key.to_string(), LwwRegister::with_stamp(value, stamp));
            }
        }
    }
}

impl Crdt for LwwMap {
    fn merge(&mut self, other: &Self) {
        for (key, theirs) in &other.slots {
            match self.slots.get_mut(key) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.slots.insert(key.clone(), theirs.clone());
                }
            }
        }
    }
}
