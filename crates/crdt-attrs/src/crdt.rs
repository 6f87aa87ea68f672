/// State-based merge shared by every replicated structure in this crate.
///
/// # Properties
///
/// All implementations must satisfy:
/// - **Commutativity:** `a.merge(b) == b.merge(a)`
/// - **Associativity:** `a.merge(b.merge(c)) == a.merge(b).merge(c)`
/// - **Idempotency:** `a.merge(a) == a`
///
/// These hold for the raw replicated state (entries, identities and
/// tombstones). They do *not* imply that a key-value view derived from that
/// state has one value per key; see [`AttributeList::resolve`].
///
/// [`AttributeList::resolve`]: crate::AttributeList::resolve
pub trait Crdt {
    /// Merge another replica's state into this one.
    ///
    /// After merging, `self` contains the least upper bound of both states.
    fn merge(&mut self, other: &Self);
}
