//! Documents: elements, their attribute storage, and whole-state sync.
//!
//! A [`Doc`] owns one [`Clock`] and all replicated state of one open
//! document. Every element picks an attribute [`Layout`] once, at creation.
//!
//! The [`Layout::KeyValueSequence`] layout stores its [`AttributeList`]
//! behind a last-writer-wins slot so that it can be swapped for a compacted
//! copy with [`Doc::compact_replace`]. The swap is a local, destructive
//! operation: edits another replica makes to the old list before it hears
//! about the swap are not folded into the new list. Merging reports such
//! edits as [`Orphan`]s, both entries added to the old list and copied
//! entries deleted from it, and [`Doc::reconcile`] replays them onto the
//! current list if the application wants to keep them.
//!
//! # Example
//!
//! ```
//! use crdt_attrs::{Doc, Entry, Layout, PatchRequest};
//!
//! let mut doc = Doc::open("replica-a");
//! doc.create_element(
//!     "box",
//!     "div",
//!     Layout::KeyValueSequence,
//!     [Entry::new("width", "100"), Entry::new("height", "200")],
//! )?;
//! for width in ["300", "400", "500", "600"] {
//!     doc.patch("box", &PatchRequest::new().set("width", width))?;
//! }
//!
//! let before = doc.encoded_len()?;
//! doc.compact_replace("box")?;
//! assert!(doc.encoded_len()? < before);
//!
//! let resolved = doc.resolved_attributes("box")?;
//! assert_eq!(resolved["width"], "600");
//! # Ok::<(), crdt_attrs::DocError>(())
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::attributes::{AttributeError, AttributeList, Entry, ListState, PatchOp, PatchRequest};
use crate::clock::{Clock, ItemId, VersionVector};
use crate::lww::{LwwMap, LwwRegister};
use crate::version::{self, CodecError, PayloadKind};
use crate::Crdt;

/// How an element stores its attributes. Chosen once, at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// A separate last-writer-wins map object referenced by the element.
    NestedMap,
    /// An attribute list behind a replaceable slot.
    KeyValueSequence,
    /// An attribute list stored as the named root object `"{element}-attr"`.
    PlainSequence,
    /// A last-writer-wins map stored inline on the element.
    ElementAttributeSet,
}

impl Layout {
    /// Every layout, in declaration order.
    pub const ALL: [Layout; 4] = [
        Layout::NestedMap,
        Layout::KeyValueSequence,
        Layout::PlainSequence,
        Layout::ElementAttributeSet,
    ];

    /// Kebab-case name, as accepted by [`FromStr`].
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Layout::NestedMap => "nested-map",
            Layout::KeyValueSequence => "key-value-sequence",
            Layout::PlainSequence => "plain-sequence",
            Layout::ElementAttributeSet => "element-attribute-set",
        }
    }

    /// Whether attributes live in an [`AttributeList`].
    #[must_use]
    pub fn is_sequence(self) -> bool {
        matches!(self, Layout::KeyValueSequence | Layout::PlainSequence)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error parsing a [`Layout`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "unknown layout '{0}' \
     (expected nested-map, key-value-sequence, plain-sequence or element-attribute-set)"
)]
pub struct ParseLayoutError(String);

impl FromStr for Layout {
    type Err = ParseLayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layout::ALL
            .into_iter()
            .find(|layout| layout.name() == s)
            .ok_or_else(|| ParseLayoutError(s.to_string()))
    }
}

/// Identity of a replicated attribute object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectId {
    /// A named root object, shared by every replica that uses the name.
    Root(String),
    /// An object created at runtime, identified by its creation stamp.
    Created(ItemId),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Root(name) => f.write_str(name),
            ObjectId::Created(id) => write!(f, "#{id}"),
        }
    }
}

/// Error returned by [`Doc`] operations.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    /// No element with this id.
    #[error("unknown element: {0}")]
    UnknownElement(String),
    /// An element with this id already exists.
    #[error("element already exists: {0}")]
    DuplicateElement(String),
    /// Only [`Layout::KeyValueSequence`] attributes can be swapped.
    #[error("element {element} uses the {layout} layout, which cannot be replaced")]
    NotReplaceable {
        /// Element id.
        element: String,
        /// The element's layout.
        layout: Layout,
    },
    /// An element references an object this replica does not hold.
    #[error("attribute object {0} is missing")]
    MissingObject(ObjectId),
    /// An element references an object that has been retired.
    #[error("attribute object {0} has been retired")]
    Retired(ObjectId),
    /// Attribute-level failure.
    #[error(transparent)]
    Attribute(#[from] AttributeError),
    /// Update encoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// What the lost edit did to the old list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrphanEdit {
    /// The entry was added after the swap's snapshot and is missing from
    /// the element's current attributes.
    Inserted,
    /// The entry was copied by the swap, then deleted from the old list.
    /// The copy is still part of the element's current attributes.
    Deleted,
}

/// An edit to a collapsed list that the replacing replica had not seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    /// Owning element.
    pub element: String,
    /// The list the entry was written to.
    pub object: ObjectId,
    /// Identity of the entry inside that list.
    pub id: ItemId,
    /// The entry itself.
    pub entry: Entry,
    /// Whether the entry was inserted or deleted.
    pub edit: OrphanEdit,
}

/// What a merge did besides converging state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Edits dropped from the read view by a compaction swap.
    pub orphans: Vec<Orphan>,
    /// Lists collapsed into retired markers by this merge.
    pub retired: Vec<ObjectId>,
    /// Elements whose list holds duplicate keys after the merge.
    pub ambiguous: Vec<String>,
}

impl MergeReport {
    /// No orphans and no duplicate keys.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.ambiguous.is_empty()
    }

    fn collect_orphans<'a>(
        &mut self,
        element: &str,
        object: &ObjectId,
        edit: OrphanEdit,
        found: impl Iterator<Item = (&'a ItemId, &'a Entry)>,
    ) {
        self.orphans.extend(found.map(|(id, entry)| Orphan {
            element: element.to_string(),
            object: object.clone(),
            id: id.clone(),
            entry: entry.clone(),
            edit,
        }));
    }
}

/// Plain, serialisable snapshot of a document's resolved contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocView {
    /// Elements by id.
    pub elements: BTreeMap<String, ElementView>,
}

/// One element of a [`DocView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementView {
    /// Tag name.
    pub tag: String,
    /// Attribute layout.
    pub layout: Layout,
    /// Live attributes in storage order, duplicates included.
    pub attributes: Vec<Entry>,
}

/// Where a [`Layout::KeyValueSequence`] slot currently points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ListRef {
    object: ObjectId,
    /// Set when this list was installed by a compaction swap.
    absorbed: Option<Absorbed>,
}

/// The list a compaction swap replaced, and how much of it was copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Absorbed {
    object: ObjectId,
    seen: VersionVector,
    copied: BTreeSet<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum AttributeSlot {
    NestedMap(ObjectId),
    KeyValueSequence(LwwRegister<ListRef>),
    PlainSequence(ObjectId),
    ElementAttributeSet(LwwMap),
}

impl AttributeSlot {
    fn layout(&self) -> Layout {
        match self {
            AttributeSlot::NestedMap(_) => Layout::NestedMap,
            AttributeSlot::KeyValueSequence(_) => Layout::KeyValueSequence,
            AttributeSlot::PlainSequence(_) => Layout::PlainSequence,
            AttributeSlot::ElementAttributeSet(_) => Layout::ElementAttributeSet,
        }
    }

    fn list_ref(&self) -> Option<&ListRef> {
        match self {
            AttributeSlot::KeyValueSequence(slot) => Some(slot.value()),
            _ => None,
        }
    }
}

impl Crdt for AttributeSlot {
    fn merge(&mut self, other: &Self) {
        match (self, other) {
            (AttributeSlot::KeyValueSequence(ours), AttributeSlot::KeyValueSequence(theirs)) => {
                ours.merge(theirs);
            }
            (
                AttributeSlot::ElementAttributeSet(ours),
                AttributeSlot::ElementAttributeSet(theirs),
            ) => {
                ours.merge(theirs);
            }
            // Object references are fixed at creation.
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Element {
    created: ItemId,
    tag_name: LwwRegister<String>,
    attributes: AttributeSlot,
}

impl Crdt for Element {
    fn merge(&mut self, other: &Self) {
        match other.created.cmp(&self.created) {
            // The same id created twice: the later creation wins outright.
            std::cmp::Ordering::Greater => *self = other.clone(),
            std::cmp::Ordering::Equal => {
                self.tag_name.merge(&other.tag_name);
                self.attributes.merge(&other.attributes);
            }
            std::cmp::Ordering::Less => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ListObject {
    owner: String,
    list: AttributeList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MapObject {
    owner: String,
    map: LwwMap,
}

/// What is left of a list once it has been swapped out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Retirement {
    owner: String,
    /// Every identity the list held on some replica that retired it.
    seen: VersionVector,
    /// Copied entries whose deletion on the old list has not been reported.
    copied: BTreeSet<ItemId>,
}

impl Retirement {
    /// Report what `list` did behind the swap's back and absorb it.
    fn absorb(&mut self, object: &ObjectId, list: &ListObject, report: &mut MergeReport) {
        let inserted = list
            .list
            .iter_with_ids()
            .filter(|(item, _)| !self.seen.covers(item));
        report.collect_orphans(&list.owner, object, OrphanEdit::Inserted, inserted);

        let deleted: Vec<(&ItemId, &Entry)> = list
            .list
            .iter_removed()
            .filter(|(item, _)| self.copied.contains(*item))
            .collect();
        for (item, _) in &deleted {
            self.copied.remove(*item);
        }
        report.collect_orphans(&list.owner, object, OrphanEdit::Deleted, deleted.into_iter());

        self.seen.merge(&list.list.version_vector());
    }
}

impl Crdt for Retirement {
    fn merge(&mut self, other: &Self) {
        self.seen.merge(&other.seen);
        // Each side only ever removes, once reported.
        self.copied.retain(|item| other.copied.contains(item));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Object {
    List(ListObject),
    Map(MapObject),
    Retired(Retirement),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DocState {
    elements: BTreeMap<String, Element>,
    objects: BTreeMap<ObjectId, Object>,
}

#[derive(Serialize)]
struct UpdateRef<'a> {
    lamport: u64,
    state: &'a DocState,
}

#[derive(Deserialize)]
struct Update {
    lamport: u64,
    state: DocState,
}

enum Attrs<'a> {
    List(&'a AttributeList),
    Map(&'a LwwMap),
}

enum AttrsMut<'a> {
    List(&'a mut AttributeList),
    Map(&'a mut LwwMap),
}

/// One open replicated document.
#[derive(Debug)]
pub struct Doc {
    clock: Clock,
    state: DocState,
}

impl Doc {
    /// Open an empty document for the given replica.
    pub fn open(actor: impl Into<String>) -> Self {
        Self {
            clock: Clock::new(actor),
            state: DocState::default(),
        }
    }

    /// Open a new replica seeded from an exported update.
    pub fn from_update(actor: impl Into<String>, payload: &[u8]) -> Result<Self, DocError> {
        let mut doc = Self::open(actor);
        doc.merge_update(payload)?;
        Ok(doc)
    }

    /// Close the document, returning its final exported state.
    pub fn close(self) -> Result<Vec<u8>, DocError> {
        let update = self.export_update()?;
        tracing::debug!(actor = self.clock.actor(), bytes = update.len(), "closed document");
        Ok(update)
    }

    /// This replica's actor id.
    #[must_use]
    pub fn actor(&self) -> &str {
        self.clock.actor()
    }

    /// The document's operation context.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Ids of all elements, sorted.
    pub fn element_ids(&self) -> impl Iterator<Item = &str> {
        self.state.elements.keys().map(String::as_str)
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.elements.len()
    }

    /// Whether the document has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.elements.is_empty()
    }

    /// Create an element with the given layout and initial attributes.
    pub fn create_element(
        &mut self,
        id: &str,
        tag: &str,
        layout: Layout,
        initial: impl IntoIterator<Item = Entry>,
    ) -> Result<(), DocError> {
        if self.state.elements.contains_key(id) {
            return Err(DocError::DuplicateElement(id.to_string()));
        }
        let initial: Vec<Entry> = initial.into_iter().collect();
        if initial.iter().any(|entry| entry.key.is_empty()) {
            return Err(AttributeError::EmptyKey.into());
        }

        let created = self.clock.next();
        let tag_name = LwwRegister::with_stamp(tag.to_string(), created.clone());
        let owner = id.to_string();

        let attributes = match layout {
            Layout::NestedMap => {
                let object = ObjectId::Created(self.clock.next());
                let map = self.map_with(&initial);
                self.state
                    .objects
                    .insert(object.clone(), Object::Map(MapObject { owner, map }));
                AttributeSlot::NestedMap(object)
            }
            Layout::KeyValueSequence => {
                let stamp = self.clock.next();
                let object = ObjectId::Created(stamp.clone());
                let list = AttributeList::with_entries(&mut self.clock, initial);
                self.state
                    .objects
                    .insert(object.clone(), Object::List(ListObject { owner, list }));
                AttributeSlot::KeyValueSequence(LwwRegister::with_stamp(
                    ListRef {
                        object,
                        absorbed: None,
                    },
                    stamp,
                ))
            }
            Layout::PlainSequence => {
                let object = ObjectId::Root(format!("{id}-attr"));
                let list = AttributeList::with_entries(&mut self.clock, initial);
                self.state
                    .objects
                    .insert(object.clone(), Object::List(ListObject { owner, list }));
                AttributeSlot::PlainSequence(object)
            }
            Layout::ElementAttributeSet => {
                AttributeSlot::ElementAttributeSet(self.map_with(&initial))
            }
        };

        self.state.elements.insert(
            id.to_string(),
            Element {
                created,
                tag_name,
                attributes,
            },
        );
        Ok(())
    }

    fn map_with(&mut self, initial: &[Entry]) -> LwwMap {
        let mut map = LwwMap::new();
        if !initial.is_empty() {
            let request: PatchRequest = initial
                .iter()
                .map(|entry| (entry.key.as_str(), PatchOp::Set(entry.value.clone())))
                .collect();
            map.apply_patch(&mut self.clock, &request);
        }
        map
    }

    /// The element's layout.
    pub fn layout(&self, id: &str) -> Result<Layout, DocError> {
        Ok(self.element(id)?.attributes.layout())
    }

    /// The element's tag name.
    pub fn tag_name(&self, id: &str) -> Result<&str, DocError> {
        Ok(self.element(id)?.tag_name.value().as_str())
    }

    /// Live attributes in storage order. Sequence layouts may repeat keys
    /// after a merge; map layouts never do.
    pub fn attributes(&self, id: &str) -> Result<Vec<Entry>, DocError> {
        Ok(match self.attrs(id)? {
            Attrs::List(list) => list.get_all(),
            Attrs::Map(map) => map.iter().map(|(k, v)| Entry::new(k, v)).collect(),
        })
    }

    /// One value per key. For sequence layouts the last entry in sequence
    /// order wins.
    pub fn resolved_attributes(&self, id: &str) -> Result<IndexMap<String, String>, DocError> {
        Ok(match self.attrs(id)? {
            Attrs::List(list) => list.resolve(),
            Attrs::Map(map) => map
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    /// The element's current attribute list, or `None` for map layouts.
    pub fn attribute_list(&self, id: &str) -> Result<Option<&AttributeList>, DocError> {
        Ok(match self.attrs(id)? {
            Attrs::List(list) => Some(list),
            Attrs::Map(_) => None,
        })
    }

    /// Tombstones retained by the element's current list (0 for maps).
    pub fn tombstone_count(&self, id: &str) -> Result<usize, DocError> {
        Ok(self
            .attribute_list(id)?
            .map_or(0, AttributeList::tombstone_count))
    }

    /// Number of retired list markers held by this replica.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.state
            .objects
            .values()
            .filter(|object| matches!(object, Object::Retired(_)))
            .count()
    }

    /// Apply `request` to the element's attributes as one local edit.
    pub fn patch(&mut self, id: &str, request: &PatchRequest) -> Result<(), DocError> {
        request.validate()?;
        let clock = &mut self.clock;
        match Self::attrs_mut(&mut self.state, id)? {
            AttrsMut::List(list) => list.patch(clock, request)?,
            AttrsMut::Map(map) => map.apply_patch(clock, request),
        }
        Ok(())
    }

    /// Collapse duplicated keys of the element's list to their resolved
    /// values. Returns the number of keys rewritten.
    pub fn resolve_duplicates(&mut self, id: &str) -> Result<usize, DocError> {
        let clock = &mut self.clock;
        match Self::attrs_mut(&mut self.state, id)? {
            AttrsMut::List(list) => Ok(list.resolve_duplicates(clock)?),
            AttrsMut::Map(_) => Ok(0),
        }
    }

    /// Swap the element's list for a fresh copy of its live entries.
    ///
    /// The old list collapses into a retired marker and its tombstones
    /// leave this replica's encoded state. Returns the id of the new list.
    ///
    /// Edits other replicas make to the old list before they see the swap
    /// are not part of the new list; merges report them as [`Orphan`]s.
    /// The marker itself is never removed, so every swap adds a few bytes
    /// (its version vector and the ids it copied) to the document for good.
    pub fn compact_replace(&mut self, id: &str) -> Result<ObjectId, DocError> {
        let DocState { elements, objects } = &mut self.state;
        let element = elements
            .get_mut(id)
            .ok_or_else(|| DocError::UnknownElement(id.to_string()))?;
        let layout = element.attributes.layout();
        let AttributeSlot::KeyValueSequence(slot) = &mut element.attributes else {
            return Err(DocError::NotReplaceable {
                element: id.to_string(),
                layout,
            });
        };

        let old_id = slot.value().object.clone();
        let (owner, snapshot, tombstones) = match objects.get(&old_id) {
            Some(Object::List(old)) => (
                old.owner.clone(),
                old.list.snapshot(),
                old.list.tombstone_count(),
            ),
            Some(_) => return Err(DocError::Retired(old_id)),
            None => return Err(DocError::MissingObject(old_id)),
        };

        let stamp = self.clock.next();
        let new_id = ObjectId::Created(stamp.clone());
        let seen = snapshot.seen().clone();
        let copied = snapshot.copied().clone();
        let list = snapshot.into_list(&mut self.clock);

        slot.set_with_stamp(
            ListRef {
                object: new_id.clone(),
                absorbed: Some(Absorbed {
                    object: old_id.clone(),
                    seen: seen.clone(),
                    copied: copied.clone(),
                }),
            },
            stamp,
        );
        objects.insert(
            new_id.clone(),
            Object::List(ListObject {
                owner: owner.clone(),
                list,
            }),
        );
        objects.insert(
            old_id.clone(),
            Object::Retired(Retirement {
                owner,
                seen,
                copied,
            }),
        );

        tracing::debug!(
            element = id,
            old = %old_id,
            new = %new_id,
            dropped_tombstones = tombstones,
            "replaced attribute list"
        );
        Ok(new_id)
    }

    /// Replay `orphans` belonging to `id` onto its current attributes as
    /// one patch. Returns the number of keys written.
    ///
    /// Inserted entries become upserts. A deleted entry becomes a delete of
    /// its key, unless the same patch upserts that key or the element no
    /// longer holds exactly that entry.
    pub fn reconcile(&mut self, id: &str, orphans: &[Orphan]) -> Result<usize, DocError> {
        let orphans: Vec<&Orphan> = orphans.iter().filter(|o| o.element == id).collect();
        let mut request: PatchRequest = orphans
            .iter()
            .filter(|orphan| orphan.edit == OrphanEdit::Inserted)
            .map(|orphan| {
                let entry = &orphan.entry;
                (entry.key.as_str(), PatchOp::Set(entry.value.clone()))
            })
            .collect();

        let current = self.attributes(id)?;
        for orphan in orphans.iter().filter(|o| o.edit == OrphanEdit::Deleted) {
            if !request.contains_key(&orphan.entry.key) && current.contains(&orphan.entry) {
                request.insert(orphan.entry.key.as_str(), PatchOp::Delete);
            }
        }
        if request.is_empty() {
            return Ok(0);
        }
        self.patch(id, &request)?;
        tracing::debug!(element = id, keys = request.len(), "reconciled orphans");
        Ok(request.len())
    }

    /// Encode the full replicated state as an update.
    pub fn export_update(&self) -> Result<Vec<u8>, DocError> {
        let update = UpdateRef {
            lamport: self.clock.counter(),
            state: &self.state,
        };
        Ok(version::encode(PayloadKind::Document, &update)?)
    }

    /// Size in bytes of [`export_update`](Self::export_update).
    pub fn encoded_len(&self) -> Result<usize, DocError> {
        Ok(self.export_update()?.len())
    }

    /// Merge an update exported by any replica of this document. Applying
    /// the same update again changes nothing and reports nothing new.
    pub fn merge_update(&mut self, payload: &[u8]) -> Result<MergeReport, DocError> {
        let update: Update = version::decode(PayloadKind::Document, payload)?;
        self.clock.observe(update.lamport);
        Ok(self.merge_state(&update.state))
    }

    /// Merge another in-memory replica.
    pub fn merge(&mut self, other: &Doc) -> MergeReport {
        self.clock.observe(other.clock.counter());
        self.merge_state(&other.state)
    }

    /// Resolved, serialisable snapshot of every element.
    #[must_use]
    pub fn view(&self) -> DocView {
        let elements = self
            .state
            .elements
            .iter()
            .map(|(id, element)| {
                let attributes = self.attributes(id).unwrap_or_default();
                let view = ElementView {
                    tag: element.tag_name.value().clone(),
                    layout: element.attributes.layout(),
                    attributes,
                };
                (id.clone(), view)
            })
            .collect();
        DocView { elements }
    }

    fn element(&self, id: &str) -> Result<&Element, DocError> {
        self.state
            .elements
            .get(id)
            .ok_or_else(|| DocError::UnknownElement(id.to_string()))
    }

    fn attrs(&self, id: &str) -> Result<Attrs<'_>, DocError> {
        let object = match &self.element(id)?.attributes {
            AttributeSlot::ElementAttributeSet(map) => return Ok(Attrs::Map(map)),
            AttributeSlot::NestedMap(object) | AttributeSlot::PlainSequence(object) => object,
            AttributeSlot::KeyValueSequence(slot) => &slot.value().object,
        };
        match self.state.objects.get(object) {
            Some(Object::List(list)) => Ok(Attrs::List(&list.list)),
            Some(Object::Map(map)) => Ok(Attrs::Map(&map.map)),
            Some(Object::Retired(_)) => Err(DocError::Retired(object.clone())),
            None => Err(DocError::MissingObject(object.clone())),
        }
    }

    fn attrs_mut<'a>(state: &'a mut DocState, id: &str) -> Result<AttrsMut<'a>, DocError> {
        let DocState { elements, objects } = state;
        let element = elements
            .get_mut(id)
            .ok_or_else(|| DocError::UnknownElement(id.to_string()))?;
        let object = match &mut element.attributes {
            AttributeSlot::ElementAttributeSet(map) => return Ok(AttrsMut::Map(map)),
            AttributeSlot::NestedMap(object) | AttributeSlot::PlainSequence(object) => {
                object.clone()
            }
            AttributeSlot::KeyValueSequence(slot) => slot.value().object.clone(),
        };
        match objects.get_mut(&object) {
            Some(Object::List(list)) => Ok(AttrsMut::List(&mut list.list)),
            Some(Object::Map(map)) => Ok(AttrsMut::Map(&mut map.map)),
            Some(Object::Retired(_)) => Err(DocError::Retired(object)),
            None => Err(DocError::MissingObject(object)),
        }
    }

    fn merge_state(&mut self, other: &DocState) -> MergeReport {
        let mut report = MergeReport::default();

        for (id, theirs) in &other.elements {
            match self.state.elements.get_mut(id) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.state.elements.insert(id.clone(), theirs.clone());
                }
            }
        }

        for (id, theirs) in &other.objects {
            match self.state.objects.get_mut(id) {
                Some(ours) => merge_object(id, ours, theirs, &mut report),
                None => {
                    self.state.objects.insert(id.clone(), theirs.clone());
                }
            }
        }

        self.retire_unreferenced(&mut report);

        report.ambiguous = self
            .state
            .elements
            .keys()
            .filter(|id| match self.attrs(id) {
                Ok(Attrs::List(list)) => list.state() == ListState::Ambiguous,
                _ => false,
            })
            .cloned()
            .collect();

        tracing::debug!(
            actor = self.clock.actor(),
            orphans = report.orphans.len(),
            retired = report.retired.len(),
            ambiguous = report.ambiguous.len(),
            "merged document state"
        );
        if !report.orphans.is_empty() {
            tracing::warn!(
                orphans = report.orphans.len(),
                "merge dropped edits made to replaced attribute lists"
            );
        }
        report
    }

    /// Retire every created list its element's winning slot no longer
    /// points at, typically the loser of two concurrent swaps.
    fn retire_unreferenced(&mut self, report: &mut MergeReport) {
        let DocState { elements, objects } = &mut self.state;

        let stale: Vec<ObjectId> = objects
            .iter()
            .filter_map(|(id, object)| match (id, object) {
                (ObjectId::Created(_), Object::List(list)) => {
                    let current = elements.get(&list.owner)?.attributes.list_ref()?;
                    (current.object != *id).then(|| id.clone())
                }
                _ => None,
            })
            .collect();

        for id in stale {
            let Some(Object::List(stale_list)) = objects.get(&id) else {
                continue;
            };
            let owner = stale_list.owner.clone();
            let current = elements
                .get(&owner)
                .and_then(|element| element.attributes.list_ref());

            let retirement = match current {
                Some(ListRef {
                    absorbed: Some(absorbed),
                    ..
                }) if absorbed.object == id => {
                    let mut retirement = Retirement {
                        owner: owner.clone(),
                        seen: absorbed.seen.clone(),
                        copied: absorbed.copied.clone(),
                    };
                    retirement.absorb(&id, stale_list, report);
                    retirement
                }
                Some(current) => {
                    let kept: HashSet<&Entry> = match objects.get(&current.object) {
                        Some(Object::List(winner)) => winner.list.iter().collect(),
                        _ => HashSet::new(),
                    };
                    let live: HashSet<&Entry> = stale_list.list.iter().collect();
                    let inserted = stale_list
                        .list
                        .iter_with_ids()
                        .filter(|(_, entry)| !kept.contains(entry));
                    report.collect_orphans(&owner, &id, OrphanEdit::Inserted, inserted);
                    let deleted = stale_list
                        .list
                        .iter_removed()
                        .filter(|(_, entry)| kept.contains(entry) && !live.contains(entry));
                    report.collect_orphans(&owner, &id, OrphanEdit::Deleted, deleted);
                    Retirement {
                        owner,
                        seen: stale_list.list.version_vector(),
                        copied: BTreeSet::new(),
                    }
                }
                None => Retirement {
                    owner,
                    seen: stale_list.list.version_vector(),
                    copied: BTreeSet::new(),
                },
            };

            objects.insert(id.clone(), Object::Retired(retirement));
            report.retired.push(id);
        }
    }
}

fn merge_object(id: &ObjectId, ours: &mut Object, theirs: &Object, report: &mut MergeReport) {
    let replacement = match (&mut *ours, theirs) {
        (Object::List(ours), Object::List(theirs)) => {
            ours.list.merge(&theirs.list);
            None
        }
        (Object::Map(ours), Object::Map(theirs)) => {
            ours.map.merge(&theirs.map);
            None
        }
        (Object::Retired(ours), Object::Retired(theirs)) => {
            ours.merge(theirs);
            None
        }
        (Object::Retired(ours), Object::List(theirs)) => {
            ours.absorb(id, theirs, report);
            None
        }
        (Object::List(ours), Object::Retired(theirs)) => {
            let mut retirement = theirs.clone();
            retirement.absorb(id, ours, report);
            Some(Object::Retired(retirement))
        }
        _ => {
            tracing::warn!(object = %id, "ignoring attribute object of mismatched kind");
            None
        }
    };

    if let Some(replacement) = replacement {
        *ours = replacement;
        report.retired.push(id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wh() -> Vec<Entry> {
        vec![Entry::new("width", "100"), Entry::new("height", "200")]
    }

    #[test]
    fn every_layout_supports_patch_and_read() {
        for layout in Layout::ALL {
            let mut doc = Doc::open("a");
            doc.create_element("e", "div", layout, wh()).unwrap();
            doc.patch("e", &PatchRequest::new().set("width", "300").delete("height"))
                .unwrap();

            assert_eq!(doc.layout("e").unwrap(), layout);
            assert_eq!(doc.tag_name("e").unwrap(), "div");
            assert_eq!(
                doc.attributes("e").unwrap(),
                vec![Entry::new("width", "300")],
                "layout {layout}"
            );
            assert_eq!(doc.attribute_list("e").unwrap().is_some(), layout.is_sequence());
        }
    }

    #[test]
    fn plain_sequence_uses_named_root_object() {
        let mut doc = Doc::open("a");
        doc.create_element("box", "div", Layout::PlainSequence, wh())
            .unwrap();
        assert!(doc
            .state
            .objects
            .contains_key(&ObjectId::Root("box-attr".into())));
    }

    #[test]
    fn view_serialises_to_plain_json() {
        let mut doc = Doc::open("a");
        doc.create_element("box", "div", Layout::PlainSequence, wh())
            .unwrap();

        let json = serde_json::to_value(doc.view()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "elements": {
                    "box": {
                        "tag": "div",
                        "layout": "plain-sequence",
                        "attributes": [
                            { "key": "width", "value": "100" },
                            { "key": "height", "value": "200" },
                        ],
                    },
                },
            })
        );
    }

    #[test]
    fn layout_names_round_trip() {
        for layout in Layout::ALL {
            assert_eq!(layout.name().parse::<Layout>().unwrap(), layout);
        }
        assert!("grid".parse::<Layout>().is_err());
    }

    #[test]
    fn duplicate_and_unknown_elements_are_rejected() {
        let mut doc = Doc::open("a");
        doc.create_element("e", "div", Layout::NestedMap, wh()).unwrap();

        assert!(matches!(
            doc.create_element("e", "div", Layout::NestedMap, []),
            Err(DocError::DuplicateElement(_))
        ));
        assert!(matches!(
            doc.patch("missing", &PatchRequest::new().delete("x")),
            Err(DocError::UnknownElement(_))
        ));
    }

    #[test]
    fn empty_initial_key_is_rejected() {
        let mut doc = Doc::open("a");
        let result = doc.create_element("e", "div", Layout::PlainSequence, [Entry::new("", "x")]);
        assert!(matches!(
            result,
            Err(DocError::Attribute(AttributeError::EmptyKey))
        ));
        assert!(doc.is_empty());
    }

    #[test]
    fn only_key_value_sequence_is_replaceable() {
        for layout in Layout::ALL {
            let mut doc = Doc::open("a");
            doc.create_element("e", "div", layout, wh()).unwrap();
            let result = doc.compact_replace("e");
            if layout == Layout::KeyValueSequence {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(DocError::NotReplaceable { .. })));
            }
        }
    }

    #[test]
    fn compact_replace_keeps_entries_and_sheds_tombstones() {
        let mut doc = Doc::open("a");
        doc.create_element("e", "div", Layout::KeyValueSequence, wh())
            .unwrap();
        for i in 0..10 {
            let request = PatchRequest::new()
                .set("width", i.to_string())
                .set("height", i.to_string());
            doc.patch("e", &request).unwrap();
        }
        let entries = doc.attributes("e").unwrap();
        let before = doc.encoded_len().unwrap();
        assert_eq!(doc.tombstone_count("e").unwrap(), 20);

        doc.compact_replace("e").unwrap();

        assert_eq!(doc.attributes("e").unwrap(), entries);
        assert_eq!(doc.tombstone_count("e").unwrap(), 0);
        assert_eq!(doc.retired_count(), 1);
        assert!(doc.encoded_len().unwrap() < before);
    }

    #[test]
    fn fork_and_close_round_trip() {
        let mut doc = Doc::open("a");
        doc.create_element("e", "span", Layout::ElementAttributeSet, wh())
            .unwrap();
        let payload = doc.close().unwrap();

        let fork = Doc::from_update("b", &payload).unwrap();
        assert_eq!(fork.actor(), "b");
        assert_eq!(fork.view().elements["e"].tag, "span");
        assert_eq!(fork.resolved_attributes("e").unwrap()["height"], "200");
        assert!(fork.clock().counter() >= 2);
    }

    #[test]
    fn merge_with_in_memory_replica_converges() {
        let mut a = Doc::open("a");
        a.create_element("e", "div", Layout::NestedMap, wh()).unwrap();
        let mut b = Doc::from_update("b", &a.export_update().unwrap()).unwrap();

        a.patch("e", &PatchRequest::new().set("width", "1")).unwrap();
        b.patch("e", &PatchRequest::new().set("color", "red")).unwrap();

        assert!(a.merge(&b).is_clean());
        assert!(b.merge(&a).is_clean());
        assert_eq!(a.view(), b.view());
        assert_eq!(a.resolved_attributes("e").unwrap().len(), 3);
    }

    #[test]
    fn reconcile_ignores_other_elements() {
        let mut doc = Doc::open("a");
        doc.create_element("e", "div", Layout::KeyValueSequence, wh())
            .unwrap();
        let orphan = Orphan {
            element: "other".into(),
            object: ObjectId::Root("x".into()),
            id: ItemId::new(1, "z"),
            entry: Entry::new("color", "red"),
            edit: OrphanEdit::Inserted,
        };
        assert_eq!(doc.reconcile("e", &[orphan]).unwrap(), 0);
        assert_eq!(doc.attributes("e").unwrap(), wh());
    }

    #[test]
    fn reconcile_skips_deletes_of_entries_that_changed() {
        let mut doc = Doc::open("a");
        doc.create_element("e", "div", Layout::KeyValueSequence, wh())
            .unwrap();
        doc.patch("e", &PatchRequest::new().set("width", "300"))
            .unwrap();
        let deleted = |key: &str, value: &str| Orphan {
            element: "e".into(),
            object: ObjectId::Root("x".into()),
            id: ItemId::new(1, "z"),
            entry: Entry::new(key, value),
            edit: OrphanEdit::Deleted,
        };

        // width=100 is no longer there, height=200 still is.
        let orphans = [deleted("width", "100"), deleted("height", "200")];
        assert_eq!(doc.reconcile("e", &orphans).unwrap(), 1);
        assert_eq!(doc.attributes("e").unwrap(), vec![Entry::new("width", "300")]);
    }

    #[test]
    fn concurrent_swaps_retire_the_losing_list() {
        let mut a = Doc::open("a");
        a.create_element("e", "div", Layout::KeyValueSequence, wh())
            .unwrap();
        let mut b = Doc::from_update("b", &a.export_update().unwrap()).unwrap();

        a.compact_replace("e").unwrap();
        b.compact_replace("e").unwrap();

        let report_a = a.merge_update(&b.export_update().unwrap()).unwrap();
        let report_b = b.merge_update(&a.export_update().unwrap()).unwrap();

        assert!(report_a.orphans.is_empty());
        assert!(report_b.orphans.is_empty());
        assert_eq!(report_a.retired.len() + report_b.retired.len(), 1);
        assert_eq!(a.view(), b.view());
        assert_eq!(a.attributes("e").unwrap(), wh());
        assert_eq!(a.retired_count(), 2);
        assert_eq!(b.retired_count(), 2);
    }
}
