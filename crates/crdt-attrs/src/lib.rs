//! # crdt-attrs
//!
//! Replicated key-value attribute lists for local-first documents.
//!
//! Small attribute sets (`width`, `height`, `color`, ...) are stored as
//! `(key, value)` entries in a replicated sequence. Every replica can edit
//! them offline; exported updates merge in any order, any number of times,
//! and all replicas converge.
//!
//! ## Quick Start
//!
//! ```
//! use crdt_attrs::prelude::*;
//!
//! let mut clock = Clock::new("device-1");
//! let mut attrs = AttributeList::with_entries(
//!     &mut clock,
//!     [Entry::new("width", "100"), Entry::new("height", "200")],
//! );
//!
//! let request = PatchRequest::new().set("width", "200").set("height", "400");
//! attrs.patch(&mut clock, &request)?;
//!
//! assert_eq!(
//!     attrs.get_all(),
//!     vec![Entry::new("width", "200"), Entry::new("height", "400")]
//! );
//! # Ok::<(), crdt_attrs::AttributeError>(())
//! ```
//!
//! ## Patching
//!
//! [`AttributeList::patch`] removes every entry whose key the request
//! names and appends the new values at the tail. Deleted entries stay
//! behind as tombstones, so a list that is patched often keeps growing.
//!
//! ## Compaction
//!
//! [`AttributeList::compact_replace`] builds a fresh list from the live
//! entries only. Inside a [`Doc`], [`Doc::compact_replace`] installs it in
//! place of the old one. Other replicas may still be editing the old list;
//! their inserts and their deletes of copied entries show up as
//! [`Orphan`]s in the [`MergeReport`] of the merge that brings them in,
//! and are only kept if the application calls [`Doc::reconcile`].
//!
//! ## Duplicate keys
//!
//! Two replicas that patch the same key concurrently each append an entry,
//! and both survive the merge. Use [`AttributeList::resolve`] for a view
//! with one value per key and [`AttributeList::resolve_duplicates`] to clean
//! the list up.

#![warn(missing_docs)]

mod attributes;
mod compact;
mod crdt;
mod doc;
mod lww;
mod sequence;

pub mod clock;
pub mod prelude;
pub mod version;

pub use attributes::{
    AttributeError, AttributeList, CompactionSnapshot, Entry, ListState, PatchOp, PatchRequest,
};
pub use clock::{Clock, ItemId, VersionVector};
pub use compact::{compact_indices, IndexRange};
pub use crdt::Crdt;
pub use doc::{
    Doc, DocError, DocView, ElementView, Layout, MergeReport, ObjectId, Orphan, OrphanEdit,
    ParseLayoutError,
};
pub use lww::{LwwMap, LwwRegister};
pub use sequence::{Sequence, SequenceError};
pub use version::{CodecError, PayloadKind};
