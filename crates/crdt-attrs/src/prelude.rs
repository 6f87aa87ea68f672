//! Convenient re-exports for common usage.
//!
//! ```
//! use crdt_attrs::prelude::*;
//! ```

pub use crate::AttributeList;
pub use crate::Clock;
pub use crate::Crdt;
pub use crate::Doc;
pub use crate::Entry;
pub use crate::Layout;
pub use crate::MergeReport;
pub use crate::PatchRequest;
