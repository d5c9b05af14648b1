//! Live object model of the machine.
//!
//! The tree itself is opaque JSON; this module owns locking, change-path
//! notifications, and patch materialization for subscribers.

mod patch;
mod path;
mod store;

pub use patch::{filtered_snapshot, merge_patch, PatchBuilder};
pub use path::{Change, ChangeKind, Filter, FilterSegment, PathSegment};
pub use store::{Message, MessageSeverity, ModelStore, WriteAccess, MODULE_KEYS};
