//! Reactive state container contract for treesync.
//!
//! The sync engine never owns application state. It reads and writes the
//! tree through [`StateStore`], and learns about local mutations through
//! change notifications. [`MemoryState`] is the reference implementation.

pub mod memory;
pub mod store;

pub use memory::MemoryState;
pub use store::{Change, ChangeCallback, ChangeKind, Origin, StateStore, Subscription};
