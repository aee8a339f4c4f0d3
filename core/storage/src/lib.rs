//! Persistence adapters for treesync.
//!
//! This module provides the trait-based interfaces the sync engine persists
//! through: a local key/value store for snapshots and a remote backend for
//! the authoritative tree, plus an explicit registry resolving both by name.
//!
//! # Design Principles
//! - Adapter isolation: no engine logic in stores or backends
//! - Async operations: all I/O operations are async
//! - Multi-path writes: a batch commits atomically or not at all
//! - Unified error semantics: consistent error types across adapters

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::{FileBackend, FileStore};
pub use memory::{MemoryBackend, MemoryStore};
pub use provider::{
    apply_batch, AuthSession, Delta, DeltaStream, LocalStore, RemoteBackend, WriteAck, WriteBatch,
};
pub use registry::{create_default_registry, LocalFactory, PersistenceRegistry, RemoteFactory};
