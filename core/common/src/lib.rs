//! Common utilities and types shared across treesync crates.
//!
//! This module provides the foundational types used throughout the codebase:
//! the error type, state-tree paths, modified markers, and helpers for
//! navigating JSON-shaped trees.

pub mod error;
pub mod tree;
pub mod types;

pub use error::{Error, Result};
pub use types::{Marker, StatePath, MARKER_KEY, SERVER_TIMESTAMP, VALUE_KEY};
