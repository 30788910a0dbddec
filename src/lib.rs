//! An in-memory, duplicate-aware B+ tree index.
//!
//! The crate's only real surface is
//! [`collections::b_plus_tree_map::BPlusTree`] — an ordered map over an
//! opaque key/value pair, built around a leaf-linked B+ tree rather than
//! `std`'s red-black tree so that range scans walk a flat sibling chain
//! instead of an in-order tree traversal. There is no persistence layer,
//! no transactions, and no concurrency control here: the tree is a plain
//! `struct` that panics on an internal invariant violation and otherwise
//! behaves like any other single-threaded collection. Callers that need
//! it shared across threads wrap it in their own `Mutex`/`RwLock`.

pub mod collections;
pub mod error;

pub use collections::b_plus_tree_map::{BPlusTree, SearchMode};
pub use error::{BPlusTreeError, BPlusTreeResult};
