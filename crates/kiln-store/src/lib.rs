//! Storage collaborators for the kiln build engine.
//!
//! The engine consumes four storage services: a content-addressed
//! [`ObjectStore`] for built blobs, an append-only [`ResultRecordStore`]
//! keyed by command hash, a [`ContentIndex`] mapping logical content paths
//! to the objects currently backing them, and a [`FileVersionTracker`]
//! that memoizes physical-file hashes. In-memory implementations back
//! tests and single-run builds; filesystem implementations persist across
//! runs. The on-disk layout is a reference implementation, not a format
//! contract.

/// Logical content path to object id index.
pub mod index;
/// Content-addressed blob stores.
pub mod object_store;
/// Append-only command result record stores.
pub mod records;
/// Memoized physical-file hashing.
pub mod tracker;

pub use index::ContentIndex;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, STORE_FORMAT_VERSION};
pub use records::{FsRecordStore, MemoryRecordStore, ResultRecordStore};
pub use tracker::FileVersionTracker;
