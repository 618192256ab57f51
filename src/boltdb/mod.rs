//! Read-only access to the containerd metadata database.
//!
//! The database is a Bolt (bbolt) file: a single-file, memory-mappable,
//! B+tree-backed key-value store.  This crate never defines or mutates
//! the format, it only consumes it.  `format` describes the on-disk
//! structures, `reader` navigates them, and [`MetadataStore`] is the
//! transactional facade the explorer holds for its lifetime.

pub mod format;
pub mod reader;

pub use reader::{Db, MetadataStore, StoreError};
