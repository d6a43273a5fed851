//! Persistent fingerprint index.
//!
//! This module owns all durable state:
//!
//! * [`store`]: SQLite persistence, schema, and the busy-retry wrapper
//!   around every mutating operation.
//! * [`entry`]: the stored row model and metadata-based change detection.
//!
//! # Change detection
//!
//! An entry is keyed by path and records the file's size and mtime (in
//! milliseconds) as observed when its fingerprint was computed. A file
//! whose live `(size, mtime)` still matches its entry is skipped on
//! rescan; any mismatch, or a missing entry, triggers a rehash and upsert.

pub mod entry;
pub mod store;

pub use entry::{system_time_to_ms, FileMeta, IndexEntry};
pub use store::{IndexStore, RetryPolicy, StoreError};
