//! A content-addressed, deduplicating, encrypted block storage engine.
//!
//! See [`blockmgr`] for an overview of how bytes turn into blocks, and
//! [`object`] for how blocks turn into logical byte streams.

pub mod blob_store;
pub mod blockmgr;
pub mod compression;
pub mod config;
pub mod counters;
pub mod errors;
pub mod file_util;
pub mod formatter;
pub mod object;
pub mod splitter;
pub mod streams;

// CLI stuff:
pub mod ui;

/// Default target size of a sealed pack, absent repository-level overrides.
pub const DEFAULT_MAX_PACK_SIZE: u64 = 20 * 1024 * 1024;

/// Default cutoff below which a block is small enough to live in a pack
/// rather than as a standalone blob.
pub const DEFAULT_MAX_PACKED_CONTENT_LENGTH: u32 = 1024 * 1024;

/// How often pending pack indexes get flushed even without an explicit `flush()`.
pub const FLUSH_PACK_INDEXES_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);
