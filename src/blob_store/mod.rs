//! Places where a repository's pack and index blobs actually live: the local
//! filesystem, a write-through cache in front of something slower, or (in
//! tests) plain memory.
//!
//! Grounded on backpak's `backend.rs` module tree (`Backend` trait +
//! `backend/{fs,memory,cache,semaphored}.rs`); kept synchronous per the
//! same reasoning backpak's own `index.rs` follows (its `async fn`s never
//! actually `.await` anything — they're CPU/IO-bound rayon work wrapped in
//! `async` for call-site convenience). A thin `#[tokio::main]` CLI layer
//! bridges this synchronous core to async where the teacher's binary uses it.

mod cache;
mod fs;
mod memory;
mod semaphored;

pub use cache::CachedBlobStore;
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use semaphored::BoundedBlobStore;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::Result;

/// `length == -1` means "read to the end of the blob starting at `offset`".
pub const TO_END: i64 = -1;

/// A cheap, cloneable flag a caller can use to abort a long-running
/// [`BlobStore::list`] (or anything else that takes one) from another
/// thread. Mirrors the "just an `AtomicBool` behind an `Arc`" idiom backpak
/// uses for its own cancellation handling rather than a full `Stream` or
/// channel-based design.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A single entry returned by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub length: u64,
}

/// Somewhere to put and fetch opaque, named byte blobs (already-encrypted
/// pack bodies and pack indexes; the engine above this layer never asks a
/// `BlobStore` to understand their contents).
///
/// Implementations must distinguish "the key doesn't exist"
/// ([`crate::errors::EngineError::BlobNotFound`]) from other I/O failures,
/// since the block manager relies on that distinction to tell a fresh pack
/// from a corrupt repository.
pub trait BlobStore: Send + Sync {
    /// Writes `data` under `key`, replacing any existing blob there.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Reads `length` bytes (or [`TO_END`] to read to the end of the blob)
    /// starting at `offset`.
    fn get(&self, key: &str, offset: u64, length: i64) -> Result<Vec<u8>>;

    /// Lists every blob whose key starts with `prefix`, checking `cancel`
    /// between backend round-trips so a caller can bail out of a large scan.
    fn list(&self, prefix: &str, cancel: &Cancel) -> Result<Vec<BlobMeta>>;

    /// Removes `key`. Deleting a key that doesn't exist is not an error —
    /// compaction routinely retries a delete against state it already
    /// changed.
    fn delete(&self, key: &str) -> Result<()>;
}
