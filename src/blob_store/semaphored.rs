//! Caps the number of concurrent operations against an inner
//! [`super::BlobStore`] — useful once callers start hammering a backend
//! with rayon-parallel fetches or deletes and want to bound the fan-out.
//!
//! Grounded directly on backpak's `backend/semaphored.rs`, which hand-rolls
//! a counting semaphore over `atomic-wait` rather than use a std
//! (nonexistent) or tokio (async-only) one.

use std::sync::atomic::{AtomicU32, Ordering};

use atomic_wait::{wait, wake_one};

use crate::errors::Result;

use super::{BlobMeta, BlobStore, Cancel};

struct Permit<'a> {
    count: &'a AtomicU32,
}

fn acquire(count: &AtomicU32) -> Permit<'_> {
    let mut prev = count.load(Ordering::Relaxed).max(1);
    loop {
        if prev == 0 {
            wait(count, 0);
            prev = 1;
            continue;
        }
        match count.compare_exchange_weak(prev, prev - 1, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => prev = actual,
        }
    }
    Permit { count }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.count.fetch_add(1, Ordering::Release) == 0 {
            wake_one(self.count);
        }
    }
}

pub struct BoundedBlobStore<B> {
    inner: B,
    permits: AtomicU32,
}

impl<B: BlobStore> BoundedBlobStore<B> {
    pub fn new(inner: B, concurrency: u32) -> Self {
        assert!(concurrency > 0, "concurrency must be nonzero");
        Self {
            inner,
            permits: AtomicU32::new(concurrency),
        }
    }
}

impl<B: BlobStore> BlobStore for BoundedBlobStore<B> {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let _permit = acquire(&self.permits);
        self.inner.put(key, data)
    }

    fn get(&self, key: &str, offset: u64, length: i64) -> Result<Vec<u8>> {
        let _permit = acquire(&self.permits);
        self.inner.get(key, offset, length)
    }

    fn list(&self, prefix: &str, cancel: &Cancel) -> Result<Vec<BlobMeta>> {
        let _permit = acquire(&self.permits);
        self.inner.list(prefix, cancel)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _permit = acquire(&self.permits);
        self.inner.delete(key)
    }
}

#[cfg(test)]
mod test {
    use super::super::MemoryBlobStore;
    use super::*;

    #[test]
    fn passes_operations_through() {
        let store = BoundedBlobStore::new(MemoryBlobStore::new(), 2);
        store.put("packs/aa/one", b"hello").unwrap();
        assert_eq!(store.get("packs/aa/one", 0, 5).unwrap(), b"hello");
        let cancel = Cancel::new();
        let listed = store.list("packs/", &cancel).unwrap();
        assert_eq!(listed.len(), 1);
        store.delete("packs/aa/one").unwrap();
        assert!(store.get("packs/aa/one", 0, 5).is_err());
    }
}
