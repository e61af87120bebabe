//! A write-through local cache in front of a slower [`super::BlobStore`].
//!
//! Grounded on backpak's `backend.rs::CachedBackend`/`WritethroughCache`
//! (the simpler, directory-of-files cache that predates that repo's later
//! `rusqlite`-backed `backend/cache.rs`). We follow the directory-of-files
//! design rather than pull in a new database dependency the rest of this
//! crate has no other use for; see DESIGN.md.

use std::fs;
use std::path::PathBuf;

use crate::errors::Result;
use crate::file_util;

use super::{BlobMeta, BlobStore, Cancel, TO_END};

pub struct CachedBlobStore<B> {
    cache_directory: PathBuf,
    inner: B,
}

impl<B: BlobStore> CachedBlobStore<B> {
    pub fn new(cache_directory: impl Into<PathBuf>, inner: B) -> Self {
        Self {
            cache_directory: cache_directory.into(),
            inner,
        }
    }

    fn cached_path(&self, key: &str) -> PathBuf {
        self.cache_directory.join(key)
    }
}

impl<B: BlobStore> BlobStore for CachedBlobStore<B> {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data)?;
        let cached = self.cached_path(key);
        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent)?;
        }
        file_util::safe_copy_to_file(std::io::Cursor::new(data), &cached)?;
        Ok(())
    }

    fn get(&self, key: &str, offset: u64, length: i64) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};

        let cached = self.cached_path(key);
        match fs::File::open(&cached) {
            Ok(mut f) => {
                crate::counters::bump(crate::counters::BlockOp::BackendCacheHit);
                f.seek(SeekFrom::Start(offset))?;
                let mut out = Vec::new();
                if length == TO_END {
                    f.read_to_end(&mut out)?;
                } else {
                    out.resize(length as usize, 0);
                    f.read_exact(&mut out)?;
                }
                Ok(out)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                crate::counters::bump(crate::counters::BlockOp::BackendCacheMiss);
                let whole = self.inner.get(key, 0, TO_END)?;
                if let Some(parent) = cached.parent() {
                    fs::create_dir_all(parent)?;
                }
                file_util::safe_copy_to_file(std::io::Cursor::new(&whole), &cached)?;
                let offset = offset as usize;
                let end = if length == TO_END {
                    whole.len()
                } else {
                    offset + length as usize
                };
                Ok(whole[offset..end].to_vec())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str, cancel: &Cancel) -> Result<Vec<BlobMeta>> {
        self.inner.list(prefix, cancel)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)?;
        let cached = self.cached_path(key);
        match fs::remove_file(&cached) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
