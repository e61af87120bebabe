//! An in-memory [`super::BlobStore`], for tests that shouldn't touch disk.
//!
//! Grounded directly on backpak's `backend/memory.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{EngineError, Result};

use super::{BlobMeta, BlobStore, Cancel, TO_END};

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_owned(), data.to_owned());
        Ok(())
    }

    fn get(&self, key: &str, offset: u64, length: i64) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(key)
            .ok_or_else(|| EngineError::BlobNotFound(key.to_owned()))?;
        let offset = offset as usize;
        if offset > blob.len() {
            return Err(EngineError::FormatError(format!(
                "read offset {offset} past end of {key} ({} bytes)",
                blob.len()
            )));
        }
        let end = if length == TO_END {
            blob.len()
        } else {
            let end = offset + length as usize;
            if end > blob.len() {
                return Err(EngineError::FormatError(format!(
                    "read of {length} bytes at offset {offset} runs past end of {key} ({} bytes)",
                    blob.len()
                )));
            }
            end
        };
        Ok(blob[offset..end].to_vec())
    }

    fn list(&self, prefix: &str, cancel: &Cancel) -> Result<Vec<BlobMeta>> {
        if cancel.is_canceled() {
            return Err(EngineError::CanceledError);
        }
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| BlobMeta {
                key: k.clone(),
                length: v.len() as u64,
            })
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deleting_a_missing_key_is_not_an_error() {
        let store = MemoryBlobStore::new();
        store.delete("never-written").unwrap();

        store.put("blob", b"data").unwrap();
        store.delete("blob").unwrap();
        store.delete("blob").unwrap();
    }
}
