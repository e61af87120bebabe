//! The default, and so far only fully-implemented, [`super::BlobStore`]:
//! blobs as files under a repository directory.
//!
//! Grounded on backpak's `backend/fs.rs`. That file lays out `packs/<2-hex>/`
//! buckets and an `indexes/` directory at `initialize()` time; we keep the
//! same fan-out (256 pack buckets keep any one directory from growing
//! enormous as a repository fills up) but make `get`/`put`/`list`/`delete`
//! actually work, using `file_util::safe_copy_to_file`'s
//! write-to-temp-then-rename idiom for `put` instead of writing in place.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};

use crate::errors::{EngineError, Result};
use crate::file_util;

use super::{BlobMeta, BlobStore, Cancel, TO_END};

pub struct FsBlobStore {
    base_directory: Utf8PathBuf,
}

impl FsBlobStore {
    /// Lays out a fresh repository directory: `packs/<2-hex>/` buckets plus
    /// a flat `indexes/` directory.
    pub fn initialize(repository: &Utf8Path) -> Result<()> {
        if repository.exists() {
            return Err(EngineError::UsageError(format!(
                "{repository} already exists"
            )));
        }
        fs::create_dir_all(repository)?;
        fs::create_dir(repository.join("packs"))?;
        for b in 0..=255u8 {
            fs::create_dir(repository.join(format!("packs/{b:02x}")))?;
        }
        fs::create_dir(repository.join("indexes"))?;
        Ok(())
    }

    pub fn open(repository: &Utf8Path) -> Result<Self> {
        if !repository.join("packs").is_dir() || !repository.join("indexes").is_dir() {
            return Err(EngineError::FormatError(format!(
                "{repository} doesn't look like a block repository"
            )));
        }
        Ok(Self {
            base_directory: repository.to_owned(),
        })
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.base_directory.join(key).into()
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let to = self.resolve(key);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        file_util::safe_copy_to_file(std::io::Cursor::new(data), &to)?;
        crate::counters::add_bytes(crate::counters::ByteOp::BytesWritten, data.len() as u64);
        Ok(())
    }

    fn get(&self, key: &str, offset: u64, length: i64) -> Result<Vec<u8>> {
        let from = self.resolve(key);
        let mut f = File::open(&from).map_err(|e| not_found_or_io(key, e))?;
        f.seek(SeekFrom::Start(offset))?;
        let mut out = Vec::new();
        if length == TO_END {
            f.read_to_end(&mut out)?;
        } else {
            let length = length as u64;
            out.resize(length as usize, 0);
            f.read_exact(&mut out)?;
        }
        crate::counters::add_bytes(crate::counters::ByteOp::BytesRead, out.len() as u64);
        Ok(out)
    }

    fn list(&self, prefix: &str, cancel: &Cancel) -> Result<Vec<BlobMeta>> {
        let mut out = Vec::new();
        walk(&self.base_directory, &self.base_directory, prefix, cancel, &mut out)?;
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::IoError(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deleting_a_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Utf8Path::from_path(dir.path()).unwrap();
        FsBlobStore::initialize(repo).unwrap();
        let store = FsBlobStore::open(repo).unwrap();

        store.delete("indexes/never-written").unwrap();

        store.put("indexes/blob", b"data").unwrap();
        store.delete("indexes/blob").unwrap();
        store.delete("indexes/blob").unwrap();
    }
}

fn not_found_or_io(key: &str, e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EngineError::BlobNotFound(key.to_owned())
    } else {
        EngineError::IoError(e)
    }
}

fn walk(
    base: &Utf8Path,
    dir: &Path,
    prefix: &str,
    cancel: &Cancel,
    out: &mut Vec<BlobMeta>,
) -> Result<()> {
    if cancel.is_canceled() {
        return Err(EngineError::CanceledError);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(base, &path, prefix, cancel, out)?;
            continue;
        }
        let Ok(utf8) = Utf8PathBuf::try_from(path.clone()) else {
            continue;
        };
        let Ok(key) = utf8.strip_prefix(base) else {
            continue;
        };
        let key = key.as_str();
        if key.starts_with(prefix) {
            let length = entry.metadata()?.len();
            out.push(BlobMeta {
                key: key.to_owned(),
                length,
            });
        }
    }
    Ok(())
}
