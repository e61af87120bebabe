//! Small filesystem helper for atomic writes. Grounded on backpak's
//! `file_util.rs`, trimmed to the one routine this crate's write path
//! actually calls.

use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

use crate::errors::Result;

/// Copies the reader to a new file at `to + ".part"`, then renames to `to`.
///
/// This guarantees `to` never contains a partial file: either the rename
/// happens after a full, synced write, or `to` is untouched.
pub fn safe_copy_to_file<R: Read>(mut from: R, to: &Path) -> Result<File> {
    let mut to_part = to.to_owned().into_os_string();
    to_part.push(".part");
    let to_part = Path::new(&to_part);

    let mut to_fh = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(to_part)?;

    std::io::copy(&mut from, &mut to_fh)?;
    drop(from);

    to_fh.sync_all()?;
    std::fs::rename(to_part, to)?;

    Ok(to_fh)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn safe_copy_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");
        safe_copy_to_file(std::io::Cursor::new(b"hello world"), &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!dest.with_extension("part").exists());
    }
}
