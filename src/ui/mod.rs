//! The `block` CLI surface: thin subcommand modules over the engine, one
//! file per subcommand, matching backpak's own `ui/*.rs` convention (an
//! `Args` struct deriving `clap::Parser`/`clap::Args`, a `run()` entry
//! point).

pub mod compact;
pub mod flush;
pub mod list;
pub mod read;
pub mod write;

use std::io::{self, Write as _};
use std::sync::Arc;

use camino::Utf8Path;

use crate::blob_store::{BlobStore, FsBlobStore, TO_END};
use crate::blockmgr::{BlockManager, BlockManagerConfig};
use crate::config::FormatHeader;
use crate::errors::{EngineError, Result};
use crate::formatter::Formatter;

/// Opens an existing repository: reads its [`FormatHeader`], unseals it with
/// `password`, and builds a [`BlockManager`] over an [`FsBlobStore`] rooted
/// at `repository`.
///
/// Password handling is intentionally minimal here (an env var, or a single
/// unechoed-nothing read from stdin) — a richer credential story (keychain
/// integration, prompts with proper terminal handling) belongs to the
/// higher-level CLI layered on top of this engine, per SPEC_FULL.md's scope
/// note that user-facing CLI beyond `block write/read/list/compact/flush`
/// is an external collaborator.
pub fn open_repository(repository: &Utf8Path, password: &[u8]) -> Result<(Arc<BlockManager>, FormatHeader)> {
    let blob_store = Arc::new(FsBlobStore::open(repository)?);
    let header_bytes = blob_store.get(crate::config::FORMAT_HEADER_BLOB, 0, TO_END)?;
    let header = FormatHeader::unseal(&header_bytes, password)
        .map_err(|e| EngineError::CryptoError(e.to_string()))?;
    let formatter = Formatter::by_name(&header.object_format, &header.secret, header.master_key())?;
    let manager = Arc::new(BlockManager::new(blob_store, formatter, BlockManagerConfig::default()));
    Ok((manager, header))
}

/// Initializes a brand-new repository directory with a freshly generated,
/// password-sealed format header.
pub fn init_repository(
    repository: &Utf8Path,
    password: &[u8],
    object_format: &str,
    max_inline_content_length: u32,
    max_block_size: u32,
    needs_master_key: bool,
) -> Result<()> {
    FsBlobStore::initialize(repository)?;
    let blob_store = FsBlobStore::open(repository)?;
    let header = FormatHeader::generate(object_format, max_inline_content_length, max_block_size, needs_master_key);
    let sealed = header
        .seal(password)
        .map_err(|e| EngineError::CryptoError(e.to_string()))?;
    blob_store.put(crate::config::FORMAT_HEADER_BLOB, &sealed)
}

pub(crate) fn read_all_stdin() -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    io::Read::read_to_end(&mut io::stdin().lock(), &mut buf)?;
    Ok(buf)
}

pub(crate) fn write_all_stdout(bytes: &[u8]) -> io::Result<()> {
    io::stdout().lock().write_all(bytes)
}
