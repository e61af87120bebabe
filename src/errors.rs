//! Error kinds the engine surfaces to its callers, per the propagation policy:
//! everything but [`EngineError::BlockNotFound`] (during lookup-then-retry) and
//! a stale-blob race during compaction bubbles up verbatim.

use thiserror::Error;

use crate::formatter::BlockId;

/// The kinds of failure the block engine can report.
///
/// Distinct from the grab-bag of `anyhow::Error` used for CLI-level glue:
/// this is the narrow, matchable boundary type callers (and the CLI's
/// exit-code mapping) can pattern-match on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    #[error("integrity error on block {id}: expected hash {expected}, got {actual}")]
    IntegrityError {
        id: BlockId,
        expected: String,
        actual: String,
    },

    #[error("pack group {pack} index entry for {block} is out of bounds ({offset}+{size} > {pack_len})")]
    PackBoundsError {
        pack: String,
        block: BlockId,
        offset: u32,
        size: u32,
        pack_len: u64,
    },

    #[error("malformed data: {0}")]
    FormatError(String),

    #[error("unknown compression header {0:?}")]
    UnknownCompressionHeader([u8; 4]),

    #[error("unknown object formatter {0:?}")]
    UnknownFormatter(String),

    #[error("malformed object ID: {0}")]
    MalformedObjectId(String),

    #[error("blob store I/O error")]
    IoError(#[from] std::io::Error),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("cryptographic operation failed: {0}")]
    CryptoError(String),

    #[error("operation canceled")]
    CanceledError,

    #[error("usage error: {0}")]
    UsageError(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
