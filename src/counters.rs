//! Process-wide statistics: lock-free counters for bytes and blocks moved
//! through the engine. All updates use relaxed atomics; there is no reset
//! operation, only a snapshot-by-copy (see [`snapshot`]).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use enum_map::{Enum, EnumMap};
use lazy_static::lazy_static;

/// 64-bit byte counters.
#[derive(Debug, Copy, Clone, Enum)]
pub enum ByteOp {
    BytesRead,
    BytesWritten,
    BytesHashed,
    BytesEncrypted,
    BytesDecrypted,
    BytesCompressed,
    BytesDecompressed,
}

/// 32-bit block/operation counters.
#[derive(Debug, Copy, Clone, Enum)]
pub enum BlockOp {
    BlocksHashed,
    BlocksChecked,
    BlocksPresent,
    BlocksValid,
    InvalidBlocks,
    WrittenBlocks,
    IndexLoad,
    BackendCacheHit,
    BackendCacheMiss,
    PackSkippedBlob,
    PackStreamRestart,
    PacksSealed,
    IndexesFlushed,
    IndexesCompacted,
}

lazy_static! {
    static ref BYTE_COUNTERS: EnumMap<ByteOp, AtomicU64> = EnumMap::default();
    static ref BLOCK_COUNTERS: EnumMap<BlockOp, AtomicU32> = EnumMap::default();
}

#[inline]
pub fn add_bytes(op: ByteOp, amount: u64) {
    BYTE_COUNTERS[op].fetch_add(amount, Ordering::Relaxed);
}

#[inline]
pub fn bump(op: BlockOp) {
    add_blocks(op, 1);
}

#[inline]
pub fn add_blocks(op: BlockOp, amount: u32) {
    BLOCK_COUNTERS[op].fetch_add(amount, Ordering::Relaxed);
}

#[inline]
pub fn get_bytes(op: ByteOp) -> u64 {
    BYTE_COUNTERS[op].load(Ordering::Relaxed)
}

#[inline]
pub fn get_blocks(op: BlockOp) -> u32 {
    BLOCK_COUNTERS[op].load(Ordering::Relaxed)
}

/// A point-in-time copy of every nonzero counter, for logging or `block list --stats`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub bytes: Vec<(&'static str, u64)>,
    pub blocks: Vec<(&'static str, u32)>,
}

fn byte_name(op: ByteOp) -> &'static str {
    match op {
        ByteOp::BytesRead => "bytes read",
        ByteOp::BytesWritten => "bytes written",
        ByteOp::BytesHashed => "bytes hashed",
        ByteOp::BytesEncrypted => "bytes encrypted",
        ByteOp::BytesDecrypted => "bytes decrypted",
        ByteOp::BytesCompressed => "bytes compressed",
        ByteOp::BytesDecompressed => "bytes decompressed",
    }
}

fn block_name(op: BlockOp) -> &'static str {
    match op {
        BlockOp::BlocksHashed => "blocks hashed",
        BlockOp::BlocksChecked => "blocks checked",
        BlockOp::BlocksPresent => "blocks present",
        BlockOp::BlocksValid => "blocks valid",
        BlockOp::InvalidBlocks => "invalid blocks",
        BlockOp::WrittenBlocks => "blocks written",
        BlockOp::IndexLoad => "indexes loaded",
        BlockOp::BackendCacheHit => "backend cache hits",
        BlockOp::BackendCacheMiss => "backend cache misses",
        BlockOp::PackSkippedBlob => "blobs skipped reading packs",
        BlockOp::PackStreamRestart => "pack read restarts",
        BlockOp::PacksSealed => "packs sealed",
        BlockOp::IndexesFlushed => "pack indexes flushed",
        BlockOp::IndexesCompacted => "pack indexes compacted away",
    }
}

/// Snapshots every counter that's nonzero. Never resets anything.
pub fn snapshot() -> Snapshot {
    let bytes = BYTE_COUNTERS
        .iter()
        .map(|(k, v)| (byte_name(k), v.load(Ordering::Relaxed)))
        .filter(|(_, v)| *v > 0)
        .collect();
    let blocks = BLOCK_COUNTERS
        .iter()
        .map(|(k, v)| (block_name(k), v.load(Ordering::Relaxed)))
        .filter(|(_, v)| *v > 0)
        .collect();
    Snapshot { bytes, blocks }
}

pub fn log_counts() {
    let snap = snapshot();
    if snap.bytes.is_empty() && snap.blocks.is_empty() {
        return;
    }
    tracing::debug!("Counters:");
    for (name, count) in &snap.bytes {
        tracing::debug!("{count:>12} {name}");
    }
    for (name, count) in &snap.blocks {
        tracing::debug!("{count:>12} {name}");
    }
}
