//! The block manager: assigns block IDs, dedupes, packs small blocks into
//! larger pack blobs, maintains pack indexes, serves reads, and compacts.
//!
//! Grounded on backpak's `pack.rs` (pack framing, finalize-and-persist) and
//! `index.rs` (rayon-parallel index loading via a `Mutex`-guarded
//! accumulator in `build_master_index`, `blob_to_pack_map`), generalized
//! from backpak's channel-pipeline design (packer/indexer/uploader threads
//! talking over `tokio::mpsc`) into a single mutex-guarded synchronous
//! manager, since nothing here needs more than one writer to be correct —
//! backpak's own `async fn index()`/`build_master_index()` never actually
//! `.await` anything, they just wrap rayon work.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::blob_store::{BlobStore, Cancel, TO_END};
use crate::compression;
use crate::counters::{self, BlockOp};
use crate::errors::{EngineError, Result};
use crate::formatter::{BlockId, Formatter, PACK_INDEX_PREFIX};

pub type PackGroup = String;

/// Reserved pack group under which sealed pack blobs are themselves
/// registered, so they're discoverable via [`ListKind::Packs`].
pub const PACKS_GROUP: &str = "packs";
/// Pack group for blocks uploaded standalone (too large to pack, or not
/// from a packable group).
pub const NON_PACKED_GROUP: &str = "raw";
/// Older name for [`NON_PACKED_GROUP`]. New repositories write
/// [`NON_PACKED_GROUP`]; readers must still recognize this one.
pub const LEGACY_NON_PACKED_GROUP: &str = "_unpacked_";

fn is_non_packed_group(group: &str) -> bool {
    matches!(
        group,
        PACKS_GROUP | NON_PACKED_GROUP | LEGACY_NON_PACKED_GROUP
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackIndexItem {
    pub offset: u32,
    pub size: u32,
    /// Length of the block's content after decompression. Equals `size`
    /// unless the block was compressed before encryption.
    #[serde(rename = "logicalSize", default)]
    pub logical_size: u32,
}

/// One pack's worth of metadata: which blob (if any) it lives in, and where
/// each block sits inside it. `pack_object` is empty for non-packed groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackIndexRecord {
    #[serde(rename = "packObject")]
    pub pack_object: String,
    #[serde(rename = "packGroup")]
    pub pack_group: String,
    #[serde(rename = "createTime")]
    pub create_time: jiff::Timestamp,
    pub items: BTreeMap<String, PackIndexItem>,
}

impl PackIndexRecord {
    fn new(group: &str) -> Self {
        Self {
            pack_object: String::new(),
            pack_group: group.to_owned(),
            create_time: jiff::Timestamp::now(),
            items: BTreeMap::new(),
        }
    }

    fn is_packed(&self) -> bool {
        !self.pack_object.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Location {
    /// Bytes are still sitting in this group's in-memory open-pack buffer.
    Buffered {
        offset: u32,
        size: u32,
        logical_size: u32,
    },
    /// Bytes live in the sealed pack blob named `pack_object`.
    Packed {
        pack_object: String,
        offset: u32,
        size: u32,
        logical_size: u32,
    },
    /// Bytes live in a standalone blob named by the block ID itself.
    Standalone { size: u32, logical_size: u32 },
}

impl Location {
    /// Bytes actually occupied on disk (post-compression, post-encryption).
    fn size(&self) -> u32 {
        match self {
            Location::Buffered { size, .. }
            | Location::Packed { size, .. }
            | Location::Standalone { size, .. } => *size,
        }
    }

    /// Length of the block's content as `get_block` returns it, after
    /// decompression.
    fn logical_size(&self) -> u32 {
        match self {
            Location::Buffered { logical_size, .. }
            | Location::Packed { logical_size, .. }
            | Location::Standalone { logical_size, .. } => *logical_size,
        }
    }
}

#[derive(Debug, Clone)]
struct BlockEntry {
    pack_group: PackGroup,
    location: Location,
}

struct OpenPack {
    buffer: Vec<u8>,
    index: PackIndexRecord,
}

impl OpenPack {
    fn new(group: &str) -> Self {
        Self {
            buffer: Vec::new(),
            index: PackIndexRecord::new(group),
        }
    }
}

struct ManagerState {
    open_packs: HashMap<PackGroup, OpenPack>,
    pending_indexes: Vec<PackIndexRecord>,
    /// `None` until the first public call loads and merges every `P...`
    /// blob; populated exactly once per manager lifetime.
    block_to_index: Option<HashMap<String, BlockEntry>>,
    flush_after: Instant,
}

pub struct BlockManagerConfig {
    pub max_pack_size: u64,
    pub max_packed_content_length: u32,
    pub max_non_packed_blocks_per_index: usize,
    pub flush_interval: Duration,
    pub parallel_deletes: usize,
    /// Codec (by name, per [`crate::compression`]) every block's content is
    /// run through before encryption. Chosen once per manager; a given
    /// repository's blocks don't mix codecs, since decompression dispatches
    /// on the self-describing header `compress` writes, not on this field.
    pub compression_codec: String,
}

impl Default for BlockManagerConfig {
    fn default() -> Self {
        Self {
            max_pack_size: crate::DEFAULT_MAX_PACK_SIZE,
            max_packed_content_length: crate::DEFAULT_MAX_PACKED_CONTENT_LENGTH,
            max_non_packed_blocks_per_index: 50_000,
            flush_interval: crate::FLUSH_PACK_INDEXES_INTERVAL,
            parallel_deletes: num_cpus::get(),
            compression_codec: "zstd".to_owned(),
        }
    }
}

/// Which blocks [`BlockManager::list_blocks`] should return. `All` and
/// `Logical` are both implemented as "every indexed block": this engine has
/// no internal-only bookkeeping entries that would need excluding from
/// `Logical`, so the two coincide here even though they're independent
/// predicates in principle (a pack-blob registration satisfies both `Packs`
/// and `Logical` at once).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    All,
    Logical,
    Packs,
    Packed,
    NonPacked,
}

impl ListKind {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "all" => ListKind::All,
            "logical" => ListKind::Logical,
            "packs" => ListKind::Packs,
            "packed" => ListKind::Packed,
            "nonpacked" => ListKind::NonPacked,
            other => {
                return Err(EngineError::UsageError(format!(
                    "unknown list_blocks kind {other:?}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ListedBlock {
    pub block_id: BlockId,
    pub pack_group: PackGroup,
    pub size: u32,
}

/// Owns all mutable repository state: open packs, pending indexes, and the
/// lazily-built block-to-location map. The blob store underneath is shared
/// and stateless to this type.
pub struct BlockManager {
    blob_store: Arc<dyn BlobStore>,
    formatter: Formatter,
    config: BlockManagerConfig,
    state: Mutex<ManagerState>,
}

impl BlockManager {
    pub fn new(blob_store: Arc<dyn BlobStore>, formatter: Formatter, config: BlockManagerConfig) -> Self {
        let flush_after = Instant::now() + config.flush_interval;
        Self {
            blob_store,
            formatter,
            config,
            state: Mutex::new(ManagerState {
                open_packs: HashMap::new(),
                pending_indexes: Vec::new(),
                block_to_index: None,
                flush_after,
            }),
        }
    }

    pub fn block_size(&self, block_id: &BlockId) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        self.ensure_block_index_loaded(&mut state)?;
        let entry = state
            .block_to_index
            .as_ref()
            .unwrap()
            .get(&block_id.to_string())
            .ok_or_else(|| EngineError::BlockNotFound(block_id.clone()))?;
        Ok(entry.location.logical_size() as u64)
    }

    pub fn get_block(&self, block_id: &BlockId) -> Result<Vec<u8>> {
        let key = block_id.to_string();

        enum Fetch {
            Buffer(Vec<u8>),
            Blob { name: String, offset: u64, length: i64 },
        }

        let fetch = {
            let mut state = self.state.lock().unwrap();
            self.ensure_block_index_loaded(&mut state)?;
            let entry = state
                .block_to_index
                .as_ref()
                .unwrap()
                .get(&key)
                .cloned()
                .ok_or_else(|| EngineError::BlockNotFound(block_id.clone()))?;

            match entry.location {
                Location::Buffered { offset, size, .. } => {
                    let open = state.open_packs.get(&entry.pack_group).ok_or_else(|| {
                        EngineError::FormatError(format!(
                            "block {key} marked buffered in group {} but no open pack exists",
                            entry.pack_group
                        ))
                    })?;
                    let start = offset as usize;
                    let end = start + size as usize;
                    if end > open.buffer.len() {
                        return Err(EngineError::PackBoundsError {
                            pack: entry.pack_group.clone(),
                            block: block_id.clone(),
                            offset,
                            size,
                            pack_len: open.buffer.len() as u64,
                        });
                    }
                    Fetch::Buffer(open.buffer[start..end].to_vec())
                }
                Location::Packed {
                    pack_object,
                    offset,
                    size,
                    ..
                } => Fetch::Blob {
                    name: pack_object,
                    offset: offset as u64,
                    length: size as i64,
                },
                Location::Standalone { size, .. } => Fetch::Blob {
                    name: key.clone(),
                    offset: 0,
                    length: size as i64,
                },
            }
        };

        let ciphertext = match fetch {
            Fetch::Buffer(bytes) => bytes,
            Fetch::Blob { name, offset, length } => self.blob_store.get(&name, offset, length)?,
        };

        // `stored` is what `write_block` actually hashed, encrypted, and
        // persisted: the content after compression, before encryption.
        // Verifying against it (rather than decompressing first) means a
        // flipped bit is always caught as an integrity error, never
        // surfaced as a decompression failure.
        let stored = self.formatter.decrypt_stored(&ciphertext, block_id)?;
        self.formatter.verify(&stored, block_id)?;
        counters::bump(BlockOp::BlocksPresent);
        compression::decompress(&stored)
    }

    /// Hashes, prefixes, dedupes, and (depending on size and group) either
    /// appends `data` to the group's open pack or uploads it standalone.
    pub fn write_block(&self, pack_group: &str, data: &[u8], prefix: Option<char>) -> Result<BlockId> {
        if prefix == Some(PACK_INDEX_PREFIX) {
            return Err(EngineError::UsageError(format!(
                "prefix {PACK_INDEX_PREFIX:?} is reserved for pack indexes"
            )));
        }

        // The block ID is derived from the compressed bytes, not the raw
        // content: every codec here is deterministic, so identical content
        // still converges on the same ID, and `get_block` can verify the
        // stored bytes directly without decompressing first.
        let stored = compression::compress(&self.config.compression_codec, data)?;
        let logical_size = data.len() as u32;
        let computed = self.formatter.compute_id(&stored);
        let block_id = match prefix {
            Some(p) => computed.block_id.with_prefix(p),
            None => computed.block_id.clone(),
        };
        let key = block_id.to_string();

        let mut state = self.state.lock().unwrap();
        self.ensure_block_index_loaded(&mut state)?;

        if state.block_to_index.as_ref().unwrap().contains_key(&key) {
            return Ok(block_id);
        }

        let packable = !is_non_packed_group(pack_group)
            && data.len() as u64 <= self.config.max_packed_content_length as u64;

        if packable {
            let ciphertext = self.formatter.encrypt(&stored, &computed);
            let size = ciphertext.len() as u32;

            let buffer_len = {
                let open = state
                    .open_packs
                    .entry(pack_group.to_owned())
                    .or_insert_with(|| OpenPack::new(pack_group));
                let offset = open.buffer.len() as u32;
                open.index.items.insert(
                    key.clone(),
                    PackIndexItem { offset, size, logical_size },
                );
                open.buffer.extend_from_slice(&ciphertext);

                state.block_to_index.as_mut().unwrap().insert(
                    key.clone(),
                    BlockEntry {
                        pack_group: pack_group.to_owned(),
                        location: Location::Buffered { offset, size, logical_size },
                    },
                );
                open.buffer.len() as u64
            };

            counters::bump(BlockOp::WrittenBlocks);

            if buffer_len >= self.config.max_pack_size {
                self.seal_pack_locked(&mut state, pack_group)?;
            }
        } else {
            let ciphertext = self.formatter.encrypt(&stored, &computed);
            let size = ciphertext.len() as u32;
            self.blob_store.put(&key, &ciphertext)?;

            let open = state
                .open_packs
                .entry(NON_PACKED_GROUP.to_owned())
                .or_insert_with(|| OpenPack::new(NON_PACKED_GROUP));
            open.index.items.insert(
                key.clone(),
                PackIndexItem { offset: 0, size, logical_size },
            );

            state.block_to_index.as_mut().unwrap().insert(
                key.clone(),
                BlockEntry {
                    pack_group: NON_PACKED_GROUP.to_owned(),
                    location: Location::Standalone { size, logical_size },
                },
            );

            counters::bump(BlockOp::WrittenBlocks);
        }

        self.maybe_flush_locked(&mut state)?;
        Ok(block_id)
    }

    /// Seals every packed group with pending bytes and flushes all pending
    /// indexes — including non-packed groups' accumulated index entries —
    /// as one new `P...` blob.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_block_index_loaded(&mut state)?;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut ManagerState) -> Result<()> {
        let filling: Vec<String> = state
            .open_packs
            .iter()
            .filter(|(_, p)| !p.buffer.is_empty())
            .map(|(g, _)| g.clone())
            .collect();
        for group in filling {
            self.seal_pack_locked(state, &group)?;
        }

        let idle_with_entries: Vec<String> = state
            .open_packs
            .iter()
            .filter(|(_, p)| p.buffer.is_empty() && !p.index.items.is_empty())
            .map(|(g, _)| g.clone())
            .collect();
        for group in idle_with_entries {
            if let Some(open) = state.open_packs.remove(&group) {
                state.pending_indexes.push(open.index);
            }
        }

        self.flush_pending_indexes_locked(state)
    }

    fn flush_pending_indexes_locked(&self, state: &mut ManagerState) -> Result<()> {
        if state.pending_indexes.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut state.pending_indexes);
        self.write_index_blob(&records)?;
        counters::bump(BlockOp::IndexesFlushed);
        state.flush_after = Instant::now() + self.config.flush_interval;
        Ok(())
    }

    fn write_index_blob(&self, records: &[PackIndexRecord]) -> Result<BlockId> {
        let json = serde_json::to_vec(records)
            .map_err(|e| EngineError::FormatError(format!("couldn't encode pack index: {e}")))?;

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&json)?;
        let gzipped = gz.finish()?;

        let computed = self.formatter.compute_id(&gzipped);
        let block_id = computed.block_id.with_prefix(PACK_INDEX_PREFIX);
        let ciphertext = self.formatter.encrypt(&gzipped, &computed);
        self.blob_store.put(&block_id.to_string(), &ciphertext)?;
        Ok(block_id)
    }

    fn maybe_flush_locked(&self, state: &mut ManagerState) -> Result<()> {
        let over_count_threshold = state
            .open_packs
            .values()
            .any(|p| p.buffer.is_empty() && p.index.items.len() > self.config.max_non_packed_blocks_per_index);

        if Instant::now() >= state.flush_after || over_count_threshold {
            self.flush_locked(state)?;
        }
        Ok(())
    }

    /// Seals `group`'s open pack: hashes and uploads its buffer (a
    /// concatenation of already-encrypted item ciphertexts) as one blob,
    /// registers the pack blob itself under [`PACKS_GROUP`] for
    /// discoverability, and moves the now-complete index onto the pending
    /// list. A no-op if the group has no open pack or an empty buffer.
    ///
    /// The [`PACKS_GROUP`] registration is bookkeeping only — nobody calls
    /// [`BlockManager::get_block`] on a pack's own ID, since its bytes were
    /// never put through [`Formatter::encrypt`] as a unit.
    fn seal_pack_locked(&self, state: &mut ManagerState, group: &str) -> Result<()> {
        let Some(mut open) = state.open_packs.remove(group) else {
            return Ok(());
        };
        if open.buffer.is_empty() {
            state.open_packs.insert(group.to_owned(), open);
            return Ok(());
        }

        // The pack's items are already individually encrypted (each was
        // put through `formatter.encrypt` in `write_block` before landing
        // in this buffer), so the pack itself is stored as-is: the items'
        // recorded offsets index straight into what's on disk. Wrapping the
        // whole buffer in another layer of encryption would leave those
        // offsets pointing into ciphertext-of-ciphertext instead.
        let pack_block_id = self.formatter.compute_id(&open.buffer).block_id;
        self.blob_store.put(&pack_block_id.to_string(), &open.buffer)?;
        open.index.pack_object = pack_block_id.to_string();

        {
            let map = state.block_to_index.as_mut().unwrap();
            for id_str in open.index.items.keys() {
                if let Some(entry) = map.get_mut(id_str) {
                    if let Location::Buffered { offset, size, logical_size } = entry.location {
                        entry.location = Location::Packed {
                            pack_object: open.index.pack_object.clone(),
                            offset,
                            size,
                            logical_size,
                        };
                    }
                }
            }
        }

        let pack_entry_size = open.buffer.len() as u32;
        let packs_open = state
            .open_packs
            .entry(PACKS_GROUP.to_owned())
            .or_insert_with(|| OpenPack::new(PACKS_GROUP));
        packs_open.index.items.insert(
            pack_block_id.to_string(),
            PackIndexItem {
                offset: 0,
                size: pack_entry_size,
                logical_size: pack_entry_size,
            },
        );

        state.block_to_index.as_mut().unwrap().insert(
            pack_block_id.to_string(),
            BlockEntry {
                pack_group: PACKS_GROUP.to_owned(),
                location: Location::Standalone {
                    size: pack_entry_size,
                    logical_size: pack_entry_size,
                },
            },
        );

        counters::bump(BlockOp::PacksSealed);
        state.pending_indexes.push(open.index);
        Ok(())
    }

    /// Merges every `P...` pack index older than `cutoff` into one, keeping
    /// the newer `CreateTime` entry for any block_id duplicated across
    /// indexes, optionally dropping entries absent from `in_use`, and
    /// deleting the superseded source blobs.
    pub fn compact_indexes(&self, cutoff: jiff::Timestamp, in_use: Option<&HashSet<BlockId>>) -> Result<()> {
        let cancel = Cancel::new();
        let index_keys: Vec<String> = self
            .blob_store
            .list("", &cancel)?
            .into_iter()
            .map(|b| b.key)
            .filter(|k| k.starts_with(PACK_INDEX_PREFIX))
            .collect();

        let loaded: Vec<Result<Vec<PackIndexRecord>>> =
            index_keys.par_iter().map(|key| self.load_pack_index_blob(key)).collect();

        let mut records = Vec::new();
        for r in loaded {
            for rec in r? {
                if rec.create_time > cutoff {
                    continue;
                }
                records.push(rec);
            }
        }

        let in_use_strings: Option<HashSet<String>> =
            in_use.map(|set| set.iter().map(|b| b.to_string()).collect());

        let mut winner_of: HashMap<String, (jiff::Timestamp, usize)> = HashMap::new();
        for (idx, rec) in records.iter().enumerate() {
            for block_id in rec.items.keys() {
                let is_winner = match winner_of.get(block_id) {
                    Some((t, _)) => rec.create_time > *t,
                    None => true,
                };
                if is_winner {
                    winner_of.insert(block_id.clone(), (rec.create_time, idx));
                }
            }
        }

        for (idx, rec) in records.iter_mut().enumerate() {
            rec.items.retain(|block_id, _| {
                let is_winner = winner_of.get(block_id).map(|(_, i)| *i == idx).unwrap_or(false);
                let in_use_ok = in_use_strings.as_ref().map(|s| s.contains(block_id)).unwrap_or(true);
                is_winner && in_use_ok
            });
        }
        records.retain(|rec| !rec.items.is_empty());

        if records.len() <= 1 && in_use.is_none() {
            return Ok(());
        }

        let merged_block_id = self.write_index_blob(&records)?;
        counters::bump(BlockOp::IndexesCompacted);

        let merged_key = merged_block_id.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_deletes.max(1))
            .build()
            .map_err(|e| EngineError::FormatError(format!("couldn't build delete pool: {e}")))?;
        pool.install(|| {
            index_keys.par_iter().for_each(|key| {
                if *key == merged_key {
                    return;
                }
                if let Err(e) = self.blob_store.delete(key) {
                    tracing::warn!("compaction: couldn't delete superseded index {key}: {e}");
                }
            });
        });

        // Force a rebuild from the now-compacted set of P... blobs.
        self.state.lock().unwrap().block_to_index = None;
        Ok(())
    }

    pub fn list_blocks(&self, prefix: &str, kind: &str) -> Result<Vec<ListedBlock>> {
        let kind = ListKind::parse(kind)?;
        let mut state = self.state.lock().unwrap();
        self.ensure_block_index_loaded(&mut state)?;

        let map = state.block_to_index.as_ref().unwrap();
        let mut out = Vec::new();
        for (id_str, entry) in map {
            if !id_str.starts_with(prefix) {
                continue;
            }
            let keep = match kind {
                ListKind::All | ListKind::Logical => true,
                ListKind::Packs => entry.pack_group == PACKS_GROUP,
                ListKind::Packed => matches!(entry.location, Location::Packed { .. }),
                ListKind::NonPacked => !matches!(entry.location, Location::Packed { .. }),
            };
            if !keep {
                continue;
            }
            out.push(ListedBlock {
                block_id: id_str.parse()?,
                pack_group: entry.pack_group.clone(),
                size: entry.location.size(),
            });
        }
        Ok(out)
    }

    fn load_pack_index_blob(&self, key: &str) -> Result<Vec<PackIndexRecord>> {
        let raw = self.blob_store.get(key, 0, TO_END)?;
        let block_id: BlockId = key.parse()?;
        let gzipped = self.formatter.decrypt_stored(&raw, &block_id)?;
        self.formatter.verify(&gzipped, &block_id)?;

        let mut json = Vec::new();
        flate2::read::GzDecoder::new(&gzipped[..]).read_to_end(&mut json)?;
        counters::bump(BlockOp::IndexLoad);

        serde_json::from_slice(&json).map_err(|e| EngineError::FormatError(format!("malformed pack index {key}: {e}")))
    }

    fn ensure_block_index_loaded(&self, state: &mut ManagerState) -> Result<()> {
        if state.block_to_index.is_some() {
            return Ok(());
        }

        let cancel = Cancel::new();
        let index_keys: Vec<String> = self
            .blob_store
            .list("", &cancel)?
            .into_iter()
            .map(|b| b.key)
            .filter(|k| k.starts_with(PACK_INDEX_PREFIX))
            .collect();

        let loaded: Vec<Result<Vec<PackIndexRecord>>> =
            index_keys.par_iter().map(|key| self.load_pack_index_blob(key)).collect();

        let mut all_records = Vec::new();
        for r in loaded {
            all_records.extend(r?);
        }

        let mut winner_time: HashMap<String, jiff::Timestamp> = HashMap::new();
        let mut map: HashMap<String, BlockEntry> = HashMap::new();
        for rec in &all_records {
            for (block_id, item) in &rec.items {
                let is_winner = match winner_time.get(block_id) {
                    Some(t) => rec.create_time > *t,
                    None => true,
                };
                if is_winner {
                    winner_time.insert(block_id.clone(), rec.create_time);
                    let location = if rec.is_packed() {
                        Location::Packed {
                            pack_object: rec.pack_object.clone(),
                            offset: item.offset,
                            size: item.size,
                            logical_size: item.logical_size,
                        }
                    } else {
                        Location::Standalone {
                            size: item.size,
                            logical_size: item.logical_size,
                        }
                    };
                    map.insert(
                        block_id.clone(),
                        BlockEntry {
                            pack_group: rec.pack_group.clone(),
                            location,
                        },
                    );
                }
            }
        }

        state.block_to_index = Some(map);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blob_store::MemoryBlobStore;

    fn manager() -> BlockManager {
        let formatter = Formatter::by_name("ENCRYPTED_HMAC_SHA256_AES256_CTR", b"test-secret", None).unwrap();
        BlockManager::new(Arc::new(MemoryBlobStore::new()), formatter, BlockManagerConfig::default())
    }

    #[test]
    fn small_blocks_pack_and_dedupe() {
        let bm = manager();
        let mut ids = Vec::new();
        let mut data_by_id = HashMap::new();
        for i in 0..100u32 {
            let data = format!("block #{i:03}--pad").into_bytes();
            let id = bm.write_block("", &data, None).unwrap();
            data_by_id.insert(id.clone(), data);
            ids.push(id);
        }
        assert_eq!(bm.blob_store.list("", &Cancel::new()).unwrap().len(), 0);

        bm.flush().unwrap();
        let blobs = bm.blob_store.list("", &Cancel::new()).unwrap();
        assert_eq!(blobs.len(), 2);

        let writes_before = counters::get_blocks(BlockOp::WrittenBlocks);
        let redundant = bm.write_block("", &data_by_id[&ids[0]], None).unwrap();
        assert_eq!(redundant, ids[0]);
        assert_eq!(counters::get_blocks(BlockOp::WrittenBlocks), writes_before);

        for id in &ids {
            assert_eq!(&bm.get_block(id).unwrap(), &data_by_id[id]);
        }
    }

    #[test]
    fn large_blocks_bypass_packing() {
        let mut config = BlockManagerConfig::default();
        config.max_packed_content_length = 1000;
        let formatter = Formatter::by_name("ENCRYPTED_HMAC_SHA256_AES256_CTR", b"s", None).unwrap();
        let bm = BlockManager::new(Arc::new(MemoryBlobStore::new()), formatter, config);

        // Random fill rather than mostly-zero bytes, so this exercises
        // compression against realistic data instead of a degenerate case.
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        for i in 0..100u32 {
            let mut data = vec![0u8; 1001];
            rng.fill_bytes(&mut data);
            data[0..4].copy_from_slice(&i.to_be_bytes());
            bm.write_block("", &data, None).unwrap();
        }
        assert_eq!(bm.blob_store.list("", &Cancel::new()).unwrap().len(), 100);
        bm.flush().unwrap();
        assert_eq!(bm.blob_store.list("", &Cancel::new()).unwrap().len(), 101);
    }

    #[test]
    fn pack_rolls_over_at_max_size() {
        let mut config = BlockManagerConfig::default();
        config.max_packed_content_length = 10_000;
        config.max_pack_size = 20_000;
        let formatter = Formatter::by_name("UNENCRYPTED_HMAC_SHA256", b"s", None).unwrap();
        let bm = BlockManager::new(Arc::new(MemoryBlobStore::new()), formatter, config);

        // Random fill, with enough slack between block sizes and the
        // thresholds above that a few dozen bytes of per-block compression
        // framing overhead can't shift which write triggers the rollover:
        // the first two blocks sum to well under max_pack_size on their
        // own, and only the third pushes the buffer over it.
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut block = |n: usize| {
            let mut data = vec![0u8; n];
            rng.fill_bytes(&mut data);
            data
        };
        bm.write_block("", &block(8000), None).unwrap();
        bm.write_block("", &block(8000), None).unwrap();
        bm.write_block("", &block(5000), None).unwrap();

        assert_eq!(bm.blob_store.list("", &Cancel::new()).unwrap().len(), 1);
        bm.flush().unwrap();
        assert_eq!(bm.blob_store.list("", &Cancel::new()).unwrap().len(), 2);
    }

    #[test]
    fn dedupe_across_writers_converges_after_compaction() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let formatter = Formatter::by_name("UNENCRYPTED_HMAC_SHA256", b"s", None).unwrap();
        let a = BlockManager::new(store.clone(), formatter.clone(), BlockManagerConfig::default());
        let b = BlockManager::new(store.clone(), formatter, BlockManagerConfig::default());

        // Neither writer has seen the other's index yet, so both pack and
        // flush the same content independently: two pack-index blobs end up
        // recording the same block_id.
        let id_a = a.write_block("", b"shared content", None).unwrap();
        let id_b = b.write_block("", b"shared content", None).unwrap();
        assert_eq!(id_a, id_b);
        a.flush().unwrap();
        b.flush().unwrap();

        let index_blobs_before = store
            .list("", &Cancel::new())
            .unwrap()
            .iter()
            .filter(|b| b.key.starts_with(PACK_INDEX_PREFIX))
            .count();
        assert_eq!(index_blobs_before, 2);

        let reader = BlockManager::new(store.clone(), formatter_for_reader(), BlockManagerConfig::default());
        reader.compact_indexes(jiff::Timestamp::now(), None).unwrap();

        let index_blobs_after = store
            .list("", &Cancel::new())
            .unwrap()
            .iter()
            .filter(|b| b.key.starts_with(PACK_INDEX_PREFIX))
            .count();
        assert_eq!(index_blobs_after, 1);

        let blocks = reader.list_blocks("", "all").unwrap();
        assert_eq!(blocks.iter().filter(|b| b.block_id == id_a).count(), 1);
    }

    fn formatter_for_reader() -> Formatter {
        Formatter::by_name("UNENCRYPTED_HMAC_SHA256", b"s", None).unwrap()
    }

    #[test]
    fn corrupted_pack_reports_integrity_error() {
        let bm = manager();
        let id = bm.write_block("", b"hello integrity", None).unwrap();
        bm.flush().unwrap();

        // Corrupt the pack blob in place.
        let key = {
            let entries = bm.list_blocks("", "packs").unwrap();
            entries[0].block_id.to_string()
        };
        let mut bytes = bm.blob_store.get(&key, 0, TO_END).unwrap();
        bytes[0] ^= 0xff;
        bm.blob_store.put(&key, &bytes).unwrap();

        let before = counters::get_blocks(BlockOp::InvalidBlocks);
        let err = bm.get_block(&id).unwrap_err();
        assert!(matches!(err, EngineError::IntegrityError { .. }));
        assert_eq!(counters::get_blocks(BlockOp::InvalidBlocks), before + 1);
    }
}
