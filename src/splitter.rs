//! Content-defined splitting: decide where to cut a byte stream into chunks.
//!
//! Grounded on backpak's `chunk.rs` (which uses FastCDC for the same
//! "content-defined, not fixed-offset" goal), generalized to the spec's
//! explicit trait plus the three strategies it names: a fixed-size cutter,
//! and two rolling-hash cutters (Buzhash, Rabin-Karp) that backpak's
//! FastCDC-based approach doesn't expose directly.

use std::sync::Mutex;

/// Decides where, if anywhere, to cut a byte stream into chunks.
///
/// `next_split_point` is fed successive byte slices (not necessarily one
/// byte at a time) and returns the 1-based position *within the supplied
/// slice* at which to cut, or `None` if no boundary was found in this call.
/// Implementations must be deterministic: two independent instances fed the
/// same byte stream emit identical split points.
pub trait Splitter: Send {
    fn reset(&mut self);

    fn next_split_point(&mut self, bytes: &[u8]) -> Option<usize>;

    fn max_segment_size(&self) -> usize;
}

/// Cuts every `len` bytes, no content sensitivity at all.
pub struct FixedSplitter {
    len: usize,
    seen_since_cut: usize,
}

impl FixedSplitter {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "fixed split length must be nonzero");
        Self {
            len,
            seen_since_cut: 0,
        }
    }
}

impl Splitter for FixedSplitter {
    fn reset(&mut self) {
        self.seen_since_cut = 0;
    }

    fn next_split_point(&mut self, bytes: &[u8]) -> Option<usize> {
        let remaining = self.len - self.seen_since_cut;
        if bytes.len() < remaining {
            self.seen_since_cut += bytes.len();
            None
        } else {
            self.seen_since_cut = 0;
            Some(remaining)
        }
    }

    fn max_segment_size(&self) -> usize {
        self.len
    }
}

const WINDOW_SIZE: usize = 64;

/// A 256-entry table of random-looking 32-bit values, generated once at
/// first use from a fixed seed so that every instance (and every process)
/// agrees on the same table — required for the determinism property.
fn buzhash_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        // A simple xorshift PRNG seeded with a fixed constant. Not
        // cryptographic; we just need a fixed, well-distributed table that
        // every process computes identically.
        let mut state: u64 = 0x9E3779B97F4A7C15;
        let mut table = [0u32; 256];
        for slot in table.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *slot = (state >> 32) as u32 ^ (state as u32);
        }
        table
    })
}

/// Rolling 32-bit Buzhash over a 64-byte window: cut when the low bits of
/// the hash are zero and we've seen at least `avg/2` bytes since the last
/// cut; force a cut at `2*avg`.
pub struct BuzhashSplitter {
    avg: usize,
    mask: u32,
    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    window_filled: usize,
    hash: u32,
    since_cut: usize,
}

impl BuzhashSplitter {
    pub fn new(avg: usize) -> Self {
        assert!(avg.is_power_of_two(), "Buzhash average must be a power of two");
        Self {
            avg,
            mask: (avg as u32) - 1,
            window: [0; WINDOW_SIZE],
            window_pos: 0,
            window_filled: 0,
            hash: 0,
            since_cut: 0,
        }
    }

    fn push_byte(&mut self, b: u8) {
        let table = buzhash_table();
        if self.window_filled < WINDOW_SIZE {
            self.hash = self.hash.rotate_left(1) ^ table[b as usize];
            self.window[self.window_pos] = b;
            self.window_filled += 1;
        } else {
            let outgoing = self.window[self.window_pos];
            // Remove the outgoing byte's contribution (rotated by the
            // window size) and roll in the new one.
            let outgoing_contrib = table[outgoing as usize].rotate_left(WINDOW_SIZE as u32 % 32);
            self.hash = self.hash.rotate_left(1) ^ outgoing_contrib ^ table[b as usize];
            self.window[self.window_pos] = b;
        }
        self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;
    }
}

impl Splitter for BuzhashSplitter {
    fn reset(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.window_pos = 0;
        self.window_filled = 0;
        self.hash = 0;
        self.since_cut = 0;
    }

    fn next_split_point(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            self.push_byte(b);
            self.since_cut += 1;

            let force_cut = self.since_cut >= 2 * self.avg;
            let content_cut = self.since_cut >= self.avg / 2 && (self.hash & self.mask) == 0;

            if force_cut || content_cut {
                self.since_cut = 0;
                return Some(i + 1);
            }
        }
        None
    }

    fn max_segment_size(&self) -> usize {
        2 * self.avg
    }
}

const RK_BASE: u64 = 1_099_511_628_211; // FNV-style odd base, good mixing in a u64 ring

/// Rolling 64-bit Rabin-Karp hash over a 64-byte window, same cut
/// thresholds as [`BuzhashSplitter`].
pub struct RabinKarp64Splitter {
    avg: usize,
    mask: u64,
    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    window_filled: usize,
    hash: u64,
    /// `RK_BASE^(WINDOW_SIZE - 1)`, precomputed so we can remove the
    /// outgoing byte's contribution in O(1).
    base_pow: u64,
    since_cut: usize,
}

impl RabinKarp64Splitter {
    pub fn new(avg: usize) -> Self {
        assert!(
            avg.is_power_of_two(),
            "Rabin-Karp average must be a power of two"
        );
        let mut base_pow = 1u64;
        for _ in 0..WINDOW_SIZE - 1 {
            base_pow = base_pow.wrapping_mul(RK_BASE);
        }
        Self {
            avg,
            mask: (avg as u64) - 1,
            window: [0; WINDOW_SIZE],
            window_pos: 0,
            window_filled: 0,
            hash: 0,
            base_pow,
            since_cut: 0,
        }
    }

    fn push_byte(&mut self, b: u8) {
        if self.window_filled < WINDOW_SIZE {
            self.hash = self.hash.wrapping_mul(RK_BASE).wrapping_add(b as u64);
            self.window[self.window_pos] = b;
            self.window_filled += 1;
        } else {
            let outgoing = self.window[self.window_pos] as u64;
            self.hash = self
                .hash
                .wrapping_sub(outgoing.wrapping_mul(self.base_pow))
                .wrapping_mul(RK_BASE)
                .wrapping_add(b as u64);
            self.window[self.window_pos] = b;
        }
        self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;
    }
}

impl Splitter for RabinKarp64Splitter {
    fn reset(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.window_pos = 0;
        self.window_filled = 0;
        self.hash = 0;
        self.since_cut = 0;
    }

    fn next_split_point(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            self.push_byte(b);
            self.since_cut += 1;

            let force_cut = self.since_cut >= 2 * self.avg;
            let content_cut = self.since_cut >= self.avg / 2 && (self.hash & self.mask) == 0;

            if force_cut || content_cut {
                self.since_cut = 0;
                return Some(i + 1);
            }
        }
        None
    }

    fn max_segment_size(&self) -> usize {
        2 * self.avg
    }
}

/// Which splitter strategy to build; a closed sum type (per DESIGN.md's
/// resolution of the "dynamic dispatch" design note) since the set of
/// supported splitters is fixed.
#[derive(Clone, Copy, Debug)]
pub enum SplitterKind {
    Fixed(usize),
    Buzhash(usize),
    RabinKarp64(usize),
}

impl SplitterKind {
    pub fn build(self) -> Box<dyn Splitter> {
        match self {
            SplitterKind::Fixed(len) => Box::new(FixedSplitter::new(len)),
            SplitterKind::Buzhash(avg) => Box::new(BuzhashSplitter::new(avg)),
            SplitterKind::RabinKarp64(avg) => Box::new(RabinKarp64Splitter::new(avg)),
        }
    }
}

/// A pool of splitters of one kind, so a busy writer doesn't reallocate
/// rolling-hash state (window buffers, tables) per object. Borrow with
/// [`SplitterPool::acquire`]; dropping the guard returns it, reset, to the
/// pool — the same "reuse scratch state" idea backpak applies to its zstd
/// encoders in `pack.rs`.
pub struct SplitterPool {
    kind: SplitterKind,
    idle: Mutex<Vec<Box<dyn Splitter>>>,
}

impl SplitterPool {
    pub fn new(kind: SplitterKind) -> Self {
        Self {
            kind,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Box<dyn Splitter> {
        let mut idle = self.idle.lock().unwrap();
        idle.pop().unwrap_or_else(|| self.kind.build())
    }

    pub fn release(&self, mut splitter: Box<dyn Splitter>) {
        splitter.reset();
        self.idle.lock().unwrap().push(splitter);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{RngCore, SeedableRng};
    use rand::rngs::StdRng;

    fn split_all(splitter: &mut dyn Splitter, data: &[u8]) -> Vec<usize> {
        let mut lengths = Vec::new();
        let mut start = 0;
        let mut pos = 0;
        while pos < data.len() {
            match splitter.next_split_point(&data[pos..pos + 1]) {
                Some(_cut_within_slice) => {
                    pos += 1;
                    lengths.push(pos - start);
                    start = pos;
                }
                None => pos += 1,
            }
        }
        if start < data.len() {
            lengths.push(data.len() - start);
        }
        lengths
    }

    #[test]
    fn fixed_cuts_at_exact_multiples() {
        let mut s = FixedSplitter::new(4);
        let data = vec![0u8; 17];
        let lengths = split_all(&mut s, &data);
        assert_eq!(lengths, vec![4, 4, 4, 4, 1]);
    }

    #[test]
    fn two_instances_agree_on_buzhash_boundaries() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut data = vec![0u8; 200_000];
        rng.fill_bytes(&mut data);

        let mut a = BuzhashSplitter::new(32);
        let mut b = BuzhashSplitter::new(32);
        assert_eq!(split_all(&mut a, &data), split_all(&mut b, &data));
    }

    #[test]
    fn dynamic_splitters_respect_size_bounds() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut data = vec![0u8; 500_000];
        rng.fill_bytes(&mut data);

        for avg in [32usize, 1024] {
            let mut s = BuzhashSplitter::new(avg);
            for len in split_all(&mut s, &data) {
                assert!(len <= 2 * avg, "segment {len} exceeds 2*avg={}", 2 * avg);
            }

            let mut s = RabinKarp64Splitter::new(avg);
            for len in split_all(&mut s, &data) {
                assert!(len <= 2 * avg, "segment {len} exceeds 2*avg={}", 2 * avg);
            }
        }
    }

    #[test]
    fn pool_reuses_and_resets() {
        let pool = SplitterPool::new(SplitterKind::Fixed(8));
        let mut s = pool.acquire();
        let _ = s.next_split_point(&[0u8; 8]);
        pool.release(s);
        let s2 = pool.acquire();
        assert_eq!(s2.max_segment_size(), 8);
    }
}
