//! Pluggable compression codecs, each keyed by a 4-byte header written
//! immediately before its compressed bytes: `output = header || compressed`.
//!
//! Grounded on backpak's `pack.rs`, which frames its zstd streams behind
//! fixed magic bytes and reuses one multithreaded encoder; generalized here
//! to a small registry of interchangeable codecs instead of one hardcoded
//! zstd stream.

use std::io::{Read, Write};

use rayon::prelude::*;

use crate::errors::{EngineError, Result};

/// A compression codec, instantiated once and reused; implementations must
/// be safe to call concurrently (any internal encoder/decoder state is
/// per-call, not shared mutable state).
pub trait Codec: Send + Sync {
    /// The 4-byte big-endian header identifying this codec's output.
    fn header_id(&self) -> [u8; 4];

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

struct Gzip;
impl Codec for Gzip {
    fn header_id(&self) -> [u8; 4] {
        *b"gzip"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(input)?;
        Ok(enc.finish()?)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::MultiGzDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

struct Deflate;
impl Codec for Deflate {
    fn header_id(&self) -> [u8; 4] {
        *b"defl"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(input)?;
        Ok(enc.finish()?)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::DeflateDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Splits input into ~1MB chunks, gzips each independently in parallel, and
/// concatenates the resulting gzip members (a valid gzip stream per RFC
/// 1952 §2, the same trick `pigz` uses). Mirrors backpak's use of a
/// multithreaded zstd encoder for the same "use all the cores" goal.
struct Pgzip;
impl Codec for Pgzip {
    fn header_id(&self) -> [u8; 4] {
        *b"pgzp"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        const CHUNK: usize = 1024 * 1024;
        if input.is_empty() {
            return Gzip.compress(input);
        }
        let parts: Vec<Result<Vec<u8>>> = input
            .par_chunks(CHUNK)
            .map(|chunk| Gzip.compress(chunk))
            .collect();
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(&part?);
        }
        Ok(out)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        // MultiGzDecoder transparently walks concatenated gzip members.
        Gzip.decompress(input)
    }
}

struct Zstd;
impl Codec for Zstd {
    fn header_id(&self) -> [u8; 4] {
        *b"zstd"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::stream::encode_all(input, 0)?)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::stream::decode_all(input)?)
    }
}

struct Lz4;
impl Codec for Lz4 {
    fn header_id(&self) -> [u8; 4] {
        [0, b'l', b'z', b'4']
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress_prepend_size(input))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::block::decompress_size_prepended(input)
            .map_err(|e| EngineError::FormatError(format!("lz4 decompress failed: {e}")))
    }
}

/// Stand-in for Go's S2 (a Snappy extension); the `snap` crate is the
/// closest maintained Rust implementation of the Snappy frame format that
/// S2 builds on. Noted as a substitution in DESIGN.md.
struct S2;
impl Codec for S2 {
    fn header_id(&self) -> [u8; 4] {
        [0, 0, b's', b'2']
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut w = snap::write::FrameEncoder::new(&mut out);
            w.write_all(input)?;
            w.flush()?;
        }
        Ok(out)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        snap::read::FrameDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

fn by_name_raw(name: &str) -> Result<Box<dyn Codec>> {
    Ok(match name {
        "gzip" => Box::new(Gzip),
        "zstd" => Box::new(Zstd),
        "s2" => Box::new(S2),
        "lz4" => Box::new(Lz4),
        "pgzip" => Box::new(Pgzip),
        "deflate" => Box::new(Deflate),
        other => {
            return Err(EngineError::FormatError(format!(
                "unknown compression codec {other:?}"
            )));
        }
    })
}

fn by_header_raw(header: [u8; 4]) -> Result<Box<dyn Codec>> {
    Ok(match &header {
        b"gzip" => Box::new(Gzip),
        b"zstd" => Box::new(Zstd),
        [0, 0, b's', b'2'] => Box::new(S2),
        [0, b'l', b'z', b'4'] => Box::new(Lz4),
        b"pgzp" => Box::new(Pgzip),
        b"defl" => Box::new(Deflate),
        _ => return Err(EngineError::UnknownCompressionHeader(header)),
    })
}

/// Compresses `data` with the named codec, prefixed by its 4-byte header.
pub fn compress(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let codec = by_name_raw(name)?;
    let mut out = Vec::with_capacity(data.len() / 2 + 4);
    out.extend_from_slice(&codec.header_id());
    out.extend_from_slice(&codec.compress(data)?);
    crate::counters::add_bytes(crate::counters::ByteOp::BytesCompressed, data.len() as u64);
    Ok(out)
}

/// Reads the 4-byte header off `framed` and decompresses the remainder
/// with the matching codec. An unknown header is a fatal error for the blob.
pub fn decompress(framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < 4 {
        return Err(EngineError::FormatError(
            "compressed blob shorter than its header".to_owned(),
        ));
    }
    let mut header = [0u8; 4];
    header.copy_from_slice(&framed[..4]);
    let codec = by_header_raw(header)?;
    let out = codec.decompress(&framed[4..])?;
    crate::counters::add_bytes(crate::counters::ByteOp::BytesDecompressed, out.len() as u64);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    const NAMES: &[&str] = &["gzip", "zstd", "s2", "lz4", "pgzip", "deflate"];

    #[test]
    fn round_trips_every_codec() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        for name in NAMES {
            let framed = compress(name, &data).unwrap_or_else(|e| panic!("{name}: {e}"));
            let back = decompress(&framed).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert_eq!(back, data, "{name} round trip mismatch");
        }
    }

    #[test]
    fn empty_input_round_trips() {
        for name in NAMES {
            let framed = compress(name, b"").unwrap();
            let back = decompress(&framed).unwrap();
            assert!(back.is_empty());
        }
    }

    #[test]
    fn unknown_header_is_fatal() {
        let mut framed = vec![b'x', b'x', b'x', b'x'];
        framed.extend_from_slice(b"garbage");
        assert!(matches!(
            decompress(&framed),
            Err(EngineError::UnknownCompressionHeader(_))
        ));
    }
}
