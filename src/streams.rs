//! Counting and encrypting stream adaptors: pure composition over a reader,
//! changing neither its length nor its error semantics.
//!
//! Grounded on backpak's `hashing.rs` (`HashingReader`/`HashingWriter` wrap
//! an inner `Read`/`Write`, update a running digest on every `read`/`write`
//! call, hand back the untouched bytes). Generalized here into a byte
//! *counter* (an atomic rather than a hasher) and a stream-cipher XOR layer,
//! per [`crate::streams`]'s two adaptor kinds.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Wraps a reader, adding every byte it yields to a shared counter.
pub struct CountingReader<'a, R> {
    inner: R,
    counter: &'a AtomicU64,
}

impl<'a, R: Read> CountingReader<'a, R> {
    pub fn new(inner: R, counter: &'a AtomicU64) -> Self {
        Self { inner, counter }
    }
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Wraps a reader, XORing an AES-CTR keystream into every buffer it yields.
/// Since CTR mode is its own inverse, the same adaptor encrypts or
/// decrypts depending only on which direction the inner reader is used.
pub struct EncryptingReader<R> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: Read> EncryptingReader<R> {
    pub fn new(inner: R, key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            inner,
            cipher: Aes256Ctr::new(key.into(), iv.into()),
        }
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counting_reader_tracks_bytes_without_altering_them() {
        let counter = AtomicU64::new(0);
        let mut r = CountingReader::new(&b"hello world"[..], &counter);
        let mut out = Vec::new();
        io::copy(&mut r, &mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn encrypting_reader_round_trips() {
        let key = [9u8; 32];
        let iv = [3u8; 16];
        let plaintext = b"a stream of bytes to protect".to_vec();

        let mut encryptor = EncryptingReader::new(&plaintext[..], &key, &iv);
        let mut ciphertext = Vec::new();
        io::copy(&mut encryptor, &mut ciphertext).unwrap();
        assert_ne!(ciphertext, plaintext);

        let mut decryptor = EncryptingReader::new(&ciphertext[..], &key, &iv);
        let mut roundtripped = Vec::new();
        io::copy(&mut decryptor, &mut roundtripped).unwrap();
        assert_eq!(roundtripped, plaintext);
    }
}
