//! Ambient, user-level preferences and the per-repository format header.
//!
//! These are two different lifetimes of configuration. `Configuration` is
//! loaded fresh from `~/.config/blockpak.toml` on every run (grounded on
//! backpak's `config.rs` directly: a tiny TOML file with a default cache
//! size). `FormatHeader` is written once, at repository creation, and never
//! changes again — it's the thing that decides which `Formatter` algorithm,
//! block size, and inline threshold a repository uses for the rest of its
//! life (SPEC_FULL.md §3's "Format Header").

use std::{fs, io};

use anyhow::{Context, Result, anyhow, bail};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::formatter::kdf;

/// 1 GiB. The teacher's own comment on this value ("make this configurable
/// with global settings") is exactly what this file now does.
fn default_cache_size() -> Byte {
    Byte::from_u64(1024 * 1024 * 1024)
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_cache_size")]
    pub cache_size: Byte,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "blockpak.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}

/// Fixed name the encrypted format header is stored under at the repository
/// root; this crate's analog of Kopia's `kopia.repository`.
pub const FORMAT_HEADER_BLOB: &str = "blockpak.repository";

const FORMAT_HEADER_VERSION: u32 = 1;
const SECRET_LEN: usize = 32;
const UNIQUE_ID_LEN: usize = 32;

/// Parameters fixed at repository-creation time, per SPEC_FULL.md §3.
/// Drives every hashing/encryption decision the [`crate::formatter::Formatter`]
/// makes; immutable for the life of the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatHeader {
    pub version: u32,
    pub object_format: String,
    #[serde(with = "serde_bytes")]
    pub secret: Vec<u8>,
    pub max_inline_content_length: u32,
    pub max_block_size: u32,
    #[serde(with = "serde_bytes")]
    master_key: Vec<u8>,
    has_master_key: bool,
    #[serde(with = "serde_bytes")]
    pub unique_id: Vec<u8>,
}

impl FormatHeader {
    /// Generates a fresh header for a brand-new repository: random secret
    /// and unique ID, and (for SIV formats) a random master key.
    pub fn generate(
        object_format: &str,
        max_inline_content_length: u32,
        max_block_size: u32,
        needs_master_key: bool,
    ) -> Self {
        let mut rng = rand::thread_rng();

        let mut secret = vec![0u8; SECRET_LEN];
        rng.fill_bytes(&mut secret);

        let mut unique_id = vec![0u8; UNIQUE_ID_LEN];
        rng.fill_bytes(&mut unique_id);

        let master_key = if needs_master_key {
            let mut key = vec![0u8; SECRET_LEN];
            rng.fill_bytes(&mut key);
            key
        } else {
            Vec::new()
        };

        Self {
            version: FORMAT_HEADER_VERSION,
            object_format: object_format.to_owned(),
            secret,
            max_inline_content_length,
            max_block_size,
            has_master_key: needs_master_key,
            master_key,
            unique_id,
        }
    }

    pub fn master_key(&self) -> Option<&[u8]> {
        self.has_master_key.then_some(self.master_key.as_slice())
    }

    /// Encrypts and serializes this header for storage. The on-disk layout
    /// is `unique_id || ciphertext`: `unique_id` isn't secret (it's a KDF
    /// salt, same role as the plaintext salt in a password hash), so it can
    /// sit in the clear ahead of everything that actually needs the
    /// password to read, breaking the chicken-and-egg problem of needing
    /// the header's own contents to derive the key that decrypts it.
    pub fn seal(&self, password: &[u8]) -> Result<Vec<u8>> {
        let key = kdf::scrypt_derive(password, &self.unique_id).map_err(|e| anyhow!("{e}"))?;
        let plaintext = ciborium_bytes(self)?;

        let iv = [0u8; 16];
        let mut ciphertext = plaintext;
        encrypt_in_place(&key, &iv, &mut ciphertext);

        let mut out = Vec::with_capacity(self.unique_id.len() + ciphertext.len());
        out.extend_from_slice(&self.unique_id);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Inverse of [`FormatHeader::seal`].
    pub fn unseal(bytes: &[u8], password: &[u8]) -> Result<Self> {
        if bytes.len() < UNIQUE_ID_LEN {
            bail!("format header too short to contain a unique ID");
        }
        let (unique_id, ciphertext) = bytes.split_at(UNIQUE_ID_LEN);
        let key = kdf::scrypt_derive(password, unique_id).map_err(|e| anyhow!("{e}"))?;

        let iv = [0u8; 16];
        let mut plaintext = ciphertext.to_vec();
        encrypt_in_place(&key, &iv, &mut plaintext);

        let header: FormatHeader =
            ciborium::from_reader(plaintext.as_slice()).context("Malformed format header")?;
        if header.unique_id != unique_id {
            bail!("format header's embedded unique ID doesn't match its salt");
        }
        Ok(header)
    }
}

fn ciborium_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).context("Couldn't serialize format header")?;
    Ok(buf)
}

/// AES-256-CTR is its own inverse; used here only to protect the header
/// itself, independent of the `Formatter` the header goes on to configure
/// (the header has to be readable before a `Formatter` can even be built).
fn encrypt_in_place(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    use aes::Aes256;
    use ctr::cipher::{KeyIvInit, StreamCipher};
    let mut cipher = ctr::Ctr128BE::<Aes256>::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips_through_seal() {
        let header = FormatHeader::generate("ENCRYPTED_HMAC_SHA256_AES256_CTR", 1024, 1 << 20, false);
        let sealed = header.seal(b"correct horse battery staple").unwrap();
        let unsealed = FormatHeader::unseal(&sealed, b"correct horse battery staple").unwrap();
        assert_eq!(header.secret, unsealed.secret);
        assert_eq!(header.unique_id, unsealed.unique_id);
        assert_eq!(header.master_key(), unsealed.master_key());
    }

    #[test]
    fn wrong_password_does_not_round_trip() {
        let header = FormatHeader::generate("UNENCRYPTED_HMAC_SHA256", 1024, 1 << 20, false);
        let sealed = header.seal(b"right password").unwrap();
        let unsealed = FormatHeader::unseal(&sealed, b"wrong password");
        // Either the CBOR fails to parse or the unique-ID check trips; either
        // way this must not silently succeed.
        assert!(unsealed.is_err());
    }

    #[test]
    fn master_key_round_trips_when_present() {
        let header = FormatHeader::generate("ENCRYPTED_HMAC_SHA256_AES256_SIV", 1024, 1 << 20, true);
        assert!(header.master_key().is_some());
        let sealed = header.seal(b"pw").unwrap();
        let unsealed = FormatHeader::unseal(&sealed, b"pw").unwrap();
        assert_eq!(header.master_key(), unsealed.master_key());
    }
}
