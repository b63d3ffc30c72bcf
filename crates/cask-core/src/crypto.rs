//! Cryptographic primitives for Cask.
//!
//! Provides three things:
//!   1. Session keys and key wrapping — a fresh AES-128 key per exchange,
//!      wrapped under the client's RSA public key with OAEP (SHA-1)
//!   2. StreamDecryptor — AES-128-CBC decryption that carries its chain
//!      state across arbitrarily sized network reads
//!   3. Checksums — the 32-bit integrity value echoed back after an upload
//!
//! Session keys derive ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::fmt;
use std::str::FromStr;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use crc_any::CRCu32;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::AES_KEY_SIZE;

/// AES block size. Every decryptable span is a multiple of this.
pub const BLOCK_SIZE: usize = 16;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

// ── Session key ───────────────────────────────────────────────────────────────

/// A client's symmetric upload key.
///
/// Replaced on every key exchange. Never logged: Debug is redacted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; AES_KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; AES_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// 16 bytes from the OS-seeded CSPRNG.
pub fn generate_session_key() -> SessionKey {
    let mut bytes = [0u8; AES_KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    let key = SessionKey(bytes);
    bytes.zeroize();
    key
}

// ── Key wrapping ──────────────────────────────────────────────────────────────

/// Encrypt `key` under the RSA public key held in `public_key`.
///
/// `public_key` is the fixed-width field from a PublicKey request: a DER
/// document (SubjectPublicKeyInfo or PKCS#1 RSAPublicKey) followed by zero
/// padding. The document length comes from its outer SEQUENCE header, so
/// trailing padding never reaches the DER parser.
pub fn wrap_key(key: &SessionKey, public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let der_len = der_length(public_key).ok_or(CryptoError::KeyWrap(
        "public key field does not start with a DER sequence".into(),
    ))?;
    let der = &public_key[..der_len];

    let rsa_key = RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|e| CryptoError::KeyWrap(format!("unusable public key: {e}")))?;

    rsa_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), key.as_bytes())
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))
}

/// Total length (header + content) of the DER SEQUENCE at the start of
/// `field`, if it fits inside the field.
fn der_length(field: &[u8]) -> Option<usize> {
    if *field.first()? != 0x30 {
        return None;
    }
    let (content, header) = match *field.get(1)? {
        n if n < 0x80 => (n as usize, 2),
        0x81 => (*field.get(2)? as usize, 3),
        0x82 => (u16::from_be_bytes([*field.get(2)?, *field.get(3)?]) as usize, 4),
        _ => return None,
    };
    let total = header + content;
    (total <= field.len()).then_some(total)
}

// ── Streaming decryption ──────────────────────────────────────────────────────

/// AES-128-CBC decryption with a zero IV, fed in block-aligned pieces.
///
/// Created once per upload. The CBC chain state lives across `decrypt`
/// calls, so splitting ciphertext at any block boundary produces the same
/// plaintext as decrypting it in one call. No padding is removed here.
pub struct StreamDecryptor {
    inner: Aes128CbcDec,
    decrypted: u64,
}

impl StreamDecryptor {
    pub fn new(key: &SessionKey) -> Self {
        let iv = GenericArray::default();
        Self {
            inner: Aes128CbcDec::new(GenericArray::from_slice(key.as_bytes()), &iv),
            decrypted: 0,
        }
    }

    /// Largest multiple of the block size not exceeding `pending`.
    pub fn decryptable_now(pending: usize) -> usize {
        pending - pending % BLOCK_SIZE
    }

    /// Decrypt a block-aligned span, continuing the chain from the previous call.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::CipherState {
                len: ciphertext.len(),
            });
        }
        let mut out = ciphertext.to_vec();
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.decrypted += ciphertext.len() as u64;
        Ok(out)
    }

    /// Ciphertext bytes consumed so far.
    pub fn decrypted(&self) -> u64 {
        self.decrypted
    }
}

impl fmt::Debug for StreamDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDecryptor")
            .field("decrypted", &self.decrypted)
            .finish_non_exhaustive()
    }
}

/// Validate PKCS#7 padding on the final plaintext block and return the
/// block with its padding removed.
pub fn strip_pkcs7(block: &[u8]) -> Result<&[u8], CryptoError> {
    let pad = *block.last().ok_or(CryptoError::InvalidPadding)? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > block.len() {
        return Err(CryptoError::InvalidPadding);
    }
    let (data, padding) = block.split_at(block.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(data)
}

// ── Checksums ─────────────────────────────────────────────────────────────────

/// Incremental 32-bit checksum over uploaded plaintext.
pub trait Checksum: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> u32;
}

/// Which checksum the server echoes in FileReceived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// POSIX `cksum`: CRC-32/CKSUM over the data followed by its length.
    #[default]
    Cksum,
    /// CRC-32 (ISO-HDLC), as in zlib and Ethernet.
    Crc32,
}

impl ChecksumKind {
    pub fn start(self) -> Box<dyn Checksum> {
        match self {
            ChecksumKind::Cksum => Box::new(Cksum::new()),
            ChecksumKind::Crc32 => Box::new(Crc32::new()),
        }
    }

    /// One-shot checksum of `data`.
    pub fn compute(self, data: &[u8]) -> u32 {
        let mut c = self.start();
        c.update(data);
        c.finalize()
    }
}

impl FromStr for ChecksumKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cksum" => Ok(ChecksumKind::Cksum),
            "crc32" => Ok(ChecksumKind::Crc32),
            other => Err(CryptoError::UnknownChecksum(other.to_owned())),
        }
    }
}

/// POSIX `cksum` checksum.
pub struct Cksum {
    crc: CRCu32,
    len: u64,
}

impl Cksum {
    pub fn new() -> Self {
        Self {
            crc: CRCu32::create_crc(0x04C1_1DB7, 32, 0, 0xFFFF_FFFF, false),
            len: 0,
        }
    }
}

impl Default for Cksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum for Cksum {
    fn update(&mut self, data: &[u8]) {
        self.crc.digest(data);
        self.len += data.len() as u64;
    }

    fn finalize(mut self: Box<Self>) -> u32 {
        // The length is appended least significant byte first, without
        // leading zero bytes.
        let mut len = self.len;
        while len != 0 {
            self.crc.digest(&[(len & 0xff) as u8]);
            len >>= 8;
        }
        self.crc.get_crc()
    }
}

/// Plain CRC-32.
pub struct Crc32(CRCu32);

impl Crc32 {
    pub fn new() -> Self {
        Self(CRCu32::crc32())
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum for Crc32 {
    fn update(&mut self, data: &[u8]) {
        self.0.digest(data);
    }

    fn finalize(self: Box<Self>) -> u32 {
        self.0.get_crc()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher input of {len} bytes is not block aligned")]
    CipherState { len: usize },

    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    #[error("invalid PKCS#7 padding")]
    InvalidPadding,

    #[error("unknown checksum: {0}")]
    UnknownChecksum(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
