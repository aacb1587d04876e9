//! AES-256-CTR stream positioning and key wrapping.
//!
//! The encrypted view treats the backing file as one long CTR keystream:
//! byte `i` of the file is always XORed with keystream byte `i`, so any
//! aligned window can be encrypted or decrypted independently by seeking
//! the cipher to the window's absolute offset. The IV is fixed at zero;
//! key uniqueness is guaranteed by generating a fresh random file key per
//! cache file.
//!
//! The file key itself is stored in the cache preamble wrapped (encrypted)
//! with the externally-provided master key, base64-encoded.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::MemError;

/// Length of a file or master key in bytes (AES-256).
pub const FILE_KEY_LEN: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

/// A 256-bit symmetric key, zeroed on drop.
///
/// Used both for the per-file key that encrypts page data and for the
/// master keys handed out by the key provider.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct FileKey([u8; FILE_KEY_LEN]);

impl FileKey {
    /// Generates a fresh random key from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; FILE_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        FileKey(bytes)
    }

    /// Builds a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; FILE_KEY_LEN]) -> Self {
        FileKey(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FILE_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.write_str("FileKey(..)")
    }
}

/// A seekable AES-256-CTR transform bound to one key.
///
/// Encryption and decryption are the same XOR, so one type serves both
/// directions. Construction is cheap; the page-fault path builds the AES
/// round keys per call on the stack and performs no heap allocation.
pub struct PageCipher {
    key: FileKey,
}

impl PageCipher {
    /// Creates a cipher for the given file key.
    #[must_use]
    pub fn new(key: FileKey) -> Self {
        PageCipher { key }
    }

    /// Applies the keystream positioned at `offset` to `buf` in place.
    pub fn apply_in_place(&self, offset: u64, buf: &mut [u8]) {
        let mut ctr = self.start_at(offset);
        ctr.apply_keystream(buf);
    }

    /// Transforms `src` into `dst` with the keystream positioned at
    /// `offset`. The slices must have equal length.
    ///
    /// # Panics
    ///
    /// Panics if `src.len() != dst.len()`.
    pub fn apply(&self, offset: u64, src: &[u8], dst: &mut [u8]) {
        assert_eq!(src.len(), dst.len());
        let mut ctr = self.start_at(offset);
        ctr.apply_keystream_b2b(src, dst)
            .expect("keystream cannot be exhausted within a file-sized range");
    }

    fn start_at(&self, offset: u64) -> Aes256Ctr {
        let iv = [0u8; 16];
        let mut ctr = Aes256Ctr::new(self.key.as_bytes().into(), (&iv).into());
        ctr.seek(offset);
        ctr
    }
}

/// Encrypts `key` with `master` and returns it base64-encoded for storage
/// in the cache preamble.
#[must_use]
pub fn wrap_key(key: &FileKey, master: &FileKey) -> String {
    let mut wrapped = [0u8; FILE_KEY_LEN];
    PageCipher::new(master.clone()).apply(0, key.as_bytes(), &mut wrapped);
    BASE64.encode(wrapped)
}

/// Decodes and decrypts a preamble-stored key with `master`.
///
/// # Errors
///
/// Returns [`MemError::BadKeyMaterial`] if the base64 payload is malformed
/// or has the wrong length.
pub fn unwrap_key(wrapped: &str, master: &FileKey) -> Result<FileKey, MemError> {
    let raw = BASE64
        .decode(wrapped)
        .map_err(|e| MemError::BadKeyMaterial(e.to_string()))?;
    let raw: [u8; FILE_KEY_LEN] = raw
        .try_into()
        .map_err(|_| MemError::BadKeyMaterial("wrapped key has wrong length".into()))?;
    let mut plain = [0u8; FILE_KEY_LEN];
    PageCipher::new(master.clone()).apply(0, &raw, &mut plain);
    Ok(FileKey::from_bytes(plain))
}
