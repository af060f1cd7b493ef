//! Payload encryption for everything written to the object store.
//!
//! `Codec` wraps AES-256-GCM with a fresh random nonce per call. Stored
//! objects use a segmented envelope so that the single-shot and multi-part
//! upload paths produce the same on-store format:
//!
//! ```text
//! segment := u32 BE sealed_len || nonce (12) || ciphertext || tag (16)
//! object  := segment+
//! ```
//!
//! Each segment authenticates its position and whether it is the last one,
//! so reordered, truncated or spliced objects fail to open.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use std::fmt;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const LEN_PREFIX: usize = 4;

/// Bytes a sealed segment adds on top of its plaintext.
pub const SEGMENT_OVERHEAD: usize = LEN_PREFIX + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("ciphertext truncated: {0}")]
    Truncated(&'static str),
    #[error("ciphertext failed authentication")]
    Authentication,
    #[error("plaintext could not be sealed")]
    Seal,
    #[error("object has more than {} segments", u32::MAX)]
    TooManySegments,
}

/// Symmetric codec bound to the process-wide encryption key.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

impl Codec {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Encrypt `plaintext` as `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_with_aad(plaintext, &[])
    }

    /// Inverse of [`Codec::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_with_aad(data, &[])
    }

    /// Seal one chunk of an object as a length-prefixed segment.
    ///
    /// `index` is the zero-based position of the chunk in the object and
    /// `is_final` must be set on the last chunk only.
    pub fn seal_segment(
        &self,
        index: u32,
        is_final: bool,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let sealed = self.encrypt_with_aad(plaintext, &segment_aad(index, is_final))?;
        let len = u32::try_from(sealed.len()).map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(LEN_PREFIX + sealed.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a complete stored object made of one or more sealed segments.
    pub fn open_object(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.is_empty() {
            return Err(CryptoError::Truncated("object holds no segments"));
        }

        let mut plaintext = Vec::with_capacity(data.len());
        let mut offset = 0usize;
        let mut index = 0u32;
        while offset < data.len() {
            let header_end = offset + LEN_PREFIX;
            if header_end > data.len() {
                return Err(CryptoError::Truncated("segment header"));
            }
            let mut len_bytes = [0u8; LEN_PREFIX];
            len_bytes.copy_from_slice(&data[offset..header_end]);
            let sealed_len = u32::from_be_bytes(len_bytes) as usize;

            let end = header_end
                .checked_add(sealed_len)
                .filter(|end| *end <= data.len())
                .ok_or(CryptoError::Truncated("segment body"))?;
            let is_final = end == data.len();

            let chunk =
                self.decrypt_with_aad(&data[header_end..end], &segment_aad(index, is_final))?;
            plaintext.extend_from_slice(&chunk);

            offset = end;
            index = index.checked_add(1).ok_or(CryptoError::TooManySegments)?;
        }
        Ok(plaintext)
    }

    fn encrypt_with_aad(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_with_aad(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated("shorter than nonce and tag"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

fn segment_aad(index: u32, is_final: bool) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(&index.to_be_bytes());
    aad[4] = u8::from(is_final);
    aad
}
