//! Callback envelope crypto: SHA-1 signatures and AES-256-CBC message bodies.
//!
//! Plaintext layout inside the ciphertext is
//! `random(16) || len(4, big-endian) || content || receive_id`, padded PKCS#7-style
//! to a multiple of 32 bytes. The IV is the first 16 bytes of the key.

use aes::Aes256;
use base64::Engine as _;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha1::{Digest, Sha1};

/// Padding block size used by the platform (not the AES block size).
const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;

/// Platform keys are generated without regard to base64 trailing bits.
const KEY_ENGINE: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid encoding aes key length: expected 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("cipher error: {0}")]
    Cipher(&'static str),
    #[error("invalid padding")]
    Padding,
    #[error("decrypted payload is truncated or has an invalid length field")]
    Length,
    #[error("receive id mismatch")]
    ReceiveIdMismatch,
    #[error("decrypted payload is not utf-8")]
    Utf8,
}

/// Signature over the four wire fields: SHA-1 of the lexicographically sorted, concatenated values, hex-encoded.
pub fn signature(token: &str, timestamp: &str, nonce: &str, ciphertext: &str) -> String {
    let mut parts = [token, timestamp, nonce, ciphertext];
    parts.sort_unstable();
    let mut sha = Sha1::new();
    for p in parts {
        sha.update(p.as_bytes());
    }
    hex::encode(sha.finalize())
}

/// True when `expected` matches the signature computed over the wire fields (hex compared case-insensitively).
pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    ciphertext: &str,
    expected: &str,
) -> bool {
    signature(token, timestamp, nonce, ciphertext).eq_ignore_ascii_case(expected.trim())
}

/// Decode the platform's 43-character EncodingAESKey (base64 without the trailing `=`).
pub fn decode_aes_key(encoding_aes_key: &str) -> Result<[u8; 32], CryptoError> {
    let trimmed = encoding_aes_key.trim().trim_end_matches('=');
    let padded = format!("{}=", trimmed);
    let raw = KEY_ENGINE.decode(padded)?;
    let key: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::KeyLength(raw.len()))?;
    Ok(key)
}

/// Pad to a multiple of 32 bytes; pad bytes all equal the pad length (1..=32).
fn pad(mut data: Vec<u8>) -> Vec<u8> {
    let pad_len = PAD_BLOCK - (data.len() % PAD_BLOCK);
    data.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    data
}

fn unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    let Some(&last) = data.last() else {
        return Err(CryptoError::Padding);
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > PAD_BLOCK || pad_len > data.len() {
        return Err(CryptoError::Padding);
    }
    Ok(&data[..data.len() - pad_len])
}

/// AES key holder for the callback envelope and for encrypted media downloads.
#[derive(Clone)]
pub struct CryptoEnvelope {
    token: String,
    key: [u8; 32],
    receive_id: String,
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("receive_id", &self.receive_id)
            .finish_non_exhaustive()
    }
}

impl CryptoEnvelope {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        receive_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            token: token.into().trim().to_string(),
            key: decode_aes_key(encoding_aes_key)?,
            receive_id: receive_id.into(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn receive_id(&self) -> &str {
        &self.receive_id
    }

    pub fn verify(&self, timestamp: &str, nonce: &str, ciphertext: &str, expected: &str) -> bool {
        verify_signature(&self.token, timestamp, nonce, ciphertext, expected)
    }

    pub fn sign(&self, timestamp: &str, nonce: &str, ciphertext: &str) -> String {
        signature(&self.token, timestamp, nonce, ciphertext)
    }

    /// Decrypt a base64 ciphertext and return the content; the trailing receive id must equal the configured one.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = base64::engine::general_purpose::STANDARD.decode(ciphertext.trim())?;
        let plain = self.decrypt_bytes(&raw)?;
        if plain.len() < RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN {
            return Err(CryptoError::Length);
        }
        let len_bytes: [u8; 4] = plain[RANDOM_PREFIX_LEN..RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN]
            .try_into()
            .map_err(|_| CryptoError::Length)?;
        let content_len = u32::from_be_bytes(len_bytes) as usize;
        let start = RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN;
        let end = start.checked_add(content_len).ok_or(CryptoError::Length)?;
        if end > plain.len() {
            return Err(CryptoError::Length);
        }
        if &plain[end..] != self.receive_id.as_bytes() {
            return Err(CryptoError::ReceiveIdMismatch);
        }
        String::from_utf8(plain[start..end].to_vec()).map_err(|_| CryptoError::Utf8)
    }

    /// Encrypt content for the wire with a fresh random prefix; returns base64.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut prefix = [0u8; RANDOM_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);
        self.encrypt_with_prefix(plaintext, prefix)
    }

    fn encrypt_with_prefix(
        &self,
        plaintext: &str,
        prefix: [u8; RANDOM_PREFIX_LEN],
    ) -> Result<String, CryptoError> {
        let content = plaintext.as_bytes();
        let content_len = u32::try_from(content.len()).map_err(|_| CryptoError::Length)?;
        let mut buf = Vec::with_capacity(
            RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN + content.len() + self.receive_id.len() + PAD_BLOCK,
        );
        buf.extend_from_slice(&prefix);
        buf.extend_from_slice(&content_len.to_be_bytes());
        buf.extend_from_slice(content);
        buf.extend_from_slice(self.receive_id.as_bytes());
        let mut buf = pad(buf);
        let len = buf.len();
        let iv = &self.key[..16];
        cbc::Encryptor::<Aes256>::new((&self.key).into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| CryptoError::Cipher("encrypt"))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(&buf))
    }

    /// Decrypt a raw AES-256-CBC body with the envelope key and strip padding. Used for encrypted media too.
    pub fn decrypt_bytes(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.is_empty() || encrypted.len() % 16 != 0 {
            return Err(CryptoError::Length);
        }
        let iv = &self.key[..16];
        let mut buf = encrypted.to_vec();
        let plain = cbc::Decryptor::<Aes256>::new((&self.key).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CryptoError::Cipher("decrypt"))?;
        Ok(unpad(plain)?.to_vec())
    }
}
