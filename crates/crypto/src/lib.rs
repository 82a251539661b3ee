//! nova_crypto
//!
//! Encrypted-at-rest envelope:
//! - JSON blob `{v, kid, kv, iv, ct, tag, aad?}`
//! - AES-256-GCM, 12-byte IV, 16-byte tag carried separately from ct
//! - PBKDF2-SHA256 (100 000 iterations) when the key comes from a passphrase
//!
//! The envelope binds an optional AAD by storing base64(sha256(aad)) and
//! feeding that digest to GCM, so a blob moved between records fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("base64 decode error: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("aad mismatch")]
    AadMismatch,
    #[error("decryption failed: integrity compromised or wrong key")]
    Decryption,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted blob format. Field names are part of the on-disk contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub v: u8,
    pub kid: String,
    pub kv: u32,
    pub iv: String, // base64, 12 bytes
    pub ct: String, // base64
    pub tag: String, // base64, 16 bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aad: Option<String>, // base64(sha256(aad bytes))
}

/// Derive a 32-byte key from a passphrase.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

struct KeyRingEntry {
    key: [u8; KEY_LEN],
    version: u32,
}

/// Holds one active key plus older keys still accepted for decryption.
pub struct EncryptionService {
    keys: HashMap<String, KeyRingEntry>,
    active_kid: String,
}

impl EncryptionService {
    pub fn new(active_kid: impl Into<String>, key: [u8; KEY_LEN], version: u32) -> Self {
        let active_kid = active_kid.into();
        let mut keys = HashMap::new();
        keys.insert(active_kid.clone(), KeyRingEntry { key, version });
        Self { keys, active_kid }
    }

    /// Register an older key for decrypt-only use.
    pub fn add_legacy_key(&mut self, kid: impl Into<String>, key: [u8; KEY_LEN], version: u32) {
        self.keys.insert(kid.into(), KeyRingEntry { key, version });
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedEnvelope, CryptoError> {
        let entry = self
            .keys
            .get(&self.active_kid)
            .ok_or_else(|| CryptoError::UnknownKeyId(self.active_kid.clone()))?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let aad_digest = aad.map(|bytes| Sha256::digest(bytes).to_vec());

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&entry.key));
        let nonce = Nonce::from_slice(&iv);
        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: aad_digest.as_deref().unwrap_or(&[]),
                },
            )
            .map_err(|_| CryptoError::Decryption)?;

        // aes-gcm appends the tag; the envelope carries it separately.
        let split = sealed.len() - TAG_LEN;
        let (ct, tag) = sealed.split_at(split);

        Ok(EncryptedEnvelope {
            v: 1,
            kid: self.active_kid.clone(),
            kv: entry.version,
            iv: BASE64.encode(iv),
            ct: BASE64.encode(ct),
            tag: BASE64.encode(tag),
            aad: aad_digest.map(|d| BASE64.encode(d)),
        })
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope, aad: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        if envelope.v != 1 {
            return Err(CryptoError::UnsupportedVersion(envelope.v));
        }
        let entry = self
            .keys
            .get(&envelope.kid)
            .ok_or_else(|| CryptoError::UnknownKeyId(envelope.kid.clone()))?;

        let iv = BASE64.decode(&envelope.iv)?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Malformed(format!("iv must be {IV_LEN} bytes")));
        }
        let ct = BASE64.decode(&envelope.ct)?;
        let tag = BASE64.decode(&envelope.tag)?;
        if tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed(format!("tag must be {TAG_LEN} bytes")));
        }

        let aad_digest = aad.map(|bytes| Sha256::digest(bytes).to_vec());
        match (&envelope.aad, &aad_digest) {
            (Some(stored), Some(given)) if stored != &BASE64.encode(given) => {
                return Err(CryptoError::AadMismatch)
            }
            (Some(_), None) | (None, Some(_)) => return Err(CryptoError::AadMismatch),
            _ => {}
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&entry.key));
        let nonce = Nonce::from_slice(&iv);
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: aad_digest.as_deref().unwrap_or(&[]),
                },
            )
            .map_err(|_| CryptoError::Decryption)
    }

    /// Parse a persisted blob and decrypt it.
    pub fn open_blob(&self, blob: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        let envelope: EncryptedEnvelope = serde_json::from_slice(blob)?;
        self.decrypt(&envelope, aad)
    }

    /// Encrypt and serialize to the persisted JSON form.
    pub fn seal_blob(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        let envelope = self.encrypt(plaintext, aad)?;
        Ok(serde_json::to_vec(&envelope)?)
    }
}
