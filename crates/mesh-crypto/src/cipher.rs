//! Whole-blob XChaCha20-Poly1305 sealing
//!
//! Sealed blob format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = "meshstage-blob-v1"
//! ```
//!
//! The AAD pins sealed blobs to this format version so a blob produced by a
//! different key hierarchy or layout fails authentication instead of decoding
//! to garbage.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use mesh_core::{MeshError, MeshResult};
use rand::RngCore;

use crate::keys::StorageKey;
use crate::{NONCE_SIZE, TAG_SIZE};

const BLOB_AAD: &[u8] = b"meshstage-blob-v1";

/// Encrypt/decrypt collaborator consumed by the storage manager.
///
/// `decrypt` must be the exact inverse of `encrypt` for every blob the
/// implementation produced.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> MeshResult<Vec<u8>>;
    fn decrypt(&self, sealed: &[u8]) -> MeshResult<Vec<u8>>;
}

/// Seals blobs under a single storage key.
pub struct XChaChaEncryptor {
    key: StorageKey,
}

impl XChaChaEncryptor {
    pub fn new(key: StorageKey) -> Self {
        Self { key }
    }

    /// Bytes added to every plaintext by sealing.
    pub const fn overhead() -> usize {
        NONCE_SIZE + TAG_SIZE
    }
}

impl std::fmt::Debug for XChaChaEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XChaChaEncryptor")
            .field("key", &self.key)
            .finish()
    }
}

impl Encryptor for XChaChaEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> MeshResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(self.key.as_bytes().into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: BLOB_AAD,
                },
            )
            .map_err(|e| MeshError::Crypto(format!("blob encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> MeshResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(MeshError::Crypto(format!(
                "sealed blob too short: {} bytes (minimum {})",
                sealed.len(),
                NONCE_SIZE + TAG_SIZE
            )));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);
        let cipher = XChaCha20Poly1305::new(self.key.as_bytes().into());

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: BLOB_AAD,
                },
            )
            .map_err(|_| {
                MeshError::Crypto("blob decryption failed: wrong key or corrupted data".into())
            })
    }
}
