//! Storage key: generation, derivation from the master key, key-file persistence

use std::path::Path;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use mesh_core::{MeshError, MeshResult};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

/// The 256-bit key that seals staged blobs. Zeroized on drop.
#[derive(Clone)]
pub struct StorageKey {
    bytes: [u8; KEY_SIZE],
}

impl StorageKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for StorageKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random storage key.
pub fn generate_storage_key() -> StorageKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    StorageKey::from_bytes(bytes)
}

/// Derive the storage key from the master key via HKDF-SHA256.
pub fn derive_storage_key(master: &MasterKey) -> MeshResult<StorageKey> {
    let hkdf = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(b"mesh-storage", &mut okm)
        .map_err(|e| MeshError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(StorageKey::from_bytes(okm))
}

/// Load a base64 key file, or create one with a fresh random key.
pub fn load_or_create_key(path: &Path) -> anyhow::Result<StorageKey> {
    if path.exists() {
        let mut encoded = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file: {}", path.display()))?;
        let decoded = STANDARD.decode(encoded.trim());
        encoded.zeroize();
        let mut raw = decoded.with_context(|| format!("decoding key file: {}", path.display()))?;

        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            anyhow::bail!(
                "key file {} holds {} bytes (expected {})",
                path.display(),
                len,
                KEY_SIZE
            );
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        tracing::debug!(path = %path.display(), "loaded storage key");
        return Ok(StorageKey::from_bytes(bytes));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating key directory: {}", parent.display()))?;
    }

    let key = generate_storage_key();
    let mut encoded = STANDARD.encode(key.as_bytes());
    let written = std::fs::write(path, &encoded);
    encoded.zeroize();
    written.with_context(|| format!("writing key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting key file: {}", path.display()))?;
    }

    tracing::info!(path = %path.display(), "generated new storage key");
    Ok(key)
}
