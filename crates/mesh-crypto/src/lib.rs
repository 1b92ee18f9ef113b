//! mesh-crypto: the encryption collaborator used by the storage manager
//!
//! Every staged payload is sealed with XChaCha20-Poly1305 before it touches
//! local storage or the mesh.
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from passphrase)
//!   └── Storage Key (HKDF-SHA256 from master key, domain="mesh-storage")
//!       └── Blob AEAD: XChaCha20-Poly1305 (nonce=random_192bit, AAD="meshstage-blob-v1")
//! ```
//!
//! Nodes without a passphrase use a random storage key persisted as base64 in
//! the configured key file.

pub mod cipher;
pub mod kdf;
pub mod keys;

pub use cipher::{Encryptor, XChaChaEncryptor};
pub use kdf::{derive_master_key, KdfParams, MasterKey, SALT_LEN};
pub use keys::{derive_storage_key, generate_storage_key, load_or_create_key, StorageKey};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
