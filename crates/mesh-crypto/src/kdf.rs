//! Passphrase unlock for a node's staged blobs
//!
//! When `MESHSTAGE_PASSPHRASE` is set, meshd stretches it with Argon2id over
//! the per-node salt in `<data_dir>/key.salt`. The result is the root of the
//! key hierarchy; [`derive_storage_key`](crate::derive_storage_key) takes it
//! from there. The salt is public, so two nodes sharing a passphrase still
//! end up with unrelated storage keys.

use argon2::{Algorithm, Argon2, Params, Version};
use mesh_core::config::CryptoConfig;
use mesh_core::{MeshError, MeshResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::KEY_SIZE;

/// Length of the salt file meshd keeps beside the data dir.
pub const SALT_LEN: usize = 16;

/// Root of the key hierarchy. Wiped when dropped; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Argon2id cost settings, taken from the `[crypto]` config table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KdfParams {
    fn hasher(&self) -> MeshResult<Argon2<'static>> {
        let params = Params::new(self.mem_cost_kib, self.time_cost, self.parallelism, Some(KEY_SIZE))
            .map_err(|e| {
                MeshError::Config(format!(
                    "argon2 costs m={} t={} p={} rejected: {e}",
                    self.mem_cost_kib, self.time_cost, self.parallelism
                ))
            })?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&CryptoConfig::default())
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Stretch `passphrase` over this node's `salt`.
///
/// Blocks for as long as the configured costs demand; meshd runs it on the
/// blocking pool. An empty passphrase is a configuration mistake, not a key.
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> MeshResult<MasterKey> {
    let secret = passphrase.expose_secret();
    if secret.is_empty() {
        return Err(MeshError::Config("storage passphrase is empty".into()));
    }

    let mut key = MasterKey::from_bytes([0u8; KEY_SIZE]);
    params
        .hasher()?
        .hash_password_into(secret.as_bytes(), salt, &mut key.bytes)
        .map_err(|e| MeshError::Crypto(format!("passphrase stretch failed: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive_storage_key;

    // smallest costs argon2 accepts, so the suite stays quick
    const CHEAP: KdfParams = KdfParams {
        mem_cost_kib: 8,
        time_cost: 1,
        parallelism: 1,
    };

    fn unlock(passphrase: &str, salt: [u8; SALT_LEN]) -> [u8; KEY_SIZE] {
        let master = derive_master_key(&SecretString::from(passphrase), &salt, &CHEAP).unwrap();
        *derive_storage_key(&master).unwrap().as_bytes()
    }

    #[test]
    fn same_salt_file_unlocks_same_storage_key() {
        let salt = *b"node-salt-000001";
        assert_eq!(unlock("orchard lantern", salt), unlock("orchard lantern", salt));
    }

    #[test]
    fn nodes_sharing_a_passphrase_get_distinct_keys() {
        let a = unlock("shared by the fleet", [0xA1; SALT_LEN]);
        let b = unlock("shared by the fleet", [0xB2; SALT_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn changed_passphrase_changes_storage_key() {
        let salt = [7; SALT_LEN];
        assert_ne!(unlock("before rotation", salt), unlock("after rotation", salt));
    }

    #[test]
    fn empty_passphrase_is_a_config_error() {
        let err = derive_master_key(&SecretString::from(""), &[0; SALT_LEN], &CHEAP).unwrap_err();
        assert!(matches!(err, MeshError::Config(_)), "{err:?}");
    }

    #[test]
    fn zero_costs_from_config_are_rejected() {
        let cfg = CryptoConfig {
            argon2_time_cost: 0,
            ..CryptoConfig::default()
        };
        let err = derive_master_key(&SecretString::from("pw"), &[0; SALT_LEN], &KdfParams::from(&cfg))
            .unwrap_err();
        assert!(matches!(err, MeshError::Config(ref m) if m.contains("t=0")), "{err:?}");
    }

    #[test]
    fn config_table_drives_costs() {
        let cfg = CryptoConfig {
            argon2_mem_cost_kib: 4096,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
            ..CryptoConfig::default()
        };
        assert_eq!(
            KdfParams::from(&cfg),
            KdfParams {
                mem_cost_kib: 4096,
                time_cost: 2,
                parallelism: 1
            }
        );
        assert_eq!(KdfParams::default(), KdfParams::from(&CryptoConfig::default()));
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = MasterKey::from_bytes([0x5A; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "MasterKey(..)");
    }
}
