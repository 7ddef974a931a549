//! Vault key metadata

use serde::{Deserialize, Serialize};

/// Default Argon2id parameters
pub const DEFAULT_TIME_COST: u32 = 3;
pub const DEFAULT_MEMORY_COST: u32 = 65536; // 64 MiB
pub const DEFAULT_PARALLELISM: u32 = 4;
pub const DEFAULT_HASH_LEN: u32 = 32;

/// Argon2id parameters for key derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argon2Params {
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub hash_len: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            time_cost: DEFAULT_TIME_COST,
            memory_cost: DEFAULT_MEMORY_COST,
            parallelism: DEFAULT_PARALLELISM,
            hash_len: DEFAULT_HASH_LEN,
        }
    }
}

/// How the master key was supplied when the vault was initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySourceKind {
    /// 32 raw bytes, hex encoded
    Raw,
    /// Passphrase stretched with Argon2id
    Passphrase,
}

/// Metadata stored in vault.json
///
/// `key_check` is a sealed known plaintext; opening it proves the supplied
/// master key is the one that sealed the existing wallets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub key_source: KeySourceKind,
    /// Base64-encoded random salt (passphrase vaults only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argon2_params: Option<Argon2Params>,
    pub cipher: String,
    pub version: u32,
    pub key_check: String,
}

impl VaultMetadata {
    pub fn raw(key_check: String) -> Self {
        Self {
            key_source: KeySourceKind::Raw,
            salt: None,
            argon2_params: None,
            cipher: "aes-256-gcm".to_string(),
            version: 1,
            key_check,
        }
    }

    pub fn passphrase(salt: String, argon2_params: Argon2Params, key_check: String) -> Self {
        Self {
            key_source: KeySourceKind::Passphrase,
            salt: Some(salt),
            argon2_params: Some(argon2_params),
            cipher: "aes-256-gcm".to_string(),
            version: 1,
            key_check,
        }
    }
}
