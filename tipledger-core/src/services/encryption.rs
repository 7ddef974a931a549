//! Encryption service - vault master key and key envelopes
//!
//! Private keys are sealed with AES-256-GCM under a master key that must be
//! supplied from outside the process: either 32 raw bytes (hex) or a
//! passphrase stretched with Argon2id. `vault.json` records how the key was
//! supplied plus a sealed check value, so a wrong or missing key fails at
//! startup instead of producing undecryptable records.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::domain::result::{Error, Result};
use crate::domain::{Argon2Params, KeySourceKind, VaultMetadata};

/// Hex-encoded 32-byte master key
pub const MASTER_KEY_ENV: &str = "TIPLEDGER_MASTER_KEY";

/// Passphrase for Argon2id derivation
pub const MASTER_PASSPHRASE_ENV: &str = "TIPLEDGER_MASTER_PASSPHRASE";

const ENVELOPE_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_CHECK_PLAINTEXT: &[u8] = b"tipledger-vault-key-check";

/// 32-byte AES key, wiped on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; 32],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            hex::decode(hex_key.trim())
                .map_err(|_| Error::config("master key is not valid hex"))?,
        );
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| Error::config("master key must be 64 hex characters (32 bytes)"))?;
        Ok(Self { bytes })
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Where the master key comes from
pub enum KeySource {
    Raw(MasterKey),
    Passphrase(Zeroizing<String>),
}

impl KeySource {
    /// Read the key source from the environment. There is no fallback: a
    /// process without a configured key refuses to start.
    pub fn from_env() -> Result<Self> {
        if let Ok(hex_key) = std::env::var(MASTER_KEY_ENV) {
            return Ok(Self::Raw(MasterKey::from_hex(&hex_key)?));
        }
        if let Ok(passphrase) = std::env::var(MASTER_PASSPHRASE_ENV) {
            if passphrase.is_empty() {
                return Err(Error::config(format!("{} is empty", MASTER_PASSPHRASE_ENV)));
            }
            return Ok(Self::Passphrase(Zeroizing::new(passphrase)));
        }
        Err(Error::config(format!(
            "no master key configured: set {} or {}",
            MASTER_KEY_ENV, MASTER_PASSPHRASE_ENV
        )))
    }

    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase(Zeroizing::new(passphrase.into()))
    }

    fn kind(&self) -> KeySourceKind {
        match self {
            Self::Raw(_) => KeySourceKind::Raw,
            Self::Passphrase(_) => KeySourceKind::Passphrase,
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySource::{:?}(<redacted>)", self.kind())
    }
}

/// AES-256-GCM sealing of small secrets into text envelopes
///
/// Envelope format: `v1:` + base64(nonce(12) || ciphertext || tag(16))
pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
}

impl EnvelopeCipher {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.bytes.into()),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Encryption("sealing failed".to_string()))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            ENVELOPE_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(packed)
        ))
    }

    pub fn open(&self, envelope: &str) -> Result<Zeroizing<Vec<u8>>> {
        let encoded = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| Error::DecryptionFailure("unknown envelope version".to_string()))?;
        let packed = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| Error::DecryptionFailure("envelope is not base64".to_string()))?;
        if packed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::DecryptionFailure("envelope too short".to_string()));
        }

        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::DecryptionFailure("authentication tag mismatch".to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Manages vault.json and turns a key source into a cipher
pub struct EncryptionService {
    data_dir: PathBuf,
    argon2_params: Argon2Params,
}

impl EncryptionService {
    pub fn new(data_dir: PathBuf) -> Self {
        Self::with_argon2_params(data_dir, Argon2Params::default())
    }

    /// Parameters used when a new passphrase vault is initialized
    pub fn with_argon2_params(data_dir: PathBuf, argon2_params: Argon2Params) -> Self {
        Self {
            data_dir,
            argon2_params,
        }
    }

    fn vault_file(&self) -> PathBuf {
        self.data_dir.join("vault.json")
    }

    /// Derive a key from a passphrase using Argon2id
    fn derive_key(&self, passphrase: &str, salt: &[u8], params: &Argon2Params) -> Result<MasterKey> {
        if params.hash_len != 32 {
            return Err(Error::Encryption(format!(
                "argon2 hash_len must be 32, got {}",
                params.hash_len
            )));
        }
        let argon2_params = argon2::Params::new(
            params.memory_cost,
            params.time_cost,
            params.parallelism,
            Some(params.hash_len as usize),
        )
        .map_err(|e| Error::Encryption(format!("Failed to create argon2 params: {:?}", e)))?;

        let argon2 = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2_params,
        );

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| Error::Encryption(format!("Failed to derive key: {:?}", e)))?;

        let master = MasterKey::from_bytes(key);
        key.zeroize();
        Ok(master)
    }

    pub fn get_metadata(&self) -> Result<Option<VaultMetadata>> {
        let path = self.vault_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Open the vault, initializing vault.json on first use
    ///
    /// Fails if the key source differs from the one the vault was created
    /// with, or if the key cannot open the stored check value.
    pub fn open(&self, source: KeySource) -> Result<EnvelopeCipher> {
        match self.get_metadata()? {
            Some(metadata) => self.open_existing(&metadata, source),
            None => self.initialize(source),
        }
    }

    fn initialize(&self, source: KeySource) -> Result<EnvelopeCipher> {
        let (cipher, metadata) = match source {
            KeySource::Raw(key) => {
                let cipher = EnvelopeCipher::new(&key);
                let check = cipher.seal(KEY_CHECK_PLAINTEXT)?;
                (cipher, VaultMetadata::raw(check))
            }
            KeySource::Passphrase(passphrase) => {
                let mut salt = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut salt);
                let key = self.derive_key(&passphrase, &salt, &self.argon2_params)?;
                let cipher = EnvelopeCipher::new(&key);
                let check = cipher.seal(KEY_CHECK_PLAINTEXT)?;
                let salt_b64 = base64::engine::general_purpose::STANDARD.encode(salt);
                (
                    cipher,
                    VaultMetadata::passphrase(salt_b64, self.argon2_params.clone(), check),
                )
            }
        };

        let content = serde_json::to_string_pretty(&metadata)?;
        fs::write(self.vault_file(), content)?;
        info!(key_source = ?metadata.key_source, "initialized wallet vault");
        Ok(cipher)
    }

    fn open_existing(&self, metadata: &VaultMetadata, source: KeySource) -> Result<EnvelopeCipher> {
        if metadata.key_source != source.kind() {
            return Err(Error::config(format!(
                "vault was created with a {:?} key but a {:?} key was supplied",
                metadata.key_source,
                source.kind()
            )));
        }

        let cipher = match source {
            KeySource::Raw(key) => EnvelopeCipher::new(&key),
            KeySource::Passphrase(passphrase) => {
                let salt = metadata
                    .salt
                    .as_deref()
                    .ok_or_else(|| Error::Encryption("vault.json has no salt".to_string()))?;
                let salt = base64::engine::general_purpose::STANDARD
                    .decode(salt)
                    .map_err(|_| Error::Encryption("Invalid salt in vault metadata".to_string()))?;
                let params = metadata.argon2_params.clone().unwrap_or_default();
                EnvelopeCipher::new(&self.derive_key(&passphrase, &salt, &params)?)
            }
        };

        match cipher.open(&metadata.key_check) {
            Ok(check) if check.as_slice() == KEY_CHECK_PLAINTEXT => Ok(cipher),
            _ => Err(Error::Encryption(
                "master key does not match this vault".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_params() -> Argon2Params {
        Argon2Params {
            time_cost: 1,
            memory_cost: 1024,
            parallelism: 1,
            hash_len: 32,
        }
    }

    fn test_key(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_seal_open() {
        let cipher = EnvelopeCipher::new(&test_key(1));
        let envelope = cipher.seal(b"secret key material").unwrap();
        assert!(envelope.starts_with("v1:"));
        assert_eq!(cipher.open(&envelope).unwrap().as_slice(), b"secret key material");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let cipher = EnvelopeCipher::new(&test_key(1));
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let cipher = EnvelopeCipher::new(&test_key(1));
        let envelope = cipher.seal(b"secret").unwrap();

        let mut packed = base64::engine::general_purpose::STANDARD
            .decode(&envelope[3..])
            .unwrap();
        let last = packed.len() - 1;
        packed[last] ^= 0x01;
        let tampered = format!("v1:{}", base64::engine::general_purpose::STANDARD.encode(packed));

        assert!(matches!(cipher.open(&tampered), Err(Error::DecryptionFailure(_))));
    }

    #[test]
    fn test_malformed_envelopes_fail() {
        let cipher = EnvelopeCipher::new(&test_key(1));
        for bad in ["", "v2:abcd", "v1:***", "v1:AAAA"] {
            assert!(matches!(cipher.open(bad), Err(Error::DecryptionFailure(_))));
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = EnvelopeCipher::new(&test_key(1)).seal(b"secret").unwrap();
        let other = EnvelopeCipher::new(&test_key(2));
        assert!(matches!(other.open(&envelope), Err(Error::DecryptionFailure(_))));
    }

    #[test]
    fn test_master_key_from_hex() {
        assert!(MasterKey::from_hex(&"ab".repeat(32)).is_ok());
        assert!(matches!(MasterKey::from_hex("abcd"), Err(Error::Config(_))));
        assert!(matches!(MasterKey::from_hex(&"zz".repeat(32)), Err(Error::Config(_))));
        assert_eq!(format!("{:?}", test_key(9)), "MasterKey(<redacted>)");
    }

    #[test]
    fn test_raw_vault_rejects_different_key_on_reopen() {
        let dir = tempdir().unwrap();
        let service = EncryptionService::new(dir.path().to_path_buf());

        let cipher = service.open(KeySource::Raw(test_key(3))).unwrap();
        let envelope = cipher.seal(b"wallet").unwrap();
        assert!(dir.path().join("vault.json").exists());

        let reopened = service.open(KeySource::Raw(test_key(3))).unwrap();
        assert_eq!(reopened.open(&envelope).unwrap().as_slice(), b"wallet");

        let err = service.open(KeySource::Raw(test_key(4))).err().unwrap();
        assert!(matches!(err, Error::Encryption(_)));
    }

    #[test]
    fn test_passphrase_vault_reopens_with_same_salt() {
        let dir = tempdir().unwrap();
        let service = EncryptionService::with_argon2_params(dir.path().to_path_buf(), fast_params());

        let cipher = service.open(KeySource::passphrase("correct horse")).unwrap();
        let envelope = cipher.seal(b"wallet").unwrap();

        let metadata = service.get_metadata().unwrap().unwrap();
        assert_eq!(metadata.key_source, KeySourceKind::Passphrase);
        assert!(metadata.salt.is_some());

        let reopened = service.open(KeySource::passphrase("correct horse")).unwrap();
        assert_eq!(reopened.open(&envelope).unwrap().as_slice(), b"wallet");

        assert!(service.open(KeySource::passphrase("wrong")).is_err());
        assert!(matches!(
            service.open(KeySource::Raw(test_key(1))),
            Err(Error::Config(_))
        ));
    }
}
