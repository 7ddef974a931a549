//! Wallet vault - custodial key generation and sealed storage
//!
//! Private keys exist in plaintext only inside this module: right after
//! generation (before sealing) and inside an `UnsealedSigner` handed out by
//! `unseal_signing_key`. Everything persisted is an AES-GCM envelope.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::domain::result::{Error, Result};
use crate::domain::wallet::validate_address;
use crate::domain::{validate_user_id, SealedKey, WalletRecord, WalletStats, WalletTrigger};
use crate::ports::{Clock, TransactionSigner, WalletStore};
use crate::services::encryption::EnvelopeCipher;

/// A freshly generated ed25519 keypair
pub struct Keypair {
    signing_key: SigningKey,
    address: String,
}

impl Keypair {
    /// Base58 public key
    pub fn address(&self) -> &str {
        &self.address
    }

    /// 64-byte secret||public encoding used by Solana keypair files
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 64]> {
        Zeroizing::new(self.signing_key.to_keypair_bytes())
    }
}

impl TransactionSigner for Keypair {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Authorization for a single decrypt of a user's key
#[derive(Debug, Clone)]
pub struct DecryptGrant {
    purpose: String,
}

impl DecryptGrant {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
        }
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }
}

/// Signing key opened from the vault. Wiped when dropped.
pub struct UnsealedSigner {
    signing_key: SigningKey,
    address: String,
}

impl TransactionSigner for UnsealedSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for UnsealedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealedSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

pub struct WalletVault {
    store: Arc<dyn WalletStore>,
    cipher: EnvelopeCipher,
    clock: Arc<dyn Clock>,
}

impl WalletVault {
    pub fn new(store: Arc<dyn WalletStore>, cipher: EnvelopeCipher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cipher,
            clock,
        }
    }

    pub fn generate_keypair() -> Keypair {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let address = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();
        Keypair {
            signing_key,
            address,
        }
    }

    pub fn encrypt(&self, private_key: &[u8]) -> Result<SealedKey> {
        Ok(SealedKey::new(self.cipher.seal(private_key)?))
    }

    pub(crate) fn decrypt(&self, sealed: &SealedKey) -> Result<Zeroizing<Vec<u8>>> {
        self.cipher.open(sealed.as_envelope())
    }

    pub fn get_wallet(&self, user_id: &str) -> Result<Option<WalletRecord>> {
        self.store.get_wallet(user_id)
    }

    pub fn has_wallet(&self, user_id: &str) -> Result<bool> {
        Ok(self.store.get_wallet(user_id)?.is_some())
    }

    /// Return the user's wallet, creating a custodial one if missing.
    /// The flag is true when this call created it.
    pub fn ensure_wallet(
        &self,
        user_id: &str,
        trigger: WalletTrigger,
    ) -> Result<(WalletRecord, bool)> {
        validate_user_id(user_id)?;
        if let Some(existing) = self.store.get_wallet(user_id)? {
            return Ok((existing, false));
        }

        let keypair = Self::generate_keypair();
        let sealed = self.encrypt(keypair.secret_bytes().as_slice())?;
        let record = WalletRecord {
            user_id: user_id.to_string(),
            address: keypair.address().to_string(),
            sealed_key: Some(sealed),
            trigger,
            created_at: self.clock.now(),
        };

        if self.store.insert_wallet_if_absent(&record)? {
            info!(user_id, trigger = trigger.as_str(), "created custodial wallet");
            return Ok((record, true));
        }

        // Lost a race with another creator; theirs wins
        let existing = self
            .store
            .get_wallet(user_id)?
            .ok_or_else(|| Error::database(format!("wallet for {} vanished after insert", user_id)))?;
        Ok((existing, false))
    }

    /// Record an externally owned address. No key is stored.
    pub fn register_wallet(&self, user_id: &str, address: &str) -> Result<(WalletRecord, bool)> {
        validate_user_id(user_id)?;
        validate_address(address)?;

        if let Some(existing) = self.store.get_wallet(user_id)? {
            return Self::same_address(existing, address).map(|record| (record, false));
        }
        if let Some(owner) = self.store.get_wallet_by_address(address)? {
            return Err(Error::validation(format!(
                "address is already registered to {}",
                owner.user_id
            )));
        }

        let record = WalletRecord {
            user_id: user_id.to_string(),
            address: address.to_string(),
            sealed_key: None,
            trigger: WalletTrigger::Manual,
            created_at: self.clock.now(),
        };
        if self.store.insert_wallet_if_absent(&record)? {
            info!(user_id, "registered external wallet");
            return Ok((record, true));
        }

        let existing = self
            .store
            .get_wallet(user_id)?
            .ok_or_else(|| Error::database(format!("wallet for {} vanished after insert", user_id)))?;
        Self::same_address(existing, address).map(|record| (record, false))
    }

    fn same_address(existing: WalletRecord, address: &str) -> Result<WalletRecord> {
        if existing.address == address {
            Ok(existing)
        } else {
            Err(Error::validation(format!(
                "{} already has a different wallet registered",
                existing.user_id
            )))
        }
    }

    /// Open a user's custodial key for signing
    pub fn unseal_signing_key(&self, user_id: &str, grant: &DecryptGrant) -> Result<UnsealedSigner> {
        let record = self
            .store
            .get_wallet(user_id)?
            .ok_or_else(|| Error::WalletNotFound(user_id.to_string()))?;
        let sealed = record.sealed_key.as_ref().ok_or_else(|| {
            Error::validation(format!("wallet of {} is not custodial", user_id))
        })?;

        let plaintext = self.decrypt(sealed)?;
        let bytes: &[u8; 64] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| Error::DecryptionFailure("unexpected key length".to_string()))?;
        let signing_key = SigningKey::from_keypair_bytes(bytes)
            .map_err(|_| Error::DecryptionFailure("key material is inconsistent".to_string()))?;

        let address = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();
        if address != record.address {
            return Err(Error::DecryptionFailure(
                "key does not match wallet address".to_string(),
            ));
        }

        info!(user_id, purpose = grant.purpose(), "unsealed signing key");
        debug!(address = %address, "signer ready");
        Ok(UnsealedSigner {
            signing_key,
            address,
        })
    }

    pub fn wallet_stats(&self) -> Result<WalletStats> {
        self.store.wallet_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::duckdb::DuckDbStore;
    use crate::ports::SystemClock;
    use crate::services::encryption::MasterKey;
    use ed25519_dalek::{Signature, Verifier};

    fn vault() -> WalletVault {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(DuckDbStore::open_in_memory(clock.clone()).unwrap());
        store.ensure_schema().unwrap();
        let cipher = EnvelopeCipher::new(&MasterKey::from_bytes([5u8; 32]));
        WalletVault::new(store, cipher, clock)
    }

    #[test]
    fn test_generated_address_is_base58_pubkey() {
        let keypair = WalletVault::generate_keypair();
        assert!(validate_address(keypair.address()).is_ok());
        assert_eq!(&keypair.secret_bytes()[32..], bs58::decode(keypair.address()).into_vec().unwrap());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let vault = vault();
        let keypair = WalletVault::generate_keypair();
        let sealed = vault.encrypt(keypair.secret_bytes().as_slice()).unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap().as_slice(), keypair.secret_bytes().as_slice());
    }

    #[test]
    fn test_ensure_wallet_is_idempotent() {
        let vault = vault();
        let (first, created) = vault.ensure_wallet("alice", WalletTrigger::Tip).unwrap();
        assert!(created);
        assert!(first.is_custodial());

        let (second, created) = vault.ensure_wallet("alice", WalletTrigger::Airdrop).unwrap();
        assert!(!created);
        assert_eq!(second.address, first.address);
        assert_eq!(second.trigger, WalletTrigger::Tip);
    }

    #[test]
    fn test_unsealed_signer_matches_address() {
        let vault = vault();
        let (record, _) = vault.ensure_wallet("alice", WalletTrigger::Manual).unwrap();
        let signer = vault
            .unseal_signing_key("alice", &DecryptGrant::new("test"))
            .unwrap();
        assert_eq!(signer.address(), record.address);

        let signature = signer.sign(b"message").unwrap();
        let pubkey: [u8; 32] = bs58::decode(&record.address).into_vec().unwrap().try_into().unwrap();
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&pubkey).unwrap();
        let signature = Signature::from_slice(&signature).unwrap();
        assert!(verifying.verify(b"message", &signature).is_ok());
    }

    #[test]
    fn test_unseal_requires_wallet_and_key() {
        let vault = vault();
        let grant = DecryptGrant::new("test");
        assert!(matches!(
            vault.unseal_signing_key("nobody", &grant),
            Err(Error::WalletNotFound(_))
        ));

        let address = bs58::encode([9u8; 32]).into_string();
        vault.register_wallet("bob", &address).unwrap();
        assert!(matches!(
            vault.unseal_signing_key("bob", &grant),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_register_wallet_rules() {
        let vault = vault();
        let address = bs58::encode([1u8; 32]).into_string();
        let other = bs58::encode([2u8; 32]).into_string();

        let (record, created) = vault.register_wallet("carol", &address).unwrap();
        assert!(created);
        assert!(!record.is_custodial());
        assert_eq!(record.trigger, WalletTrigger::Manual);

        let (_, created) = vault.register_wallet("carol", &address).unwrap();
        assert!(!created);

        assert!(matches!(vault.register_wallet("carol", &other), Err(Error::Validation(_))));
        assert!(matches!(vault.register_wallet("dave", &address), Err(Error::Validation(_))));
        assert!(vault.register_wallet("dave", "not-an-address").is_err());
    }
}
