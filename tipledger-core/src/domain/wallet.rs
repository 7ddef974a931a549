//! Wallet domain model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::{Error, Result};

/// What caused a wallet record to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletTrigger {
    Manual,
    Tip,
    Airdrop,
    Migration,
}

impl WalletTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Tip => "tip",
            Self::Airdrop => "airdrop",
            Self::Migration => "migration",
        }
    }
}

impl FromStr for WalletTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "tip" => Ok(Self::Tip),
            "airdrop" => Ok(Self::Airdrop),
            "migration" => Ok(Self::Migration),
            other => Err(Error::database(format!("unknown wallet trigger '{}'", other))),
        }
    }
}

/// Encrypted private key envelope. Only the vault can open it.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedKey(String);

impl SealedKey {
    pub fn new(envelope: impl Into<String>) -> Self {
        Self(envelope.into())
    }

    pub fn as_envelope(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedKey(<redacted>)")
    }
}

/// A user's wallet. Custodial wallets carry a sealed key; manually
/// registered external addresses do not.
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub user_id: String,
    pub address: String,
    pub sealed_key: Option<SealedKey>,
    pub trigger: WalletTrigger,
    pub created_at: DateTime<Utc>,
}

impl WalletRecord {
    pub fn is_custodial(&self) -> bool {
        self.sealed_key.is_some()
    }
}

/// Serializable view of a wallet without key material
#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub user_id: String,
    pub address: String,
    pub trigger: WalletTrigger,
    pub custodial: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&WalletRecord> for WalletSummary {
    fn from(record: &WalletRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            address: record.address.clone(),
            trigger: record.trigger,
            custodial: record.is_custodial(),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WalletStats {
    pub total: u64,
    pub custodial: u64,
    pub by_trigger: Vec<(WalletTrigger, u64)>,
}

/// Validate a base58 ed25519 public address
pub fn validate_address(address: &str) -> Result<()> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|_| Error::validation(format!("{} is not base58", address)))?;
    if bytes.len() != 32 {
        return Err(Error::validation(format!(
            "address decodes to {} bytes, expected 32",
            bytes.len()
        )));
    }
    Ok(())
}
