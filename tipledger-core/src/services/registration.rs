//! Wallet registration - single-use nonces and ownership proofs
//!
//! A user asks for a challenge, signs its message with the wallet they want
//! to register, and submits the signature. Nonces are bound to the user they
//! were issued to, expire after a TTL and can be consumed once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::result::{Error, Result};
use crate::domain::validate_user_id;
use crate::ports::Clock;

/// What the user must sign to prove they own a wallet
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationChallenge {
    pub nonce: Uuid,
    pub message: String,
    pub expires_at: DateTime<Utc>,
}

/// A signed answer to a `RegistrationChallenge`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub user_id: String,
    /// Base58 public key being registered
    pub address: String,
    pub nonce: String,
    /// The exact message that was signed
    pub message: String,
    /// Ed25519 signature, base64 or base58
    pub signature: String,
}

#[derive(Debug)]
struct IssuedNonce {
    user_id: String,
    expires_at: DateTime<Utc>,
}

pub struct NonceStore {
    issued: Mutex<HashMap<Uuid, IssuedNonce>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            issued: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, IssuedNonce>>> {
        self.issued
            .lock()
            .map_err(|_| Error::database("nonce store lock poisoned"))
    }

    pub fn issue(&self, user_id: &str) -> Result<RegistrationChallenge> {
        validate_user_id(user_id)?;
        let now = self.clock.now();
        let nonce = Uuid::new_v4();
        let expires_at = now + self.ttl;

        let mut issued = self.lock()?;
        issued.retain(|_, n| n.expires_at > now);
        issued.insert(
            nonce,
            IssuedNonce {
                user_id: user_id.to_string(),
                expires_at,
            },
        );
        debug!(user_id, "issued registration nonce");

        Ok(RegistrationChallenge {
            nonce,
            message: challenge_message(user_id, nonce, now),
            expires_at,
        })
    }

    /// Use up a nonce. Unknown, expired, reused or foreign nonces all fail
    /// the same way.
    pub fn consume(&self, nonce: &str, user_id: &str) -> Result<()> {
        let nonce = Uuid::parse_str(nonce).map_err(|_| Error::NonceReplayOrExpired)?;
        let now = self.clock.now();
        let mut issued = self.lock()?;

        match issued.get(&nonce) {
            Some(entry) if entry.user_id != user_id => {
                warn!(user_id, "registration nonce presented by another user");
                Err(Error::NonceReplayOrExpired)
            }
            Some(entry) if entry.expires_at <= now => {
                issued.remove(&nonce);
                Err(Error::NonceReplayOrExpired)
            }
            Some(_) => {
                issued.remove(&nonce);
                Ok(())
            }
            None => Err(Error::NonceReplayOrExpired),
        }
    }

    /// Outstanding nonces, expired ones included until the next issue
    pub fn outstanding(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

fn challenge_message(user_id: &str, nonce: Uuid, issued_at: DateTime<Utc>) -> String {
    format!(
        "Register wallet for TipLedger\nuser: {}\nnonce: {}\nissued: {}",
        user_id,
        nonce,
        issued_at.to_rfc3339()
    )
}

/// Decode a 64-byte signature given as base64 or base58
pub fn decode_signature(signature: &str) -> Result<[u8; 64]> {
    let signature = signature.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(signature)
        .ok()
        .filter(|bytes| bytes.len() == 64)
        .or_else(|| {
            bs58::decode(signature)
                .into_vec()
                .ok()
                .filter(|bytes| bytes.len() == 64)
        })
        .ok_or_else(|| Error::validation("signature must be 64 bytes of base64 or base58"))?;

    decoded
        .as_slice()
        .try_into()
        .map_err(|_| Error::validation("signature must be 64 bytes"))
}

/// Check that `address` signed `message`, and that the message names `nonce`
pub fn verify_ownership(request: &RegistrationRequest) -> Result<()> {
    if !request.message.contains(&format!("nonce: {}", request.nonce)) {
        return Err(Error::validation("signed message does not contain the nonce"));
    }

    let key_bytes: [u8; 32] = bs58::decode(&request.address)
        .into_vec()
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::validation("address is not a base58 ed25519 public key"))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| Error::validation("address is not a valid ed25519 public key"))?;

    let signature = Signature::from_bytes(&decode_signature(&request.signature)?);
    verifying_key
        .verify(request.message.as_bytes(), &signature)
        .map_err(|_| Error::validation("signature does not match address"))
}
