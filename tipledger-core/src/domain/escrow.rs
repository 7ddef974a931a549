//! Escrow domain model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowKind {
    Tip,
    AirdropClaim,
}

impl EscrowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tip => "tip",
            Self::AirdropClaim => "airdrop_claim",
        }
    }
}

impl FromStr for EscrowKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tip" => Ok(Self::Tip),
            "airdrop_claim" => Ok(Self::AirdropClaim),
            other => Err(Error::database(format!("unknown escrow kind '{}'", other))),
        }
    }
}

/// Lifecycle: `Pending -> Claimed` or `Pending -> Expired`, both terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Claimed,
    Expired,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Expired => "expired",
        }
    }

    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Claimed) | (Self::Pending, Self::Expired)
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "expired" => Ok(Self::Expired),
            other => Err(Error::database(format!("unknown escrow status '{}'", other))),
        }
    }
}

/// Funds held for a recipient who has not registered a wallet yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowItem {
    pub id: Uuid,
    pub kind: EscrowKind,
    pub recipient_id: String,
    pub sender_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: EscrowStatus,
    pub message: Option<String>,
    /// Airdrop this claim belongs to
    pub airdrop_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Settlement signature recorded when claimed
    pub proof_ref: Option<String>,
}

impl EscrowItem {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Pending && self.expires_at <= now
    }
}

/// Input for a new pending tip or airdrop claim
#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub recipient_id: String,
    pub sender_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub message: Option<String>,
    pub airdrop_id: Option<Uuid>,
}

/// Per-currency aggregate of a recipient's pending items
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimLine {
    pub currency: String,
    pub amount: Decimal,
    pub item_ids: Vec<Uuid>,
}

/// Transfers needed to pay out everything pending for a recipient
#[derive(Debug, Clone, Serialize)]
pub struct ClaimPlan {
    pub recipient_id: String,
    pub wallet_address: String,
    pub lines: Vec<ClaimLine>,
}

impl ClaimPlan {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.lines.iter().map(|l| l.item_ids.len()).sum()
    }
}

/// Result of `mark_claimed`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClaimOutcome {
    pub claimed: Vec<EscrowItem>,
    /// Ids that were not pending (already claimed, expired, or unknown)
    pub skipped: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EscrowStats {
    pub pending: u64,
    pub claimed: u64,
    pub expired: u64,
    pub pending_by_currency: Vec<(String, Decimal)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_pending_transitions() {
        assert!(EscrowStatus::Pending.can_transition_to(EscrowStatus::Claimed));
        assert!(EscrowStatus::Pending.can_transition_to(EscrowStatus::Expired));
        assert!(!EscrowStatus::Claimed.can_transition_to(EscrowStatus::Expired));
        assert!(!EscrowStatus::Expired.can_transition_to(EscrowStatus::Claimed));
        assert!(!EscrowStatus::Claimed.can_transition_to(EscrowStatus::Pending));
    }

    #[test]
    fn test_status_roundtrip_names() {
        assert_eq!("expired".parse::<EscrowStatus>().unwrap(), EscrowStatus::Expired);
        assert_eq!("airdrop_claim".parse::<EscrowKind>().unwrap(), EscrowKind::AirdropClaim);
    }
}
