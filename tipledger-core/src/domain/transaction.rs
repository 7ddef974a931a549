//! Transaction domain model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::{Error, Result};

/// What produced a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Tip,
    Credit,
    Debit,
    EscrowHold,
    EscrowRelease,
    Refund,
    Fee,
    Airdrop,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tip => "tip",
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::EscrowHold => "escrow_hold",
            Self::EscrowRelease => "escrow_release",
            Self::Refund => "refund",
            Self::Fee => "fee",
            Self::Airdrop => "airdrop",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "tip" => Self::Tip,
            "credit" => Self::Credit,
            "debit" => Self::Debit,
            "escrow_hold" => Self::EscrowHold,
            "escrow_release" => Self::EscrowRelease,
            "refund" => Self::Refund,
            "fee" => Self::Fee,
            "airdrop" => Self::Airdrop,
            other => return Err(Error::database(format!("unknown transaction kind '{}'", other))),
        })
    }
}

/// An immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Monotonic insertion order, used for newest-first paging
    pub seq: i64,
    pub kind: TransactionKind,
    pub sender_id: String,
    pub receiver_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    /// On-chain signature when the entry settles an external transfer
    pub signature: Option<String>,
}

/// One movement between two ledger accounts, applied as part of an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub struct TransferLeg {
    pub kind: TransactionKind,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub currency: String,
}

impl TransferLeg {
    pub fn new(
        kind: TransactionKind,
        from: impl Into<String>,
        to: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            amount,
            currency: currency.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} must be positive", self.amount)));
        }
        if self.from == self.to {
            return Err(Error::validation(format!(
                "cannot transfer from {} to itself",
                self.from
            )));
        }
        Ok(())
    }
}
