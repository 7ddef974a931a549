//! Fee accumulation domain model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::{Error, Result};

/// `Pending -> Processing -> Swapped | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStatus {
    Pending,
    Processing,
    Swapped,
    Failed,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Swapped => "swapped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "swapped" => Ok(Self::Swapped),
            "failed" => Ok(Self::Failed),
            other => Err(Error::database(format!("unknown fee status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeRecord {
    pub id: Uuid,
    pub token: String,
    pub amount: Decimal,
    /// Ledger transaction or escrow item that produced the fee
    pub source_ref: String,
    pub status: FeeStatus,
    pub accumulated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settlement_signature: Option<String>,
    pub error_message: Option<String>,
}

/// Sum of pending records for one token
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Accumulated {
    pub total: Decimal,
    pub contributing_ids: Vec<Uuid>,
}

/// Records moved to `Processing` for a single swap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeBatch {
    pub token: String,
    pub total: Decimal,
    pub ids: Vec<Uuid>,
}

/// How a claimed batch ended
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSettlement {
    Swapped { signature: String },
    Failed { error: String },
}

impl BatchSettlement {
    pub fn status(&self) -> FeeStatus {
        match self {
            Self::Swapped { .. } => FeeStatus::Swapped,
            Self::Failed { .. } => FeeStatus::Failed,
        }
    }
}

/// What `swap` did for a token
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SwapOutcome {
    /// Native currency needs no conversion
    NotRequired,
    /// Pending total is under the token's threshold
    BelowThreshold { total: Decimal, threshold: Decimal },
    Swapped { batch: FeeBatch, signature: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeStatsRow {
    pub token: String,
    pub status: FeeStatus,
    pub count: u64,
    pub total: Decimal,
}
