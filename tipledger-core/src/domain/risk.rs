//! Risk limit domain model

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::result::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Tip,
    Withdraw,
    Airdrop,
}

impl TransactionType {
    pub const ALL: [TransactionType; 3] = [Self::Tip, Self::Withdraw, Self::Airdrop];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tip => "tip",
            Self::Withdraw => "withdraw",
            Self::Airdrop => "airdrop",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tip" => Ok(Self::Tip),
            "withdraw" => Ok(Self::Withdraw),
            "airdrop" => Ok(Self::Airdrop),
            other => Err(Error::validation(format!("unknown transaction type '{}'", other))),
        }
    }
}

/// Limits for one transaction type, in native currency units
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeLimits {
    pub max_per_transaction: Decimal,
    pub daily_limit: Decimal,
    pub cooldown_minutes: i64,
}

impl TypeLimits {
    fn new(max_per_transaction: Decimal, daily_limit: Decimal, cooldown_minutes: i64) -> Self {
        Self {
            max_per_transaction,
            daily_limit,
            cooldown_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskLimits {
    pub tip: TypeLimits,
    pub withdraw: TypeLimits,
    pub airdrop: TypeLimits,
    /// `should_block` blocks when the risk score is strictly above this
    pub block_score_threshold: u32,
    /// Users above this score appear in the daily report
    pub high_risk_score: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            tip: TypeLimits::new(Decimal::new(1, 2), Decimal::new(1, 1), 5),
            withdraw: TypeLimits::new(Decimal::new(1, 2), Decimal::new(5, 2), 60),
            airdrop: TypeLimits::new(Decimal::new(5, 3), Decimal::new(2, 2), 120),
            block_score_threshold: 5,
            high_risk_score: 5,
        }
    }
}

impl RiskLimits {
    pub fn for_type(&self, tx_type: TransactionType) -> &TypeLimits {
        match tx_type {
            TransactionType::Tip => &self.tip,
            TransactionType::Withdraw => &self.withdraw,
            TransactionType::Airdrop => &self.airdrop,
        }
    }
}

/// Result of `check_limits`; every violated rule is listed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitCheck {
    pub ok: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDecision {
    pub block: bool,
    pub reasons: Vec<String>,
    pub score: u32,
}

impl BlockDecision {
    pub fn into_result(self) -> Result<()> {
        if self.block {
            Err(Error::RiskLimitExceeded {
                reasons: self.reasons,
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HighRiskUser {
    pub user_id: String,
    pub score: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub day: chrono::NaiveDate,
    pub active_users: usize,
    pub total_tips: Decimal,
    pub total_withdraws: Decimal,
    pub total_airdrops: Decimal,
    pub high_risk_users: Vec<HighRiskUser>,
}
