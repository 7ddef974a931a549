//! Account domain model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::result::{Error, Result};

/// Ledger account holding funds reserved for pending escrow items
pub const ESCROW_ACCOUNT: &str = "system:escrow";

/// Ledger account collecting platform fees
pub const FEE_ACCOUNT: &str = "system:fees";

/// Counterparty recorded for credits and debits that cross the ledger boundary
/// (deposits, withdrawals, on-chain escrow payouts). Never holds a balance.
pub const EXTERNAL_PARTY: &str = "external";

/// A (user, currency) balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    /// Canonical token symbol, uppercase
    pub currency: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// True for accounts owned by the platform rather than a user
pub fn is_system_account(user_id: &str) -> bool {
    user_id.starts_with("system:")
}

/// Reject ids that would collide with system or boundary accounts
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("user id is empty"));
    }
    if is_system_account(user_id) || user_id == EXTERNAL_PARTY {
        return Err(Error::validation(format!(
            "{} is reserved",
            user_id
        )));
    }
    Ok(())
}
