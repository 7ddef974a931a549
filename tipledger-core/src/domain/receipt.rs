//! Results of the user-facing operations

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::escrow::ClaimPlan;
use super::wallet::WalletSummary;

/// Where a transfer ended up
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "destination", rename_all = "snake_case")]
pub enum Delivery {
    /// Credited on the ledger to a user with a wallet
    Ledger { transaction_id: Uuid },
    /// Held in escrow until the user registers a wallet
    Escrow { escrow_id: Uuid },
}

impl Delivery {
    pub fn is_escrowed(&self) -> bool {
        matches!(self, Self::Escrow { .. })
    }

    /// Transaction or escrow id, used as the source of a fee record
    pub fn reference(&self) -> String {
        match self {
            Self::Ledger { transaction_id } => transaction_id.to_string(),
            Self::Escrow { escrow_id } => escrow_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TipReceipt {
    pub sender_id: String,
    pub recipient_id: String,
    /// What the sender paid, fee included
    pub amount: Decimal,
    pub fee: Decimal,
    /// What the recipient gets
    pub net: Decimal,
    pub currency: String,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectReceipt {
    pub airdrop_id: Uuid,
    pub user_id: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub delivery: Delivery,
    pub remaining_slots: u32,
}

/// One settled payout of a claim
#[derive(Debug, Clone, Serialize)]
pub struct PayoutLine {
    pub currency: String,
    pub amount: Decimal,
    pub signature: String,
    pub claimed: usize,
    /// Items that expired or were claimed elsewhere while the payout ran
    pub skipped: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimReceipt {
    pub recipient_id: String,
    pub wallet_address: String,
    pub payouts: Vec<PayoutLine>,
    /// Currencies whose payout failed, with the error. Their items stay pending.
    pub failures: Vec<(String, String)>,
}

impl ClaimReceipt {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReceipt {
    pub wallet: WalletSummary,
    /// False when the same address was already registered
    pub created: bool,
    /// Escrowed funds now claimable to the registered wallet
    pub pending: ClaimPlan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_reference() {
        let id = Uuid::new_v4();
        let delivery = Delivery::Escrow { escrow_id: id };
        assert!(delivery.is_escrowed());
        assert_eq!(delivery.reference(), id.to_string());

        let json = serde_json::to_value(&Delivery::Ledger { transaction_id: id }).unwrap();
        assert_eq!(json["destination"], "ledger");
    }
}
