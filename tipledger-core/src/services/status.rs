//! Status service - platform-wide summaries

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::result::Result;
use crate::domain::token::TOKENS;
use crate::domain::{
    EscrowStats, FeeStatsRow, RiskReport, WalletStats, ESCROW_ACCOUNT, FEE_ACCOUNT,
};
use crate::services::escrow::EscrowManager;
use crate::services::fees::FeeAccumulator;
use crate::services::ledger::LedgerService;
use crate::services::risk::RiskGate;
use crate::services::vault::WalletVault;

pub struct StatusService {
    ledger: Arc<LedgerService>,
    vault: Arc<WalletVault>,
    escrow: Arc<EscrowManager>,
    fees: Arc<FeeAccumulator>,
    risk: Arc<RiskGate>,
}

impl StatusService {
    pub fn new(
        ledger: Arc<LedgerService>,
        vault: Arc<WalletVault>,
        escrow: Arc<EscrowManager>,
        fees: Arc<FeeAccumulator>,
        risk: Arc<RiskGate>,
    ) -> Self {
        Self {
            ledger,
            vault,
            escrow,
            fees,
            risk,
        }
    }

    /// Get overall status summary
    pub fn get_status(&self) -> Result<StatusSummary> {
        let mut supply = Vec::new();
        for token in TOKENS {
            let total = self.ledger.total_supply(token.symbol)?;
            if total.is_zero() {
                continue;
            }
            supply.push(SupplyLine {
                currency: token.symbol.to_string(),
                total,
                held_in_escrow: self.ledger.get_balance(ESCROW_ACCOUNT, token.symbol)?,
                collected_fees: self.ledger.get_balance(FEE_ACCOUNT, token.symbol)?,
            });
        }

        Ok(StatusSummary {
            supply,
            escrow: self.escrow.statistics()?,
            fees: self.fees.stats()?,
            wallets: self.vault.wallet_stats()?,
            risk: self.risk.daily_report()?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub supply: Vec<SupplyLine>,
    pub escrow: EscrowStats,
    pub fees: Vec<FeeStatsRow>,
    pub wallets: WalletStats,
    pub risk: RiskReport,
}

/// Ledger totals for one currency
#[derive(Debug, Serialize)]
pub struct SupplyLine {
    pub currency: String,
    pub total: Decimal,
    pub held_in_escrow: Decimal,
    pub collected_fees: Decimal,
}
