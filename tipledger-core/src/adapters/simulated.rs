//! Simulated chain collaborators for tests and local runs
//!
//! `SimulatedChain` implements every chain-facing port in memory:
//! - prices come from a fixed table
//! - transfers and swaps produce deterministic messages
//! - submitted transactions are kept so callers can inspect them
//!
//! Failures and latency can be switched on to exercise error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::result::{Error, Result};
use crate::domain::TokenInfo;
use crate::ports::{
    BlockchainClient, ConfirmationStatus, PriceOracle, SignedTransaction, SwapQuote,
    SwapQuoteProvider, TransferBuilder, UnsignedTransaction,
};

/// Behaviour of the simulated chain
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// USD price per symbol
    pub prices: HashMap<String, Decimal>,
    /// Reject every submitted transaction
    pub fail_sends: bool,
    /// Status reported by `confirm`
    pub confirmation: ConfirmationStatus,
    /// Report no swap route for any pair
    pub no_route: bool,
    /// Delay before every response
    pub delay: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        let prices = [
            ("SOL", Decimal::from(100)),
            ("USDC", Decimal::ONE),
            ("USDT", Decimal::ONE),
            ("BONK", Decimal::new(2, 5)),
            ("JTO", Decimal::from(3)),
            ("PYTH", Decimal::new(4, 1)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            prices,
            fail_sends: false,
            confirmation: ConfirmationStatus::Finalized,
            no_route: false,
            delay: Duration::ZERO,
        }
    }
}

pub struct SimulatedChain {
    config: Mutex<SimConfig>,
    submitted: Mutex<Vec<SignedTransaction>>,
    counter: AtomicU64,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedChain {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config: Mutex::new(config),
            submitted: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn config(&self) -> Result<SimConfig> {
        self.config
            .lock()
            .map(|c| c.clone())
            .map_err(|_| Error::external("simulated chain config poisoned"))
    }

    /// Change behaviour mid-test
    pub fn update(&self, f: impl FnOnce(&mut SimConfig)) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut config);
    }

    /// Transactions accepted so far, oldest first
    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.submitted
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    async fn respond(&self) -> Result<SimConfig> {
        let config = self.config()?;
        if !config.delay.is_zero() {
            tokio::time::sleep(config.delay).await;
        }
        Ok(config)
    }
}

#[async_trait]
impl BlockchainClient for SimulatedChain {
    async fn get_balance(&self, _address: &str) -> Result<Decimal> {
        self.respond().await?;
        Ok(Decimal::ZERO)
    }

    async fn send_signed_transaction(&self, tx: &SignedTransaction) -> Result<String> {
        let config = self.respond().await?;
        if config.fail_sends {
            return Err(Error::external("simulated RPC rejected the transaction"));
        }
        if tx.signature.len() != 64 {
            return Err(Error::external("transaction is not signed"));
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let signature = format!("sim-{}-{}", n, bs58::encode(&tx.signature[..8]).into_string());
        self.submitted
            .lock()
            .map_err(|_| Error::external("simulated chain state poisoned"))?
            .push(tx.clone());
        Ok(signature)
    }

    async fn confirm(&self, _signature: &str) -> Result<ConfirmationStatus> {
        Ok(self.respond().await?.confirmation)
    }
}

#[async_trait]
impl SwapQuoteProvider for SimulatedChain {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<Option<SwapQuote>> {
        let config = self.respond().await?;
        if config.no_route {
            return Ok(None);
        }
        Ok(Some(SwapQuote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: amount,
            out_amount: amount / 100,
            slippage_bps,
            route: serde_json::json!({ "venue": "simulated" }),
        }))
    }

    async fn build_swap_transaction(
        &self,
        quote: &SwapQuote,
        payer_address: &str,
    ) -> Result<UnsignedTransaction> {
        self.respond().await?;
        let message = format!(
            "swap:{}:{}:{}:{}",
            payer_address, quote.input_mint, quote.output_mint, quote.in_amount
        );
        Ok(UnsignedTransaction {
            message: message.into_bytes(),
        })
    }
}

#[async_trait]
impl PriceOracle for SimulatedChain {
    async fn get_price(&self, symbol: &str) -> Result<Decimal> {
        let config = self.respond().await?;
        config
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::external(format!("no simulated price for {}", symbol)))
    }
}

#[async_trait]
impl TransferBuilder for SimulatedChain {
    async fn build_transfer(
        &self,
        from_address: &str,
        to_address: &str,
        token: &TokenInfo,
        base_units: u64,
    ) -> Result<UnsignedTransaction> {
        self.respond().await?;
        let message = format!(
            "transfer:{}:{}:{}:{}",
            from_address, to_address, token.mint, base_units
        );
        Ok(UnsignedTransaction {
            message: message.into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token;

    #[tokio::test]
    async fn test_transfer_round_trip() {
        let chain = SimulatedChain::default();
        let unsigned = chain
            .build_transfer("from", "to", token::lookup("USDC").unwrap(), 1_500_000)
            .await
            .unwrap();
        assert!(String::from_utf8(unsigned.message.clone()).unwrap().ends_with(":1500000"));

        let signed = SignedTransaction {
            message: unsigned.message,
            signature: vec![1u8; 64],
            signer: "from".to_string(),
        };
        let signature = chain.send_signed_transaction(&signed).await.unwrap();
        assert!(signature.starts_with("sim-0-"));
        assert!(chain.confirm(&signature).await.unwrap().is_success());
        assert_eq!(chain.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_can_be_switched_on() {
        let chain = SimulatedChain::default();
        chain.update(|c| {
            c.fail_sends = true;
            c.no_route = true;
        });

        let signed = SignedTransaction {
            message: vec![],
            signature: vec![0u8; 64],
            signer: "x".to_string(),
        };
        assert!(chain.send_signed_transaction(&signed).await.unwrap_err().is_external());
        assert!(chain.get_quote("a", "b", 1, 100).await.unwrap().is_none());
        assert!(chain.get_price("DOGE").await.is_err());
        assert_eq!(chain.get_price("SOL").await.unwrap(), Decimal::from(100));
    }
}
