//! Chain-facing collaborator ports
//!
//! Transaction construction, RPC, swap routing and pricing live outside the
//! core. Implementations are expected to be network clients; callers wrap
//! every call in a timeout and never hold a store lock across one.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::result::{Error, Result};
use crate::domain::TokenInfo;

/// A transaction message ready to be signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    /// Base58 address of the signer
    pub signer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Confirmed,
    Finalized,
    Failed,
}

impl ConfirmationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Finalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapQuote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub slippage_bps: u16,
    /// Provider payload passed back to `build_swap_transaction`
    #[serde(default)]
    pub route: serde_json::Value,
}

/// Something that can sign transaction messages, such as an unsealed wallet key
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> &str;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

pub fn sign_transaction(
    signer: &dyn TransactionSigner,
    tx: UnsignedTransaction,
) -> Result<SignedTransaction> {
    let signature = signer.sign(&tx.message)?;
    Ok(SignedTransaction {
        message: tx.message,
        signature,
        signer: signer.address().to_string(),
    })
}

/// Await a collaborator call, failing with `Timeout` after `limit`
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{} after {}ms", what, limit.as_millis()))),
    }
}

#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// Native balance of an address
    async fn get_balance(&self, address: &str) -> Result<Decimal>;

    /// Submit a signed transaction and return its signature
    async fn send_signed_transaction(&self, tx: &SignedTransaction) -> Result<String>;

    async fn confirm(&self, signature: &str) -> Result<ConfirmationStatus>;
}

#[async_trait]
pub trait SwapQuoteProvider: Send + Sync {
    /// `Ok(None)` when no route exists
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<Option<SwapQuote>>;

    async fn build_swap_transaction(
        &self,
        quote: &SwapQuote,
        payer_address: &str,
    ) -> Result<UnsignedTransaction>;
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD price of one unit of `symbol`
    async fn get_price(&self, symbol: &str) -> Result<Decimal>;
}

/// Builds payout transfers for escrow claims
#[async_trait]
pub trait TransferBuilder: Send + Sync {
    async fn build_transfer(
        &self,
        from_address: &str,
        to_address: &str,
        token: &TokenInfo,
        base_units: u64,
    ) -> Result<UnsignedTransaction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_fails_slow_calls() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        };
        let err = with_timeout(Duration::from_secs(15), "quote", slow).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(msg) if msg.contains("quote")));

        let fast = async { Ok::<_, Error>(2) };
        assert_eq!(with_timeout(Duration::from_secs(1), "quote", fast).await.unwrap(), 2);
    }
}
