//! Fee accumulator - collects non-native fees and swaps them to native
//!
//! A swap claims every pending record of a token in one database
//! transaction (`pending -> processing`), performs the network round trips
//! without holding the store lock, then settles the batch as `swapped` or
//! `failed`. Records never return to `pending`, so a batch is swapped at
//! most once even when runs overlap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FeeSettings;
use crate::domain::result::{Error, Result};
use crate::domain::token::{self, TokenInfo};
use crate::domain::{
    Accumulated, BatchSettlement, FeeBatch, FeeRecord, FeeStatsRow, FeeStatus, SwapOutcome,
};
use crate::ports::{
    sign_transaction, with_timeout, BlockchainClient, Clock, FeeStore, SwapQuoteProvider,
    TransactionSigner,
};

/// Result of processing every token with pending fees
#[derive(Debug, Default, Serialize)]
pub struct FeeRunReport {
    pub outcomes: Vec<(String, SwapOutcome)>,
    /// Tokens whose swap failed, with the error
    pub failures: Vec<(String, String)>,
    pub interrupted: bool,
}

pub struct FeeAccumulator {
    store: Arc<dyn FeeStore>,
    swaps: Arc<dyn SwapQuoteProvider>,
    chain: Arc<dyn BlockchainClient>,
    clock: Arc<dyn Clock>,
    thresholds: HashMap<String, Decimal>,
    default_threshold: Decimal,
    slippage_bps: u16,
    io_timeout: Duration,
}

impl FeeAccumulator {
    pub fn new(
        store: Arc<dyn FeeStore>,
        swaps: Arc<dyn SwapQuoteProvider>,
        chain: Arc<dyn BlockchainClient>,
        clock: Arc<dyn Clock>,
        settings: &FeeSettings,
        io_timeout: Duration,
    ) -> Self {
        let thresholds = settings
            .thresholds
            .iter()
            .map(|(symbol, value)| (symbol.to_ascii_uppercase(), *value))
            .collect();
        Self {
            store,
            swaps,
            chain,
            clock,
            thresholds,
            default_threshold: settings.default_threshold,
            slippage_bps: settings.slippage_bps,
            io_timeout,
        }
    }

    pub fn threshold(&self, token: &str) -> Decimal {
        self.thresholds
            .get(token)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Record a fee taken in `token`. Native fees need no conversion and
    /// are not tracked here.
    pub fn record_fee(
        &self,
        token: &str,
        amount: Decimal,
        source_ref: &str,
    ) -> Result<Option<FeeRecord>> {
        let info = token::lookup(token)?;
        info.validate_amount(amount)?;
        if info.is_native() {
            return Ok(None);
        }

        let record = FeeRecord {
            id: Uuid::new_v4(),
            token: info.symbol.to_string(),
            amount,
            source_ref: source_ref.to_string(),
            status: FeeStatus::Pending,
            accumulated_at: self.clock.now(),
            claimed_at: None,
            settled_at: None,
            settlement_signature: None,
            error_message: None,
        };
        self.store.insert_fee(&record)?;
        debug!(token = info.symbol, source_ref, "fee accumulated");
        Ok(Some(record))
    }

    pub fn accumulated(&self, token: &str) -> Result<Accumulated> {
        let symbol = token::normalize_currency(token)?;
        self.store.accumulated(symbol)
    }

    pub fn is_swappable(&self, token: &str, total: Decimal) -> Result<bool> {
        let info = token::lookup(token)?;
        Ok(!info.is_native() && total > Decimal::ZERO && total >= self.threshold(info.symbol))
    }

    /// Swap all pending fees of `token` into the native currency
    pub async fn swap(&self, token: &str, signer: &dyn TransactionSigner) -> Result<SwapOutcome> {
        let info = token::lookup(token)?;
        if info.is_native() {
            return Ok(SwapOutcome::NotRequired);
        }

        let threshold = self.threshold(info.symbol);
        let batch = match self.store.claim_batch(info.symbol, threshold, self.clock.now())? {
            Some(batch) => batch,
            None => {
                let pending = self.store.accumulated(info.symbol)?;
                return Ok(SwapOutcome::BelowThreshold {
                    total: pending.total,
                    threshold,
                });
            }
        };
        info!(token = info.symbol, records = batch.ids.len(), total = %batch.total, "claimed fee batch");

        match self.execute_swap(info, &batch, signer).await {
            Ok(signature) => {
                let settlement = BatchSettlement::Swapped {
                    signature: signature.clone(),
                };
                self.store.settle_batch(&batch, &settlement, self.clock.now())?;
                info!(token = info.symbol, signature = %signature, "fee batch swapped");
                Ok(SwapOutcome::Swapped { batch, signature })
            }
            Err(e) => {
                let settlement = BatchSettlement::Failed {
                    error: e.to_string(),
                };
                self.store.settle_batch(&batch, &settlement, self.clock.now())?;
                warn!(token = info.symbol, error = %e, "fee batch swap failed");
                Err(e)
            }
        }
    }

    async fn execute_swap(
        &self,
        info: &TokenInfo,
        batch: &FeeBatch,
        signer: &dyn TransactionSigner,
    ) -> Result<String> {
        let amount = info.to_base_units(batch.total)?;
        let native = token::native();

        let quote = with_timeout(
            self.io_timeout,
            "swap quote",
            self.swaps
                .get_quote(info.mint, native.mint, amount, self.slippage_bps),
        )
        .await?
        .ok_or_else(|| Error::SwapQuoteUnavailable(info.symbol.to_string()))?;

        let unsigned = with_timeout(
            self.io_timeout,
            "swap transaction build",
            self.swaps.build_swap_transaction(&quote, signer.address()),
        )
        .await?;
        let signed = sign_transaction(signer, unsigned)?;

        let signature = with_timeout(
            self.io_timeout,
            "swap submission",
            self.chain.send_signed_transaction(&signed),
        )
        .await?;
        let status = with_timeout(
            self.io_timeout,
            "swap confirmation",
            self.chain.confirm(&signature),
        )
        .await?;
        if !status.is_success() {
            return Err(Error::external(format!(
                "swap transaction {} failed on chain",
                signature
            )));
        }
        Ok(signature)
    }

    /// Swap every token with pending fees, stopping between tokens on shutdown
    pub async fn process_all(
        &self,
        signer: &dyn TransactionSigner,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<FeeRunReport> {
        let mut report = FeeRunReport::default();
        for token in self.store.tokens_with_pending()? {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            match self.swap(&token, signer).await {
                Ok(outcome) => report.outcomes.push((token, outcome)),
                Err(e) => report.failures.push((token, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Fail batches whose swap never finished (claimed before `cutoff`)
    pub fn fail_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let failed = self.store.fail_stale_processing(cutoff, self.clock.now())?;
        if failed > 0 {
            warn!(failed, "failed stale fee records");
        }
        Ok(failed)
    }

    pub fn records(&self, token: &str, status: Option<FeeStatus>) -> Result<Vec<FeeRecord>> {
        let symbol = token::normalize_currency(token)?;
        self.store.fee_records(symbol, status)
    }

    pub fn stats(&self) -> Result<Vec<FeeStatsRow>> {
        self.store.fee_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::duckdb::DuckDbStore;
    use crate::ports::{ConfirmationStatus, ManualClock, SignedTransaction, SwapQuote, UnsignedTransaction};
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[derive(Default)]
    struct FakeSwaps {
        no_route: bool,
        quotes: AtomicUsize,
    }

    #[async_trait]
    impl SwapQuoteProvider for FakeSwaps {
        async fn get_quote(
            &self,
            input_mint: &str,
            output_mint: &str,
            amount: u64,
            slippage_bps: u16,
        ) -> Result<Option<SwapQuote>> {
            self.quotes.fetch_add(1, Ordering::SeqCst);
            if self.no_route {
                return Ok(None);
            }
            Ok(Some(SwapQuote {
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                in_amount: amount,
                out_amount: amount / 100,
                slippage_bps,
                route: serde_json::Value::Null,
            }))
        }

        async fn build_swap_transaction(
            &self,
            quote: &SwapQuote,
            _payer_address: &str,
        ) -> Result<UnsignedTransaction> {
            Ok(UnsignedTransaction {
                message: quote.in_amount.to_le_bytes().to_vec(),
            })
        }
    }

    struct FakeChain {
        status: ConfirmationStatus,
    }

    #[async_trait]
    impl BlockchainClient for FakeChain {
        async fn get_balance(&self, _address: &str) -> Result<Decimal> {
            Ok(Decimal::ZERO)
        }

        async fn send_signed_transaction(&self, tx: &SignedTransaction) -> Result<String> {
            Ok(format!("sig-{}", tx.message.len()))
        }

        async fn confirm(&self, _signature: &str) -> Result<ConfirmationStatus> {
            Ok(self.status.clone())
        }
    }

    struct FakeSigner;

    impl TransactionSigner for FakeSigner {
        fn address(&self) -> &str {
            "FeeWallet11111111111111111111111111111111111"
        }

        fn sign(&self, _message: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![0u8; 64])
        }
    }

    fn accumulator(swaps: FakeSwaps, status: ConfirmationStatus) -> (Arc<FakeSwaps>, FeeAccumulator) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(DuckDbStore::open_in_memory(clock.clone()).unwrap());
        store.ensure_schema().unwrap();
        let swaps = Arc::new(swaps);
        let accumulator = FeeAccumulator::new(
            store,
            swaps.clone(),
            Arc::new(FakeChain { status }),
            clock,
            &FeeSettings::default(),
            Duration::from_secs(5),
        );
        (swaps, accumulator)
    }

    #[test]
    fn test_native_fees_pass_through() {
        let (_, fees) = accumulator(FakeSwaps::default(), ConfirmationStatus::Confirmed);
        assert!(fees.record_fee("SOL", dec("0.001"), "tx-1").unwrap().is_none());
        assert!(fees.stats().unwrap().is_empty());
        assert!(!fees.is_swappable("SOL", dec("100")).unwrap());
        assert!(fees.record_fee("DOGE", dec("1"), "tx-1").is_err());
    }

    #[test]
    fn test_accumulated_and_threshold() {
        let (_, fees) = accumulator(FakeSwaps::default(), ConfirmationStatus::Confirmed);
        let a = fees.record_fee("usdc", dec("0.04"), "tx-1").unwrap().unwrap();
        let b = fees.record_fee("USDC", dec("0.05"), "tx-2").unwrap().unwrap();

        let acc = fees.accumulated("USDC").unwrap();
        assert_eq!(acc.total, dec("0.09"));
        let mut ids = acc.contributing_ids.clone();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(!fees.is_swappable("USDC", acc.total).unwrap());
        assert!(fees.is_swappable("USDC", dec("0.10")).unwrap());
        assert!(!fees.is_swappable("BONK", dec("99999")).unwrap());
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_claim() {
        let (swaps, fees) = accumulator(FakeSwaps::default(), ConfirmationStatus::Confirmed);
        fees.record_fee("USDC", dec("0.04"), "tx-1").unwrap();

        let outcome = fees.swap("USDC", &FakeSigner).await.unwrap();
        assert_eq!(
            outcome,
            SwapOutcome::BelowThreshold {
                total: dec("0.04"),
                threshold: dec("0.10")
            }
        );
        assert_eq!(swaps.quotes.load(Ordering::SeqCst), 0);
        assert_eq!(fees.records("USDC", Some(FeeStatus::Pending)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_swap_settles_batch_once() {
        let (swaps, fees) = accumulator(FakeSwaps::default(), ConfirmationStatus::Finalized);
        fees.record_fee("USDC", dec("0.06"), "tx-1").unwrap();
        fees.record_fee("USDC", dec("0.06"), "tx-2").unwrap();

        let outcome = fees.swap("USDC", &FakeSigner).await.unwrap();
        match outcome {
            SwapOutcome::Swapped { batch, signature } => {
                assert_eq!(batch.total, dec("0.12"));
                assert_eq!(batch.ids.len(), 2);
                assert_eq!(signature, "sig-8");
            }
            other => panic!("unexpected {:?}", other),
        }

        let swapped = fees.records("USDC", Some(FeeStatus::Swapped)).unwrap();
        assert_eq!(swapped.len(), 2);
        assert!(swapped.iter().all(|r| r.settlement_signature.as_deref() == Some("sig-8")));

        // Nothing left to swap
        assert!(matches!(
            fees.swap("USDC", &FakeSigner).await.unwrap(),
            SwapOutcome::BelowThreshold { .. }
        ));
        assert_eq!(swaps.quotes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_route_fails_batch() {
        let swaps = FakeSwaps {
            no_route: true,
            ..Default::default()
        };
        let (_, fees) = accumulator(swaps, ConfirmationStatus::Confirmed);
        fees.record_fee("JTO", dec("0.05"), "tx-1").unwrap();

        let err = fees.swap("JTO", &FakeSigner).await.unwrap_err();
        assert!(matches!(err, Error::SwapQuoteUnavailable(_)));

        let failed = fees.records("JTO", Some(FeeStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error_message.is_some());
        assert!(fees.records("JTO", Some(FeeStatus::Pending)).unwrap().is_empty());
        assert!(fees.records("JTO", Some(FeeStatus::Processing)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chain_failure_marks_failed() {
        let (_, fees) = accumulator(FakeSwaps::default(), ConfirmationStatus::Failed);
        fees.record_fee("PYTH", dec("1"), "tx-1").unwrap();
        assert!(fees.swap("PYTH", &FakeSigner).await.is_err());
        assert_eq!(fees.records("PYTH", Some(FeeStatus::Failed)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_process_all_respects_shutdown() {
        let (_, fees) = accumulator(FakeSwaps::default(), ConfirmationStatus::Confirmed);
        fees.record_fee("USDC", dec("1"), "tx-1").unwrap();
        fees.record_fee("USDT", dec("1"), "tx-2").unwrap();

        let (tx, rx) = watch::channel(true);
        let report = fees.process_all(&FakeSigner, &rx).await.unwrap();
        assert!(report.interrupted);
        assert!(report.outcomes.is_empty());

        tx.send(false).unwrap();
        let report = fees.process_all(&FakeSigner, &rx).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.failures.is_empty());
    }
}
