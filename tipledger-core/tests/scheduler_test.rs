//! Background job tests
//!
//! Drive the scheduler against a real context: escrow expiry, airdrop
//! closing and fee swaps, plus clean shutdown. Tokio time is paused so
//! intervals fire without real waiting; the ledger clock is manual.
//!
//! Run with: cargo test --test scheduler_test -- --nocapture

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio::sync::watch;

use tipledger_core::adapters::simulated::SimulatedChain;
use tipledger_core::domain::{AirdropStatus, EscrowStatus, FeeStatus};
use tipledger_core::ports::{ManualClock, TransactionSigner};
use tipledger_core::services::{KeySource, MasterKey, Origin, WalletVault};
use tipledger_core::{Collaborators, TipLedgerContext};

// ============================================================================
// Test Helpers
// ============================================================================

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

struct Setup {
    _temp_dir: TempDir,
    clock: Arc<ManualClock>,
    chain: Arc<SimulatedChain>,
    ctx: TipLedgerContext,
}

fn setup() -> Setup {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let chain = Arc::new(SimulatedChain::default());
    let ctx = TipLedgerContext::with_clock(
        temp_dir.path(),
        KeySource::Raw(MasterKey::from_bytes([5; 32])),
        Collaborators::simulated(chain.clone()),
        Origin::Worker,
        clock.clone(),
    )
    .expect("Failed to open context");
    Setup {
        _temp_dir: temp_dir,
        clock,
        chain,
        ctx,
    }
}

fn platform_signer() -> Arc<dyn TransactionSigner> {
    Arc::new(WalletVault::generate_keypair())
}

// ============================================================================
// Scheduled runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduler_runs_jobs_and_stops_on_shutdown() {
    let s = setup();
    let parts = s.ctx.components();
    parts.ledger.credit_balance("alice", "USDC", dec("10"), None).unwrap();

    let receipt = s.ctx.tipping.tip("alice", "bob", dec("0.5"), "USDC").await.unwrap();
    assert!(receipt.delivery.is_escrowed());
    for i in 0..3 {
        parts.fees.record_fee("USDC", dec("0.05"), &format!("seed-{}", i)).unwrap();
    }

    s.clock.advance(chrono::Duration::days(31));

    let (tx, rx) = watch::channel(false);
    let handle = s.ctx.scheduler(Some(platform_signer())).spawn(rx);

    // First ticks of both intervals fire right away
    tokio::time::sleep(Duration::from_secs(1)).await;

    let escrow = parts.escrow.statistics().unwrap();
    assert_eq!(escrow.pending, 0);
    assert_eq!(escrow.expired, 1);
    assert_eq!(
        parts.ledger.get_balance("alice", "USDC").unwrap(),
        dec("10") - receipt.fee
    );

    assert!(parts.fees.records("USDC", Some(FeeStatus::Pending)).unwrap().is_empty());
    // The tip fee plus the seeded ones went out in one swap
    assert_eq!(parts.fees.records("USDC", Some(FeeStatus::Swapped)).unwrap().len(), 4);
    assert_eq!(s.chain.submitted().len(), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    let events = s.ctx.events.get_recent(50).unwrap();
    assert!(events.iter().any(|e| e.event == "escrow_expired"));
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_stops_when_sender_dropped() {
    let s = setup();
    let (tx, rx) = watch::channel(false);
    let handle = s.ctx.scheduler(None).spawn(rx);

    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

// ============================================================================
// Single passes
// ============================================================================

#[tokio::test]
async fn test_sweep_closes_expired_airdrops() {
    let s = setup();
    let parts = s.ctx.components();
    parts.ledger.credit_balance("host", "USDC", dec("1"), None).unwrap();

    let airdrop = s
        .ctx
        .tipping
        .create_airdrop("host", dec("0.4"), "USDC", 4, chrono::Duration::minutes(10))
        .await
        .unwrap();
    s.ctx.tipping.collect_airdrop(airdrop.id, "guest").unwrap();

    s.clock.advance(chrono::Duration::minutes(11));
    let (_tx, rx) = watch::channel(false);
    s.ctx.scheduler(None).sweep_once(&rx).unwrap();

    let closed = parts.airdrops.get(airdrop.id).unwrap().unwrap();
    assert_eq!(closed.status, AirdropStatus::Expired);
    assert!(s.ctx.tipping.collect_airdrop(airdrop.id, "late").is_err());

    // Past retention it is forgotten
    s.clock.advance(chrono::Duration::hours(2));
    s.ctx.scheduler(None).sweep_once(&rx).unwrap();
    assert!(parts.airdrops.get(airdrop.id).unwrap().is_none());
}

#[tokio::test]
async fn test_sweep_stops_on_shutdown_signal() {
    let s = setup();
    let parts = s.ctx.components();
    parts.ledger.credit_balance("alice", "SOL", dec("1"), None).unwrap();
    s.ctx.tipping.tip("alice", "bob", dec("0.01"), "SOL").await.unwrap();
    s.clock.advance(chrono::Duration::days(31));

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let report = s.ctx.scheduler(None).sweep_once(&rx).unwrap();

    assert!(report.interrupted);
    assert!(report.expired.is_empty());
    let pending = parts.escrow.list_pending("bob").unwrap();
    // Past expiry, so no longer listed as claimable, but still held
    assert!(pending.is_empty());
    assert_eq!(parts.escrow.statistics().unwrap().pending, 1);
}

#[tokio::test]
async fn test_sweep_releases_abandoned_claim_then_refunds() {
    let s = setup();
    let parts = s.ctx.components();
    parts.ledger.credit_balance("alice", "SOL", dec("1"), None).unwrap();
    let receipt = s.ctx.tipping.tip("alice", "bob", dec("0.01"), "SOL").await.unwrap();

    // A claim that never came back, e.g. the process died mid-payout
    let wallet = WalletVault::generate_keypair();
    let lease = parts.escrow.reserve_claim("bob", wallet.address()).unwrap();
    assert_eq!(lease.plan.item_count(), 1);

    s.clock.advance(chrono::Duration::days(31));
    let (_tx, rx) = watch::channel(false);
    let report = s.ctx.scheduler(None).sweep_once(&rx).unwrap();

    assert_eq!(report.expired.len(), 1);
    assert_eq!(
        parts.ledger.get_balance("alice", "SOL").unwrap(),
        dec("1") - receipt.fee
    );
    let events = s.ctx.events.get_recent(50).unwrap();
    assert!(events.iter().any(|e| e.event == "claim_lease_released"));
}

#[tokio::test]
async fn test_fee_processing_needs_a_signer() {
    let s = setup();
    s.ctx
        .components()
        .fees
        .record_fee("USDC", dec("1"), "seed")
        .unwrap();

    let (_tx, rx) = watch::channel(false);
    assert!(s.ctx.scheduler(None).process_fees_once(&rx).await.unwrap().is_none());
    assert!(s.chain.submitted().is_empty());
}

#[tokio::test]
async fn test_failed_swap_is_not_retried() {
    let s = setup();
    let fees = &s.ctx.components().fees;
    fees.record_fee("JTO", dec("0.1"), "seed").unwrap();
    s.chain.update(|c| c.no_route = true);

    let (_tx, rx) = watch::channel(false);
    let scheduler = s.ctx.scheduler(Some(platform_signer()));
    let report = scheduler.process_fees_once(&rx).await.unwrap().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "JTO");

    let failed = fees.records("JTO", Some(FeeStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error_message.is_some());

    // A working route later does not resurrect the failed batch
    s.chain.update(|c| c.no_route = false);
    let report = scheduler.process_fees_once(&rx).await.unwrap().unwrap();
    assert!(report.outcomes.is_empty());
    assert!(s.chain.submitted().is_empty());
}

#[tokio::test]
async fn test_native_fees_are_never_swapped() {
    let s = setup();
    let parts = s.ctx.components();
    parts.ledger.credit_balance("alice", "SOL", dec("1"), None).unwrap();
    s.ctx.tipping.tip("alice", "bob", dec("0.01"), "SOL").await.unwrap();

    // Fee stays on the ledger fee account, no swap record is made
    assert!(parts.fees.records("SOL", None).unwrap().is_empty());
    let escrowed = parts.escrow.list_pending("bob").unwrap();
    assert_eq!(escrowed.len(), 1);
    assert_eq!(escrowed[0].status, EscrowStatus::Pending);
}
