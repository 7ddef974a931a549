//! Integration tests for tipledger-core services
//!
//! These tests verify critical accounting scenarios using real DuckDB.
//! Chain collaborators are simulated at the trait level, but all database
//! operations are real.
//!
//! Run with: cargo test --test integration_tests -- --nocapture

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use tipledger_core::adapters::simulated::SimulatedChain;
use tipledger_core::domain::{
    EscrowStatus, NewEscrow, TransactionKind, TransactionType, WalletTrigger, ESCROW_ACCOUNT,
};
use tipledger_core::ports::{Clock, ManualClock, TransactionSigner};
use tipledger_core::services::{DecryptGrant, KeySource, MasterKey, Origin, WalletVault};
use tipledger_core::{Collaborators, Error, TipLedgerContext};

// ============================================================================
// Test Helpers
// ============================================================================

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn raw_key(byte: u8) -> KeySource {
    KeySource::Raw(MasterKey::from_bytes([byte; 32]))
}

/// Open a context in `temp_dir` driven by a manual clock
fn open_context(temp_dir: &TempDir) -> (Arc<ManualClock>, TipLedgerContext) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let ctx = TipLedgerContext::with_clock(
        temp_dir.path(),
        raw_key(7),
        Collaborators::simulated(Arc::new(SimulatedChain::default())),
        Origin::Bot,
        clock.clone(),
    )
    .expect("Failed to open context");
    (clock, ctx)
}

fn pending(sender: &str, recipient: &str, amount: &str, currency: &str) -> NewEscrow {
    NewEscrow {
        recipient_id: recipient.to_string(),
        sender_id: sender.to_string(),
        amount: dec(amount),
        currency: currency.to_string(),
        message: None,
        airdrop_id: None,
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[test]
fn test_tip_then_overdraft_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    let ledger = &ctx.components().ledger;

    ledger.credit_balance("A", "SOL", dec("0.02"), Some("deposit")).unwrap();
    ledger.record_tip("A", "B", dec("0.01"), "SOL").unwrap();
    assert_eq!(ledger.get_balance("A", "SOL").unwrap(), dec("0.01"));
    assert_eq!(ledger.get_balance("B", "SOL").unwrap(), dec("0.01"));

    let err = ledger.record_tip("A", "B", dec("0.02"), "SOL").unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));
    assert_eq!(ledger.get_balance("A", "SOL").unwrap(), dec("0.01"));
    assert_eq!(ledger.get_balance("B", "SOL").unwrap(), dec("0.01"));
}

#[test]
fn test_conservation_across_many_tips() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    let ledger = &ctx.components().ledger;

    let users = ["u1", "u2", "u3", "u4"];
    for user in users {
        ledger.credit_balance(user, "USDC", dec("25"), None).unwrap();
    }
    let supply = ledger.total_supply("USDC").unwrap();
    assert_eq!(supply, dec("100"));

    // Some of these overdraw and must fail without side effects
    for i in 0..40usize {
        let from = users[i % 4];
        let to = users[(i * 3 + 1) % 4];
        if from == to {
            continue;
        }
        let amount = Decimal::from((i % 7) as u64 + 1) * dec("1.25");
        let _ = ledger.record_tip(from, to, amount, "USDC");
        assert_eq!(ledger.total_supply("USDC").unwrap(), supply);
    }

    for user in users {
        assert!(ledger.get_balance(user, "USDC").unwrap() >= Decimal::ZERO);
    }
}

#[test]
fn test_reading_a_balance_creates_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    let ledger = &ctx.components().ledger;

    assert_eq!(ledger.get_balance("ghost", "BONK").unwrap(), Decimal::ZERO);
    assert!(ledger.balances("ghost").unwrap().is_empty());

    assert!(ledger.ensure_account("ghost", "BONK").unwrap());
    assert!(!ledger.ensure_account("ghost", "BONK").unwrap());
    assert_eq!(ledger.balances("ghost").unwrap().len(), 1);
}

#[test]
fn test_history_is_newest_first() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    let ledger = &ctx.components().ledger;

    ledger.credit_balance("A", "SOL", dec("1"), None).unwrap();
    for _ in 0..3 {
        ledger.record_tip("A", "B", dec("0.1"), "SOL").unwrap();
    }

    let history: Vec<_> = ledger
        .list_transactions("A", 10)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].kind, TransactionKind::Tip);
    assert_eq!(history[3].kind, TransactionKind::Credit);
    assert!(history.windows(2).all(|w| w[0].seq > w[1].seq));
}

// ============================================================================
// Escrow
// ============================================================================

#[test]
fn test_escrow_expires_after_thirty_days() {
    let temp_dir = TempDir::new().unwrap();
    let (clock, ctx) = open_context(&temp_dir);
    let escrow = &ctx.components().escrow;
    ctx.components()
        .ledger
        .credit_balance("sender", "USDC", dec("5"), None)
        .unwrap();

    let item = escrow.add_pending_tip(pending("sender", "U", "5", "USDC")).unwrap();
    let listed = escrow.list_pending("U").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, item.id);

    clock.advance(Duration::days(30));
    let expired = escrow.sweep_expired(clock.now()).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, EscrowStatus::Expired);
    assert!(escrow.list_pending("U").unwrap().is_empty());

    // Refunded in full, nothing left held
    let ledger = &ctx.components().ledger;
    assert_eq!(ledger.get_balance("sender", "USDC").unwrap(), dec("5"));
    assert_eq!(ledger.get_balance(ESCROW_ACCOUNT, "USDC").unwrap(), Decimal::ZERO);
}

#[test]
fn test_plan_claim_sums_pending_items() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    let escrow = &ctx.components().escrow;
    ctx.components()
        .ledger
        .credit_balance("sender", "BONK", dec("1000"), None)
        .unwrap();

    escrow.add_pending_tip(pending("sender", "U", "123.45", "BONK")).unwrap();
    escrow.add_pending_tip(pending("sender", "U", "76.55", "BONK")).unwrap();

    let wallet = WalletVault::generate_keypair();
    let plan = escrow.plan_claim("U", wallet.address()).unwrap();
    assert_eq!(plan.lines.len(), 1);
    assert_eq!(plan.lines[0].amount, dec("200"));
    assert_eq!(plan.lines[0].item_ids.len(), 2);
}

#[test]
fn test_sweep_leaves_items_not_yet_due() {
    let temp_dir = TempDir::new().unwrap();
    let (clock, ctx) = open_context(&temp_dir);
    let escrow = &ctx.components().escrow;
    ctx.components()
        .ledger
        .credit_balance("sender", "SOL", dec("1"), None)
        .unwrap();

    let item = escrow.add_pending_tip(pending("sender", "U", "0.5", "SOL")).unwrap();
    let before = clock.now() + Duration::days(30) - Duration::seconds(1);
    assert!(escrow.sweep_expired(before).unwrap().is_empty());

    let stored = escrow.get(item.id).unwrap().unwrap();
    assert_eq!(stored.status, EscrowStatus::Pending);
    assert!(stored.resolved_at.is_none());
}

// ============================================================================
// Risk
// ============================================================================

#[test]
fn test_per_transaction_max_applies_with_daily_headroom() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    let risk = &ctx.components().risk;

    let check = risk.check_limits("u", TransactionType::Tip, dec("0.02")).unwrap();
    assert!(!check.ok);
    assert_eq!(check.reasons.len(), 1);
    assert!(check.reasons[0].contains("maximum tip limit"));

    assert!(risk.check_limits("u", TransactionType::Tip, dec("0.01")).unwrap().ok);
}

// ============================================================================
// Vault and startup
// ============================================================================

#[test]
fn test_vault_round_trip_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let address = {
        let (_, ctx) = open_context(&temp_dir);
        let vault = &ctx.components().vault;

        let (record, created) = vault
            .ensure_wallet("alice", WalletTrigger::Tip)
            .unwrap();
        assert!(created);
        assert!(record.sealed_key.is_some());
        assert!(!vault.ensure_wallet("alice", WalletTrigger::Airdrop).unwrap().1);
        record.address
    };

    // Same key after restart opens the same wallet
    let (_, ctx) = open_context(&temp_dir);
    let signer = ctx
        .components()
        .vault
        .unseal_signing_key("alice", &DecryptGrant::new("integration test"))
        .unwrap();
    assert_eq!(signer.address(), address);
}

#[test]
fn test_wrong_key_fails_closed() {
    let temp_dir = TempDir::new().unwrap();
    drop(open_context(&temp_dir));

    let result = TipLedgerContext::new(
        temp_dir.path(),
        raw_key(8),
        Collaborators::simulated(Arc::new(SimulatedChain::default())),
        Origin::Api,
    );
    assert!(matches!(result.err(), Some(Error::Encryption(_))));

    let result = TipLedgerContext::new(
        temp_dir.path(),
        KeySource::passphrase("not the raw key"),
        Collaborators::simulated(Arc::new(SimulatedChain::default())),
        Origin::Api,
    );
    assert!(matches!(result.err(), Some(Error::Config(_))));
}

#[test]
fn test_data_dir_is_single_writer() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);

    let second = TipLedgerContext::new(
        temp_dir.path(),
        raw_key(7),
        Collaborators::simulated(Arc::new(SimulatedChain::default())),
        Origin::Worker,
    );
    assert!(matches!(second.err(), Some(Error::Config(_))));

    drop(ctx);
    let (_, _reopened) = open_context(&temp_dir);
}

#[test]
fn test_invalid_settings_refuse_to_start() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join("settings.json"),
        r#"{ "ledger": { "feeRateBps": 20000 } }"#,
    )
    .unwrap();

    let result = TipLedgerContext::new(
        temp_dir.path(),
        raw_key(7),
        Collaborators::simulated(Arc::new(SimulatedChain::default())),
        Origin::Bot,
    );
    assert!(matches!(result.err(), Some(Error::Config(_))));
}

// ============================================================================
// Status and event log
// ============================================================================

#[tokio::test]
async fn test_status_reports_supply_and_escrow() {
    let temp_dir = TempDir::new().unwrap();
    let (_, ctx) = open_context(&temp_dir);
    ctx.components()
        .ledger
        .credit_balance("alice", "SOL", dec("1"), None)
        .unwrap();

    ctx.tipping.tip("alice", "bob", dec("0.01"), "SOL").await.unwrap();

    let status = ctx.status_service.get_status().unwrap();
    let sol = status.supply.iter().find(|s| s.currency == "SOL").unwrap();
    assert_eq!(sol.total, dec("1"));
    assert_eq!(sol.held_in_escrow, dec("0.00995"));
    assert_eq!(sol.collected_fees, dec("0.00005"));
    assert_eq!(status.escrow.pending, 1);
    assert_eq!(status.risk.active_users, 1);

    let events = ctx.events.get_recent(10).unwrap();
    assert!(events.iter().any(|e| e.event == "tip_escrowed"));
    // Raw user ids never reach the event log
    assert!(events
        .iter()
        .all(|e| e.subject.as_deref() != Some("alice")));
}
