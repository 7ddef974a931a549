//! Storage ports - capability-scoped persistence traits
//!
//! Each service receives only the store capabilities it needs. The DuckDB
//! adapter implements all of them on one connection, which lets operations
//! that span capabilities (escrow funding, claim release) run in a single
//! database transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::result::Result;
use crate::domain::{
    Account, Accumulated, BatchSettlement, ClaimOutcome, EscrowItem, EscrowStats, FeeBatch,
    FeeRecord, FeeStatsRow, FeeStatus, Transaction, TransferLeg, WalletRecord, WalletStats,
};

/// Balances and the append-only transaction log
pub trait LedgerStore: Send + Sync {
    /// Balance of an account; zero when the account does not exist. Never writes.
    fn get_balance(&self, user_id: &str, currency: &str) -> Result<Decimal>;

    /// All accounts of a user
    fn get_balances(&self, user_id: &str) -> Result<Vec<Account>>;

    /// Create a zero-balance account if missing. Returns true if created.
    fn ensure_account(&self, user_id: &str, currency: &str) -> Result<bool>;

    /// Add funds entering the ledger from outside (deposit)
    fn credit(
        &self,
        user_id: &str,
        currency: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Transaction>;

    /// Remove funds leaving the ledger (withdrawal). Fails with
    /// `InsufficientBalance` rather than going negative.
    fn debit(
        &self,
        user_id: &str,
        currency: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Transaction>;

    /// Apply every leg or none of them
    fn apply_transfers(
        &self,
        legs: &[TransferLeg],
        reference: Option<&str>,
    ) -> Result<Vec<Transaction>>;

    /// Transactions touching the user, newest first, strictly older than `before_seq`
    fn list_transactions(
        &self,
        user_id: &str,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    /// Sum of all balances in a currency
    fn total_supply(&self, currency: &str) -> Result<Decimal>;
}

pub trait EscrowStore: Send + Sync {
    /// Insert a pending item and apply its funding legs in one transaction
    fn insert_pending(&self, item: &EscrowItem, funding: &[TransferLeg])
        -> Result<Vec<Transaction>>;

    fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowItem>>;

    /// Pending items with `expires_at > now`, oldest first
    fn list_pending(&self, recipient_id: &str, now: DateTime<Utc>) -> Result<Vec<EscrowItem>>;

    /// Lease unexpired, unleased pending items of `recipient_id` to `token`
    /// before their payout is sent. Returns only the items this call leased.
    fn lease_for_claim(
        &self,
        recipient_id: &str,
        ids: &[Uuid],
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowItem>>;

    /// Drop `token`'s lease on those `ids` that are still pending
    fn release_lease(&self, token: &str, ids: &[Uuid]) -> Result<usize>;

    /// Drop every lease taken before `started_before` on a pending item.
    /// Returns the ids that were released.
    fn release_stale_leases(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Transition still-pending items of `recipient_id` to claimed and release
    /// their held funds. Without `lease` only unleased items qualify; with it,
    /// items leased to that token qualify even past their expiry. Anything
    /// else is reported as skipped.
    fn mark_claimed(
        &self,
        recipient_id: &str,
        ids: &[Uuid],
        proof_ref: &str,
        lease: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Ids of unleased pending items with `expires_at <= now`, oldest expiry first
    fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;

    /// Expire one due, unleased item and refund its sender atomically.
    /// Returns `None` if the item is no longer pending, leased or not yet due.
    fn expire_and_refund(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<EscrowItem>>;

    /// Pending totals per currency for a recipient
    fn pending_totals(&self, recipient_id: &str) -> Result<Vec<(String, Decimal)>>;

    fn escrow_stats(&self) -> Result<EscrowStats>;
}

pub trait WalletStore: Send + Sync {
    fn get_wallet(&self, user_id: &str) -> Result<Option<WalletRecord>>;

    fn get_wallet_by_address(&self, address: &str) -> Result<Option<WalletRecord>>;

    /// Insert unless the user already has a wallet. Returns true if inserted.
    fn insert_wallet_if_absent(&self, record: &WalletRecord) -> Result<bool>;

    fn wallet_stats(&self) -> Result<WalletStats>;
}

pub trait FeeStore: Send + Sync {
    fn insert_fee(&self, record: &FeeRecord) -> Result<()>;

    /// Sum of pending records for a token
    fn accumulated(&self, token: &str) -> Result<Accumulated>;

    fn tokens_with_pending(&self) -> Result<Vec<String>>;

    /// Move all pending records of `token` to processing, but only when their
    /// total reaches `min_total`
    fn claim_batch(
        &self,
        token: &str,
        min_total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<FeeBatch>>;

    /// Finish a claimed batch. Only records still in processing are touched.
    fn settle_batch(
        &self,
        batch: &FeeBatch,
        settlement: &BatchSettlement,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Fail processing records claimed before `claimed_before`
    fn fail_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    fn fee_records(&self, token: &str, status: Option<FeeStatus>) -> Result<Vec<FeeRecord>>;

    fn fee_stats(&self) -> Result<Vec<FeeStatsRow>>;
}
