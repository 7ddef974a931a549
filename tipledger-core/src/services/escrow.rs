//! Escrow manager - funds held for recipients without a wallet
//!
//! Holding moves the sender's funds into `system:escrow` in the same database
//! transaction that inserts the item. An item then either gets claimed (funds
//! leave the ledger as an on-chain payout) or expires (funds are refunded to
//! the sender). Both transitions only apply to items that are still pending,
//! so whichever runs first wins and the other becomes a no-op.
//!
//! A payout is preceded by a lease: `reserve_claim` tags the items with a
//! token before any network call, so a second claim or the expiry sweep
//! cannot take them while the transfer is in flight.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::result::Result;
use crate::domain::token;
use crate::domain::wallet::validate_address;
use crate::domain::{
    validate_user_id, ClaimLine, ClaimOutcome, ClaimPlan, EscrowItem, EscrowKind, EscrowStats,
    EscrowStatus, NewEscrow, TransactionKind, TransferLeg, ESCROW_ACCOUNT, FEE_ACCOUNT,
};
use crate::ports::{Clock, EscrowStore};

/// What one sweep pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Items expired and refunded, for notifying their senders
    pub expired: Vec<EscrowItem>,
    /// Due items that were claimed or expired by someone else first
    pub skipped: usize,
    /// The pass stopped early because shutdown was requested
    pub interrupted: bool,
}

/// Items leased to one claim attempt, grouped for payout
#[derive(Debug, Clone)]
pub struct ReservedClaim {
    pub token: String,
    pub plan: ClaimPlan,
}

pub struct EscrowManager {
    store: Arc<dyn EscrowStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    sweep_batch_size: usize,
}

impl EscrowManager {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        sweep_batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            sweep_batch_size: sweep_batch_size.max(1),
        }
    }

    pub fn add_pending_tip(&self, data: NewEscrow) -> Result<EscrowItem> {
        self.add_pending_with_fee(EscrowKind::Tip, data, Decimal::ZERO)
    }

    pub fn add_pending_airdrop_claim(&self, data: NewEscrow) -> Result<EscrowItem> {
        self.add_pending_with_fee(EscrowKind::AirdropClaim, data, Decimal::ZERO)
    }

    /// Hold `data.amount` for the recipient and charge `fee` to the sender,
    /// all in one database transaction
    pub fn add_pending_with_fee(
        &self,
        kind: EscrowKind,
        data: NewEscrow,
        fee: Decimal,
    ) -> Result<EscrowItem> {
        validate_user_id(&data.sender_id)?;
        validate_user_id(&data.recipient_id)?;
        let token = token::lookup(&data.currency)?;
        token.validate_amount(data.amount)?;

        let now = self.clock.now();
        let item = EscrowItem {
            id: Uuid::new_v4(),
            kind,
            recipient_id: data.recipient_id,
            sender_id: data.sender_id,
            amount: data.amount,
            currency: token.symbol.to_string(),
            status: EscrowStatus::Pending,
            message: data.message,
            airdrop_id: data.airdrop_id,
            created_at: now,
            expires_at: now + self.ttl,
            resolved_at: None,
            proof_ref: None,
        };

        let mut funding = vec![TransferLeg::new(
            TransactionKind::EscrowHold,
            item.sender_id.clone(),
            ESCROW_ACCOUNT,
            item.amount,
            token.symbol,
        )];
        if fee > Decimal::ZERO {
            funding.push(TransferLeg::new(
                TransactionKind::Fee,
                item.sender_id.clone(),
                FEE_ACCOUNT,
                fee,
                token.symbol,
            ));
        }

        self.store.insert_pending(&item, &funding)?;
        info!(
            escrow_id = %item.id,
            kind = item.kind.as_str(),
            currency = %item.currency,
            "escrow item pending"
        );
        Ok(item)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<EscrowItem>> {
        self.store.get_escrow(id)
    }

    /// Pending, unexpired items for a recipient, oldest first
    pub fn list_pending(&self, recipient_id: &str) -> Result<Vec<EscrowItem>> {
        self.store.list_pending(recipient_id, self.clock.now())
    }

    /// Group a recipient's pending items into one payout line per currency.
    /// Moves no funds and takes no lease.
    pub fn plan_claim(&self, recipient_id: &str, wallet_address: &str) -> Result<ClaimPlan> {
        validate_address(wallet_address)?;
        let items = self.list_pending(recipient_id)?;
        Ok(group_lines(recipient_id, wallet_address, items))
    }

    /// Lease every claimable item for one payout attempt
    ///
    /// Items already leased elsewhere are left out, so two overlapping
    /// claims never plan the same item.
    pub fn reserve_claim(&self, recipient_id: &str, wallet_address: &str) -> Result<ReservedClaim> {
        validate_address(wallet_address)?;
        let ids: Vec<Uuid> = self.list_pending(recipient_id)?.iter().map(|i| i.id).collect();
        let token = Uuid::new_v4().to_string();
        let leased = if ids.is_empty() {
            Vec::new()
        } else {
            self.store
                .lease_for_claim(recipient_id, &ids, &token, self.clock.now())?
        };
        if leased.len() < ids.len() {
            debug!(
                recipient_id,
                wanted = ids.len(),
                leased = leased.len(),
                "some escrow items are leased by another claim"
            );
        }
        Ok(ReservedClaim {
            plan: group_lines(recipient_id, wallet_address, leased),
            token,
        })
    }

    /// Settle leased items once their payout landed
    pub fn settle_claim(
        &self,
        recipient_id: &str,
        token: &str,
        ids: &[Uuid],
        proof_ref: &str,
    ) -> Result<ClaimOutcome> {
        let outcome = self
            .store
            .mark_claimed(recipient_id, ids, proof_ref, Some(token), self.clock.now())?;
        self.log_claim(recipient_id, &outcome);
        Ok(outcome)
    }

    /// Hand leased items back after a failed payout
    pub fn release_claim(&self, token: &str, ids: &[Uuid]) -> Result<usize> {
        let released = self.store.release_lease(token, ids)?;
        debug!(released, "escrow lease released");
        Ok(released)
    }

    /// Drop leases older than `started_before`. Their payouts are assumed
    /// to have died with the process that started them.
    pub fn release_stale_claims(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let released = self.store.release_stale_leases(started_before)?;
        if !released.is_empty() {
            warn!(count = released.len(), "released stale escrow claim leases");
        }
        Ok(released)
    }

    /// Mark unleased items claimed after their payout settled on-chain
    ///
    /// Safe to repeat: ids that are no longer pending come back in `skipped`.
    pub fn mark_claimed(
        &self,
        recipient_id: &str,
        ids: &[Uuid],
        proof_ref: &str,
    ) -> Result<ClaimOutcome> {
        let outcome = self
            .store
            .mark_claimed(recipient_id, ids, proof_ref, None, self.clock.now())?;
        self.log_claim(recipient_id, &outcome);
        Ok(outcome)
    }

    fn log_claim(&self, recipient_id: &str, outcome: &ClaimOutcome) {
        if !outcome.skipped.is_empty() {
            warn!(
                recipient_id,
                skipped = outcome.skipped.len(),
                "some escrow items were no longer pending at claim time"
            );
        }
        info!(recipient_id, claimed = outcome.claimed.len(), "escrow items claimed");
    }

    /// Expire and refund every item due at `now`
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<EscrowItem>> {
        Ok(self.sweep(now, None)?.expired)
    }

    /// Like `sweep_expired`, checking for shutdown between items
    pub fn sweep_expired_until(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SweepReport> {
        self.sweep(now, Some(shutdown))
    }

    fn sweep(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        loop {
            let due = self.store.due_for_expiry(now, self.sweep_batch_size)?;
            if due.is_empty() {
                break;
            }
            let mut progressed = false;
            for id in due {
                if shutdown.is_some_and(|rx| *rx.borrow()) {
                    report.interrupted = true;
                    info!(expired = report.expired.len(), "escrow sweep interrupted by shutdown");
                    return Ok(report);
                }
                match self.store.expire_and_refund(id, now)? {
                    Some(item) => {
                        debug!(escrow_id = %item.id, "expired and refunded");
                        report.expired.push(item);
                        progressed = true;
                    }
                    None => report.skipped += 1,
                }
            }
            if !progressed {
                break;
            }
        }

        if !report.expired.is_empty() {
            info!(expired = report.expired.len(), "escrow sweep finished");
        }
        Ok(report)
    }

    /// Pending totals per currency for a recipient
    pub fn pending_balance(&self, recipient_id: &str) -> Result<Vec<(String, Decimal)>> {
        self.store.pending_totals(recipient_id)
    }

    pub fn statistics(&self) -> Result<EscrowStats> {
        self.store.escrow_stats()
    }
}

fn group_lines(recipient_id: &str, wallet_address: &str, items: Vec<EscrowItem>) -> ClaimPlan {
    let mut lines: BTreeMap<String, ClaimLine> = BTreeMap::new();
    for item in items {
        let line = lines.entry(item.currency.clone()).or_insert_with(|| ClaimLine {
            currency: item.currency.clone(),
            amount: Decimal::ZERO,
            item_ids: Vec::new(),
        });
        line.amount += item.amount;
        line.item_ids.push(item.id);
    }

    ClaimPlan {
        recipient_id: recipient_id.to_string(),
        wallet_address: wallet_address.to_string(),
        lines: lines.into_values().collect(),
    }
}
