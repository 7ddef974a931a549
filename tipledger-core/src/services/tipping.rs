//! Tipping service - the use cases a bot or API calls
//!
//! Composes the ledger, vault, escrow, risk, fee and airdrop services.
//! Store calls are synchronous and short; collaborator calls (prices,
//! transfers, confirmations) are awaited with a timeout and never while a
//! store lock is held.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LedgerSettings;
use crate::domain::result::{Error, Result};
use crate::domain::token::{self, TokenInfo};
use crate::domain::{
    validate_user_id, Airdrop, ClaimLine, ClaimReceipt, CollectReceipt, Delivery, EscrowKind,
    NewEscrow, PayoutLine, RegistrationReceipt, TipReceipt, TransactionKind, TransactionType,
    TransferLeg, WalletSummary, WalletTrigger, FEE_ACCOUNT,
};
use crate::ports::{
    sign_transaction, with_timeout, BlockchainClient, PriceOracle, TransactionSigner,
    TransferBuilder,
};
use crate::services::airdrop::AirdropBook;
use crate::services::escrow::{EscrowManager, SweepReport};
use crate::services::fees::FeeAccumulator;
use crate::services::ledger::LedgerService;
use crate::services::logging::{EventLog, LogEvent};
use crate::services::registration::{
    verify_ownership, NonceStore, RegistrationChallenge, RegistrationRequest,
};
use crate::services::risk::RiskGate;
use crate::services::vault::WalletVault;

/// The services a `TippingService` composes
#[derive(Clone)]
pub struct Components {
    pub ledger: Arc<LedgerService>,
    pub vault: Arc<WalletVault>,
    pub escrow: Arc<EscrowManager>,
    pub risk: Arc<RiskGate>,
    pub fees: Arc<FeeAccumulator>,
    pub airdrops: Arc<AirdropBook>,
    pub nonces: Arc<NonceStore>,
}

pub struct TippingService {
    parts: Components,
    prices: Arc<dyn PriceOracle>,
    chain: Arc<dyn BlockchainClient>,
    events: Option<Arc<EventLog>>,
    fee_rate: Decimal,
    amount_precision: u32,
    io_timeout: Duration,
    auto_create_wallets: bool,
}

impl TippingService {
    pub fn new(
        parts: Components,
        prices: Arc<dyn PriceOracle>,
        chain: Arc<dyn BlockchainClient>,
        settings: &LedgerSettings,
    ) -> Self {
        Self {
            parts,
            prices,
            chain,
            events: None,
            fee_rate: Decimal::new(settings.fee_rate_bps as i64, 4),
            amount_precision: settings.amount_precision,
            io_timeout: Duration::from_millis(settings.io_timeout_ms),
            auto_create_wallets: settings.auto_create_wallets,
        }
    }

    pub fn with_event_log(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn components(&self) -> &Components {
        &self.parts
    }

    fn event(&self, event: LogEvent) {
        if let Some(events) = &self.events {
            events.record(event);
        }
    }

    /// Platform fee on `amount`, floored to the configured precision
    pub fn fee_for(&self, token: &TokenInfo, amount: Decimal) -> Decimal {
        token.floor_to(amount * self.fee_rate, self.amount_precision)
    }

    /// Value of `amount` in native units, for risk limits
    async fn to_native(&self, token: &TokenInfo, amount: Decimal) -> Result<Decimal> {
        if token.is_native() {
            return Ok(amount);
        }
        let price = with_timeout(
            self.io_timeout,
            "price lookup",
            self.prices.get_price(token.symbol),
        )
        .await?;
        let native_price = with_timeout(
            self.io_timeout,
            "price lookup",
            self.prices.get_price(token::native().symbol),
        )
        .await?;
        if native_price <= Decimal::ZERO || price < Decimal::ZERO {
            return Err(Error::external(format!(
                "price oracle returned an unusable price for {}",
                token.symbol
            )));
        }
        Ok(amount * price / native_price)
    }

    /// Admit a transaction and hold its quota. Every `Ok` must be followed
    /// by `risk.settle` for the same amount.
    fn guard(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        native_amount: Decimal,
    ) -> Result<()> {
        let decision = self.parts.risk.reserve(user_id, tx_type, native_amount)?;
        if decision.block {
            warn!(user_id, tx_type = tx_type.as_str(), score = decision.score, "transaction blocked");
            self.event(
                LogEvent::new("risk_blocked")
                    .with_operation(tx_type.as_str())
                    .with_user(user_id),
            );
        }
        decision.into_result()
    }

    /// Whether `user_id` is paid on the ledger. In auto-create mode a
    /// missing wallet is created here.
    fn ledger_recipient(&self, user_id: &str, trigger: WalletTrigger) -> Result<bool> {
        if !self.auto_create_wallets {
            return self.parts.vault.has_wallet(user_id);
        }
        let (wallet, created) = self.parts.vault.ensure_wallet(user_id, trigger)?;
        if created {
            self.event(
                LogEvent::new("wallet_created")
                    .with_operation(trigger.as_str())
                    .with_user(user_id)
                    .with_subject(wallet.address),
            );
        }
        Ok(true)
    }

    /// Track a fee for swapping. The fee itself is already on the ledger, so
    /// a failure here is logged rather than undoing the transfer.
    fn track_fee(&self, token: &TokenInfo, fee: Decimal, source_ref: &str) {
        if fee <= Decimal::ZERO {
            return;
        }
        if let Err(e) = self.parts.fees.record_fee(token.symbol, fee, source_ref) {
            warn!(token = token.symbol, source_ref, error = %e, "failed to record fee");
            self.event(
                LogEvent::new("fee_record_failed")
                    .with_subject(token.symbol)
                    .with_error(e.to_string()),
            );
        }
    }

    /// Send `amount` (fee included) from `sender_id` to `recipient_id`
    ///
    /// Recipients with a wallet are paid on the ledger; others get an escrow
    /// item they can claim after registering, or a custodial wallet when
    /// `auto_create_wallets` is on.
    pub async fn tip(
        &self,
        sender_id: &str,
        recipient_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<TipReceipt> {
        validate_user_id(sender_id)?;
        validate_user_id(recipient_id)?;
        if sender_id == recipient_id {
            return Err(Error::validation("cannot tip yourself"));
        }
        let token = token::lookup(currency)?;
        token.validate_amount(amount)?;

        let fee = self.fee_for(token, amount);
        let net = amount - fee;
        if net <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} leaves nothing after fees", amount)));
        }

        let native_amount = self.to_native(token, amount).await?;
        self.guard(sender_id, TransactionType::Tip, native_amount)?;

        let delivered = self.deliver_tip(token, sender_id, recipient_id, net, fee);
        self.parts
            .risk
            .settle(sender_id, TransactionType::Tip, native_amount, delivered.is_ok())?;
        let delivery = delivered?;
        self.track_fee(token, fee, &delivery.reference());

        info!(currency = token.symbol, escrowed = delivery.is_escrowed(), "tip completed");
        self.event(
            LogEvent::new(if delivery.is_escrowed() { "tip_escrowed" } else { "tip_recorded" })
                .with_operation("tip")
                .with_user(sender_id),
        );

        Ok(TipReceipt {
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            amount,
            fee,
            net,
            currency: token.symbol.to_string(),
            delivery,
        })
    }

    fn deliver_tip(
        &self,
        token: &TokenInfo,
        sender_id: &str,
        recipient_id: &str,
        net: Decimal,
        fee: Decimal,
    ) -> Result<Delivery> {
        if self.ledger_recipient(recipient_id, WalletTrigger::Tip)? {
            let mut legs = vec![TransferLeg::new(
                TransactionKind::Tip,
                sender_id,
                recipient_id,
                net,
                token.symbol,
            )];
            if fee > Decimal::ZERO {
                legs.push(TransferLeg::new(
                    TransactionKind::Fee,
                    sender_id,
                    FEE_ACCOUNT,
                    fee,
                    token.symbol,
                ));
            }
            let entries = self.parts.ledger.apply_transfers(&legs, None)?;
            let tip = entries
                .first()
                .ok_or_else(|| Error::database("tip produced no ledger entry"))?;
            return Ok(Delivery::Ledger {
                transaction_id: tip.id,
            });
        }

        let item = self.parts.escrow.add_pending_with_fee(
            EscrowKind::Tip,
            NewEscrow {
                recipient_id: recipient_id.to_string(),
                sender_id: sender_id.to_string(),
                amount: net,
                currency: token.symbol.to_string(),
                message: None,
                airdrop_id: None,
            },
            fee,
        )?;
        Ok(Delivery::Escrow { escrow_id: item.id })
    }

    /// Open an airdrop. The creator is charged share by share as users collect.
    pub async fn create_airdrop(
        &self,
        creator_id: &str,
        total_amount: Decimal,
        currency: &str,
        max_users: u32,
        duration: chrono::Duration,
    ) -> Result<Airdrop> {
        validate_user_id(creator_id)?;
        let token = token::lookup(currency)?;
        token.validate_amount(total_amount)?;

        let available = self.parts.ledger.get_balance(creator_id, token.symbol)?;
        if available < total_amount {
            return Err(Error::insufficient_balance(creator_id, token.symbol));
        }

        let native_amount = self.to_native(token, total_amount).await?;
        self.guard(creator_id, TransactionType::Airdrop, native_amount)?;

        let created = self.parts.airdrops.create(
            creator_id,
            total_amount,
            token.symbol,
            max_users,
            duration,
            self.amount_precision,
        );
        self.parts
            .risk
            .settle(creator_id, TransactionType::Airdrop, native_amount, created.is_ok())?;
        let airdrop = created?;

        self.event(
            LogEvent::new("airdrop_created")
                .with_operation("airdrop")
                .with_subject(airdrop.id.to_string()),
        );
        Ok(airdrop)
    }

    /// Pay one share of an airdrop to `user_id`
    ///
    /// If the payout fails (for example the creator no longer has the funds)
    /// the slot is released and nothing is moved.
    pub fn collect_airdrop(&self, airdrop_id: Uuid, user_id: &str) -> Result<CollectReceipt> {
        let reserved = self.parts.airdrops.reserve(airdrop_id, user_id)?;
        let token = token::lookup(&reserved.currency)?;

        match self.pay_share(token, &reserved.creator_id, user_id, reserved.share, airdrop_id) {
            Ok((delivery, fee)) => {
                self.track_fee(token, fee, &delivery.reference());
                self.event(
                    LogEvent::new("airdrop_collected")
                        .with_operation("airdrop")
                        .with_subject(airdrop_id.to_string()),
                );
                Ok(CollectReceipt {
                    airdrop_id,
                    user_id: user_id.to_string(),
                    amount: reserved.share - fee,
                    fee,
                    currency: token.symbol.to_string(),
                    delivery,
                    remaining_slots: reserved.remaining_slots,
                })
            }
            Err(e) => {
                self.parts.airdrops.release(airdrop_id, user_id)?;
                warn!(airdrop_id = %airdrop_id, error = %e, "airdrop share not paid");
                Err(e)
            }
        }
    }

    fn pay_share(
        &self,
        token: &TokenInfo,
        creator_id: &str,
        user_id: &str,
        share: Decimal,
        airdrop_id: Uuid,
    ) -> Result<(Delivery, Decimal)> {
        let fee = self.fee_for(token, share);
        let net = share - fee;
        if net <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} leaves nothing after fees", share)));
        }

        if self.ledger_recipient(user_id, WalletTrigger::Airdrop)? {
            let mut legs = vec![TransferLeg::new(
                TransactionKind::Airdrop,
                creator_id,
                user_id,
                net,
                token.symbol,
            )];
            if fee > Decimal::ZERO {
                legs.push(TransferLeg::new(
                    TransactionKind::Fee,
                    creator_id,
                    FEE_ACCOUNT,
                    fee,
                    token.symbol,
                ));
            }
            let reference = airdrop_id.to_string();
            let entries = self.parts.ledger.apply_transfers(&legs, Some(&reference))?;
            let paid = entries
                .first()
                .ok_or_else(|| Error::database("airdrop share produced no ledger entry"))?;
            Ok((
                Delivery::Ledger {
                    transaction_id: paid.id,
                },
                fee,
            ))
        } else {
            let item = self.parts.escrow.add_pending_with_fee(
                EscrowKind::AirdropClaim,
                NewEscrow {
                    recipient_id: user_id.to_string(),
                    sender_id: creator_id.to_string(),
                    amount: net,
                    currency: token.symbol.to_string(),
                    message: None,
                    airdrop_id: Some(airdrop_id),
                },
                fee,
            )?;
            Ok((Delivery::Escrow { escrow_id: item.id }, fee))
        }
    }

    /// Pay out a user's escrowed funds to their registered wallet
    ///
    /// One on-chain transfer per currency, signed by the platform escrow
    /// wallet. The items are leased before any transfer is built, so an
    /// overlapping claim or the expiry sweep leaves them alone. A confirmed
    /// currency is settled as claimed; a failed one is released and stays
    /// pending for a retry.
    pub async fn claim_pending(
        &self,
        user_id: &str,
        wallet_address: &str,
        builder: &dyn TransferBuilder,
        escrow_signer: &dyn TransactionSigner,
    ) -> Result<ClaimReceipt> {
        validate_user_id(user_id)?;
        let wallet = self
            .parts
            .vault
            .get_wallet(user_id)?
            .ok_or_else(|| Error::WalletNotFound(user_id.to_string()))?;
        if wallet.address != wallet_address {
            return Err(Error::validation(
                "claims can only be paid to the registered wallet",
            ));
        }

        let reserved = self.parts.escrow.reserve_claim(user_id, wallet_address)?;
        let mut receipt = ClaimReceipt {
            recipient_id: user_id.to_string(),
            wallet_address: wallet_address.to_string(),
            payouts: Vec::new(),
            failures: Vec::new(),
        };

        for line in &reserved.plan.lines {
            match self
                .pay_out(line, wallet_address, builder, escrow_signer)
                .await
            {
                Ok(signature) => {
                    let outcome = self.parts.escrow.settle_claim(
                        user_id,
                        &reserved.token,
                        &line.item_ids,
                        &signature,
                    )?;
                    receipt.payouts.push(PayoutLine {
                        currency: line.currency.clone(),
                        amount: line.amount,
                        signature,
                        claimed: outcome.claimed.len(),
                        skipped: outcome.skipped,
                    });
                }
                Err(e) => {
                    warn!(user_id, currency = %line.currency, error = %e, "escrow payout failed");
                    self.parts.escrow.release_claim(&reserved.token, &line.item_ids)?;
                    self.event(
                        LogEvent::new("claim_failed")
                            .with_operation("claim")
                            .with_subject(line.currency.clone())
                            .with_error(e.to_string()),
                    );
                    receipt.failures.push((line.currency.clone(), e.to_string()));
                }
            }
        }

        if !receipt.payouts.is_empty() {
            self.event(
                LogEvent::new("escrow_claimed")
                    .with_operation("claim")
                    .with_user(user_id),
            );
        }
        Ok(receipt)
    }

    async fn pay_out(
        &self,
        line: &ClaimLine,
        wallet_address: &str,
        builder: &dyn TransferBuilder,
        signer: &dyn TransactionSigner,
    ) -> Result<String> {
        let token = token::lookup(&line.currency)?;
        let units = token.to_base_units(line.amount)?;

        let unsigned = with_timeout(
            self.io_timeout,
            "transfer build",
            builder.build_transfer(signer.address(), wallet_address, token, units),
        )
        .await?;
        let signed = sign_transaction(signer, unsigned)?;
        let signature = with_timeout(
            self.io_timeout,
            "transfer submission",
            self.chain.send_signed_transaction(&signed),
        )
        .await?;
        let status = with_timeout(
            self.io_timeout,
            "transfer confirmation",
            self.chain.confirm(&signature),
        )
        .await?;
        if !status.is_success() {
            return Err(Error::external(format!(
                "payout {} failed on chain",
                signature
            )));
        }
        Ok(signature)
    }

    /// Start a wallet registration for `user_id`
    pub fn registration_challenge(&self, user_id: &str) -> Result<RegistrationChallenge> {
        self.parts.nonces.issue(user_id)
    }

    /// Finish a wallet registration and report what is waiting in escrow
    pub fn register_wallet(&self, request: &RegistrationRequest) -> Result<RegistrationReceipt> {
        self.parts.nonces.consume(&request.nonce, &request.user_id)?;
        if let Err(e) = verify_ownership(request) {
            self.event(
                LogEvent::new("registration_rejected")
                    .with_operation("register")
                    .with_user(&request.user_id)
                    .with_error(e.to_string()),
            );
            return Err(e);
        }

        let (record, created) = self
            .parts
            .vault
            .register_wallet(&request.user_id, &request.address)?;
        let pending = self
            .parts
            .escrow
            .plan_claim(&request.user_id, &record.address)?;

        self.event(
            LogEvent::new("wallet_registered")
                .with_operation("register")
                .with_user(&request.user_id),
        );
        Ok(RegistrationReceipt {
            wallet: WalletSummary::from(&record),
            created,
            pending,
        })
    }

    /// Return items whose claim lease started before `started_before` to
    /// the pool, so they can be claimed again or expire
    pub fn release_stale_claims(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let released = self.parts.escrow.release_stale_claims(started_before)?;
        for id in &released {
            self.event(
                LogEvent::new("claim_lease_released")
                    .with_operation("sweep")
                    .with_subject(id.to_string()),
            );
        }
        Ok(released)
    }

    /// Expire and refund due escrow items, stopping between items on shutdown
    pub fn process_expired_escrow(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SweepReport> {
        let report = self.parts.escrow.sweep_expired_until(now, shutdown)?;
        for item in &report.expired {
            self.event(
                LogEvent::new("escrow_expired")
                    .with_operation("sweep")
                    .with_subject(item.id.to_string()),
            );
        }
        Ok(report)
    }
}
