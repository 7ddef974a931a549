//! Ledger service - validated balance operations over a `LedgerStore`

use std::collections::VecDeque;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::result::{Error, Result};
use crate::domain::token;
use crate::domain::{validate_user_id, Account, Transaction, TransactionKind, TransferLeg};
use crate::ports::LedgerStore;

/// Rows fetched per round trip by `TransactionHistory`
const HISTORY_PAGE_SIZE: usize = 100;

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Move `amount` from sender to recipient as one ledger transaction
    pub fn record_tip(
        &self,
        sender_id: &str,
        recipient_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<Transaction> {
        validate_user_id(sender_id)?;
        validate_user_id(recipient_id)?;
        let token = token::lookup(currency)?;
        token.validate_amount(amount)?;

        let leg = TransferLeg::new(TransactionKind::Tip, sender_id, recipient_id, amount, token.symbol);
        let mut entries = self.store.apply_transfers(&[leg], None)?;
        debug!(currency = token.symbol, "recorded tip");
        entries
            .pop()
            .ok_or_else(|| Error::database("transfer produced no entry"))
    }

    /// Apply several legs atomically, e.g. a tip and its platform fee
    pub fn apply_transfers(
        &self,
        legs: &[TransferLeg],
        reference: Option<&str>,
    ) -> Result<Vec<Transaction>> {
        for leg in legs {
            token::lookup(&leg.currency)?.validate_amount(leg.amount)?;
            leg.validate()?;
        }
        self.store.apply_transfers(legs, reference)
    }

    pub fn credit_balance(
        &self,
        user_id: &str,
        currency: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Transaction> {
        validate_user_id(user_id)?;
        let token = token::lookup(currency)?;
        token.validate_amount(amount)?;
        self.store.credit(user_id, token.symbol, amount, reference)
    }

    pub fn debit_balance(
        &self,
        user_id: &str,
        currency: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Transaction> {
        validate_user_id(user_id)?;
        let token = token::lookup(currency)?;
        token.validate_amount(amount)?;
        self.store.debit(user_id, token.symbol, amount, reference)
    }

    /// Zero for unknown accounts. Never creates one.
    pub fn get_balance(&self, user_id: &str, currency: &str) -> Result<Decimal> {
        let symbol = token::normalize_currency(currency)?;
        self.store.get_balance(user_id, symbol)
    }

    pub fn ensure_account(&self, user_id: &str, currency: &str) -> Result<bool> {
        let symbol = token::normalize_currency(currency)?;
        self.store.ensure_account(user_id, symbol)
    }

    pub fn balances(&self, user_id: &str) -> Result<Vec<Account>> {
        self.store.get_balances(user_id)
    }

    pub fn total_supply(&self, currency: &str) -> Result<Decimal> {
        let symbol = token::normalize_currency(currency)?;
        self.store.total_supply(symbol)
    }

    /// Up to `limit` most recent transactions of a user, newest first.
    /// Pages are fetched lazily as the iterator advances.
    pub fn list_transactions(&self, user_id: &str, limit: usize) -> TransactionHistory {
        TransactionHistory::new(Arc::clone(&self.store), user_id.to_string(), limit)
    }
}

/// Lazy newest-first iterator over a user's transactions
///
/// Paging is keyed on the transaction sequence, so entries appended while
/// iterating do not shift or duplicate results. `restart` begins again from
/// the newest entry.
pub struct TransactionHistory {
    store: Arc<dyn LedgerStore>,
    user_id: String,
    limit: usize,
    yielded: usize,
    cursor: Option<i64>,
    buffer: VecDeque<Transaction>,
    exhausted: bool,
}

impl TransactionHistory {
    fn new(store: Arc<dyn LedgerStore>, user_id: String, limit: usize) -> Self {
        Self {
            store,
            user_id,
            limit,
            yielded: 0,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn restart(&mut self) {
        self.yielded = 0;
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<()> {
        let want = HISTORY_PAGE_SIZE.min(self.limit - self.yielded);
        let page = self.store.list_transactions(&self.user_id, self.cursor, want)?;
        if page.len() < want {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.seq);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for TransactionHistory {
    type Item = Result<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.yielded >= self.limit {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                // Stop after reporting the error once
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let entry = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(Ok(entry))
    }
}
