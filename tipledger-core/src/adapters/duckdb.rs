//! DuckDB store implementation
//!
//! One connection behind a mutex implements every storage port. Balance
//! changes are conditional statements (`UPDATE ... WHERE balance >= ?`)
//! executed inside a database transaction, never read-then-write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::result::{Error, Result};
use crate::domain::{
    Account, Accumulated, BatchSettlement, ClaimOutcome, EscrowItem, EscrowStats, EscrowStatus,
    FeeBatch, FeeRecord, FeeStatsRow, FeeStatus, SealedKey, Transaction, TransactionKind,
    TransferLeg, WalletRecord, WalletStats, WalletTrigger, ESCROW_ACCOUNT, EXTERNAL_PARTY,
};
use crate::ports::{Clock, EscrowStore, FeeStore, LedgerStore, SystemClock, WalletStore};
use crate::services::{MigrationResult, MigrationService};

/// Maximum number of retries when database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400, 800ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
}

const TX_COLUMNS: &str = "id, seq, kind, sender_id, receiver_id, CAST(amount AS VARCHAR), \
                          currency, created_at, signature";

const ESCROW_COLUMNS: &str = "id, kind, recipient_id, sender_id, CAST(amount AS VARCHAR), \
                              currency, status, message, airdrop_id, created_at, expires_at, \
                              resolved_at, proof_ref";

const FEE_COLUMNS: &str = "id, token, CAST(amount AS VARCHAR), source_ref, status, \
                           accumulated_at, claimed_at, settled_at, settlement_signature, \
                           error_message";

/// DuckDB-backed store for ledger, escrow, wallets and fees
pub struct DuckDbStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl DuckDbStore {
    /// Open (or create) a database file
    ///
    /// Includes retry logic with exponential backoff for file locking errors,
    /// which can occur when another process is releasing the file.
    pub fn new(db_path: &Path) -> Result<Self> {
        Self::with_clock(db_path, Arc::new(SystemClock))
    }

    pub fn with_clock(db_path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        db_path: Some(db_path.to_path_buf()),
                        clock,
                    });
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            attempt = attempt + 1,
                            max = MAX_RETRIES,
                            "database busy, retrying: {}",
                            err_msg
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::database(format!("Failed to open database after {} retries", MAX_RETRIES))
        }))
    }

    /// In-memory database, mainly for tests
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        let conn = Connection::open_in_memory_with_flags(config)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
            clock,
        })
    }

    fn try_open_connection(db_path: &Path) -> Result<Connection> {
        // IMPORTANT: Disable extension autoloading to avoid macOS code signing issues
        // (cached extensions in ~/.duckdb/extensions may have different Team IDs)
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Ok(Connection::open_with_flags(db_path, config)?)
    }

    /// Run database migrations using the MigrationService
    pub fn run_migrations(&self) -> Result<MigrationResult> {
        let conn = self.lock()?;
        MigrationService::new(&conn).run_pending()
    }

    /// Ensure database schema exists (runs pending migrations)
    pub fn ensure_schema(&self) -> Result<()> {
        self.run_migrations()?;
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    // === Maintenance ===

    pub fn get_transaction_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn get_account_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Currencies with at least one account
    pub fn get_currencies(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT currency FROM accounts ORDER BY currency")?;
        let currencies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(currencies)
    }

    /// Force a checkpoint of the write-ahead log
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("CHECKPOINT")?;
        Ok(())
    }
}

// === Statement helpers (usable on a Connection or an open Transaction) ===

fn credit_in(conn: &Connection, user_id: &str, currency: &str, amount: Decimal, now: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE accounts
         SET balance = balance + CAST(? AS DECIMAL(38, 9)), updated_at = ?
         WHERE user_id = ? AND currency = ?",
        params![amount.to_string(), now, user_id, currency],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO accounts (user_id, currency, balance, created_at, updated_at)
             VALUES (?, ?, CAST(? AS DECIMAL(38, 9)), ?, ?)",
            params![user_id, currency, amount.to_string(), now, now],
        )?;
    }
    Ok(())
}

fn debit_in(conn: &Connection, user_id: &str, currency: &str, amount: Decimal, now: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE accounts
         SET balance = balance - CAST(? AS DECIMAL(38, 9)), updated_at = ?
         WHERE user_id = ? AND currency = ? AND balance >= CAST(? AS DECIMAL(38, 9))",
        params![amount.to_string(), now, user_id, currency, amount.to_string()],
    )?;
    if updated == 0 {
        return Err(Error::insufficient_balance(user_id, currency));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_transaction(
    conn: &Connection,
    kind: TransactionKind,
    sender_id: &str,
    receiver_id: &str,
    amount: Decimal,
    currency: &str,
    now: i64,
    signature: Option<&str>,
) -> Result<Transaction> {
    let seq: i64 = conn.query_row("SELECT nextval('transactions_seq')", [], |row| row.get(0))?;
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO transactions (id, seq, kind, sender_id, receiver_id, amount, currency, created_at, signature)
         VALUES (?, ?, ?, ?, ?, CAST(? AS DECIMAL(38, 9)), ?, ?, ?)",
        params![
            id.to_string(),
            seq,
            kind.as_str(),
            sender_id,
            receiver_id,
            amount.to_string(),
            currency,
            now,
            signature,
        ],
    )?;
    Ok(Transaction {
        id,
        seq,
        kind,
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        amount,
        currency: currency.to_string(),
        created_at: from_ms(now)?,
        signature: signature.map(|s| s.to_string()),
    })
}

fn apply_legs(
    conn: &Connection,
    legs: &[TransferLeg],
    reference: Option<&str>,
    now: i64,
) -> Result<Vec<Transaction>> {
    let mut transactions = Vec::with_capacity(legs.len());
    for leg in legs {
        leg.validate()?;
        debit_in(conn, &leg.from, &leg.currency, leg.amount, now)?;
        credit_in(conn, &leg.to, &leg.currency, leg.amount, now)?;
        transactions.push(append_transaction(
            conn,
            leg.kind,
            &leg.from,
            &leg.to,
            leg.amount,
            &leg.currency,
            now,
            reference,
        )?);
    }
    Ok(transactions)
}

fn select_escrow(conn: &Connection, id: &str) -> Result<Option<EscrowItem>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM escrow_items WHERE id = ?", ESCROW_COLUMNS))?;
    let mut rows = stmt
        .query_map(params![id], RawEscrow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match rows.pop() {
        Some(raw) => Ok(Some(raw.into_item()?)),
        None => Ok(None),
    }
}

// === Row conversion ===

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s)
        .map(|d| d.normalize())
        .map_err(|e| Error::database(format!("invalid decimal '{}': {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::database(format!("invalid id '{}': {}", s, e)))
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::database(format!("timestamp out of range: {}", ms)))
}

fn from_ms_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

struct RawTransaction {
    id: String,
    seq: i64,
    kind: String,
    sender_id: String,
    receiver_id: String,
    amount: String,
    currency: String,
    created_at: i64,
    signature: Option<String>,
}

impl RawTransaction {
    fn from_row(row: &duckdb::Row) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seq: row.get(1)?,
            kind: row.get(2)?,
            sender_id: row.get(3)?,
            receiver_id: row.get(4)?,
            amount: row.get(5)?,
            currency: row.get(6)?,
            created_at: row.get(7)?,
            signature: row.get(8)?,
        })
    }

    fn into_transaction(self) -> Result<Transaction> {
        Ok(Transaction {
            id: parse_uuid(&self.id)?,
            seq: self.seq,
            kind: self.kind.parse()?,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            amount: parse_decimal(&self.amount)?,
            currency: self.currency,
            created_at: from_ms(self.created_at)?,
            signature: self.signature,
        })
    }
}

struct RawEscrow {
    id: String,
    kind: String,
    recipient_id: String,
    sender_id: String,
    amount: String,
    currency: String,
    status: String,
    message: Option<String>,
    airdrop_id: Option<String>,
    created_at: i64,
    expires_at: i64,
    resolved_at: Option<i64>,
    proof_ref: Option<String>,
}

impl RawEscrow {
    fn from_row(row: &duckdb::Row) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            recipient_id: row.get(2)?,
            sender_id: row.get(3)?,
            amount: row.get(4)?,
            currency: row.get(5)?,
            status: row.get(6)?,
            message: row.get(7)?,
            airdrop_id: row.get(8)?,
            created_at: row.get(9)?,
            expires_at: row.get(10)?,
            resolved_at: row.get(11)?,
            proof_ref: row.get(12)?,
        })
    }

    fn into_item(self) -> Result<EscrowItem> {
        Ok(EscrowItem {
            id: parse_uuid(&self.id)?,
            kind: self.kind.parse()?,
            recipient_id: self.recipient_id,
            sender_id: self.sender_id,
            amount: parse_decimal(&self.amount)?,
            currency: self.currency,
            status: self.status.parse()?,
            message: self.message,
            airdrop_id: self.airdrop_id.as_deref().map(parse_uuid).transpose()?,
            created_at: from_ms(self.created_at)?,
            expires_at: from_ms(self.expires_at)?,
            resolved_at: from_ms_opt(self.resolved_at)?,
            proof_ref: self.proof_ref,
        })
    }
}

struct RawFee {
    id: String,
    token: String,
    amount: String,
    source_ref: String,
    status: String,
    accumulated_at: i64,
    claimed_at: Option<i64>,
    settled_at: Option<i64>,
    settlement_signature: Option<String>,
    error_message: Option<String>,
}

impl RawFee {
    fn from_row(row: &duckdb::Row) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            token: row.get(1)?,
            amount: row.get(2)?,
            source_ref: row.get(3)?,
            status: row.get(4)?,
            accumulated_at: row.get(5)?,
            claimed_at: row.get(6)?,
            settled_at: row.get(7)?,
            settlement_signature: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<FeeRecord> {
        Ok(FeeRecord {
            id: parse_uuid(&self.id)?,
            token: self.token,
            amount: parse_decimal(&self.amount)?,
            source_ref: self.source_ref,
            status: self.status.parse()?,
            accumulated_at: from_ms(self.accumulated_at)?,
            claimed_at: from_ms_opt(self.claimed_at)?,
            settled_at: from_ms_opt(self.settled_at)?,
            settlement_signature: self.settlement_signature,
            error_message: self.error_message,
        })
    }
}

struct RawWallet {
    user_id: String,
    address: String,
    sealed_key: Option<String>,
    trigger: String,
    created_at: i64,
}

impl RawWallet {
    fn from_row(row: &duckdb::Row) -> duckdb::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            address: row.get(1)?,
            sealed_key: row.get(2)?,
            trigger: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<WalletRecord> {
        Ok(WalletRecord {
            user_id: self.user_id,
            address: self.address,
            sealed_key: self.sealed_key.map(SealedKey::new),
            trigger: self.trigger.parse()?,
            created_at: from_ms(self.created_at)?,
        })
    }
}

// === Ledger ===

impl LedgerStore for DuckDbStore {
    fn get_balance(&self, user_id: &str, currency: &str) -> Result<Decimal> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT CAST(balance AS VARCHAR) FROM accounts WHERE user_id = ? AND currency = ?",
        )?;
        let balances = stmt
            .query_map(params![user_id, currency], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        match balances.first() {
            Some(balance) => parse_decimal(balance),
            None => Ok(Decimal::ZERO),
        }
    }

    fn get_balances(&self, user_id: &str) -> Result<Vec<Account>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, currency, CAST(balance AS VARCHAR), created_at, updated_at
             FROM accounts WHERE user_id = ? ORDER BY currency",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(user_id, currency, balance, created_at, updated_at)| {
                Ok(Account {
                    user_id,
                    currency,
                    balance: parse_decimal(&balance)?,
                    created_at: from_ms(created_at)?,
                    updated_at: from_ms(updated_at)?,
                })
            })
            .collect()
    }

    fn ensure_account(&self, user_id: &str, currency: &str) -> Result<bool> {
        let conn = self.lock()?;
        let now = self.now_ms();
        let inserted = conn.execute(
            "INSERT INTO accounts (user_id, currency, balance, created_at, updated_at)
             VALUES (?, ?, 0, ?, ?)
             ON CONFLICT (user_id, currency) DO NOTHING",
            params![user_id, currency, now, now],
        )?;
        Ok(inserted > 0)
    }

    fn credit(
        &self,
        user_id: &str,
        currency: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} must be positive", amount)));
        }
        let mut conn = self.lock()?;
        let now = self.now_ms();
        let tx = conn.transaction()?;
        credit_in(&tx, user_id, currency, amount, now)?;
        let entry = append_transaction(
            &tx,
            TransactionKind::Credit,
            EXTERNAL_PARTY,
            user_id,
            amount,
            currency,
            now,
            reference,
        )?;
        tx.commit()?;
        Ok(entry)
    }

    fn debit(
        &self,
        user_id: &str,
        currency: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} must be positive", amount)));
        }
        let mut conn = self.lock()?;
        let now = self.now_ms();
        let tx = conn.transaction()?;
        debit_in(&tx, user_id, currency, amount, now)?;
        let entry = append_transaction(
            &tx,
            TransactionKind::Debit,
            user_id,
            EXTERNAL_PARTY,
            amount,
            currency,
            now,
            reference,
        )?;
        tx.commit()?;
        Ok(entry)
    }

    fn apply_transfers(
        &self,
        legs: &[TransferLeg],
        reference: Option<&str>,
    ) -> Result<Vec<Transaction>> {
        if legs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.lock()?;
        let now = self.now_ms();
        let tx = conn.transaction()?;
        let entries = apply_legs(&tx, legs, reference, now)?;
        tx.commit()?;
        debug!(legs = legs.len(), "applied transfer batch");
        Ok(entries)
    }

    fn list_transactions(
        &self,
        user_id: &str,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions
             WHERE (sender_id = ? OR receiver_id = ?) AND seq < ?
             ORDER BY seq DESC
             LIMIT ?",
            TX_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, user_id, before_seq.unwrap_or(i64::MAX), limit as i64],
                RawTransaction::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawTransaction::into_transaction).collect()
    }

    fn total_supply(&self, currency: &str) -> Result<Decimal> {
        let conn = self.lock()?;
        let total: String = conn.query_row(
            "SELECT CAST(COALESCE(SUM(balance), 0) AS VARCHAR) FROM accounts WHERE currency = ?",
            params![currency],
            |row| row.get(0),
        )?;
        parse_decimal(&total)
    }
}

// === Escrow ===

impl EscrowStore for DuckDbStore {
    fn insert_pending(
        &self,
        item: &EscrowItem,
        funding: &[TransferLeg],
    ) -> Result<Vec<Transaction>> {
        let mut conn = self.lock()?;
        let now = self.now_ms();
        let tx = conn.transaction()?;
        let entries = apply_legs(&tx, funding, Some(&item.id.to_string()), now)?;
        tx.execute(
            "INSERT INTO escrow_items (id, kind, recipient_id, sender_id, amount, currency, status,
                                       message, airdrop_id, created_at, expires_at)
             VALUES (?, ?, ?, ?, CAST(? AS DECIMAL(38, 9)), ?, 'pending', ?, ?, ?, ?)",
            params![
                item.id.to_string(),
                item.kind.as_str(),
                item.recipient_id,
                item.sender_id,
                item.amount.to_string(),
                item.currency,
                item.message,
                item.airdrop_id.map(|id| id.to_string()),
                item.created_at.timestamp_millis(),
                item.expires_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(entries)
    }

    fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowItem>> {
        let conn = self.lock()?;
        select_escrow(&conn, &id.to_string())
    }

    fn list_pending(&self, recipient_id: &str, now: DateTime<Utc>) -> Result<Vec<EscrowItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM escrow_items
             WHERE recipient_id = ? AND status = 'pending' AND expires_at > ?
             ORDER BY created_at ASC, id ASC",
            ESCROW_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![recipient_id, now.timestamp_millis()],
                RawEscrow::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEscrow::into_item).collect()
    }

    fn lease_for_claim(
        &self,
        recipient_id: &str,
        ids: &[Uuid],
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowItem>> {
        let mut conn = self.lock()?;
        let now_ms = now.timestamp_millis();
        let tx = conn.transaction()?;

        let mut leased = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let updated = tx.execute(
                "UPDATE escrow_items
                 SET claim_token = ?, claim_started_at = ?
                 WHERE id = ? AND recipient_id = ? AND status = 'pending'
                   AND claim_token IS NULL AND expires_at > ?",
                params![token, now_ms, id.to_string(), recipient_id, now_ms],
            )?;
            if updated == 0 {
                continue;
            }
            match select_escrow(&tx, &id.to_string())? {
                Some(item) => leased.push(item),
                None => return Err(Error::EscrowNotFound(id.to_string())),
            }
        }

        tx.commit()?;
        Ok(leased)
    }

    fn release_lease(&self, token: &str, ids: &[Uuid]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut released = 0;
        for id in ids {
            released += tx.execute(
                "UPDATE escrow_items
                 SET claim_token = NULL, claim_started_at = NULL
                 WHERE id = ? AND claim_token = ? AND status = 'pending'",
                params![id.to_string(), token],
            )?;
        }
        tx.commit()?;
        Ok(released)
    }

    fn release_stale_leases(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut conn = self.lock()?;
        let cutoff = started_before.timestamp_millis();
        let tx = conn.transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM escrow_items
                 WHERE status = 'pending' AND claim_token IS NOT NULL AND claim_started_at < ?
                 ORDER BY claim_started_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute(
            "UPDATE escrow_items
             SET claim_token = NULL, claim_started_at = NULL
             WHERE status = 'pending' AND claim_token IS NOT NULL AND claim_started_at < ?",
            params![cutoff],
        )?;

        tx.commit()?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    fn mark_claimed(
        &self,
        recipient_id: &str,
        ids: &[Uuid],
        proof_ref: &str,
        lease: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut conn = self.lock()?;
        let now_ms = now.timestamp_millis();
        let tx = conn.transaction()?;

        let mut outcome = ClaimOutcome::default();
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            // A NULL lease matches only unleased rows
            let updated = tx.execute(
                "UPDATE escrow_items
                 SET status = 'claimed', resolved_at = ?, proof_ref = ?
                 WHERE id = ? AND recipient_id = ? AND status = 'pending'
                   AND claim_token IS NOT DISTINCT FROM ?",
                params![now_ms, proof_ref, id.to_string(), recipient_id, lease],
            )?;
            if updated == 0 {
                outcome.skipped.push(*id);
                continue;
            }
            match select_escrow(&tx, &id.to_string())? {
                Some(item) => outcome.claimed.push(item),
                None => return Err(Error::EscrowNotFound(id.to_string())),
            }
        }

        let mut totals: BTreeMap<&str, Decimal> = BTreeMap::new();
        for item in &outcome.claimed {
            *totals.entry(item.currency.as_str()).or_default() += item.amount;
        }
        for (currency, total) in totals {
            debit_in(&tx, ESCROW_ACCOUNT, currency, total, now_ms)?;
            append_transaction(
                &tx,
                TransactionKind::EscrowRelease,
                ESCROW_ACCOUNT,
                recipient_id,
                total,
                currency,
                now_ms,
                Some(proof_ref),
            )?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM escrow_items
             WHERE status = 'pending' AND claim_token IS NULL AND expires_at <= ?
             ORDER BY expires_at ASC, id ASC
             LIMIT ?",
        )?;
        let ids = stmt
            .query_map(params![now.timestamp_millis(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    fn expire_and_refund(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<EscrowItem>> {
        let mut conn = self.lock()?;
        let now_ms = now.timestamp_millis();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE escrow_items
             SET status = 'expired', resolved_at = ?
             WHERE id = ? AND status = 'pending' AND claim_token IS NULL AND expires_at <= ?",
            params![now_ms, id.to_string(), now_ms],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let item = select_escrow(&tx, &id.to_string())?
            .ok_or_else(|| Error::EscrowNotFound(id.to_string()))?;

        debit_in(&tx, ESCROW_ACCOUNT, &item.currency, item.amount, now_ms)?;
        credit_in(&tx, &item.sender_id, &item.currency, item.amount, now_ms)?;
        append_transaction(
            &tx,
            TransactionKind::Refund,
            ESCROW_ACCOUNT,
            &item.sender_id,
            item.amount,
            &item.currency,
            now_ms,
            Some(&item.id.to_string()),
        )?;

        tx.commit()?;
        Ok(Some(item))
    }

    fn pending_totals(&self, recipient_id: &str) -> Result<Vec<(String, Decimal)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT currency, CAST(SUM(amount) AS VARCHAR) FROM escrow_items
             WHERE recipient_id = ? AND status = 'pending'
             GROUP BY currency ORDER BY currency",
        )?;
        let rows = stmt
            .query_map(params![recipient_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(currency, total)| Ok((currency, parse_decimal(&total)?)))
            .collect()
    }

    fn escrow_stats(&self) -> Result<EscrowStats> {
        let conn = self.lock()?;
        let mut stats = EscrowStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM escrow_items GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (status, count) in counts {
            match status.parse::<EscrowStatus>()? {
                EscrowStatus::Pending => stats.pending = count as u64,
                EscrowStatus::Claimed => stats.claimed = count as u64,
                EscrowStatus::Expired => stats.expired = count as u64,
            }
        }

        let mut stmt = conn.prepare(
            "SELECT currency, CAST(SUM(amount) AS VARCHAR) FROM escrow_items
             WHERE status = 'pending' GROUP BY currency ORDER BY currency",
        )?;
        let totals = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (currency, total) in totals {
            stats.pending_by_currency.push((currency, parse_decimal(&total)?));
        }

        Ok(stats)
    }
}

// === Wallets ===

impl WalletStore for DuckDbStore {
    fn get_wallet(&self, user_id: &str) -> Result<Option<WalletRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, address, sealed_key, created_trigger, created_at
             FROM wallets WHERE user_id = ?",
        )?;
        let mut rows = stmt
            .query_map(params![user_id], RawWallet::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.pop().map(RawWallet::into_record).transpose()
    }

    fn get_wallet_by_address(&self, address: &str) -> Result<Option<WalletRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, address, sealed_key, created_trigger, created_at
             FROM wallets WHERE address = ?",
        )?;
        let mut rows = stmt
            .query_map(params![address], RawWallet::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.pop().map(RawWallet::into_record).transpose()
    }

    fn insert_wallet_if_absent(&self, record: &WalletRecord) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO wallets (user_id, address, sealed_key, created_trigger, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (user_id) DO NOTHING",
            params![
                record.user_id,
                record.address,
                record.sealed_key.as_ref().map(|k| k.as_envelope().to_string()),
                record.trigger.as_str(),
                record.created_at.timestamp_millis(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn wallet_stats(&self) -> Result<WalletStats> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT created_trigger, COUNT(*), COUNT(sealed_key) FROM wallets
             GROUP BY created_trigger ORDER BY created_trigger",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stats = WalletStats::default();
        for (trigger, count, custodial) in rows {
            let trigger: WalletTrigger = trigger.parse()?;
            stats.total += count as u64;
            stats.custodial += custodial as u64;
            stats.by_trigger.push((trigger, count as u64));
        }
        Ok(stats)
    }
}

// === Fees ===

impl FeeStore for DuckDbStore {
    fn insert_fee(&self, record: &FeeRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO fee_accumulation (id, token, amount, source_ref, status, accumulated_at)
             VALUES (?, ?, CAST(? AS DECIMAL(38, 9)), ?, ?, ?)",
            params![
                record.id.to_string(),
                record.token,
                record.amount.to_string(),
                record.source_ref,
                record.status.as_str(),
                record.accumulated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn accumulated(&self, token: &str) -> Result<Accumulated> {
        let conn = self.lock()?;
        pending_fees(&conn, token)
    }

    fn tokens_with_pending(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT token FROM fee_accumulation WHERE status = 'pending' ORDER BY token",
        )?;
        let tokens = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    fn claim_batch(
        &self,
        token: &str,
        min_total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<FeeBatch>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let pending = pending_fees(&tx, token)?;
        if pending.contributing_ids.is_empty() || pending.total < min_total {
            return Ok(None);
        }

        let claimed = tx.execute(
            "UPDATE fee_accumulation SET status = 'processing', claimed_at = ?
             WHERE token = ? AND status = 'pending'",
            params![now.timestamp_millis(), token],
        )?;
        if claimed != pending.contributing_ids.len() {
            return Err(Error::database(format!(
                "fee batch for {} changed while claiming ({} of {})",
                token,
                claimed,
                pending.contributing_ids.len()
            )));
        }

        tx.commit()?;
        Ok(Some(FeeBatch {
            token: token.to_string(),
            total: pending.total,
            ids: pending.contributing_ids,
        }))
    }

    fn settle_batch(
        &self,
        batch: &FeeBatch,
        settlement: &BatchSettlement,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let (signature, error) = match settlement {
            BatchSettlement::Swapped { signature } => (Some(signature.as_str()), None),
            BatchSettlement::Failed { error } => (None, Some(error.as_str())),
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut settled = 0;
        for id in &batch.ids {
            settled += tx.execute(
                "UPDATE fee_accumulation
                 SET status = ?, settled_at = ?, settlement_signature = ?, error_message = ?
                 WHERE id = ? AND status = 'processing'",
                params![
                    settlement.status().as_str(),
                    now.timestamp_millis(),
                    signature,
                    error,
                    id.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(settled)
    }

    fn fail_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let failed = conn.execute(
            "UPDATE fee_accumulation
             SET status = 'failed', settled_at = ?, error_message = 'swap did not complete'
             WHERE status = 'processing' AND claimed_at < ?",
            params![now.timestamp_millis(), claimed_before.timestamp_millis()],
        )?;
        Ok(failed)
    }

    fn fee_records(&self, token: &str, status: Option<FeeStatus>) -> Result<Vec<FeeRecord>> {
        let conn = self.lock()?;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM fee_accumulation WHERE token = ? AND status = ?
                     ORDER BY accumulated_at ASC, id ASC",
                    FEE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![token, status.as_str()], RawFee::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM fee_accumulation WHERE token = ?
                     ORDER BY accumulated_at ASC, id ASC",
                    FEE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![token], RawFee::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().map(RawFee::into_record).collect()
    }

    fn fee_stats(&self) -> Result<Vec<FeeStatsRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT token, status, COUNT(*), CAST(SUM(amount) AS VARCHAR)
             FROM fee_accumulation GROUP BY token, status ORDER BY token, status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(token, status, count, total)| {
                Ok(FeeStatsRow {
                    token,
                    status: status.parse()?,
                    count: count as u64,
                    total: parse_decimal(&total)?,
                })
            })
            .collect()
    }
}

fn pending_fees(conn: &Connection, token: &str) -> Result<Accumulated> {
    let mut stmt = conn.prepare(
        "SELECT id, CAST(amount AS VARCHAR) FROM fee_accumulation
         WHERE token = ? AND status = 'pending'
         ORDER BY accumulated_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![token], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut accumulated = Accumulated::default();
    for (id, amount) in rows {
        accumulated.total += parse_decimal(&amount)?;
        accumulated.contributing_ids.push(parse_uuid(&id)?);
    }
    Ok(accumulated)
}
