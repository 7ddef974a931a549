//! Event log - structured operational events in logs.duckdb
//!
//! Records what happened (tip recorded, escrow swept, swap failed) without
//! what it was about: no key material, balances, amounts or tip messages are
//! ever written here. Diagnostics go through `tracing`; this log is the
//! durable record an operator can export.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::domain::result::{Error, Result};
use crate::log_migrations::LOG_MIGRATIONS;
use crate::services::MigrationService;

/// Counter for generating unique IDs within the same millisecond
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique ID based on timestamp + counter
fn generate_id() -> u64 {
    let timestamp = now_ms() as u64;

    // Use lower 48 bits for timestamp (good for ~8900 years)
    // Use upper 16 bits for counter (65536 unique IDs per millisecond)
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    (timestamp << 16) | counter
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn detect_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

/// Stable, non-reversible reference to a user for event subjects
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

/// Install a `tracing` subscriber for host binaries.
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::config(format!("tracing already initialized: {}", e)))
}

/// Which host process emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Bot,
    Api,
    Worker,
}

impl Origin {
    fn as_str(&self) -> &'static str {
        match self {
            Origin::Bot => "bot",
            Origin::Api => "api",
            Origin::Worker => "worker",
        }
    }
}

/// An event to be recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Opaque reference such as an escrow id or token symbol
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            operation: None,
            subject: None,
            error_message: None,
            error_details: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Subject a user by fingerprint, never by raw id
    pub fn with_user(self, user_id: &str) -> Self {
        self.with_subject(fingerprint(user_id))
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

/// A log entry as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub origin: String,
    pub app_version: String,
    pub platform: String,
    pub event: String,
    pub operation: Option<String>,
    pub subject: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
}

impl LogEntry {
    fn from_row(row: &duckdb::Row) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            origin: row.get(2)?,
            app_version: row.get(3)?,
            platform: row.get(4)?,
            event: row.get(5)?,
            operation: row.get(6)?,
            subject: row.get(7)?,
            error_message: row.get(8)?,
            error_details: row.get(9)?,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, timestamp, origin, app_version, platform, event, operation, \
                             subject, error_message, error_details";

/// Durable event journal in its own database file
pub struct EventLog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    origin: Origin,
    app_version: String,
    platform: &'static str,
}

impl EventLog {
    /// Open or create logs.duckdb in the data directory and run its migrations
    pub fn new(data_dir: &Path, origin: Origin, app_version: impl Into<String>) -> Result<Self> {
        let db_path = data_dir.join("logs.duckdb");
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        let conn = Connection::open_with_flags(&db_path, config)?;
        MigrationService::with_migrations(&conn, LOG_MIGRATIONS).run_pending()?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            origin,
            app_version: app_version.into(),
            platform: detect_platform(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::database("event log lock poisoned"))
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sys_logs (
                id, timestamp, origin, app_version, platform,
                event, operation, subject, error_message, error_details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                generate_id(),
                now_ms(),
                self.origin.as_str(),
                &self.app_version,
                self.platform,
                &event.event,
                &event.operation,
                &event.subject,
                &event.error_message,
                &event.error_details,
            ],
        )?;
        Ok(())
    }

    /// Record an event, reporting storage failures through `tracing` only
    pub fn record(&self, event: LogEvent) {
        let name = event.event.clone();
        if let Err(e) = self.log(event) {
            tracing::warn!(event = %name, error = %e, "failed to write event log");
        }
    }

    pub fn log_error(&self, event: &str, message: &str, details: Option<&str>) -> Result<()> {
        let mut log_event = LogEvent::new(event).with_error(message);
        if let Some(d) = details {
            log_event = log_event.with_error_details(d);
        }
        self.log(log_event)
    }

    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_logs ORDER BY id DESC LIMIT ?",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([limit as i64], LogEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn get_errors(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_logs WHERE error_message IS NOT NULL ORDER BY id DESC LIMIT ?",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([limit as i64], LogEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete entries older than `timestamp_ms` (unix ms)
    pub fn delete_before(&self, timestamp_ms: i64) -> Result<u64> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM sys_logs WHERE timestamp < ?", [timestamp_ms])?;
        Ok(deleted as u64)
    }

    /// Copy the log database to `output_path` for troubleshooting
    pub fn export(&self, output_path: &Path) -> Result<PathBuf> {
        let conn = self.lock()?;
        conn.execute_batch("CHECKPOINT")?;
        std::fs::copy(&self.db_path, output_path)?;
        Ok(output_path.to_path_buf())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_event_log_creation() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path(), Origin::Bot, "1.0.0").unwrap();
        assert!(log.db_path().exists());
    }

    #[test]
    fn test_log_with_context() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path(), Origin::Worker, "2.0.0").unwrap();

        log.log(
            LogEvent::new("escrow_expired")
                .with_operation("sweep")
                .with_subject("3f1c"),
        )
        .unwrap();

        let entries = log.get_recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "escrow_expired");
        assert_eq!(entries[0].operation.as_deref(), Some("sweep"));
        assert_eq!(entries[0].subject.as_deref(), Some("3f1c"));
        assert_eq!(entries[0].origin, "worker");
    }

    #[test]
    fn test_log_error() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path(), Origin::Api, "1.0.0").unwrap();

        log.log_error("swap_failed", "quote timed out", Some("USDC")).unwrap();
        log.record(LogEvent::new("tip_recorded"));

        let errors = log.get_errors(10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event, "swap_failed");
        assert_eq!(errors[0].error_details.as_deref(), Some("USDC"));
        assert_eq!(log.count().unwrap(), 2);
    }

    #[test]
    fn test_reopen_keeps_entries_and_delete_before() {
        let dir = tempdir().unwrap();
        {
            let log = EventLog::new(dir.path(), Origin::Bot, "1.0.0").unwrap();
            log.record(LogEvent::new("one"));
            log.record(LogEvent::new("two"));
        }
        let log = EventLog::new(dir.path(), Origin::Bot, "1.0.0").unwrap();
        assert_eq!(log.count().unwrap(), 2);

        let deleted = log.delete_before(now_ms() + 1000).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(log.count().unwrap(), 0);
    }

    #[test]
    fn test_user_subject_is_fingerprinted() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path(), Origin::Bot, "1.0.0").unwrap();
        log.log(LogEvent::new("wallet_registered").with_user("123456789")).unwrap();

        let entry = &log.get_recent(1).unwrap()[0];
        let subject = entry.subject.as_deref().unwrap();
        assert_eq!(subject.len(), 16);
        assert_ne!(subject, "123456789");
        assert_eq!(subject, fingerprint("123456789"));
    }

    #[test]
    fn test_export() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path(), Origin::Bot, "1.0.0").unwrap();
        log.record(LogEvent::new("tip_recorded"));

        let export_path = dir.path().join("export.duckdb");
        log.export(&export_path).unwrap();
        assert!(export_path.exists());
    }
}
