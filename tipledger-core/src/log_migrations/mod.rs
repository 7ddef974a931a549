//! Event log migrations (logs.duckdb)
//!
//! Kept separate from the ledger migrations so the event log can be
//! exported or deleted without touching balances.

pub const LOG_MIGRATIONS: &[(&str, &str)] = &[
    ("000_migrations.sql", include_str!("000_migrations.sql")),
    ("001_event_log.sql", include_str!("001_event_log.sql")),
];
