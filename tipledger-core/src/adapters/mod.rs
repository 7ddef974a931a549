//! Adapter implementations
//!
//! Adapters implement the port traits with concrete technologies:
//! - DuckDB for every storage port (ledger, escrow, wallets, fees)
//! - fs2 file lock guarding the data directory
//! - an in-memory simulated chain for tests and local runs

pub mod duckdb;
pub mod lock;
pub mod simulated;
