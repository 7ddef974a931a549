//! Configuration management
//!
//! Settings live in `settings.json` inside the data directory:
//! ```json
//! {
//!   "ledger": { "feeRateBps": 50 },
//!   "escrow": { "ttlDays": 30 },
//!   "fees": { "thresholds": { "BONK": "100000" } },
//!   "risk": { "limits": { ... }, "utcOffsetMinutes": 0 }
//! }
//! ```
//! Every field has a default, so a missing file is a valid configuration.
//! The master key is never read from here; see `services::encryption`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::result::{Error, Result};
use crate::domain::RiskLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerSettings {
    /// Platform fee on tips and airdrops, in basis points
    pub fee_rate_bps: u32,
    /// Fees and airdrop shares are floored to this many decimal places
    pub amount_precision: u32,
    /// Bound on every call to an external collaborator
    pub io_timeout_ms: u64,
    /// Give walletless recipients a custodial wallet instead of escrowing
    pub auto_create_wallets: bool,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            fee_rate_bps: 50,
            amount_precision: 8,
            io_timeout_ms: 15_000,
            auto_create_wallets: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EscrowSettings {
    pub ttl_days: i64,
    pub sweep_interval_secs: u64,
    /// Items expired per sweep pass
    pub sweep_batch_size: usize,
}

impl Default for EscrowSettings {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            sweep_interval_secs: 3600,
            sweep_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeSettings {
    pub slippage_bps: u16,
    /// Minimum pending total before a token is swapped, by symbol
    pub thresholds: HashMap<String, Decimal>,
    pub default_threshold: Decimal,
    pub process_interval_secs: u64,
    /// Processing records older than this are failed by the sweeper
    pub stale_processing_minutes: i64,
}

impl Default for FeeSettings {
    fn default() -> Self {
        let thresholds = [
            ("USDC", Decimal::new(10, 2)),
            ("USDT", Decimal::new(10, 2)),
            ("BONK", Decimal::from(100_000)),
            ("JTO", Decimal::new(5, 2)),
            ("PYTH", Decimal::new(10, 2)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            slippage_bps: 100,
            thresholds,
            default_threshold: Decimal::new(10, 2),
            process_interval_secs: 24 * 3600,
            stale_processing_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskSettings {
    pub limits: RiskLimits,
    /// Offset of the risk day boundary from UTC
    pub utc_offset_minutes: i32,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrationSettings {
    pub nonce_ttl_minutes: i64,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            nonce_ttl_minutes: 10,
        }
    }
}

/// TipLedger configuration (settings.json)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub ledger: LedgerSettings,
    pub escrow: EscrowSettings,
    pub fees: FeeSettings,
    pub risk: RiskSettings,
    pub registration: RegistrationSettings,
}

impl Config {
    /// Load config from the data directory
    ///
    /// Environment overrides (for deployments and CI):
    /// - TIPLEDGER_ESCROW_TTL_DAYS
    /// - TIPLEDGER_FEE_RATE_BPS
    /// - TIPLEDGER_IO_TIMEOUT_MS
    pub fn load(data_dir: &Path) -> Result<Self> {
        let settings_path = data_dir.join("settings.json");

        let mut config: Config = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("invalid settings.json: {}", e)))?
        } else {
            Config::default()
        };

        if let Some(days) = env_override("TIPLEDGER_ESCROW_TTL_DAYS")? {
            config.escrow.ttl_days = days;
        }
        if let Some(bps) = env_override("TIPLEDGER_FEE_RATE_BPS")? {
            config.ledger.fee_rate_bps = bps;
        }
        if let Some(ms) = env_override("TIPLEDGER_IO_TIMEOUT_MS")? {
            config.ledger.io_timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Save config to the data directory
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join("settings.json"), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.fee_rate_bps >= 10_000 {
            return Err(Error::config("feeRateBps must be below 10000"));
        }
        if self.escrow.ttl_days <= 0 {
            return Err(Error::config("escrow ttlDays must be positive"));
        }
        if self.ledger.io_timeout_ms == 0 {
            return Err(Error::config("ioTimeoutMs must be positive"));
        }
        if self.risk.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(Error::config("utcOffsetMinutes must be within a day"));
        }
        Ok(())
    }

    pub fn fee_rate(&self) -> Decimal {
        Decimal::new(self.ledger.fee_rate_bps as i64, 4)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.io_timeout_ms)
    }

    pub fn escrow_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.escrow.ttl_days)
    }

    pub fn nonce_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.registration.nonce_ttl_minutes)
    }

    /// Swap threshold for a token symbol
    pub fn swap_threshold(&self, token: &str) -> Decimal {
        self.fees
            .thresholds
            .get(token)
            .copied()
            .unwrap_or(self.fees.default_threshold)
    }
}

fn env_override<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.escrow.ttl_days, 30);
        assert_eq!(config.fee_rate(), Decimal::new(5, 3));
        assert_eq!(config.swap_threshold("BONK"), Decimal::from(100_000));
        assert_eq!(config.swap_threshold("UNKNOWN"), Decimal::new(10, 2));
        assert_eq!(config.fees.slippage_bps, 100);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{ "escrow": { "ttlDays": 7 }, "fees": { "defaultThreshold": "1" } }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.escrow.ttl_days, 7);
        assert_eq!(config.escrow.sweep_batch_size, 100);
        assert_eq!(config.fees.default_threshold, Decimal::ONE);
        assert_eq!(config.ledger.fee_rate_bps, 50);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{ not json").unwrap();
        assert!(matches!(Config::load(dir.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.risk.utc_offset_minutes = -300;
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.risk.utc_offset_minutes, -300);
    }

    #[test]
    fn test_validate_rejects_fee_over_100_percent() {
        let mut config = Config::default();
        config.ledger.fee_rate_bps = 10_000;
        assert!(config.validate().is_err());
    }
}
