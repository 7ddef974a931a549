//! TipLedger Core - accounting core for a non-custodial tipping platform
//!
//! This crate implements the core domain logic following hexagonal architecture:
//!
//! - **domain**: Core business entities (Account, Transaction, EscrowItem, etc.)
//! - **ports**: Trait definitions for storage and chain collaborators
//! - **services**: Business logic orchestration
//! - **adapters**: Concrete implementations (DuckDB, file lock, simulated chain)

pub mod adapters;
pub mod config;
pub mod domain;
pub mod log_migrations;
pub mod migrations;
pub mod ports;
pub mod services;

use std::path::Path;
use std::sync::Arc;

use adapters::duckdb::DuckDbStore;
use adapters::lock::DataDirLock;
use adapters::simulated::SimulatedChain;
use config::Config;
use ports::{BlockchainClient, Clock, PriceOracle, SwapQuoteProvider, SystemClock, TransactionSigner};
use services::*;

// Re-export commonly used types at crate root
pub use domain::result::{Error, OperationResult, Result};
pub use domain::{
    Account, ClaimPlan, ClaimReceipt, CollectReceipt, EscrowItem, TipReceipt, Transaction,
    WalletRecord,
};

/// Network-facing collaborators supplied by the host
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn BlockchainClient>,
    pub swaps: Arc<dyn SwapQuoteProvider>,
    pub prices: Arc<dyn PriceOracle>,
}

impl Collaborators {
    /// Every collaborator backed by one in-memory `SimulatedChain`
    pub fn simulated(chain: Arc<SimulatedChain>) -> Self {
        Self {
            chain: chain.clone(),
            swaps: chain.clone(),
            prices: chain,
        }
    }
}

/// Main context for TipLedger operations
///
/// This is the primary entry point for all business logic. It holds the
/// data directory lock, the database, configuration and all services.
pub struct TipLedgerContext {
    pub config: Config,
    pub store: Arc<DuckDbStore>,
    pub clock: Arc<dyn Clock>,
    pub tipping: Arc<TippingService>,
    pub status_service: StatusService,
    pub encryption_service: EncryptionService,
    pub events: Arc<EventLog>,
    // Declared last so it is released after the database closes
    _lock: DataDirLock,
}

impl TipLedgerContext {
    /// Open the data directory with the master key from the environment
    pub fn open_from_env(
        data_dir: &Path,
        collaborators: Collaborators,
        origin: Origin,
    ) -> Result<Self> {
        Self::new(data_dir, KeySource::from_env()?, collaborators, origin)
    }

    pub fn new(
        data_dir: &Path,
        key_source: KeySource,
        collaborators: Collaborators,
        origin: Origin,
    ) -> Result<Self> {
        Self::with_clock(data_dir, key_source, collaborators, origin, Arc::new(SystemClock))
    }

    pub fn with_clock(
        data_dir: &Path,
        key_source: KeySource,
        collaborators: Collaborators,
        origin: Origin,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let lock = DataDirLock::acquire(data_dir)?;
        let config = Config::load(data_dir)?;

        // The key is checked before any database is touched
        let encryption_service = EncryptionService::new(data_dir.to_path_buf());
        let cipher = encryption_service.open(key_source)?;

        let store = Arc::new(DuckDbStore::with_clock(
            &data_dir.join("tipledger.duckdb"),
            clock.clone(),
        )?);
        store.ensure_schema()?;
        let events = Arc::new(EventLog::new(data_dir, origin, env!("CARGO_PKG_VERSION"))?);

        let parts = Components {
            ledger: Arc::new(LedgerService::new(store.clone())),
            vault: Arc::new(WalletVault::new(store.clone(), cipher, clock.clone())),
            escrow: Arc::new(EscrowManager::new(
                store.clone(),
                clock.clone(),
                config.escrow_ttl(),
                config.escrow.sweep_batch_size,
            )),
            risk: Arc::new(RiskGate::new(
                config.risk.limits.clone(),
                config.risk.utc_offset_minutes,
                clock.clone(),
            )?),
            fees: Arc::new(FeeAccumulator::new(
                store.clone(),
                collaborators.swaps,
                collaborators.chain.clone(),
                clock.clone(),
                &config.fees,
                config.io_timeout(),
            )),
            airdrops: Arc::new(AirdropBook::new(clock.clone())),
            nonces: Arc::new(NonceStore::new(clock.clone(), config.nonce_ttl())),
        };

        let status_service = StatusService::new(
            parts.ledger.clone(),
            parts.vault.clone(),
            parts.escrow.clone(),
            parts.fees.clone(),
            parts.risk.clone(),
        );
        let tipping = Arc::new(
            TippingService::new(
                parts,
                collaborators.prices,
                collaborators.chain,
                &config.ledger,
            )
            .with_event_log(events.clone()),
        );

        events.record(LogEvent::new("context_opened").with_operation("startup"));

        Ok(Self {
            config,
            store,
            clock,
            tipping,
            status_service,
            encryption_service,
            events,
            _lock: lock,
        })
    }

    pub fn components(&self) -> &Components {
        self.tipping.components()
    }

    /// Background jobs for this context. Fee swaps run only with a signer.
    pub fn scheduler(&self, fee_signer: Option<Arc<dyn TransactionSigner>>) -> Scheduler {
        Scheduler::new(
            self.tipping.clone(),
            fee_signer,
            self.clock.clone(),
            SchedulerSettings::from_config(&self.config),
        )
    }
}
