//! Service layer - business logic orchestration
//!
//! Services coordinate domain logic and port interactions. Each service
//! focuses on a specific use case or feature area.

pub mod airdrop;
pub mod encryption;
pub mod escrow;
pub mod fees;
pub mod ledger;
pub mod logging;
pub mod migration;
pub mod registration;
pub mod risk;
pub mod scheduler;
mod status;
pub mod tipping;
pub mod vault;

pub use airdrop::{AirdropBook, ReservedShare};
pub use encryption::{EncryptionService, EnvelopeCipher, KeySource, MasterKey};
pub use escrow::{EscrowManager, ReservedClaim, SweepReport};
pub use fees::{FeeAccumulator, FeeRunReport};
pub use ledger::{LedgerService, TransactionHistory};
pub use logging::{init_tracing, EventLog, LogEntry, LogEvent, Origin};
pub use migration::{MigrationResult, MigrationService};
pub use registration::{NonceStore, RegistrationChallenge, RegistrationRequest};
pub use risk::RiskGate;
pub use scheduler::{Scheduler, SchedulerSettings};
pub use status::{StatusService, StatusSummary, SupplyLine};
pub use tipping::{Components, TippingService};
pub use vault::{DecryptGrant, Keypair, UnsealedSigner, WalletVault};
