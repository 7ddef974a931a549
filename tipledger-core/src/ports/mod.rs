//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces for external dependencies. The core domain
//! depends only on these traits, not on concrete implementations.

pub mod chain;
mod clock;
mod repository;

pub use chain::{
    sign_transaction, BlockchainClient, ConfirmationStatus, PriceOracle, SignedTransaction,
    SwapQuote, SwapQuoteProvider, TransactionSigner, TransferBuilder, UnsignedTransaction,
    with_timeout,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use repository::{EscrowStore, FeeStore, LedgerStore, WalletStore};
