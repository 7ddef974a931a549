//! Core domain entities
//!
//! All business entities are defined here. These are pure data structures
//! with validation logic - no I/O or external dependencies.

mod account;
pub mod airdrop;
mod encryption;
pub mod escrow;
pub mod fee;
mod receipt;
pub mod result;
pub mod risk;
pub mod token;
mod transaction;
pub mod wallet;

pub use account::{
    is_system_account, validate_user_id, Account, ESCROW_ACCOUNT, EXTERNAL_PARTY, FEE_ACCOUNT,
};
pub use airdrop::{Airdrop, AirdropStatus};
pub use encryption::{Argon2Params, KeySourceKind, VaultMetadata};
pub use escrow::{
    ClaimLine, ClaimOutcome, ClaimPlan, EscrowItem, EscrowKind, EscrowStats, EscrowStatus,
    NewEscrow,
};
pub use fee::{
    Accumulated, BatchSettlement, FeeBatch, FeeRecord, FeeStatsRow, FeeStatus, SwapOutcome,
};
pub use receipt::{
    ClaimReceipt, CollectReceipt, Delivery, PayoutLine, RegistrationReceipt, TipReceipt,
};
pub use risk::{BlockDecision, LimitCheck, RiskLimits, RiskReport, TransactionType, TypeLimits};
pub use token::TokenInfo;
pub use transaction::{Transaction, TransactionKind, TransferLeg};
pub use wallet::{SealedKey, WalletRecord, WalletStats, WalletSummary, WalletTrigger};
