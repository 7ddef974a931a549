//! Result and error types for the core library

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core library error type
///
/// Validation variants (`InvalidAmount`, `UnsupportedCurrency`,
/// `InsufficientBalance`, ...) are returned before anything is written.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Insufficient {currency} balance for {user_id}")]
    InsufficientBalance { user_id: String, currency: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Wallet not found for {0}")]
    WalletNotFound(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Risk limit exceeded: {}", reasons.join("; "))]
    RiskLimitExceeded { reasons: Vec<String> },

    #[error("Escrow item not found: {0}")]
    EscrowNotFound(String),

    #[error("Swap quote unavailable: {0}")]
    SwapQuoteUnavailable(String),

    #[error("Registration nonce is unknown, expired or already used")]
    NonceReplayOrExpired,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn insufficient_balance(user_id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self::InsufficientBalance {
            user_id: user_id.into(),
            currency: currency.into(),
        }
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    /// True for failures of an external collaborator (network, timeout, quote)
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::ExternalService(_) | Self::Timeout(_) | Self::SwapQuoteUnavailable(_)
        )
    }
}

impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;

/// Operation result with optional context (for transport-layer serialization)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl<T> OperationResult<T> {
    /// Create a successful result
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            context: None,
        }
    }

    /// Create a failed result
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: None,
        }
    }

    /// Create a failed result with context
    pub fn fail_with_context(
        error: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: Some(context),
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(Error::RiskLimitExceeded { reasons }) => {
                let mut context = HashMap::new();
                context.insert("reasons".to_string(), serde_json::json!(reasons));
                Self::fail_with_context(
                    format!("Risk limit exceeded: {}", reasons.join("; ")),
                    context,
                )
            }
            Err(e) => Self::fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_ok() {
        let result: OperationResult<i32> = OperationResult::ok(42);
        assert!(result.success);
        assert_eq!(result.data, Some(42));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_from_result() {
        let err: Result<i32> = Err(Error::insufficient_balance("alice", "SOL"));
        let result: OperationResult<i32> = err.into();
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some("Insufficient SOL balance for alice".to_string())
        );
    }

    #[test]
    fn test_risk_reasons_carried_in_context() {
        let err: Result<()> = Err(Error::RiskLimitExceeded {
            reasons: vec!["a".to_string(), "b".to_string()],
        });
        let result: OperationResult<()> = err.into();
        let context = result.context.unwrap();
        assert_eq!(context["reasons"], serde_json::json!(["a", "b"]));
        assert!(result.error.unwrap().contains("a; b"));
    }

    #[test]
    fn test_external_classification() {
        assert!(Error::Timeout("rpc".into()).is_external());
        assert!(Error::SwapQuoteUnavailable("BONK".into()).is_external());
        assert!(!Error::validation("bad").is_external());
    }
}
