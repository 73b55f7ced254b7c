//! Wallet error types.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// PostgreSQL error codes that signal lock contention rather than a broken store.
const CONTENTION_CODES: [&str; 4] = [
    "55P03", // lock_not_available (lock_timeout elapsed)
    "40P01", // deadlock_detected
    "40001", // serialization_failure
    "23505", // unique_violation on the idempotency index
];

/// Wallet errors
#[derive(Debug, Error)]
pub enum WalletError {
    /// Amount is zero, negative or more precise than the ledger supports
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Sender and receiver of a transfer are the same wallet
    #[error("Cannot transfer credits to the same user")]
    SameUserTransfer,

    /// Any other rejected input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Spendable balance does not cover the requested amount
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    /// Lock contention outlasted the retry budget
    #[error("Wallet busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Reservation not found
    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    /// Reservation was already released or has expired
    #[error("Reservation already released: {0}")]
    ReservationReleased(Uuid),

    /// Transaction cannot be compensated by a reversal
    #[error("Transaction {0} cannot be reversed")]
    NotReversible(Uuid),

    /// A row lock could not be taken in time. Retried by the store; never
    /// surfaces to callers.
    #[error("Lock contention: {0}")]
    Contention(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Storage failure outside the database driver
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for WalletError {
    fn from(err: sqlx::Error) -> Self {
        let contended = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| CONTENTION_CODES.contains(&&*code));

        if contended {
            WalletError::Contention(err.to_string())
        } else {
            WalletError::Database(err)
        }
    }
}

impl WalletError {
    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Storage errors are sanitized so nothing about the database layout or
    /// driver reaches the caller.
    pub fn client_message(&self) -> String {
        match self {
            WalletError::Database(_) | WalletError::Storage(_) | WalletError::Contention(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Error kind label used for logs, metrics and upstream status mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            WalletError::InvalidAmount(_)
            | WalletError::SameUserTransfer
            | WalletError::Validation(_) => "validation",
            WalletError::InsufficientBalance { .. } => "insufficient_balance",
            WalletError::Busy { .. } | WalletError::Contention(_) => "busy",
            WalletError::TransactionNotFound(_) | WalletError::ReservationNotFound(_) => {
                "not_found"
            }
            WalletError::ReservationReleased(_) | WalletError::NotReversible(_) => "conflict",
            WalletError::Database(_) | WalletError::Storage(_) => "internal",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), "busy" | "internal")
    }

    pub(crate) fn is_contention(&self) -> bool {
        matches!(self, WalletError::Contention(_))
    }
}

/// Result type for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;
