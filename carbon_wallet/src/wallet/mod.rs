//! Wallet ledger: balances, transactions, transfers and reservations.
//!
//! This module implements:
//! - Per-user wallets with `available == earned - spent` enforced on every write
//! - Idempotent credits, debits and adjustments keyed by reference ID
//! - Two-leg transfers committed in one atomic unit with ordered row locks
//! - Time-boxed reservations that shrink the spendable balance
//!
//! ## Example
//!
//! ```no_run
//! use carbon_wallet::events::{EventNotifier, InMemoryPublisher};
//! use carbon_wallet::wallet::{BalanceEngine, CreditRequest, MemoryWalletStore, WalletConfig};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//! use tracing::Span;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WalletConfig::default();
//!     let (notifier, _dispatcher) =
//!         EventNotifier::spawn(Arc::new(InMemoryPublisher::new()), &config, Span::none());
//!     let store = Arc::new(MemoryWalletStore::new(config.retry, Span::none()));
//!     let engine = BalanceEngine::new(store, notifier, Span::none());
//!
//!     let user = Uuid::new_v4();
//!     let tx = engine
//!         .credit(CreditRequest::new(user, Decimal::from(25), "activity").reference("ride-1"))
//!         .await?;
//!     println!("Balance after credit: {}", tx.balance_after);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod memory;
pub mod models;
pub mod reservation;
pub mod store;
pub mod transfer;

pub use config::{RetryPolicy, WalletConfig, parse_env_or};
pub use engine::BalanceEngine;
pub use errors::{WalletError, WalletResult};
pub use memory::MemoryWalletStore;
pub use models::{
    AMOUNT_LIMIT, AMOUNT_SCALE, AdjustmentDirection, BalanceView, CreditRequest, CreditReservation,
    DebitRequest, HistoryQuery, Metadata, MetadataValue, ReferenceKey, Transaction,
    TransactionPage, TransactionStatus, TransactionType, TransferResult, UserId, Wallet,
    validate_amount,
};
pub use reservation::ReservationManager;
pub use store::{AtomicScope, AtomicWork, Committed, LedgerUnit, UnitChanges, WalletStore, with_retry};
pub use transfer::TransferCoordinator;
