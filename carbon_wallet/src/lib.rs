//! # Carbon Wallet
//!
//! Ledger for carbon credits earned from sustainable activities and spent on
//! offsets, transfers and certificates.
//!
//! Every balance change is one atomic unit of work on a [`wallet::WalletStore`]:
//! the wallets involved are locked in ascending user ID order, the change is
//! validated against `available == earned - spent` and the spendable balance,
//! and the wallet rows and immutable transaction records are written together.
//! Change events are published after commit and never affect the ledger.
//!
//! ## Core Modules
//!
//! - [`wallet`]: Models, balance engine, transfers, reservations and stores
//! - [`events`]: Event envelope, publishers, post-commit notifier and the
//!   `credit_earned` consumer
//! - [`db`]: PostgreSQL pool and the SQL-backed store
//! - [`telemetry`]: Ledger metrics and log helpers
//!
//! ## Example
//!
//! ```no_run
//! use carbon_wallet::db::{Database, DatabaseConfig, PgWalletStore};
//! use carbon_wallet::wallet::WalletConfig;
//! use tracing::Span;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::new(&DatabaseConfig::from_env()).await?;
//!     let store = PgWalletStore::new(db.pool().clone(), WalletConfig::from_env().retry, Span::none());
//!     store.init_schema().await?;
//!     Ok(())
//! }
//! ```

/// PostgreSQL connection pool and SQL store.
pub mod db;

/// Ledger change events.
pub mod events;

/// Ledger metrics and structured log helpers.
pub mod telemetry;

/// Wallet ledger.
pub mod wallet;

pub use events::{EventConsumer, EventNotifier};
pub use wallet::{
    BalanceEngine, ReservationManager, TransferCoordinator, WalletConfig, WalletError,
    WalletResult,
};
