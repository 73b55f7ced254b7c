//! Carbon wallet ledger service.
//!
//! Hosts the ledger over PostgreSQL: publishes ledger events with
//! `NOTIFY`, applies `credit_earned` events received with `LISTEN`, and
//! sweeps expired reservations.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod service;

pub use config::{ConfigError, ServerConfig};
pub use service::{ServiceTasks, WalletService};
