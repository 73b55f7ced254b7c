//! Ledger change events.
//!
//! Outbound: [`EventNotifier`] queues `balance_updated` and
//! `transfer_completed` after commit; a dispatcher task publishes them
//! through an [`EventPublisher`]. Inbound: [`EventConsumer`] turns
//! `credit_earned` events from an [`EventSource`] into idempotent credits.

pub mod consumer;
pub mod errors;
pub mod models;
pub mod notifier;
pub mod publisher;

pub use consumer::{ACTIVITY_SOURCE, ChannelSource, ConsumeOutcome, EventConsumer, EventSource, PgListenerSource};
pub use errors::{EventError, EventResult};
pub use models::{BalanceUpdated, CreditEarned, EventEnvelope, LedgerEvent, TransferCompleted};
pub use notifier::EventNotifier;
pub use publisher::{EventPublisher, InMemoryPublisher, PgNotifyPublisher};
