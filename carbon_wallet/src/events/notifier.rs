//! Post-commit event notification.
//!
//! Ledger components hand events to [`EventNotifier`], which never blocks and
//! never fails the caller. A dispatcher task drains the bounded queue and
//! publishes each event with retries. The dispatcher exits once every
//! notifier clone is dropped and the queue is empty.
//!
//! Delivery is best-effort. An event is lost when the queue is full, when
//! every publish attempt fails, or when the process dies with the event
//! still queued. Each loss is logged and counted, and consumers reconcile
//! through transaction history. Guaranteed delivery would need an outbox
//! table written in the same unit as the ledger rows.

use super::models::{BalanceUpdated, EventEnvelope, LedgerEvent, TransferCompleted};
use super::publisher::EventPublisher;
use crate::telemetry;
use crate::wallet::{RetryPolicy, Transaction, TransferResult, WalletConfig};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::Span;

/// Cheap-to-clone handle that queues ledger events for publication
#[derive(Clone)]
pub struct EventNotifier {
    sender: mpsc::Sender<EventEnvelope>,
    source: String,
    version: String,
    span: Span,
}

impl EventNotifier {
    /// Start the dispatcher on the current runtime
    pub fn spawn(
        publisher: Arc<dyn EventPublisher>,
        config: &WalletConfig,
        span: Span,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.notifier_queue_capacity.max(1));

        let dispatcher = Dispatcher {
            receiver,
            publisher,
            max_attempts: config.publish_max_attempts.max(1),
            backoff: config.retry,
            span: span.clone(),
        };
        let handle = tokio::spawn(dispatcher.run());

        let notifier = Self {
            sender,
            source: config.event_source.clone(),
            version: config.event_version.clone(),
            span,
        };
        (notifier, handle)
    }

    /// Queue `balance_updated` for a committed transaction
    pub fn balance_updated(&self, tx: &Transaction) {
        self.enqueue(&BalanceUpdated::from(tx));
    }

    /// Queue `transfer_completed` for a committed transfer
    pub fn transfer_completed(&self, result: &TransferResult) {
        self.enqueue(&TransferCompleted::from(result));
    }

    fn enqueue<E: LedgerEvent>(&self, payload: &E) {
        let envelope = match EventEnvelope::new(&self.source, &self.version, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    parent: &self.span,
                    event_type = E::EVENT_TYPE,
                    error = %e,
                    "Failed to build event envelope"
                );
                telemetry::event_dropped(E::EVENT_TYPE);
                return;
            }
        };

        match self.sender.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                tracing::warn!(
                    parent: &self.span,
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    "Event queue full, dropping event"
                );
                telemetry::event_dropped(&envelope.event_type);
            }
            Err(TrySendError::Closed(envelope)) => {
                tracing::warn!(
                    parent: &self.span,
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    "Event dispatcher stopped, dropping event"
                );
                telemetry::event_dropped(&envelope.event_type);
            }
        }
    }
}

struct Dispatcher {
    receiver: mpsc::Receiver<EventEnvelope>,
    publisher: Arc<dyn EventPublisher>,
    max_attempts: u32,
    backoff: RetryPolicy,
    span: Span,
}

impl Dispatcher {
    async fn run(mut self) {
        tracing::debug!(parent: &self.span, "Event dispatcher started");
        while let Some(event) = self.receiver.recv().await {
            self.deliver(&event).await;
        }
        tracing::debug!(parent: &self.span, "Event dispatcher drained");
    }

    async fn deliver(&self, event: &EventEnvelope) {
        for attempt in 1..=self.max_attempts {
            match self.publisher.publish(event).await {
                Ok(()) => {
                    tracing::debug!(
                        parent: &self.span,
                        event_type = %event.event_type,
                        event_id = %event.event_id,
                        attempt = attempt,
                        "Event published"
                    );
                    telemetry::event_published(&event.event_type);
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    tracing::debug!(
                        parent: &self.span,
                        event_id = %event.event_id,
                        attempt = attempt,
                        error = %e,
                        "Event publish failed, retrying"
                    );
                    tokio::time::sleep(self.backoff.backoff(attempt)).await;
                }
                Err(e) => {
                    tracing::error!(
                        parent: &self.span,
                        event_type = %event.event_type,
                        event_id = %event.event_id,
                        attempts = attempt,
                        error = %e,
                        "Event publish failed, giving up"
                    );
                    telemetry::event_failed(&event.event_type);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::publisher::InMemoryPublisher;
    use crate::wallet::{TransactionType, WalletConfig};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use uuid::Uuid;

    fn config(capacity: usize) -> WalletConfig {
        WalletConfig {
            notifier_queue_capacity: capacity,
            publish_max_attempts: 3,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                lock_timeout: Duration::from_millis(10),
            },
            ..WalletConfig::default()
        }
    }

    fn credit_tx() -> Transaction {
        Transaction::completed(
            Uuid::new_v4(),
            TransactionType::CreditEarned,
            Decimal::from(4),
            Decimal::from(4),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_publishes_envelope_with_source_and_version() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let (notifier, handle) = EventNotifier::spawn(publisher.clone(), &config(8), Span::none());

        let tx = credit_tx();
        notifier.balance_updated(&tx);
        drop(notifier);
        handle.await.unwrap();

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "balance_updated");
        assert_eq!(events[0].source, "wallet-service");
        assert_eq!(events[0].version, "1.0");
        let payload: BalanceUpdated = events[0].decode().unwrap();
        assert_eq!(payload.transaction_id, tx.id);
    }

    #[tokio::test]
    async fn test_outage_gives_up_after_attempt_budget() {
        let publisher = Arc::new(InMemoryPublisher::new());
        publisher.set_failing(true);
        let (notifier, handle) = EventNotifier::spawn(publisher.clone(), &config(8), Span::none());

        notifier.balance_updated(&credit_tx());
        drop(notifier);
        handle.await.unwrap();

        assert!(publisher.events().is_empty());
        assert_eq!(publisher.attempts(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let (notifier, handle) = EventNotifier::spawn(publisher.clone(), &config(1), Span::none());

        // The current-thread runtime cannot drain while this loop runs
        for _ in 0..10 {
            notifier.balance_updated(&credit_tx());
        }
        drop(notifier);
        handle.await.unwrap();

        assert_eq!(publisher.events().len(), 1);
    }
}
