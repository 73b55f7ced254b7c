//! `credit_earned` consumer.
//!
//! Each event becomes a credit keyed by `activity:<activityId>`, so a
//! redelivered event is answered by the ledger's replay instead of a second
//! credit.

use super::errors::{EventError, EventResult};
use super::models::{CreditEarned, EventEnvelope};
use crate::telemetry;
use crate::wallet::{BalanceEngine, CreditRequest, Metadata, RetryPolicy, Transaction, WalletError};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tracing::Span;

/// `source` recorded on credits created from activity events
pub const ACTIVITY_SOURCE: &str = "activity";

/// Stream of envelopes from the bus
#[async_trait]
pub trait EventSource: Send {
    /// Next envelope; `None` once the source is closed for good
    async fn next_event(&mut self) -> Option<EventResult<EventEnvelope>>;
}

/// Source fed by an in-process channel
pub struct ChannelSource {
    receiver: mpsc::Receiver<EventEnvelope>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<EventEnvelope>) -> Self {
        Self { receiver }
    }

    /// Sender and source pair
    pub fn channel(capacity: usize) -> (mpsc::Sender<EventEnvelope>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self::new(receiver))
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Option<EventResult<EventEnvelope>> {
        self.receiver.recv().await.map(Ok)
    }
}

/// Source reading PostgreSQL `LISTEN` notifications. The listener reconnects
/// on its own after a dropped connection.
pub struct PgListenerSource {
    listener: PgListener,
}

impl PgListenerSource {
    pub async fn connect(pool: &PgPool, channel: &str) -> EventResult<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl EventSource for PgListenerSource {
    async fn next_event(&mut self) -> Option<EventResult<EventEnvelope>> {
        match self.listener.recv().await {
            Ok(notification) => Some(EventEnvelope::from_json(notification.payload())),
            Err(e) => Some(Err(EventError::Database(e))),
        }
    }
}

/// What became of one consumed envelope
#[derive(Debug)]
pub enum ConsumeOutcome {
    /// Credit committed or replayed
    Credited(Transaction),
    /// Not a `credit_earned` event
    Ignored,
    /// Payload could not be decoded
    Malformed(EventError),
    /// Ledger refused the credit
    Rejected(WalletError),
    /// Retryable failure outlasted the attempt budget
    Failed(WalletError),
}

impl ConsumeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ConsumeOutcome::Credited(_) => "credited",
            ConsumeOutcome::Ignored => "ignored",
            ConsumeOutcome::Malformed(_) => "malformed",
            ConsumeOutcome::Rejected(_) => "rejected",
            ConsumeOutcome::Failed(_) => "failed",
        }
    }
}

/// Applies `credit_earned` events to the ledger
#[derive(Clone)]
pub struct EventConsumer {
    engine: BalanceEngine,
    retry: RetryPolicy,
    span: Span,
}

impl EventConsumer {
    pub fn new(engine: BalanceEngine, retry: RetryPolicy, span: Span) -> Self {
        Self {
            engine,
            retry,
            span,
        }
    }

    /// Consume until the source closes or `shutdown` flips
    pub async fn run<S: EventSource>(&self, mut source: S, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(parent: &self.span, "Event consumer started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = source.next_event() => match next {
                    None => break,
                    Some(Ok(envelope)) => {
                        self.handle(&envelope).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(parent: &self.span, error = %e, "Dropping unreadable event");
                        telemetry::event_consumed("unknown", "malformed");
                    }
                },
            }
        }
        tracing::info!(parent: &self.span, "Event consumer stopped");
    }

    /// Apply one envelope. Never fails; the outcome says what happened.
    pub async fn handle(&self, envelope: &EventEnvelope) -> ConsumeOutcome {
        let outcome = self.apply(envelope).await;
        telemetry::event_consumed(&envelope.event_type, outcome.label());

        match &outcome {
            ConsumeOutcome::Credited(tx) => tracing::debug!(
                parent: &self.span,
                event_id = %envelope.event_id,
                transaction_id = %tx.id,
                "Activity credit applied"
            ),
            ConsumeOutcome::Ignored => tracing::trace!(
                parent: &self.span,
                event_type = %envelope.event_type,
                "Ignoring event"
            ),
            ConsumeOutcome::Malformed(e) => tracing::warn!(
                parent: &self.span,
                event_id = %envelope.event_id,
                error = %e,
                "Skipping malformed credit_earned event"
            ),
            ConsumeOutcome::Rejected(e) => tracing::warn!(
                parent: &self.span,
                event_id = %envelope.event_id,
                error = %e,
                "Ledger rejected activity credit"
            ),
            ConsumeOutcome::Failed(e) => tracing::error!(
                parent: &self.span,
                event_id = %envelope.event_id,
                error = %e,
                "Activity credit failed after retries"
            ),
        }
        outcome
    }

    async fn apply(&self, envelope: &EventEnvelope) -> ConsumeOutcome {
        if !envelope.is::<CreditEarned>() {
            return ConsumeOutcome::Ignored;
        }
        let earned: CreditEarned = match envelope.decode() {
            Ok(earned) => earned,
            Err(e) => return ConsumeOutcome::Malformed(e),
        };

        let request = CreditRequest::new(earned.user_id, earned.credits_earned, ACTIVITY_SOURCE)
            .description(earned.description.clone())
            .reference(format!("activity:{}", earned.activity_id))
            .metadata(
                Metadata::new()
                    .with("activity_id", earned.activity_id.clone())
                    .with("activity_type", earned.activity_type.clone())
                    .with("event_id", envelope.event_id.to_string()),
            );

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.engine.credit(request.clone()).await {
                Ok(tx) => return ConsumeOutcome::Credited(tx),
                Err(e) if !e.is_retryable() => return ConsumeOutcome::Rejected(e),
                Err(e) if attempt >= max_attempts => return ConsumeOutcome::Failed(e),
                Err(e) => {
                    tracing::debug!(
                        parent: &self.span,
                        event_id = %envelope.event_id,
                        attempt = attempt,
                        error = %e,
                        "Activity credit failed, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BalanceUpdated, EventNotifier, InMemoryPublisher};
    use crate::wallet::{MemoryWalletStore, WalletConfig};
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use uuid::Uuid;

    fn consumer() -> (EventConsumer, BalanceEngine) {
        let config = WalletConfig::default();
        let (notifier, _handle) =
            EventNotifier::spawn(Arc::new(InMemoryPublisher::new()), &config, Span::none());
        let store = Arc::new(MemoryWalletStore::new(config.retry, Span::none()));
        let engine = BalanceEngine::new(store, notifier, Span::none());
        (
            EventConsumer::new(engine.clone(), config.retry, Span::none()),
            engine,
        )
    }

    fn earned(user: Uuid, activity_id: &str, credits: Decimal) -> EventEnvelope {
        let payload = CreditEarned {
            user_id: user,
            activity_id: activity_id.to_string(),
            activity_type: "cycling".to_string(),
            credits_earned: credits,
            description: "commute".to_string(),
        };
        EventEnvelope::new("activity-service", "1.0", &payload).unwrap()
    }

    #[tokio::test]
    async fn test_credit_earned_is_applied_once() {
        let (consumer, engine) = consumer();
        let user = Uuid::new_v4();
        let event = earned(user, "ride-1", Decimal::from(6));

        let first = consumer.handle(&event).await;
        let second = consumer.handle(&event).await;

        let (ConsumeOutcome::Credited(a), ConsumeOutcome::Credited(b)) = (first, second) else {
            panic!("expected both deliveries to credit");
        };
        assert_eq!(a.id, b.id);
        assert_eq!(a.source, ACTIVITY_SOURCE);
        assert_eq!(a.reference_id, "activity:ride-1");
        assert_eq!(engine.get_balance(user).await.unwrap().available, Decimal::from(6));
    }

    #[tokio::test]
    async fn test_other_events_ignored() {
        let (consumer, _) = consumer();
        let tx = Transaction::completed(
            Uuid::new_v4(),
            crate::wallet::TransactionType::CreditEarned,
            Decimal::ONE,
            Decimal::ONE,
            chrono::Utc::now(),
        );
        let envelope =
            EventEnvelope::new("wallet-service", "1.0", &BalanceUpdated::from(&tx)).unwrap();
        assert!(matches!(consumer.handle(&envelope).await, ConsumeOutcome::Ignored));
    }

    #[tokio::test]
    async fn test_malformed_and_rejected_are_skipped() {
        let (consumer, _) = consumer();

        let mut broken = earned(Uuid::new_v4(), "ride-2", Decimal::ONE);
        broken.data = serde_json::json!({ "userId": "not-a-uuid" });
        assert!(matches!(consumer.handle(&broken).await, ConsumeOutcome::Malformed(_)));

        let negative = earned(Uuid::new_v4(), "ride-3", Decimal::from(-4));
        assert!(matches!(consumer.handle(&negative).await, ConsumeOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_run_stops_when_source_closes() {
        let (consumer, engine) = consumer();
        let user = Uuid::new_v4();
        let (sender, source) = ChannelSource::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        sender.send(earned(user, "ride-4", Decimal::from(2))).await.unwrap();
        sender.send(earned(user, "ride-4", Decimal::from(2))).await.unwrap();
        sender.send(earned(user, "ride-5", Decimal::from(3))).await.unwrap();
        drop(sender);

        consumer.run(source, shutdown_rx).await;
        assert_eq!(engine.get_balance(user).await.unwrap().available, Decimal::from(5));
    }
}
