//! Event bus publishers.

use super::errors::{EventError, EventResult};
use super::models::{EventEnvelope, LedgerEvent};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more
const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Sink for ledger events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &EventEnvelope) -> EventResult<()>;
}

/// Publishes events with `pg_notify` on a fixed channel
#[derive(Clone)]
pub struct PgNotifyPublisher {
    pool: PgPool,
    channel: String,
}

impl PgNotifyPublisher {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl EventPublisher for PgNotifyPublisher {
    async fn publish(&self, event: &EventEnvelope) -> EventResult<()> {
        let payload = event.to_json()?;
        if payload.len() > MAX_NOTIFY_PAYLOAD {
            return Err(EventError::Publish(format!(
                "payload of {} bytes exceeds the notify limit",
                payload.len()
            )));
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Publisher that keeps events in memory. Can be switched into an outage.
#[derive(Default)]
pub struct InMemoryPublisher {
    events: Mutex<Vec<EventEnvelope>>,
    failing: AtomicBool,
    attempts: AtomicU64,
    published: Notify,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Publish calls seen, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Recorded events of one type, decoded
    pub fn events_of<E: LedgerEvent>(&self) -> Vec<E> {
        self.events()
            .iter()
            .filter(|e| e.is::<E>())
            .filter_map(|e| e.decode().ok())
            .collect()
    }

    /// Wait until at least `count` events are recorded or `timeout` passes,
    /// returning what was recorded
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<EventEnvelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the check so a publish in between is not missed
            let published = self.published.notified();
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return self.events();
            }
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &EventEnvelope) -> EventResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventError::Publish("bus unavailable".to_string()));
        }

        self.events
            .lock()
            .map_err(|_| EventError::Publish("event log poisoned".to_string()))?
            .push(event.clone());
        self.published.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::models::CreditEarned;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn sample() -> EventEnvelope {
        let payload = CreditEarned {
            user_id: Uuid::new_v4(),
            activity_id: "a-1".to_string(),
            activity_type: "cycling".to_string(),
            credits_earned: Decimal::ONE,
            description: String::new(),
        };
        EventEnvelope::new("test", "1.0", &payload).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_records_and_fails() {
        let publisher = InMemoryPublisher::new();
        publisher.publish(&sample()).await.unwrap();

        publisher.set_failing(true);
        assert!(publisher.publish(&sample()).await.is_err());

        assert_eq!(publisher.events().len(), 1);
        assert_eq!(publisher.attempts(), 2);
        assert_eq!(publisher.events_of::<CreditEarned>().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_times_out_with_partial_result() {
        let publisher = InMemoryPublisher::new();
        publisher.publish(&sample()).await.unwrap();
        let events = publisher.wait_for(2, Duration::from_millis(20)).await;
        assert_eq!(events.len(), 1);
    }
}
