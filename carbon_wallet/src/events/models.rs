//! Event envelope and payloads carried on the bus.
//!
//! Field names are camelCase on the wire; event types are snake_case.

use super::errors::{EventError, EventResult};
use crate::wallet::{Transaction, TransactionType, TransferResult, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Payload with a fixed event type
pub trait LedgerEvent: Serialize + DeserializeOwned {
    const EVENT_TYPE: &'static str;
}

/// Envelope shared by every event on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub source: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a payload under a fresh event ID
    pub fn new<E: LedgerEvent>(source: &str, version: &str, payload: &E) -> EventResult<Self> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: E::EVENT_TYPE.to_string(),
            source: source.to_string(),
            version: version.to_string(),
            timestamp: Utc::now(),
            data: serde_json::to_value(payload)?,
        })
    }

    pub fn is<E: LedgerEvent>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    /// Decode the payload, checking the event type first
    pub fn decode<E: LedgerEvent>(&self) -> EventResult<E> {
        if !self.is::<E>() {
            return Err(EventError::UnexpectedType {
                expected: E::EVENT_TYPE,
                actual: self.event_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_json(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> EventResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Published after every committed balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdated {
    pub user_id: UserId,
    pub transaction_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub source: String,
    pub reference_id: String,
}

impl LedgerEvent for BalanceUpdated {
    const EVENT_TYPE: &'static str = "balance_updated";
}

impl From<&Transaction> for BalanceUpdated {
    fn from(tx: &Transaction) -> Self {
        Self {
            user_id: tx.user_id,
            transaction_id: tx.id,
            transaction_type: tx.tx_type,
            amount: tx.amount,
            balance_after: tx.balance_after,
            source: tx.source.clone(),
            reference_id: tx.reference_id.clone(),
        }
    }
}

/// Published once per committed transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompleted {
    pub transfer_id: Uuid,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub amount: Decimal,
    pub description: String,
    pub from_balance: Decimal,
    pub to_balance: Decimal,
}

impl LedgerEvent for TransferCompleted {
    const EVENT_TYPE: &'static str = "transfer_completed";
}

impl From<&TransferResult> for TransferCompleted {
    fn from(result: &TransferResult) -> Self {
        Self {
            transfer_id: result.transfer_id,
            from_user_id: result.from_tx.user_id,
            to_user_id: result.to_tx.user_id,
            amount: result.from_tx.amount,
            description: result.from_tx.description.clone(),
            from_balance: result.from_balance,
            to_balance: result.to_balance,
        }
    }
}

/// Consumed from the activity service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditEarned {
    pub user_id: UserId,
    pub activity_id: String,
    pub activity_type: String,
    pub credits_earned: Decimal,
    #[serde(default)]
    pub description: String,
}

impl LedgerEvent for CreditEarned {
    const EVENT_TYPE: &'static str = "credit_earned";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let payload = CreditEarned {
            user_id: Uuid::nil(),
            activity_id: "a-1".to_string(),
            activity_type: "cycling".to_string(),
            credits_earned: Decimal::new(25, 1),
            description: String::new(),
        };
        let envelope = EventEnvelope::new("activity-service", "1.0", &payload).unwrap();
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["eventType"], "credit_earned");
        assert_eq!(json["source"], "activity-service");
        assert_eq!(json["data"]["activityId"], "a-1");
        assert_eq!(json["data"]["creditsEarned"], "2.5");
        assert!(json.get("eventId").is_some());
    }

    #[test]
    fn test_decode_checks_type() {
        let payload = CreditEarned {
            user_id: Uuid::new_v4(),
            activity_id: "a-2".to_string(),
            activity_type: "walking".to_string(),
            credits_earned: Decimal::ONE,
            description: "morning walk".to_string(),
        };
        let envelope = EventEnvelope::new("activity-service", "1.0", &payload).unwrap();

        assert_eq!(envelope.decode::<CreditEarned>().unwrap(), payload);
        assert!(matches!(
            envelope.decode::<BalanceUpdated>(),
            Err(EventError::UnexpectedType { expected: "balance_updated", .. })
        ));
    }

    #[test]
    fn test_from_json_accepts_missing_description() {
        let raw = r#"{
            "eventId": "7f1c3a52-9b0e-4d55-8a51-1d2f0f5f6c11",
            "eventType": "credit_earned",
            "source": "activity-service",
            "version": "1.0",
            "timestamp": "2026-01-05T10:00:00Z",
            "data": {
                "userId": "0b8f8c7e-3b7a-4f0e-9e55-5a8a3b0f2d10",
                "activityId": "ride-42",
                "activityType": "cycling",
                "creditsEarned": "12.5"
            }
        }"#;
        let envelope = EventEnvelope::from_json(raw).unwrap();
        let earned: CreditEarned = envelope.decode().unwrap();
        assert_eq!(earned.credits_earned, Decimal::new(125, 1));
        assert!(earned.description.is_empty());
    }
}
