//! Single-wallet ledger operations.
//!
//! Every mutation is one atomic unit on the store. Events are queued only
//! after the unit committed and only for fresh writes, never for replays.

use super::{
    errors::{WalletError, WalletResult},
    models::{
        AdjustmentDirection, BalanceView, CreditRequest, CreditReservation, DebitRequest,
        HistoryQuery, Metadata, MetadataValue, ReferenceKey, Transaction, TransactionPage,
        TransactionStatus, TransactionType, UserId, validate_amount,
    },
    store::{AtomicScope, AtomicWork, Committed, LedgerUnit, WalletStore},
};
use crate::events::EventNotifier;
use crate::telemetry;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::Span;
use uuid::Uuid;

/// `source` recorded on debits
pub const DEBIT_SOURCE: &str = "debit";

/// `source` recorded on adjustments and reversals
pub const ADJUSTMENT_SOURCE: &str = "adjustment";

/// `source` recorded on reservation captures
pub const CAPTURE_SOURCE: &str = "reservation";

/// Metadata key holding an adjustment's direction
pub const DIRECTION_KEY: &str = "direction";

/// Metadata key holding the ID of the transaction a reversal compensates
pub const REVERSES_KEY: &str = "reverses";

/// Ledger operations on a single wallet
#[derive(Clone)]
pub struct BalanceEngine {
    store: Arc<dyn WalletStore>,
    notifier: EventNotifier,
    span: Span,
}

impl BalanceEngine {
    pub fn new(store: Arc<dyn WalletStore>, notifier: EventNotifier, span: Span) -> Self {
        Self {
            store,
            notifier,
            span,
        }
    }

    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    pub(crate) fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Balance snapshot; creates the wallet on first sight
    pub async fn get_balance(&self, user_id: UserId) -> WalletResult<BalanceView> {
        let wallet = self.store.get_or_create_wallet(user_id).await?;
        Ok(BalanceView::from(&wallet))
    }

    /// Add earned credits. A completed credit with the same reference is
    /// returned unchanged.
    pub async fn credit(&self, request: CreditRequest) -> WalletResult<Transaction> {
        const OP: &str = "credit";
        let amount = validate_amount(request.amount).map_err(|e| self.rejected(OP, e))?;
        let reference_id = request.reference_id.trim().to_string();
        let key = ReferenceKey::new(request.user_id, &reference_id, TransactionType::CreditEarned);
        let scope = AtomicScope::user(request.user_id).with_reference(key.clone());

        let committed = self
            .run_unit(OP, &scope, &|unit: &mut LedgerUnit| {
                if unit.replay(key.as_ref()).is_some() {
                    return Ok(());
                }
                let balance = unit.credit(request.user_id, amount)?;
                let mut tx = Transaction::completed(
                    request.user_id,
                    TransactionType::CreditEarned,
                    amount,
                    balance,
                    unit.now(),
                );
                tx.source = request.source.clone();
                tx.description = request.description.clone();
                tx.reference_id = reference_id.clone();
                tx.metadata = request.metadata.clone();
                unit.record(tx);
                Ok(())
            })
            .await?;

        self.settle(OP, committed, amount)
    }

    /// Spend credits, bounded by the spendable balance. Same replay rule as
    /// [`BalanceEngine::credit`].
    pub async fn debit(&self, request: DebitRequest) -> WalletResult<Transaction> {
        const OP: &str = "debit";
        let amount = validate_amount(request.amount).map_err(|e| self.rejected(OP, e))?;
        let reference_id = request.reference_id.trim().to_string();
        let key = ReferenceKey::new(request.user_id, &reference_id, TransactionType::CreditSpent);
        let scope = AtomicScope::user(request.user_id).with_reference(key.clone());

        let committed = self
            .run_unit(OP, &scope, &|unit: &mut LedgerUnit| {
                if unit.replay(key.as_ref()).is_some() {
                    return Ok(());
                }
                let balance = unit.debit(request.user_id, amount)?;
                let mut tx = Transaction::completed(
                    request.user_id,
                    TransactionType::CreditSpent,
                    amount,
                    balance,
                    unit.now(),
                );
                tx.source = DEBIT_SOURCE.to_string();
                tx.description = request.description.clone();
                tx.reference_id = reference_id.clone();
                tx.metadata = request.metadata.clone();
                unit.record(tx);
                Ok(())
            })
            .await?;

        self.settle(OP, committed, amount)
    }

    /// Manual correction recorded as an `Adjustment`
    pub async fn adjust(
        &self,
        user_id: UserId,
        direction: AdjustmentDirection,
        amount: Decimal,
        reason: &str,
        reference_id: &str,
    ) -> WalletResult<Transaction> {
        self.adjust_with("adjust", user_id, direction, amount, reason, reference_id, Metadata::new())
            .await
    }

    /// Compensate a completed credit, debit or adjustment with an opposite
    /// adjustment. Repeating the call returns the first reversal.
    pub async fn reverse_transaction(&self, transaction_id: Uuid, reason: &str) -> WalletResult<Transaction> {
        const OP: &str = "reverse";
        let original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(WalletError::TransactionNotFound(transaction_id))
            .map_err(|e| self.rejected(OP, e))?;

        if original.status != TransactionStatus::Completed {
            return Err(self.rejected(OP, WalletError::NotReversible(transaction_id)));
        }

        let direction = match original.tx_type {
            TransactionType::CreditEarned => AdjustmentDirection::Decrease,
            TransactionType::CreditSpent => AdjustmentDirection::Increase,
            TransactionType::Adjustment => {
                let recorded = match original.metadata.get(DIRECTION_KEY) {
                    Some(MetadataValue::Text(label)) => AdjustmentDirection::from_label(label),
                    _ => None,
                };
                recorded
                    .map(|direction| direction.opposite())
                    .ok_or_else(|| self.rejected(OP, WalletError::NotReversible(transaction_id)))?
            }
            TransactionType::TransferIn | TransactionType::TransferOut => {
                return Err(self.rejected(OP, WalletError::NotReversible(transaction_id)));
            }
        };

        self.adjust_with(
            OP,
            original.user_id,
            direction,
            original.amount,
            reason,
            &format!("reversal:{transaction_id}"),
            Metadata::new().with(REVERSES_KEY, transaction_id.to_string()),
        )
        .await
    }

    pub async fn get_transaction(&self, transaction_id: Uuid) -> WalletResult<Transaction> {
        self.store
            .get_transaction(transaction_id)
            .await?
            .ok_or(WalletError::TransactionNotFound(transaction_id))
    }

    /// Newest-first page of a user's history
    pub async fn transaction_history(&self, query: HistoryQuery) -> WalletResult<TransactionPage> {
        self.store.transaction_history(&query.normalized()).await
    }

    /// Debit a held amount and release the hold in one unit
    pub(crate) async fn capture_hold(
        &self,
        reservation: &CreditReservation,
        description: &str,
    ) -> WalletResult<Transaction> {
        const OP: &str = "capture";
        let reference_id = format!("reservation:{}", reservation.id);
        let key = ReferenceKey::new(reservation.user_id, &reference_id, TransactionType::CreditSpent);
        let scope = AtomicScope::user(reservation.user_id).with_reference(key.clone());

        let committed = self
            .run_unit(OP, &scope, &|unit: &mut LedgerUnit| {
                if unit.replay(key.as_ref()).is_some() {
                    return Ok(());
                }
                // Released first so the hold no longer counts against the debit
                let hold = unit.release_hold(reservation.id)?;
                let balance = unit.debit(hold.user_id, hold.amount)?;
                let mut tx = Transaction::completed(
                    hold.user_id,
                    TransactionType::CreditSpent,
                    hold.amount,
                    balance,
                    unit.now(),
                );
                tx.source = CAPTURE_SOURCE.to_string();
                tx.description = description.to_string();
                tx.reference_id = reference_id.clone();
                tx.metadata = Metadata::new().with("purpose", hold.purpose.clone());
                unit.record(tx);
                Ok(())
            })
            .await?;

        self.settle(OP, committed, reservation.amount)
    }

    #[allow(clippy::too_many_arguments)]
    async fn adjust_with(
        &self,
        operation: &'static str,
        user_id: UserId,
        direction: AdjustmentDirection,
        amount: Decimal,
        reason: &str,
        reference_id: &str,
        metadata: Metadata,
    ) -> WalletResult<Transaction> {
        let amount = validate_amount(amount).map_err(|e| self.rejected(operation, e))?;
        let reference_id = reference_id.trim().to_string();
        let key = ReferenceKey::new(user_id, &reference_id, TransactionType::Adjustment);
        let scope = AtomicScope::user(user_id).with_reference(key.clone());
        let metadata = metadata.with(DIRECTION_KEY, direction.as_str());

        let committed = self
            .run_unit(operation, &scope, &|unit: &mut LedgerUnit| {
                if unit.replay(key.as_ref()).is_some() {
                    return Ok(());
                }
                let balance = match direction {
                    AdjustmentDirection::Increase => unit.credit(user_id, amount)?,
                    AdjustmentDirection::Decrease => unit.debit(user_id, amount)?,
                };
                let mut tx = Transaction::completed(
                    user_id,
                    TransactionType::Adjustment,
                    amount,
                    balance,
                    unit.now(),
                );
                tx.source = ADJUSTMENT_SOURCE.to_string();
                tx.description = reason.to_string();
                tx.reference_id = reference_id.clone();
                tx.metadata = metadata.clone();
                unit.record(tx);
                Ok(())
            })
            .await?;

        self.settle(operation, committed, amount)
    }

    /// Execute a unit with timing, metrics and failure logging
    pub(crate) async fn run_unit(
        &self,
        operation: &'static str,
        scope: &AtomicScope,
        work: &AtomicWork<'_>,
    ) -> WalletResult<Committed> {
        let started = Instant::now();
        let result = self.store.execute_atomic(scope, work).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(committed) => {
                let outcome = if committed.is_replay() { "replayed" } else { "ok" };
                telemetry::ledger_operation(operation, outcome, elapsed);
            }
            Err(e) => {
                telemetry::ledger_operation(operation, e.kind(), elapsed);
                if e.is_retryable() {
                    tracing::warn!(
                        parent: &self.span,
                        operation = operation,
                        error = %e,
                        "Ledger operation failed"
                    );
                } else {
                    tracing::debug!(
                        parent: &self.span,
                        operation = operation,
                        error = %e,
                        "Ledger operation rejected"
                    );
                }
            }
        }
        telemetry::log_slow_operation(&self.span, operation, elapsed);
        result
    }

    /// Count and log an error raised before any unit ran
    pub(crate) fn rejected(&self, operation: &'static str, err: WalletError) -> WalletError {
        telemetry::ledger_operation(operation, err.kind(), std::time::Duration::ZERO);
        tracing::debug!(
            parent: &self.span,
            operation = operation,
            error = %err,
            "Ledger operation rejected"
        );
        err
    }

    /// Pull the single transaction out of a unit and notify when it is new
    fn settle(
        &self,
        operation: &'static str,
        committed: Committed,
        requested: Decimal,
    ) -> WalletResult<Transaction> {
        if let Some(tx) = committed.transactions.into_iter().next() {
            tracing::info!(
                parent: &self.span,
                operation = operation,
                user_id = %tx.user_id,
                transaction_id = %tx.id,
                amount = %tx.amount,
                balance_after = %tx.balance_after,
                "Ledger transaction committed"
            );
            self.notifier.balance_updated(&tx);
            return Ok(tx);
        }

        let tx = committed.replayed.into_iter().next().ok_or_else(|| {
            WalletError::Storage(format!("{operation} committed without a transaction"))
        })?;

        if tx.amount != requested {
            tracing::warn!(
                parent: &self.span,
                operation = operation,
                transaction_id = %tx.id,
                reference_id = %tx.reference_id,
                recorded = %tx.amount,
                requested = %requested,
                "Reference reused with a different amount, returning recorded transaction"
            );
        } else {
            tracing::info!(
                parent: &self.span,
                operation = operation,
                transaction_id = %tx.id,
                reference_id = %tx.reference_id,
                "Replayed ledger transaction"
            );
        }
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BalanceUpdated, EventNotifier, InMemoryPublisher};
    use crate::wallet::{AMOUNT_LIMIT, MemoryWalletStore, WalletConfig};
    use std::time::Duration;

    struct Harness {
        engine: BalanceEngine,
        publisher: Arc<InMemoryPublisher>,
    }

    fn harness() -> Harness {
        let publisher = Arc::new(InMemoryPublisher::new());
        let config = WalletConfig::default();
        let (notifier, _handle) = EventNotifier::spawn(publisher.clone(), &config, Span::none());
        let store = Arc::new(MemoryWalletStore::new(config.retry, Span::none()));
        Harness {
            engine: BalanceEngine::new(store, notifier, Span::none()),
            publisher,
        }
    }

    #[tokio::test]
    async fn test_credit_past_limit_is_rejected_without_panic() {
        let h = harness();
        let user = Uuid::new_v4();

        let err = h
            .engine
            .credit(CreditRequest::new(user, Decimal::MAX, "activity"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));

        let near_limit = AMOUNT_LIMIT - Decimal::ONE;
        h.engine
            .credit(CreditRequest::new(user, near_limit, "activity"))
            .await
            .unwrap();
        let err = h
            .engine
            .credit(CreditRequest::new(user, Decimal::ONE, "activity"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(!err.is_retryable());

        let balance = h.engine.get_balance(user).await.unwrap();
        assert_eq!(balance.available, near_limit);
        assert_eq!(balance.total_earned, near_limit);
    }

    #[tokio::test]
    async fn test_credit_then_debit() {
        let h = harness();
        let user = Uuid::new_v4();

        let credit = h
            .engine
            .credit(CreditRequest::new(user, Decimal::from(50), "activity"))
            .await
            .unwrap();
        assert_eq!(credit.balance_after, Decimal::from(50));
        assert!(credit.processed_at.is_some());

        let debit = h
            .engine
            .debit(DebitRequest::new(user, Decimal::from(20)).description("bus ticket"))
            .await
            .unwrap();
        assert_eq!(debit.balance_after, Decimal::from(30));
        assert_eq!(debit.source, DEBIT_SOURCE);

        let balance = h.engine.get_balance(user).await.unwrap();
        assert_eq!(balance.available, Decimal::from(30));
        assert_eq!(balance.total_earned, Decimal::from(50));
        assert_eq!(balance.total_spent, Decimal::from(20));
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let h = harness();
        let user = Uuid::new_v4();
        for amount in [Decimal::ZERO, Decimal::from(-3), Decimal::new(1, 9)] {
            let err = h
                .engine
                .credit(CreditRequest::new(user, amount, "activity"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
    }

    #[tokio::test]
    async fn test_replayed_credit_publishes_once() {
        let h = harness();
        let user = Uuid::new_v4();
        let request = CreditRequest::new(user, Decimal::from(10), "activity").reference("act-1");

        let first = h.engine.credit(request.clone()).await.unwrap();
        let second = h.engine.credit(request).await.unwrap();
        assert_eq!(first, second);

        let events = h.publisher.wait_for(1, Duration::from_millis(200)).await;
        assert_eq!(events.len(), 1);
        let payload: BalanceUpdated = events[0].decode().unwrap();
        assert_eq!(payload.transaction_id, first.id);
        assert_eq!(h.engine.get_balance(user).await.unwrap().available, Decimal::from(10));
    }

    #[tokio::test]
    async fn test_adjust_records_direction() {
        let h = harness();
        let user = Uuid::new_v4();

        let up = h
            .engine
            .adjust(user, AdjustmentDirection::Increase, Decimal::from(8), "support credit", "ticket-7")
            .await
            .unwrap();
        assert_eq!(up.tx_type, TransactionType::Adjustment);
        assert_eq!(
            up.metadata.get(DIRECTION_KEY),
            Some(&MetadataValue::Text("increase".to_string()))
        );

        let err = h
            .engine
            .adjust(user, AdjustmentDirection::Decrease, Decimal::from(9), "clawback", "ticket-8")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_reverse_credit_is_idempotent() {
        let h = harness();
        let user = Uuid::new_v4();
        let credit = h
            .engine
            .credit(CreditRequest::new(user, Decimal::from(15), "activity"))
            .await
            .unwrap();

        let reversal = h.engine.reverse_transaction(credit.id, "fraudulent ride").await.unwrap();
        assert_eq!(reversal.reference_id, format!("reversal:{}", credit.id));
        assert_eq!(reversal.balance_after, Decimal::ZERO);

        let again = h.engine.reverse_transaction(credit.id, "fraudulent ride").await.unwrap();
        assert_eq!(again.id, reversal.id);

        let balance = h.engine.get_balance(user).await.unwrap();
        assert_eq!(balance.available, Decimal::ZERO);
        assert_eq!(balance.total_earned, Decimal::from(15));
        assert_eq!(balance.total_spent, Decimal::from(15));
    }

    #[tokio::test]
    async fn test_reverse_adjustment_flips_direction() {
        let h = harness();
        let user = Uuid::new_v4();
        let bonus = h
            .engine
            .adjust(user, AdjustmentDirection::Increase, Decimal::from(6), "support credit", "ticket-9")
            .await
            .unwrap();

        let reversal = h.engine.reverse_transaction(bonus.id, "issued twice").await.unwrap();
        assert_eq!(
            reversal.metadata.get(DIRECTION_KEY),
            Some(&MetadataValue::Text("decrease".to_string()))
        );
        assert_eq!(
            reversal.metadata.get(REVERSES_KEY),
            Some(&MetadataValue::Text(bonus.id.to_string()))
        );

        let balance = h.engine.get_balance(user).await.unwrap();
        assert_eq!(balance.available, Decimal::ZERO);
        assert_eq!(balance.total_earned, Decimal::from(6));
        assert_eq!(balance.total_spent, Decimal::from(6));
    }

    #[tokio::test]
    async fn test_reverse_unknown_transaction() {
        let h = harness();
        let err = h
            .engine
            .reverse_transaction(Uuid::new_v4(), "typo")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::TransactionNotFound(_)));
    }
}
