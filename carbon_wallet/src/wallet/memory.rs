//! In-process wallet store.
//!
//! Each wallet has its own async lock, taken in ascending user ID order with
//! the policy's lock timeout. Lock entries are removed once no unit holds or
//! waits on them. Ledger data sits behind one short-lived mutex
//! that is never held across an await.

use super::{
    config::RetryPolicy,
    errors::{WalletError, WalletResult},
    models::{CreditReservation, HistoryQuery, Transaction, TransactionPage, UserId, Wallet},
    store::{AtomicScope, AtomicWork, Committed, LedgerUnit, WalletStore, with_retry},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::Span;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<UserId, Wallet>,
    transactions: Vec<Transaction>,
    reservations: HashMap<Uuid, CreditReservation>,
}

/// Wallet store kept in memory
#[derive(Clone)]
pub struct MemoryWalletStore {
    state: Arc<Mutex<MemoryState>>,
    row_locks: Arc<Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>>,
    fail_next_commit: Arc<AtomicBool>,
    retry: RetryPolicy,
    span: Span,
}

impl MemoryWalletStore {
    pub fn new(retry: RetryPolicy, span: Span) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            row_locks: Arc::new(Mutex::new(HashMap::new())),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
            retry,
            span,
        }
    }

    /// Make the next commit fail with a storage error, as a crashed
    /// database would
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Hold a wallet's row lock from outside, as a long-running writer would
    pub async fn lock_wallet(&self, user_id: UserId) -> WalletResult<OwnedMutexGuard<()>> {
        Ok(self.row_lock(user_id)?.lock_owned().await)
    }

    /// Every stored transaction, oldest first
    pub fn all_transactions(&self) -> WalletResult<Vec<Transaction>> {
        Ok(self.state()?.transactions.clone())
    }

    fn state(&self) -> WalletResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| WalletError::Storage("memory store poisoned".to_string()))
    }

    fn row_lock(&self, user_id: UserId) -> WalletResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| WalletError::Storage("memory lock table poisoned".to_string()))?;
        Ok(locks.entry(user_id).or_default().clone())
    }

    async fn lock_rows(&self, users: &[UserId]) -> WalletResult<Vec<OwnedMutexGuard<()>>> {
        let mut guards = Vec::with_capacity(users.len());
        for user_id in users {
            let lock = self.row_lock(*user_id)?;
            match tokio::time::timeout(self.retry.lock_timeout, lock.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    return Err(WalletError::Contention(format!(
                        "wallet {user_id} lock not acquired within {:?}",
                        self.retry.lock_timeout
                    )));
                }
            }
        }
        Ok(guards)
    }

    /// Drop lock entries for `users` that nobody holds or waits on
    fn prune_row_locks(&self, users: &[UserId]) {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for user_id in users {
            if locks
                .get(user_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(user_id);
            }
        }
    }

    async fn attempt_atomic(
        &self,
        scope: &AtomicScope,
        work: &AtomicWork<'_>,
    ) -> WalletResult<Committed> {
        let result = match self.lock_rows(scope.users()).await {
            Ok(_guards) => self.apply_unit(scope, work),
            Err(e) => Err(e),
        };
        self.prune_row_locks(scope.users());
        result
    }

    fn apply_unit(&self, scope: &AtomicScope, work: &AtomicWork<'_>) -> WalletResult<Committed> {
        let now = Utc::now();

        let mut unit = {
            let state = self.state()?;
            let wallets = scope
                .users()
                .iter()
                .map(|id| {
                    state
                        .wallets
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| Wallet::new(*id))
                })
                .collect();
            let holds = state
                .reservations
                .values()
                .filter(|r| scope.users().contains(&r.user_id) && r.is_active(now))
                .cloned()
                .collect();
            let replays = state
                .transactions
                .iter()
                .filter(|tx| scope.references().iter().any(|key| key.matches(tx)))
                .cloned()
                .collect();
            LedgerUnit::new(now, wallets, holds, replays)
        };

        work(&mut unit)?;

        let mut changes = unit.into_changes();
        let mut state = self.state()?;

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(WalletError::Storage("injected commit failure".to_string()));
        }

        // All checks before any write so a failed commit leaves no trace
        for id in &changes.released {
            let still_held = state.reservations.get(id).is_some_and(|r| !r.is_released);
            if !still_held {
                return Err(WalletError::ReservationReleased(*id));
            }
        }

        let committed_at = Utc::now();
        changes.stamp(committed_at);

        for wallet in &changes.wallets {
            state.wallets.insert(wallet.user_id, wallet.clone());
        }
        state.transactions.extend(changes.transactions.iter().cloned());
        for hold in &changes.new_holds {
            state.reservations.insert(hold.id, hold.clone());
        }
        let mut released = Vec::with_capacity(changes.released.len());
        for id in &changes.released {
            if let Some(reservation) = state.reservations.get_mut(id) {
                reservation.is_released = true;
                reservation.released_at = Some(committed_at);
                released.push(reservation.clone());
            }
        }

        Ok(changes.into_committed(released))
    }
}

impl Default for MemoryWalletStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Span::none())
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn execute_atomic(
        &self,
        scope: &AtomicScope,
        work: &AtomicWork<'_>,
    ) -> WalletResult<Committed> {
        with_retry(&self.retry, &self.span, || self.attempt_atomic(scope, work)).await
    }

    async fn get_or_create_wallet(&self, user_id: UserId) -> WalletResult<Wallet> {
        let mut state = self.state()?;
        Ok(state
            .wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::new(user_id))
            .clone())
    }

    async fn get_transaction(&self, id: Uuid) -> WalletResult<Option<Transaction>> {
        Ok(self
            .state()?
            .transactions
            .iter()
            .find(|tx| tx.id == id)
            .cloned())
    }

    async fn transaction_history(&self, query: &HistoryQuery) -> WalletResult<TransactionPage> {
        let query = query.clone().normalized();
        let state = self.state()?;

        // Stored oldest first; reverse keeps insertion order as the tiebreak
        let matching: Vec<&Transaction> = state
            .transactions
            .iter()
            .rev()
            .filter(|tx| query.matches(tx))
            .collect();
        let mut sorted = matching;
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(TransactionPage {
            total: sorted.len() as i64,
            transactions: sorted
                .into_iter()
                .skip(query.offset as usize)
                .take(query.limit as usize)
                .cloned()
                .collect(),
            limit: query.limit,
            offset: query.offset,
        })
    }

    async fn get_reservation(&self, id: Uuid) -> WalletResult<Option<CreditReservation>> {
        Ok(self.state()?.reservations.get(&id).cloned())
    }

    async fn release_reservation(&self, id: Uuid, at: DateTime<Utc>) -> WalletResult<bool> {
        let mut state = self.state()?;
        let reservation = state
            .reservations
            .get_mut(&id)
            .ok_or(WalletError::ReservationNotFound(id))?;

        if reservation.is_released {
            return Ok(false);
        }
        reservation.is_released = true;
        reservation.released_at = Some(at);
        Ok(true)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> WalletResult<Vec<CreditReservation>> {
        let mut state = self.state()?;
        let mut released = Vec::new();
        for reservation in state.reservations.values_mut() {
            if !reservation.is_released && reservation.expires_at <= now {
                reservation.is_released = true;
                reservation.released_at = Some(now);
                released.push(reservation.clone());
            }
        }
        Ok(released)
    }

    async fn active_reserved_total(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> WalletResult<Decimal> {
        Ok(self
            .state()?
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && r.is_active(now))
            .map(|r| r.amount)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_store() -> MemoryWalletStore {
        MemoryWalletStore::new(
            RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                lock_timeout: Duration::from_millis(20),
            },
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_unique() {
        let store = fast_store();
        let user = Uuid::new_v4();
        let first = store.get_or_create_wallet(user).await.unwrap();
        let second = store.get_or_create_wallet(user).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.available_credits, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_failed_work_writes_nothing() {
        let store = fast_store();
        let user = Uuid::new_v4();
        let result = store
            .execute_atomic(&AtomicScope::user(user), &|unit: &mut LedgerUnit| {
                unit.credit(user, Decimal::from(10))?;
                Err(WalletError::Validation("abort".to_string()))
            })
            .await;

        assert!(result.is_err());
        let wallet = store.get_or_create_wallet(user).await.unwrap();
        assert_eq!(wallet.available_credits, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_writes_nothing() {
        let store = fast_store();
        let user = Uuid::new_v4();
        store.fail_next_commit();

        let result = store
            .execute_atomic(&AtomicScope::user(user), &|unit: &mut LedgerUnit| {
                unit.credit(user, Decimal::from(10)).map(|_| ())
            })
            .await;

        assert!(matches!(result, Err(WalletError::Storage(_))));
        assert!(store.all_transactions().unwrap().is_empty());
        let wallet = store.get_or_create_wallet(user).await.unwrap();
        assert_eq!(wallet.total_earned, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_held_lock_yields_busy() {
        let store = fast_store();
        let user = Uuid::new_v4();
        let _guard = store.lock_wallet(user).await.unwrap();

        let result = store
            .execute_atomic(&AtomicScope::user(user), &|unit: &mut LedgerUnit| {
                unit.credit(user, Decimal::ONE).map(|_| ())
            })
            .await;

        assert!(matches!(result, Err(WalletError::Busy { attempts: 2 })));
    }

    fn row_lock_count(store: &MemoryWalletStore) -> usize {
        store.row_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_row_locks_are_dropped_after_units() {
        let store = fast_store();
        for _ in 0..50 {
            let user = Uuid::new_v4();
            store
                .execute_atomic(&AtomicScope::user(user), &|unit: &mut LedgerUnit| {
                    unit.credit(user, Decimal::ONE).map(|_| ())
                })
                .await
                .unwrap();
        }
        assert_eq!(row_lock_count(&store), 0);

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let _ = store
            .execute_atomic(&AtomicScope::user(alice).with_user(bob), &|_: &mut LedgerUnit| {
                Err(WalletError::Validation("abort".to_string()))
            })
            .await;
        assert_eq!(row_lock_count(&store), 0);
    }

    #[tokio::test]
    async fn test_held_row_lock_survives_pruning() {
        let store = fast_store();
        let user = Uuid::new_v4();
        let guard = store.lock_wallet(user).await.unwrap();

        let result = store
            .execute_atomic(&AtomicScope::user(user), &|unit: &mut LedgerUnit| {
                unit.credit(user, Decimal::ONE).map(|_| ())
            })
            .await;
        assert!(matches!(result, Err(WalletError::Busy { .. })));
        assert_eq!(row_lock_count(&store), 1);

        drop(guard);
        store
            .execute_atomic(&AtomicScope::user(user), &|unit: &mut LedgerUnit| {
                unit.credit(user, Decimal::ONE).map(|_| ())
            })
            .await
            .unwrap();
        assert_eq!(row_lock_count(&store), 0);
    }

    #[tokio::test]
    async fn test_release_is_compare_and_set() {
        let store = fast_store();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let hold = CreditReservation {
            id: Uuid::new_v4(),
            user_id: user,
            amount: Decimal::from(5),
            purpose: "cert".to_string(),
            reference_id: String::new(),
            expires_at: now + chrono::Duration::minutes(5),
            is_released: false,
            created_at: now,
            released_at: None,
        };
        let id = hold.id;
        store
            .execute_atomic(&AtomicScope::user(user), &move |unit: &mut LedgerUnit| {
                unit.hold(hold.clone());
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.release_reservation(id, now).await.unwrap());
        assert!(!store.release_reservation(id, now).await.unwrap());
        assert!(matches!(
            store.release_reservation(Uuid::new_v4(), now).await,
            Err(WalletError::ReservationNotFound(_))
        ));
    }
}
