//! Storage contract for the ledger.
//!
//! Every mutation runs through [`WalletStore::execute_atomic`]. The store
//! locks the wallets named by an [`AtomicScope`] (ascending user ID), loads
//! them together with the user's active holds and any completed transactions
//! matching the scope's idempotency keys into a [`LedgerUnit`], and hands the
//! unit to a synchronous closure. The closure validates and stages changes;
//! when it returns `Ok` the store persists everything staged and commits,
//! otherwise nothing is written.

use super::{
    config::RetryPolicy,
    errors::{WalletError, WalletResult},
    models::{
        CreditReservation, HistoryQuery, ReferenceKey, Transaction, TransactionPage, UserId,
        Wallet,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tracing::Span;
use uuid::Uuid;

/// Body of an atomic unit. May run more than once when the store retries.
pub type AtomicWork<'a> = dyn Fn(&mut LedgerUnit) -> WalletResult<()> + Send + Sync + 'a;

/// Rows an atomic unit locks and the replays it needs to see
#[derive(Debug, Clone, Default)]
pub struct AtomicScope {
    users: Vec<UserId>,
    references: Vec<ReferenceKey>,
}

impl AtomicScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope over a single wallet
    pub fn user(user_id: UserId) -> Self {
        Self::new().with_user(user_id)
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        if let Err(pos) = self.users.binary_search(&user_id) {
            self.users.insert(pos, user_id);
        }
        self
    }

    /// Preload the completed transaction for `key`, if any. `None` is ignored.
    pub fn with_reference(mut self, key: Option<ReferenceKey>) -> Self {
        if let Some(key) = key {
            self = self.with_user(key.user_id);
            if !self.references.contains(&key) {
                self.references.push(key);
            }
        }
        self
    }

    /// Users in lock order
    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    pub fn references(&self) -> &[ReferenceKey] {
        &self.references
    }
}

/// State visible to an atomic unit while its wallets are locked
#[derive(Debug)]
pub struct LedgerUnit {
    now: DateTime<Utc>,
    wallets: BTreeMap<UserId, Wallet>,
    holds: Vec<CreditReservation>,
    replays: Vec<Transaction>,
    dirty: BTreeSet<UserId>,
    staged: Vec<Transaction>,
    new_holds: Vec<CreditReservation>,
    released: Vec<Uuid>,
    returned_replays: Vec<Transaction>,
    reused_holds: Vec<CreditReservation>,
}

impl LedgerUnit {
    /// Built by stores once the scope's rows are locked
    pub fn new(
        now: DateTime<Utc>,
        wallets: Vec<Wallet>,
        holds: Vec<CreditReservation>,
        replays: Vec<Transaction>,
    ) -> Self {
        Self {
            now,
            wallets: wallets.into_iter().map(|w| (w.user_id, w)).collect(),
            holds,
            replays,
            dirty: BTreeSet::new(),
            staged: Vec::new(),
            new_holds: Vec::new(),
            released: Vec::new(),
            returned_replays: Vec::new(),
            reused_holds: Vec::new(),
        }
    }

    /// Timestamp shared by everything this unit writes
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn wallet(&self, user_id: UserId) -> WalletResult<&Wallet> {
        self.wallets
            .get(&user_id)
            .ok_or_else(|| WalletError::Storage(format!("wallet {user_id} not locked by unit")))
    }

    /// Sum of active holds for a user, ignoring holds released in this unit
    pub fn reserved(&self, user_id: UserId) -> Decimal {
        self.holds
            .iter()
            .chain(self.new_holds.iter())
            .filter(|h| h.user_id == user_id && h.is_active(self.now))
            .filter(|h| !self.released.contains(&h.id))
            .map(|h| h.amount)
            .sum()
    }

    /// Available credits minus active holds
    pub fn spendable(&self, user_id: UserId) -> WalletResult<Decimal> {
        Ok(self.wallet(user_id)?.available_credits - self.reserved(user_id))
    }

    /// Completed transaction already recorded under `key`. The returned
    /// record is reported back in [`Committed::replayed`].
    pub fn replay(&mut self, key: Option<&ReferenceKey>) -> Option<Transaction> {
        let key = key?;
        let found = self.replays.iter().find(|tx| key.matches(tx)).cloned()?;
        self.returned_replays.push(found.clone());
        Some(found)
    }

    /// Active hold placed earlier under the same reference. The returned
    /// hold is reported back in [`Committed::reused_holds`].
    pub fn active_hold(&mut self, user_id: UserId, reference_id: &str) -> Option<CreditReservation> {
        if reference_id.trim().is_empty() {
            return None;
        }
        let found = self
            .holds
            .iter()
            .find(|h| {
                h.user_id == user_id
                    && h.reference_id == reference_id
                    && h.is_active(self.now)
                    && !self.released.contains(&h.id)
            })
            .cloned()?;
        self.reused_holds.push(found.clone());
        Some(found)
    }

    /// Add credits; returns the new available balance
    pub fn credit(&mut self, user_id: UserId, amount: Decimal) -> WalletResult<Decimal> {
        let now = self.now;
        let wallet = self.wallet_mut(user_id)?;
        let balance = wallet.apply_credit(amount, now)?;
        Self::check_invariant(wallet)?;
        self.dirty.insert(user_id);
        Ok(balance)
    }

    /// Spend credits, bounded by the spendable balance; returns the new
    /// available balance
    pub fn debit(&mut self, user_id: UserId, amount: Decimal) -> WalletResult<Decimal> {
        let spendable = self.spendable(user_id)?;
        if spendable < amount {
            return Err(WalletError::InsufficientBalance {
                available: spendable.max(Decimal::ZERO),
                required: amount,
            });
        }

        let now = self.now;
        let wallet = self.wallet_mut(user_id)?;
        let balance = wallet.apply_debit(amount, now)?;
        Self::check_invariant(wallet)?;
        self.dirty.insert(user_id);
        Ok(balance)
    }

    /// Stage a transaction for insertion at commit
    pub fn record(&mut self, tx: Transaction) {
        self.staged.push(tx);
    }

    /// Stage a new hold
    pub fn hold(&mut self, reservation: CreditReservation) {
        self.new_holds.push(reservation);
    }

    /// Release an active hold as part of this unit. The store re-checks the
    /// flag at commit so a concurrent release or sweep wins cleanly.
    pub fn release_hold(&mut self, reservation_id: Uuid) -> WalletResult<CreditReservation> {
        let now = self.now;
        let hold = self
            .holds
            .iter()
            .find(|h| h.id == reservation_id && h.is_active(now))
            .filter(|h| !self.released.contains(&h.id))
            .cloned()
            .ok_or(WalletError::ReservationReleased(reservation_id))?;
        self.released.push(reservation_id);
        Ok(hold)
    }

    fn wallet_mut(&mut self, user_id: UserId) -> WalletResult<&mut Wallet> {
        self.wallets
            .get_mut(&user_id)
            .ok_or_else(|| WalletError::Storage(format!("wallet {user_id} not locked by unit")))
    }

    fn check_invariant(wallet: &Wallet) -> WalletResult<()> {
        if wallet.is_consistent() {
            Ok(())
        } else {
            Err(WalletError::Storage(format!(
                "balance invariant violated for wallet {}",
                wallet.user_id
            )))
        }
    }

    /// Hand the staged writes to the store for persistence
    pub fn into_changes(self) -> UnitChanges {
        let dirty = self.dirty;
        UnitChanges {
            wallets: self
                .wallets
                .into_values()
                .filter(|w| dirty.contains(&w.user_id))
                .collect(),
            transactions: self.staged,
            new_holds: self.new_holds,
            released: self.released,
            replayed: self.returned_replays,
            reused_holds: self.reused_holds,
        }
    }
}

/// Writes a successful unit asks the store to persist
#[derive(Debug)]
pub struct UnitChanges {
    pub wallets: Vec<Wallet>,
    pub transactions: Vec<Transaction>,
    pub new_holds: Vec<CreditReservation>,
    pub released: Vec<Uuid>,
    pub replayed: Vec<Transaction>,
    pub reused_holds: Vec<CreditReservation>,
}

impl UnitChanges {
    /// Stamp processing time on staged transactions; stores call this just
    /// before writing them
    pub fn stamp(&mut self, committed_at: DateTime<Utc>) {
        for tx in &mut self.transactions {
            tx.processed_at = Some(committed_at);
        }
    }

    /// Package the outcome once the store has committed
    pub fn into_committed(self, released: Vec<CreditReservation>) -> Committed {
        Committed {
            transactions: self.transactions,
            wallets: self.wallets,
            holds: self.new_holds,
            released,
            replayed: self.replayed,
            reused_holds: self.reused_holds,
        }
    }
}

/// Result of a committed atomic unit
#[derive(Debug, Clone, Default)]
pub struct Committed {
    /// Transactions inserted by the unit, in staging order
    pub transactions: Vec<Transaction>,
    /// Wallets the unit changed, after the change
    pub wallets: Vec<Wallet>,
    /// Holds created by the unit
    pub holds: Vec<CreditReservation>,
    /// Holds released by the unit
    pub released: Vec<CreditReservation>,
    /// Previously committed transactions the unit returned instead of writing
    pub replayed: Vec<Transaction>,
    /// Active holds the unit returned instead of creating
    pub reused_holds: Vec<CreditReservation>,
}

impl Committed {
    pub fn wallet(&self, user_id: UserId) -> Option<&Wallet> {
        self.wallets.iter().find(|w| w.user_id == user_id)
    }

    /// Nothing was written because the unit found an earlier result
    pub fn is_replay(&self) -> bool {
        self.transactions.is_empty() && !self.replayed.is_empty()
    }
}

/// Persistent ledger storage
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Run `work` as one atomic unit over `scope`, retrying on lock
    /// contention and surfacing [`WalletError::Busy`] once the retry budget
    /// is spent.
    async fn execute_atomic(
        &self,
        scope: &AtomicScope,
        work: &AtomicWork<'_>,
    ) -> WalletResult<Committed>;

    /// Wallet for a user, creating an empty one on first sight
    async fn get_or_create_wallet(&self, user_id: UserId) -> WalletResult<Wallet>;

    async fn get_transaction(&self, id: Uuid) -> WalletResult<Option<Transaction>>;

    /// Filtered, newest-first page of a user's transactions
    async fn transaction_history(&self, query: &HistoryQuery) -> WalletResult<TransactionPage>;

    async fn get_reservation(&self, id: Uuid) -> WalletResult<Option<CreditReservation>>;

    /// Flip `is_released` if still unset. Returns whether this call flipped it.
    async fn release_reservation(&self, id: Uuid, at: DateTime<Utc>) -> WalletResult<bool>;

    /// Release every unreleased hold with `expires_at <= now`
    async fn release_expired(&self, now: DateTime<Utc>) -> WalletResult<Vec<CreditReservation>>;

    /// Sum of a user's active holds at `now`
    async fn active_reserved_total(&self, user_id: UserId, now: DateTime<Utc>)
    -> WalletResult<Decimal>;
}

/// Drive `attempt` until it stops reporting contention or the policy runs out
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, span: &Span, mut attempt: F) -> WalletResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WalletResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for n in 1..=max_attempts {
        match attempt().await {
            Err(err) if err.is_contention() => {
                if n == max_attempts {
                    break;
                }
                let backoff = policy.backoff(n);
                tracing::debug!(
                    parent: span,
                    attempt = n,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Atomic unit contended, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }

    tracing::warn!(parent: span, attempts = max_attempts, "Atomic unit gave up after retries");
    metrics::counter!("wallet_busy_total").increment(1);
    Err(WalletError::Busy {
        attempts: max_attempts,
    })
}
