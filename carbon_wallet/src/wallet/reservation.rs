//! Time-boxed holds on spendable credits.
//!
//! Holds never move money on their own. They shrink the spendable balance
//! until released, captured or expired. Every release path flips
//! `is_released` with compare-and-set, so a sweep racing a release or a
//! capture has exactly one winner.

use super::{
    engine::BalanceEngine,
    errors::{WalletError, WalletResult},
    models::{CreditReservation, Transaction, UserId, validate_amount},
    store::{AtomicScope, LedgerUnit},
};
use crate::telemetry;
use chrono::Utc;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;
use uuid::Uuid;

/// Places, releases and captures credit reservations
#[derive(Clone)]
pub struct ReservationManager {
    engine: BalanceEngine,
    default_ttl: Duration,
    span: Span,
}

impl ReservationManager {
    pub fn new(engine: BalanceEngine, default_ttl: Duration, span: Span) -> Self {
        Self {
            engine,
            default_ttl,
            span,
        }
    }

    /// Hold `amount` of the user's spendable credits until `ttl` elapses.
    /// An active hold under the same non-blank reference is returned instead
    /// of placing a second one.
    pub async fn reserve(
        &self,
        user_id: UserId,
        amount: Decimal,
        purpose: &str,
        reference_id: &str,
        ttl: Option<Duration>,
    ) -> WalletResult<CreditReservation> {
        const OP: &str = "reserve";
        let amount = validate_amount(amount).map_err(|e| self.engine.rejected(OP, e))?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl)
            .ok()
            .filter(|ttl| *ttl > chrono::Duration::zero())
            .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or_else(|| {
                self.engine
                    .rejected(OP, WalletError::Validation(format!("invalid reservation ttl {ttl:?}")))
            })?;
        let reference_id = reference_id.trim().to_string();

        let committed = self
            .engine
            .run_unit(OP, &AtomicScope::user(user_id), &|unit: &mut LedgerUnit| {
                if unit.active_hold(user_id, &reference_id).is_some() {
                    return Ok(());
                }

                let spendable = unit.spendable(user_id)?;
                if spendable < amount {
                    return Err(WalletError::InsufficientBalance {
                        available: spendable.max(Decimal::ZERO),
                        required: amount,
                    });
                }

                let now = unit.now();
                let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
                    WalletError::Validation(format!("reservation ttl {ttl} is out of range"))
                })?;
                unit.hold(CreditReservation {
                    id: Uuid::new_v4(),
                    user_id,
                    amount,
                    purpose: purpose.to_string(),
                    reference_id: reference_id.clone(),
                    expires_at,
                    is_released: false,
                    created_at: now,
                    released_at: None,
                });
                Ok(())
            })
            .await?;

        if let Some(hold) = committed.holds.into_iter().next() {
            tracing::info!(
                parent: &self.span,
                reservation_id = %hold.id,
                user_id = %user_id,
                amount = %amount,
                expires_at = %hold.expires_at,
                "Credits reserved"
            );
            return Ok(hold);
        }

        committed.reused_holds.into_iter().next().ok_or_else(|| {
            WalletError::Storage("reserve committed without a reservation".to_string())
        })
    }

    /// Release a hold. Returns whether this call released it; repeats are
    /// no-ops.
    pub async fn release(&self, reservation_id: Uuid) -> WalletResult<bool> {
        let released = self
            .engine
            .store()
            .release_reservation(reservation_id, Utc::now())
            .await?;

        tracing::debug!(
            parent: &self.span,
            reservation_id = %reservation_id,
            released = released,
            "Reservation release"
        );
        Ok(released)
    }

    /// Spend the held amount and release the hold in one unit
    pub async fn capture(&self, reservation_id: Uuid, description: &str) -> WalletResult<Transaction> {
        let reservation = self
            .engine
            .store()
            .get_reservation(reservation_id)
            .await?
            .ok_or(WalletError::ReservationNotFound(reservation_id))?;

        let tx = self.engine.capture_hold(&reservation, description).await?;
        tracing::info!(
            parent: &self.span,
            reservation_id = %reservation_id,
            transaction_id = %tx.id,
            "Reservation captured"
        );
        Ok(tx)
    }

    pub async fn get(&self, reservation_id: Uuid) -> WalletResult<CreditReservation> {
        self.engine
            .store()
            .get_reservation(reservation_id)
            .await?
            .ok_or(WalletError::ReservationNotFound(reservation_id))
    }

    /// Available credits minus active holds
    pub async fn spendable(&self, user_id: UserId) -> WalletResult<Decimal> {
        let store = self.engine.store();
        let wallet = store.get_or_create_wallet(user_id).await?;
        let reserved = store.active_reserved_total(user_id, Utc::now()).await?;
        Ok((wallet.available_credits - reserved).max(Decimal::ZERO))
    }

    /// Release every hold past its expiry
    pub async fn sweep_expired(&self) -> WalletResult<Vec<CreditReservation>> {
        let expired = self.engine.store().release_expired(Utc::now()).await?;
        if !expired.is_empty() {
            telemetry::reservations_expired(expired.len());
            tracing::info!(
                parent: &self.span,
                count = expired.len(),
                "Released expired reservations"
            );
        }
        Ok(expired)
    }

    /// Run [`ReservationManager::sweep_expired`] every `interval` until
    /// `shutdown` flips or its sender is dropped
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = ReservationSweeper {
            manager: self.clone(),
            interval,
            shutdown,
        };
        tokio::spawn(sweeper.run())
    }
}

/// Periodic expiry sweep
struct ReservationSweeper {
    manager: ReservationManager,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ReservationSweeper {
    async fn run(mut self) {
        let span = self.manager.span.clone();
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(parent: &span, interval_ms = self.interval.as_millis() as u64, "Reservation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.manager.sweep_expired().await {
                        tracing::error!(parent: &span, error = %e, "Reservation sweep failed");
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(parent: &span, "Reservation sweeper stopped");
    }
}
