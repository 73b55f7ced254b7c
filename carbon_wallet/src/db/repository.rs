//! PostgreSQL implementation of [`WalletStore`].
//!
//! An atomic unit is one database transaction: `lock_timeout` is set locally,
//! missing wallet rows are inserted, then every wallet in scope is locked
//! `FOR UPDATE` in ascending user ID order. Lock timeouts, deadlocks,
//! serialization failures and idempotency index conflicts surface as
//! contention and are retried.

use crate::wallet::{
    AtomicScope, AtomicWork, Committed, CreditReservation, HistoryQuery, LedgerUnit, Metadata,
    RetryPolicy, Transaction, TransactionPage, UserId, Wallet, WalletError, WalletResult,
    WalletStore, with_retry,
};
use super::timeouts::{with_default_timeout, with_long_timeout};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::Span;
use uuid::Uuid;

const WALLET_COLUMNS: &str =
    "user_id, available_credits, pending_credits, total_earned, total_spent, last_updated, created_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, tx_type, status, amount, balance_after, source, \
     description, reference_id, from_user_id, to_user_id, metadata, processed_at, created_at";

const RESERVATION_COLUMNS: &str =
    "id, user_id, amount, purpose, reference_id, expires_at, is_released, created_at, released_at";

/// Wallet store backed by PostgreSQL
#[derive(Clone)]
pub struct PgWalletStore {
    pool: PgPool,
    retry: RetryPolicy,
    span: Span,
}

impl PgWalletStore {
    pub fn new(pool: PgPool, retry: RetryPolicy, span: Span) -> Self {
        Self { pool, retry, span }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables and indexes if they do not exist
    pub async fn init_schema(&self) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                user_id UUID PRIMARY KEY,
                available_credits NUMERIC(20, 6) NOT NULL DEFAULT 0,
                pending_credits NUMERIC(20, 6) NOT NULL DEFAULT 0,
                total_earned NUMERIC(20, 6) NOT NULL DEFAULT 0,
                total_spent NUMERIC(20, 6) NOT NULL DEFAULT 0,
                last_updated TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT wallets_available_non_negative CHECK (available_credits >= 0),
                CONSTRAINT wallets_pending_non_negative CHECK (pending_credits >= 0),
                CONSTRAINT wallets_balance_identity
                    CHECK (available_credits = total_earned - total_spent)
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL REFERENCES wallets(user_id),
                tx_type TEXT NOT NULL,
                status TEXT NOT NULL,
                amount NUMERIC(20, 6) NOT NULL CHECK (amount > 0),
                balance_after NUMERIC(20, 6) NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                reference_id TEXT NOT NULL DEFAULT '',
                from_user_id UUID,
                to_user_id UUID,
                metadata JSONB NOT NULL DEFAULT '[]',
                processed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_transactions_reference
                ON wallet_transactions(user_id, reference_id, tx_type)
                WHERE status = 'completed' AND reference_id <> '';
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_wallet_transactions_user_created
                ON wallet_transactions(user_id, created_at DESC);
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_reservations (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL REFERENCES wallets(user_id),
                amount NUMERIC(20, 6) NOT NULL CHECK (amount > 0),
                purpose TEXT NOT NULL,
                reference_id TEXT NOT NULL DEFAULT '',
                expires_at TIMESTAMPTZ NOT NULL,
                is_released BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                released_at TIMESTAMPTZ
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_credit_reservations_active
                ON credit_reservations(user_id, expires_at) WHERE NOT is_released;
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_credit_reservations_expiry
                ON credit_reservations(expires_at) WHERE NOT is_released;
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(parent: &self.span, "Ledger schema ready");
        Ok(())
    }

    async fn attempt_atomic(
        &self,
        scope: &AtomicScope,
        work: &AtomicWork<'_>,
    ) -> WalletResult<Committed> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.retry.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        let now = Utc::now();

        let mut wallets = Vec::with_capacity(scope.users().len());
        for user_id in scope.users() {
            sqlx::query(
                "INSERT INTO wallets (user_id, last_updated, created_at)
                 VALUES ($1, $2, $2)
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query(&format!(
                "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1 FOR UPDATE"
            ))
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            wallets.push(wallet_from_row(&row)?);
        }

        let holds = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM credit_reservations
             WHERE user_id = ANY($1) AND NOT is_released AND expires_at > $2"
        ))
        .bind(scope.users())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(reservation_from_row)
        .collect::<WalletResult<Vec<_>>>()?;

        let mut replays = Vec::new();
        for key in scope.references() {
            let row = sqlx::query(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions
                 WHERE user_id = $1 AND reference_id = $2 AND tx_type = $3
                   AND status = 'completed'"
            ))
            .bind(key.user_id)
            .bind(&key.reference_id)
            .bind(key.tx_type.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                replays.push(transaction_from_row(&row)?);
            }
        }

        let mut unit = LedgerUnit::new(now, wallets, holds, replays);
        // Dropping `tx` on error rolls back
        work(&mut unit)?;

        let mut changes = unit.into_changes();
        let committed_at = Utc::now();
        changes.stamp(committed_at);

        for wallet in &changes.wallets {
            sqlx::query(
                "UPDATE wallets
                 SET available_credits = $2, pending_credits = $3, total_earned = $4,
                     total_spent = $5, last_updated = $6
                 WHERE user_id = $1",
            )
            .bind(wallet.user_id)
            .bind(wallet.available_credits)
            .bind(wallet.pending_credits)
            .bind(wallet.total_earned)
            .bind(wallet.total_spent)
            .bind(wallet.last_updated)
            .execute(&mut *tx)
            .await?;
        }

        for record in &changes.transactions {
            sqlx::query(&format!(
                "INSERT INTO wallet_transactions ({TRANSACTION_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
            ))
            .bind(record.id)
            .bind(record.user_id)
            .bind(record.tx_type.as_str())
            .bind(record.status.as_str())
            .bind(record.amount)
            .bind(record.balance_after)
            .bind(&record.source)
            .bind(&record.description)
            .bind(&record.reference_id)
            .bind(record.from_user_id)
            .bind(record.to_user_id)
            .bind(Json(&record.metadata))
            .bind(record.processed_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for hold in &changes.new_holds {
            sqlx::query(&format!(
                "INSERT INTO credit_reservations ({RESERVATION_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .bind(hold.id)
            .bind(hold.user_id)
            .bind(hold.amount)
            .bind(&hold.purpose)
            .bind(&hold.reference_id)
            .bind(hold.expires_at)
            .bind(hold.is_released)
            .bind(hold.created_at)
            .bind(hold.released_at)
            .execute(&mut *tx)
            .await?;
        }

        let mut released = Vec::with_capacity(changes.released.len());
        for id in &changes.released {
            let row = sqlx::query(&format!(
                "UPDATE credit_reservations SET is_released = TRUE, released_at = $2
                 WHERE id = $1 AND NOT is_released
                 RETURNING {RESERVATION_COLUMNS}"
            ))
            .bind(id)
            .bind(committed_at)
            .fetch_optional(&mut *tx)
            .await?;
            match row {
                Some(row) => released.push(reservation_from_row(&row)?),
                None => return Err(WalletError::ReservationReleased(*id)),
            }
        }

        tx.commit().await?;
        Ok(changes.into_committed(released))
    }
}

#[async_trait]
impl WalletStore for PgWalletStore {
    async fn execute_atomic(
        &self,
        scope: &AtomicScope,
        work: &AtomicWork<'_>,
    ) -> WalletResult<Committed> {
        with_retry(&self.retry, &self.span, || self.attempt_atomic(scope, work)).await
    }

    async fn get_or_create_wallet(&self, user_id: UserId) -> WalletResult<Wallet> {
        let now = Utc::now();
        with_default_timeout(
            sqlx::query(
                "INSERT INTO wallets (user_id, last_updated, created_at)
                 VALUES ($1, $2, $2)
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;

        let row = with_default_timeout(
            sqlx::query(&format!(
                "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1"
            ))
            .bind(user_id)
            .fetch_one(&self.pool),
        )
        .await?;
        wallet_from_row(&row)
    }

    async fn get_transaction(&self, id: Uuid) -> WalletResult<Option<Transaction>> {
        let row = with_default_timeout(
            sqlx::query(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transaction_history(&self, query: &HistoryQuery) -> WalletResult<TransactionPage> {
        let query = query.clone().normalized();
        let tx_type = query.tx_type.map(|t| t.as_str());
        let status = query.status.map(|s| s.as_str());

        const FILTER: &str = "WHERE user_id = $1
               AND ($2::TEXT IS NULL OR tx_type = $2)
               AND ($3::TEXT IS NULL OR status = $3)
               AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
               AND ($5::TIMESTAMPTZ IS NULL OR created_at < $5)";

        let total: i64 = with_default_timeout(
            sqlx::query(&format!(
                "SELECT COUNT(*) AS total FROM wallet_transactions {FILTER}"
            ))
            .bind(query.user_id)
            .bind(tx_type)
            .bind(status)
            .bind(query.from)
            .bind(query.to)
            .fetch_one(&self.pool),
        )
        .await?
        .try_get("total")?;

        let transactions = with_default_timeout(
            sqlx::query(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions {FILTER}
                 ORDER BY created_at DESC, id DESC
                 LIMIT $6 OFFSET $7"
            ))
            .bind(query.user_id)
            .bind(tx_type)
            .bind(status)
            .bind(query.from)
            .bind(query.to)
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool),
        )
        .await?
        .iter()
        .map(transaction_from_row)
        .collect::<WalletResult<Vec<_>>>()?;

        Ok(TransactionPage {
            transactions,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    async fn get_reservation(&self, id: Uuid) -> WalletResult<Option<CreditReservation>> {
        let row = with_default_timeout(
            sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM credit_reservations WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn release_reservation(&self, id: Uuid, at: DateTime<Utc>) -> WalletResult<bool> {
        let result = with_default_timeout(
            sqlx::query(
                "UPDATE credit_reservations SET is_released = TRUE, released_at = $2
                 WHERE id = $1 AND NOT is_released",
            )
            .bind(id)
            .bind(at)
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = with_default_timeout(
            sqlx::query("SELECT 1 FROM credit_reservations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(WalletError::ReservationNotFound(id)),
        }
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> WalletResult<Vec<CreditReservation>> {
        with_long_timeout(
            sqlx::query(&format!(
                "UPDATE credit_reservations SET is_released = TRUE, released_at = $1
                 WHERE NOT is_released AND expires_at <= $1
                 RETURNING {RESERVATION_COLUMNS}"
            ))
            .bind(now)
            .fetch_all(&self.pool),
        )
        .await?
        .iter()
        .map(reservation_from_row)
        .collect()
    }

    async fn active_reserved_total(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> WalletResult<Decimal> {
        let row = with_default_timeout(
            sqlx::query(
                "SELECT COALESCE(SUM(amount), 0) AS total FROM credit_reservations
                 WHERE user_id = $1 AND NOT is_released AND expires_at > $2",
            )
            .bind(user_id)
            .bind(now)
            .fetch_one(&self.pool),
        )
        .await?;
        Ok(row.try_get("total")?)
    }
}

fn wallet_from_row(row: &PgRow) -> WalletResult<Wallet> {
    Ok(Wallet {
        user_id: row.try_get("user_id")?,
        available_credits: row.try_get("available_credits")?,
        pending_credits: row.try_get("pending_credits")?,
        total_earned: row.try_get("total_earned")?,
        total_spent: row.try_get("total_spent")?,
        last_updated: row.try_get("last_updated")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> WalletResult<Transaction> {
    let tx_type: String = row.try_get("tx_type")?;
    let status: String = row.try_get("status")?;
    let metadata: Json<Metadata> = row.try_get("metadata")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tx_type: tx_type.parse()?,
        status: status.parse()?,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        source: row.try_get("source")?,
        description: row.try_get("description")?,
        reference_id: row.try_get("reference_id")?,
        from_user_id: row.try_get("from_user_id")?,
        to_user_id: row.try_get("to_user_id")?,
        metadata: metadata.0,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn reservation_from_row(row: &PgRow) -> WalletResult<CreditReservation> {
    Ok(CreditReservation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        purpose: row.try_get("purpose")?,
        reference_id: row.try_get("reference_id")?,
        expires_at: row.try_get("expires_at")?,
        is_released: row.try_get("is_released")?,
        created_at: row.try_get("created_at")?,
        released_at: row.try_get("released_at")?,
    })
}
