//! PostgreSQL plumbing for the ledger.
//!
//! One pool serves the [`PgWalletStore`], the `NOTIFY` publisher and the
//! `LISTEN` source, so it is sized for all three.

use crate::wallet::RetryPolicy;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::Span;

pub mod config;
pub mod repository;
pub mod timeouts;

pub use config::DatabaseConfig;
pub use repository::PgWalletStore;
pub use timeouts::{TimeoutError, TimeoutResult};

/// Pool occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// Shared connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect using `config`'s pool sizing and timeouts
    ///
    /// ```no_run
    /// use carbon_wallet::db::{Database, DatabaseConfig};
    /// use carbon_wallet::wallet::RetryPolicy;
    /// use tracing::Span;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let db = Database::new(&DatabaseConfig::from_env()).await?;
    ///     db.health_check().await?;
    ///     let store = db.wallet_store(RetryPolicy::default(), Span::none());
    ///     store.init_schema().await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = pool_options(config).connect(&config.database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ledger store over this pool
    pub fn wallet_store(&self, retry: RetryPolicy, span: Span) -> PgWalletStore {
        PgWalletStore::new(self.pool.clone(), retry, span)
    }

    /// Round trip to the server, bounded by the default query timeout
    pub async fn health_check(&self) -> TimeoutResult<()> {
        timeouts::with_default_timeout(sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Wait for checked-out connections, then close the pool
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_follow_config() {
        let mut config = DatabaseConfig::development();
        config.min_connections = 50;
        config.max_connections = 8;

        let options = pool_options(&config);
        assert_eq!(options.get_max_connections(), 8);
        assert_eq!(options.get_min_connections(), 8);
        assert_eq!(
            options.get_acquire_timeout(),
            Duration::from_secs(config.connection_timeout_secs)
        );
    }

    #[test]
    fn test_development_config() {
        let config = DatabaseConfig::development();
        assert!(config.database_url.ends_with("/carbon_wallet"));
        assert!(config.min_connections <= config.max_connections);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at DATABASE_URL"]
    async fn test_health_check_and_stats() {
        let db = Database::new(&DatabaseConfig::from_env())
            .await
            .expect("Failed to connect to database");
        db.health_check().await.expect("Health check failed");
        assert!(db.stats().size >= 1);
        db.close().await;
    }
}
