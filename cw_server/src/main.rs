//! Carbon wallet ledger service.
//!
//! Connects to PostgreSQL, ensures the schema, and runs the event
//! dispatcher, reservation sweeper and activity consumer until Ctrl+C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Error;
use carbon_wallet::db::Database;
use carbon_wallet::events::{PgListenerSource, PgNotifyPublisher};
use cw_server::{ServerConfig, WalletService, logging, metrics};
use pico_args::Arguments;
use tracing::info;

const HELP: &str = "\
Run the carbon wallet ledger service

USAGE:
  cw_server [OPTIONS]

OPTIONS:
  --db-url     URL         Database connection string  [default: env DATABASE_URL or postgres://postgres@localhost/carbon_wallet]
  --metrics    IP:PORT     Prometheus scrape address   [default: env METRICS_ADDR, disabled when unset]

FLAGS:
  -h, --help               Print help information

ENVIRONMENT:
  DATABASE_URL             PostgreSQL connection string
  METRICS_ADDR             Prometheus scrape address (e.g., 0.0.0.0:9090)
  EVENT_PUBLISH_CHANNEL    NOTIFY channel for ledger events [default: wallet_events]
  EVENT_CONSUME_CHANNEL    LISTEN channel for credit_earned [default: activity_events]
  RUST_LOG                 Log filter [default: info,sqlx=warn]
  (See .env file for all configuration options)
";

struct Args {
    database_url: Option<String>,
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let args = Args {
        database_url: pargs.opt_value_from_str("--db-url")?,
        metrics_addr: pargs.opt_value_from_str("--metrics")?,
    };

    logging::init();

    let config = ServerConfig::from_env(args.database_url, args.metrics_addr)?;
    config.validate()?;

    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics(addr).map_err(|e| anyhow::anyhow!(e))?;
        info!(%addr, "Prometheus metrics exported");
    }

    info!("Connecting to database");
    let db = Database::new(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
    db.health_check().await?;
    let stats = db.stats();
    metrics::db_connections_active(stats.size);
    info!(size = stats.size, idle = stats.idle, "Database connected successfully");

    let store = db.wallet_store(config.wallet.retry, tracing::info_span!("pg_wallet_store"));
    store.init_schema().await?;
    info!("Ledger schema ready");

    let publisher = PgNotifyPublisher::new(db.pool().clone(), config.wallet.publish_channel.clone());
    let source = PgListenerSource::connect(db.pool(), &config.wallet.consume_channel)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to listen on {}: {}",
                config.wallet.consume_channel,
                e
            )
        })?;

    let (service, tasks) = WalletService::start(
        Arc::new(store),
        Arc::new(publisher),
        source,
        &config.wallet,
    );

    info!(
        publish_channel = %config.wallet.publish_channel,
        consume_channel = %config.wallet.consume_channel,
        "Wallet service is running. Press Ctrl+C to stop."
    );

    shutdown_signal().await?;

    info!("Shutting down wallet service...");
    tasks.shutdown(service).await;
    db.close().await;

    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() -> Result<(), Error> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CTRL+C signal handler: {}", e))
}
