//! Structured logging configuration.

use tokio::task::JoinError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Initialize structured logging
///
/// Levels come from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
///
/// # Example
///
/// ```no_run
/// use cw_server::logging;
///
/// #[tokio::main]
/// async fn main() {
///     logging::init();
///     tracing::info!("Server starting");
/// }
/// ```
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Structured logging initialized");
}

/// Log how a background task ended
///
/// # Arguments
///
/// * `task` - Task name (`sweeper`, `consumer`, `dispatcher`)
/// * `result` - Result of awaiting the task's join handle
pub fn log_task_exit(task: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => tracing::info!(task = task, "Background task stopped"),
        Err(e) if e.is_cancelled() => tracing::warn!(task = task, "Background task cancelled"),
        Err(e) => tracing::error!(task = task, error = %e, "Background task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let _ = EnvFilter::new(DEFAULT_FILTER);
        assert!(DEFAULT_FILTER.contains("sqlx=warn"));
    }

    #[tokio::test]
    async fn test_log_task_exit() {
        // Just ensure it doesn't panic
        log_task_exit("ok_task", tokio::spawn(async {}).await);

        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        log_task_exit("cancelled_task", handle.await);
    }
}
