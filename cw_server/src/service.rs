//! Wallet service composition.
//!
//! Wires one store, publisher and inbound event source into the ledger
//! components and the three background tasks: the event dispatcher, the
//! reservation sweeper and the `credit_earned` consumer.

use carbon_wallet::events::{EventConsumer, EventNotifier, EventPublisher, EventSource};
use carbon_wallet::wallet::{
    BalanceEngine, ReservationManager, TransferCoordinator, WalletConfig, WalletStore,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::logging;

/// Ledger components handed to callers
#[derive(Clone)]
pub struct WalletService {
    pub engine: BalanceEngine,
    pub transfers: TransferCoordinator,
    pub reservations: ReservationManager,
}

/// Background tasks owned by a running service
pub struct ServiceTasks {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl WalletService {
    /// Build the components and spawn the background tasks on the current runtime
    pub fn start<S>(
        store: Arc<dyn WalletStore>,
        publisher: Arc<dyn EventPublisher>,
        source: S,
        config: &WalletConfig,
    ) -> (Self, ServiceTasks)
    where
        S: EventSource + 'static,
    {
        let (notifier, dispatcher) =
            EventNotifier::spawn(publisher, config, tracing::info_span!("event_notifier"));

        let engine = BalanceEngine::new(store, notifier, tracing::info_span!("balance_engine"));
        let transfers = TransferCoordinator::new(engine.clone(), tracing::info_span!("transfers"));
        let reservations = ReservationManager::new(
            engine.clone(),
            config.default_reservation_ttl,
            tracing::info_span!("reservations"),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = reservations.spawn_sweeper(config.sweep_interval, shutdown_rx.clone());

        let consumer = EventConsumer::new(
            engine.clone(),
            config.retry,
            tracing::info_span!("event_consumer", channel = %config.consume_channel),
        );
        let consumer = tokio::spawn(async move { consumer.run(source, shutdown_rx).await });

        let service = Self {
            engine,
            transfers,
            reservations,
        };
        let tasks = ServiceTasks {
            shutdown,
            dispatcher,
            sweeper,
            consumer,
        };
        (service, tasks)
    }
}

impl ServiceTasks {
    /// Stop the sweeper and consumer, then let the dispatcher drain.
    ///
    /// The dispatcher only finishes once every [`EventNotifier`] clone is
    /// gone, so `service` is consumed here and callers must not hold other
    /// component clones.
    pub async fn shutdown(self, service: WalletService) {
        tracing::info!("Stopping background tasks");

        // Receivers may already be gone if a task ended early
        let _ = self.shutdown.send(true);

        logging::log_task_exit("sweeper", self.sweeper.await);
        logging::log_task_exit("consumer", self.consumer.await);

        drop(service);
        logging::log_task_exit("dispatcher", self.dispatcher.await);
    }
}
