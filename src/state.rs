use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::{Config, DispatchConfig};
use crate::engine::dispatch::DispatchJob;
use crate::engine::lifecycle::TripLifecycle;
use crate::engine::notify::NotificationCoordinator;
use crate::engine::reachability::ReachabilityRegistry;
use crate::models::trip::TripEvent;
use crate::observability::metrics::Metrics;
use crate::pricing::{FixedRates, RateSource};
use crate::store::{InMemoryStore, RecordStore};
use crate::transport::{DeliveryTransport, WsTransport};

pub struct AppState {
    pub config: DispatchConfig,
    pub store: Arc<dyn RecordStore>,
    pub registry: ReachabilityRegistry,
    pub lifecycle: Arc<TripLifecycle>,
    pub coordinator: Arc<NotificationCoordinator>,
    pub rates: Arc<dyn RateSource>,
    /// Concrete WebSocket transport for the socket handlers; the
    /// coordinator only sees it through the `DeliveryTransport` trait.
    pub ws: Arc<WsTransport>,
    pub dispatch_tx: mpsc::Sender<DispatchJob>,
    pub trip_events_tx: broadcast::Sender<TripEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<DispatchJob>) {
        let ws = Arc::new(WsTransport::new());
        Self::build(
            config.dispatch.clone(),
            config.dispatch_queue_size,
            config.event_buffer_size,
            ws.clone(),
            ws,
        )
    }

    /// Test constructor: swap the delivery transport for a double while the
    /// rest of the wiring stays identical.
    pub fn with_transport(
        dispatch: DispatchConfig,
        queue_size: usize,
        event_buffer_size: usize,
        transport: Arc<dyn DeliveryTransport>,
    ) -> (Self, mpsc::Receiver<DispatchJob>) {
        Self::build(
            dispatch,
            queue_size,
            event_buffer_size,
            transport,
            Arc::new(WsTransport::new()),
        )
    }

    fn build(
        config: DispatchConfig,
        queue_size: usize,
        event_buffer_size: usize,
        transport: Arc<dyn DeliveryTransport>,
        ws: Arc<WsTransport>,
    ) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(queue_size);
        let (trip_events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
        let metrics = Metrics::new();
        let lifecycle = Arc::new(TripLifecycle::new(store.clone(), trip_events_tx.clone()));
        let rates: Arc<dyn RateSource> = Arc::new(FixedRates::from_config(&config));

        let coordinator = Arc::new(NotificationCoordinator::new(
            store.clone(),
            lifecycle.clone(),
            transport,
            rates.clone(),
            dispatch_tx.clone(),
            metrics.clone(),
            config.offer_timeout,
        ));

        (
            Self {
                config,
                store,
                registry: ReachabilityRegistry::new(),
                lifecycle,
                coordinator,
                rates,
                ws,
                dispatch_tx,
                trip_events_tx,
                metrics,
            },
            dispatch_rx,
        )
    }

    /// Transport hook: a driver's delivery channel came up.
    pub fn on_connect(&self, driver_id: Uuid) {
        self.registry.connect(driver_id);
        self.metrics
            .reachable_drivers
            .set(self.registry.connected_count() as i64);
    }

    /// Transport hook: a driver's delivery channel dropped. Any offer the
    /// driver still held resolves as a rejection so the trip is reassigned.
    pub async fn on_disconnect(&self, driver_id: Uuid) {
        self.registry.disconnect(driver_id);
        self.metrics
            .reachable_drivers
            .set(self.registry.connected_count() as i64);
        self.coordinator.cancel_for_driver(driver_id).await;
    }
}
