use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::dispatch::DispatchJob;
use crate::engine::lifecycle::TripLifecycle;
use crate::engine::queue::enqueue_dispatch;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::driver::OperationalStatus;
use crate::models::offer::OfferPayload;
use crate::models::trip::Trip;
use crate::observability::metrics::Metrics;
use crate::pricing::RateSource;
use crate::store::RecordStore;
use crate::transport::DeliveryTransport;

pub const TIMEOUT_REASON: &str = "no response within timeout";
pub const DISCONNECT_REASON: &str = "driver disconnected";

/// One outstanding trip offer. The entry in the pending table is the unit
/// of mutual exclusion: whichever of accept/reject/timeout/disconnect
/// removes it first owns the resolution, everyone else no-ops.
struct PendingOffer {
    trip_id: Uuid,
    payload: OfferPayload,
    /// Drivers already excluded for this trip's dispatch cycle, carried so
    /// a rejection can extend it on the way back into the queue.
    excluded: Vec<Uuid>,
    offered_at: Instant,
    timer: AbortHandle,
}

/// Owns the pending-offer table and the accept/reject/timeout/disconnect
/// protocol around it. At most one live offer per driver, enforced by the
/// per-key entry in `pending`.
pub struct NotificationCoordinator {
    pending: DashMap<Uuid, PendingOffer>,
    store: Arc<dyn RecordStore>,
    lifecycle: Arc<TripLifecycle>,
    transport: Arc<dyn DeliveryTransport>,
    rates: Arc<dyn RateSource>,
    dispatch_tx: mpsc::Sender<DispatchJob>,
    metrics: Metrics,
    offer_timeout: Duration,
}

impl NotificationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        lifecycle: Arc<TripLifecycle>,
        transport: Arc<dyn DeliveryTransport>,
        rates: Arc<dyn RateSource>,
        dispatch_tx: mpsc::Sender<DispatchJob>,
        metrics: Metrics,
        offer_timeout: Duration,
    ) -> Self {
        Self {
            pending: DashMap::new(),
            store,
            lifecycle,
            transport,
            rates,
            dispatch_tx,
            metrics,
            offer_timeout,
        }
    }

    pub fn has_pending(&self, driver_id: Uuid) -> bool {
        self.pending.contains_key(&driver_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a trip offer to a driver and arm its timeout. Fails with
    /// `AlreadyPending` if the driver still holds an unresolved offer; the
    /// dispatcher screens for that, so hitting it here is an invariant
    /// violation. A failed delivery resolves immediately as a rejection.
    pub async fn offer(
        self: Arc<Self>,
        driver_id: Uuid,
        trip: &Trip,
        excluded: Vec<Uuid>,
    ) -> Result<(), AppError> {
        let payload = OfferPayload::for_trip(trip, self.offer_timeout.as_millis() as u64);

        match self.pending.entry(driver_id) {
            Entry::Occupied(entry) => {
                error!(
                    driver_id = %driver_id,
                    trip_id = %trip.id,
                    held_trip_id = %entry.get().trip_id,
                    "invariant violation: driver already holds a pending offer"
                );
                return Err(AppError::AlreadyPending(driver_id));
            }
            Entry::Vacant(entry) => {
                let coordinator = Arc::clone(&self);
                let trip_id = trip.id;
                let timeout = self.offer_timeout;
                let timer = tokio::spawn(async move {
                    sleep(timeout).await;
                    coordinator.on_timeout(driver_id, trip_id).await;
                });

                entry.insert(PendingOffer {
                    trip_id,
                    payload: payload.clone(),
                    excluded,
                    offered_at: Instant::now(),
                    timer: timer.abort_handle(),
                });
            }
        }
        self.metrics.offers_outstanding.inc();

        if self.transport.send_offer(driver_id, &payload) {
            info!(driver_id = %driver_id, trip_id = %trip.id, "offer sent");
            return Ok(());
        }

        // A driver who cannot be reached is functionally a driver who rejects.
        warn!(driver_id = %driver_id, trip_id = %trip.id, "offer delivery failed; treating as rejection");
        if let Some(pending) = self.take_pending(driver_id, Some(trip.id)) {
            pending.timer.abort();
            self.metrics.offers_outstanding.dec();
            self.observe(&pending, "undeliverable");
            self.redispatch(trip.id, pending.excluded, driver_id).await;
        }
        Ok(())
    }

    /// Driver accepts the offer. Atomically claims the pending entry, then
    /// prices the approach leg and requests `assigned -> accepted`.
    pub async fn accept(&self, driver_id: Uuid, trip_id: Uuid) -> Result<Trip, AppError> {
        let pending = self
            .take_pending(driver_id, Some(trip_id))
            .ok_or_else(|| self.mismatch(driver_id, trip_id, "accept"))?;
        pending.timer.abort();
        self.metrics.offers_outstanding.dec();

        let driver_position = match self.store.driver_coordinate(driver_id) {
            Ok(position) => position,
            Err(err) => {
                warn!(driver_id = %driver_id, trip_id = %trip_id, error = %err, "accept failed reading driver position; reassigning");
                self.observe(&pending, "error");
                self.redispatch(trip_id, pending.excluded, driver_id).await;
                return Err(err.into());
            }
        };

        let approach_km = haversine_km(&driver_position, &pending.payload.pickup);
        let approach_fee = approach_km * self.rates.approach_rate_per_km();

        let trip = match self
            .lifecycle
            .accept(trip_id, driver_id, approach_km, approach_fee)
        {
            Ok(trip) => trip,
            Err(err) => {
                // The trip moved on (e.g. rider cancelled) between the offer
                // and this accept. The offer is simply no longer valid.
                self.observe(&pending, "conflict");
                self.transport
                    .send_offer_closed(driver_id, trip_id, "offer is no longer valid");
                return Err(err);
            }
        };

        if let Err(err) = self
            .store
            .set_driver_operational(driver_id, OperationalStatus::OnTrip)
        {
            warn!(driver_id = %driver_id, error = %err, "failed to mark driver on trip");
        }

        self.observe(&pending, "accepted");
        info!(driver_id = %driver_id, trip_id = %trip_id, "offer accepted");
        Ok(trip)
    }

    /// Driver rejects the offer. Atomically claims the pending entry and
    /// puts the trip back on the dispatch queue with this driver excluded.
    pub async fn reject(
        &self,
        driver_id: Uuid,
        trip_id: Uuid,
        reason: &str,
    ) -> Result<(), AppError> {
        let pending = self
            .take_pending(driver_id, Some(trip_id))
            .ok_or_else(|| self.mismatch(driver_id, trip_id, "reject"))?;
        pending.timer.abort();
        self.metrics.offers_outstanding.dec();

        self.observe(&pending, "rejected");
        info!(driver_id = %driver_id, trip_id = %trip_id, reason, "offer rejected");
        self.redispatch(trip_id, pending.excluded, driver_id).await;
        Ok(())
    }

    /// Fired by the armed timer. If the entry is still there the offer ran
    /// out of time and is treated exactly like a rejection; if accept or
    /// reject won the race first, this observes nothing and no-ops.
    async fn on_timeout(&self, driver_id: Uuid, trip_id: Uuid) {
        let Some(pending) = self.take_pending(driver_id, Some(trip_id)) else {
            debug!(driver_id = %driver_id, trip_id = %trip_id, "timeout fired after offer was resolved");
            return;
        };
        self.metrics.offers_outstanding.dec();

        self.observe(&pending, "timeout");
        info!(driver_id = %driver_id, trip_id = %trip_id, "offer timed out");
        self.transport
            .send_offer_closed(driver_id, trip_id, TIMEOUT_REASON);
        self.redispatch(trip_id, pending.excluded, driver_id).await;
    }

    /// Invoked when a driver's delivery channel drops. A disconnected
    /// driver cannot hold a trip hostage: any live offer resolves as a
    /// rejection and the trip goes back to dispatch.
    pub async fn cancel_for_driver(&self, driver_id: Uuid) {
        let Some(pending) = self.take_pending(driver_id, None) else {
            return;
        };
        pending.timer.abort();
        self.metrics.offers_outstanding.dec();

        self.observe(&pending, "disconnected");
        info!(
            driver_id = %driver_id,
            trip_id = %pending.trip_id,
            reason = DISCONNECT_REASON,
            "driver disconnected with a live offer; reassigning"
        );
        self.redispatch(pending.trip_id, pending.excluded, driver_id)
            .await;
    }

    /// Invoked when the trip itself is withdrawn (rider cancellation). The
    /// offer is cleared without re-dispatching.
    pub fn revoke(&self, driver_id: Uuid, trip_id: Uuid, reason: &str) {
        let Some(pending) = self.take_pending(driver_id, Some(trip_id)) else {
            return;
        };
        pending.timer.abort();
        self.metrics.offers_outstanding.dec();

        self.observe(&pending, "revoked");
        info!(driver_id = %driver_id, trip_id = %trip_id, reason, "offer revoked");
        self.transport.send_offer_closed(driver_id, trip_id, reason);
    }

    /// The single atomic check-and-clear. `remove_if` runs its predicate
    /// under the per-key shard lock, so exactly one caller can win the
    /// entry for a given (driver, trip) pair.
    fn take_pending(&self, driver_id: Uuid, trip_id: Option<Uuid>) -> Option<PendingOffer> {
        self.pending
            .remove_if(&driver_id, |_, entry| {
                trip_id.is_none_or(|t| entry.trip_id == t)
            })
            .map(|(_, entry)| entry)
    }

    async fn redispatch(&self, trip_id: Uuid, mut excluded: Vec<Uuid>, losing_driver: Uuid) {
        if !excluded.contains(&losing_driver) {
            excluded.push(losing_driver);
        }

        let job = DispatchJob { trip_id, excluded };
        if let Err(err) = enqueue_dispatch(&self.dispatch_tx, &self.metrics, job).await {
            error!(trip_id = %trip_id, error = %err, "failed to re-queue trip for dispatch");
        }
    }

    fn mismatch(&self, driver_id: Uuid, trip_id: Uuid, action: &str) -> AppError {
        warn!(driver_id = %driver_id, trip_id = %trip_id, action, "no matching pending offer");
        AppError::OfferMismatch { driver_id, trip_id }
    }

    fn observe(&self, pending: &PendingOffer, outcome: &str) {
        self.metrics
            .offer_resolution_seconds
            .with_label_values(&[outcome])
            .observe(pending.offered_at.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::{broadcast, mpsc};
    use uuid::Uuid;

    use super::NotificationCoordinator;
    use crate::engine::dispatch::DispatchJob;
    use crate::engine::lifecycle::TripLifecycle;
    use crate::error::AppError;
    use crate::models::driver::{AccountStatus, Coordinate, Driver, OperationalStatus};
    use crate::models::offer::OfferPayload;
    use crate::models::trip::{Trip, TripStatus};
    use crate::observability::metrics::Metrics;
    use crate::pricing::FixedRates;
    use crate::store::{InMemoryStore, RecordStore};
    use crate::transport::DeliveryTransport;

    struct RecordingTransport {
        deliver: AtomicBool,
        closed: Mutex<Vec<(Uuid, Uuid, String)>>,
    }

    impl RecordingTransport {
        fn new(deliver: bool) -> Self {
            Self {
                deliver: AtomicBool::new(deliver),
                closed: Mutex::new(Vec::new()),
            }
        }
    }

    impl DeliveryTransport for RecordingTransport {
        fn send_offer(&self, _driver_id: Uuid, _payload: &OfferPayload) -> bool {
            self.deliver.load(Ordering::SeqCst)
        }

        fn send_offer_closed(&self, driver_id: Uuid, trip_id: Uuid, reason: &str) {
            self.closed
                .lock()
                .unwrap()
                .push((driver_id, trip_id, reason.to_string()));
        }
    }

    struct Rig {
        coordinator: Arc<NotificationCoordinator>,
        lifecycle: Arc<TripLifecycle>,
        store: Arc<InMemoryStore>,
        transport: Arc<RecordingTransport>,
        jobs_rx: mpsc::Receiver<DispatchJob>,
    }

    fn rig(offer_timeout: Duration, deliver: bool) -> Rig {
        let store = Arc::new(InMemoryStore::new());
        let (events, _) = broadcast::channel(64);
        let lifecycle = Arc::new(TripLifecycle::new(store.clone(), events));
        let transport = Arc::new(RecordingTransport::new(deliver));
        let rates = Arc::new(FixedRates {
            approach_per_km: 0.5,
            trip_per_km: 1.2,
        });
        let (dispatch_tx, jobs_rx) = mpsc::channel(64);

        let coordinator = Arc::new(NotificationCoordinator::new(
            store.clone(),
            lifecycle.clone(),
            transport.clone(),
            rates,
            dispatch_tx,
            Metrics::new(),
            offer_timeout,
        ));

        Rig {
            coordinator,
            lifecycle,
            store,
            transport,
            jobs_rx,
        }
    }

    fn register_driver(rig: &Rig) -> Uuid {
        let driver = Driver {
            id: Uuid::new_v4(),
            name: "test-driver".to_string(),
            location: Coordinate {
                lat: 36.81,
                lng: 10.18,
            },
            operational: OperationalStatus::Online,
            account: AccountStatus::Verified,
            updated_at: Utc::now(),
        };
        rig.store.insert_driver(driver.clone()).unwrap();
        driver.id
    }

    async fn assigned_and_offered(rig: &Rig) -> (Trip, Uuid) {
        let driver_id = register_driver(rig);
        let trip = rig
            .lifecycle
            .create(
                Uuid::new_v4(),
                Coordinate {
                    lat: 36.80,
                    lng: 10.18,
                },
                None,
                Coordinate {
                    lat: 36.85,
                    lng: 10.20,
                },
                None,
                5.0,
                6.0,
            )
            .unwrap();
        let trip = rig.lifecycle.assign(trip.id, driver_id).unwrap();
        rig.coordinator
            .clone()
            .offer(driver_id, &trip, Vec::new())
            .await
            .unwrap();
        (trip, driver_id)
    }

    #[tokio::test]
    async fn accept_resolves_the_offer_and_prices_the_approach() {
        let mut rig = rig(Duration::from_secs(5), true);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        let accepted = rig.coordinator.accept(driver_id, trip.id).await.unwrap();
        assert_eq!(accepted.status, TripStatus::Accepted);
        assert!(accepted.approach_km.is_some());
        let km = accepted.approach_km.unwrap();
        assert!((accepted.approach_fee.unwrap() - km * 0.5).abs() < 1e-9);

        assert!(!rig.coordinator.has_pending(driver_id));
        assert!(rig.jobs_rx.try_recv().is_err());

        let driver = rig.store.load_driver(driver_id).unwrap();
        assert_eq!(driver.operational, OperationalStatus::OnTrip);
    }

    #[tokio::test]
    async fn reject_requeues_the_trip_with_the_driver_excluded() {
        let mut rig = rig(Duration::from_secs(5), true);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        rig.coordinator
            .reject(driver_id, trip.id, "too far")
            .await
            .unwrap();

        let job = rig.jobs_rx.recv().await.unwrap();
        assert_eq!(job.trip_id, trip.id);
        assert!(job.excluded.contains(&driver_id));
        assert!(!rig.coordinator.has_pending(driver_id));

        // Status only changes once a new driver is assigned or dispatch
        // runs out of candidates.
        let trip = rig.store.load_trip(trip.id).unwrap();
        assert_eq!(trip.status, TripStatus::Assigned);
    }

    #[tokio::test]
    async fn timeout_is_equivalent_to_a_rejection() {
        let mut rig = rig(Duration::from_millis(30), true);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        let job = tokio::time::timeout(Duration::from_secs(2), rig.jobs_rx.recv())
            .await
            .expect("timeout should requeue the trip")
            .unwrap();
        assert_eq!(job.trip_id, trip.id);
        assert!(job.excluded.contains(&driver_id));
        assert!(!rig.coordinator.has_pending(driver_id));

        let closed = rig.transport.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].2, super::TIMEOUT_REASON);
    }

    #[tokio::test]
    async fn accept_after_timeout_observes_the_entry_already_cleared() {
        let mut rig = rig(Duration::from_millis(30), true);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        let _ = tokio::time::timeout(Duration::from_secs(2), rig.jobs_rx.recv()).await;

        let err = rig.coordinator.accept(driver_id, trip.id).await.unwrap_err();
        assert!(matches!(err, AppError::OfferMismatch { .. }));
    }

    #[tokio::test]
    async fn second_offer_to_the_same_driver_fails_already_pending() {
        let rig = rig(Duration::from_secs(5), true);
        let (_, driver_id) = assigned_and_offered(&rig).await;

        let other = rig
            .lifecycle
            .create(
                Uuid::new_v4(),
                Coordinate {
                    lat: 36.82,
                    lng: 10.19,
                },
                None,
                Coordinate {
                    lat: 36.86,
                    lng: 10.22,
                },
                None,
                4.0,
                5.0,
            )
            .unwrap();

        let err = rig
            .coordinator
            .clone()
            .offer(driver_id, &other, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyPending(_)));
    }

    #[tokio::test]
    async fn failed_delivery_resolves_as_an_immediate_rejection() {
        let mut rig = rig(Duration::from_secs(5), false);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        let job = rig.jobs_rx.recv().await.unwrap();
        assert_eq!(job.trip_id, trip.id);
        assert!(job.excluded.contains(&driver_id));
        assert!(!rig.coordinator.has_pending(driver_id));
    }

    #[tokio::test]
    async fn disconnect_reassigns_a_live_offer() {
        let mut rig = rig(Duration::from_secs(5), true);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        rig.coordinator.cancel_for_driver(driver_id).await;

        let job = rig.jobs_rx.recv().await.unwrap();
        assert_eq!(job.trip_id, trip.id);
        assert!(job.excluded.contains(&driver_id));

        // No pending offer: further disconnects are a no-op.
        rig.coordinator.cancel_for_driver(driver_id).await;
        assert!(rig.jobs_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn revoke_clears_the_offer_without_requeueing() {
        let mut rig = rig(Duration::from_secs(5), true);
        let (trip, driver_id) = assigned_and_offered(&rig).await;

        rig.coordinator
            .revoke(driver_id, trip.id, "rider cancelled");

        assert!(!rig.coordinator.has_pending(driver_id));
        assert!(rig.jobs_rx.try_recv().is_err());
        let closed = rig.transport.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accept_and_reject_resolve_exactly_once() {
        for _ in 0..50 {
            let mut rig = rig(Duration::from_secs(5), true);
            let (trip, driver_id) = assigned_and_offered(&rig).await;
            let trip_id = trip.id;

            let accepting = {
                let coordinator = rig.coordinator.clone();
                tokio::spawn(async move { coordinator.accept(driver_id, trip_id).await.is_ok() })
            };
            let rejecting = {
                let coordinator = rig.coordinator.clone();
                tokio::spawn(async move {
                    coordinator.reject(driver_id, trip_id, "busy").await.is_ok()
                })
            };

            let accepted = accepting.await.unwrap();
            let rejected = rejecting.await.unwrap();

            // Exactly one side effect, never zero, never two.
            assert!(accepted ^ rejected);
            assert!(!rig.coordinator.has_pending(driver_id));

            let requeued = rig.jobs_rx.try_recv().is_ok();
            assert_eq!(requeued, rejected);

            let trip = rig.store.load_trip(trip_id).unwrap();
            let expected = if accepted {
                TripStatus::Accepted
            } else {
                TripStatus::Assigned
            };
            assert_eq!(trip.status, expected);
        }
    }
}
