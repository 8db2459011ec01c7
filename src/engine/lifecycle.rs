use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::Coordinate;
use crate::models::trip::{Trip, TripEvent, TripEventKind, TripStatus};
use crate::store::RecordStore;

/// The authoritative trip lifecycle. Every status mutation goes through
/// here: each transition is validated against the freshly loaded status and
/// written back with compare-and-swap, so a caller racing a concurrent
/// transition loses with a conflict instead of silently succeeding.
pub struct TripLifecycle {
    store: Arc<dyn RecordStore>,
    events: broadcast::Sender<TripEvent>,
}

impl TripLifecycle {
    pub fn new(store: Arc<dyn RecordStore>, events: broadcast::Sender<TripEvent>) -> Self {
        Self { store, events }
    }

    pub fn create(
        &self,
        rider_id: Uuid,
        pickup: Coordinate,
        pickup_address: Option<String>,
        destination: Coordinate,
        destination_address: Option<String>,
        estimated_km: f64,
        estimated_fare: f64,
    ) -> Result<Trip, AppError> {
        let trip = Trip {
            id: Uuid::new_v4(),
            rider_id,
            driver_id: None,
            pickup,
            pickup_address,
            destination,
            destination_address,
            estimated_km,
            estimated_fare,
            approach_km: None,
            approach_fee: None,
            status: TripStatus::Requested,
            requested_at: Utc::now(),
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
        };

        self.store.insert_trip(trip.clone())?;
        self.emit(&trip, TripEventKind::Requested);
        Ok(trip)
    }

    /// `requested -> assigned`, or `assigned -> assigned` with a new driver
    /// (reassignment after a reject/timeout). `assigned_at` is set on the
    /// first assignment only.
    pub fn assign(&self, trip_id: Uuid, driver_id: Uuid) -> Result<Trip, AppError> {
        let mut trip = self.store.load_trip(trip_id)?;

        match trip.status {
            TripStatus::Requested | TripStatus::Assigned => {}
            other => {
                return Err(AppError::Conflict(format!(
                    "cannot assign trip {trip_id} in status {other:?}"
                )));
            }
        }

        let expected = trip.status;
        trip.driver_id = Some(driver_id);
        trip.status = TripStatus::Assigned;
        trip.assigned_at.get_or_insert_with(Utc::now);
        self.store.save_trip(&trip, expected)?;

        info!(trip_id = %trip_id, driver_id = %driver_id, "trip assigned");
        self.emit(&trip, TripEventKind::DriverAssigned);
        Ok(trip)
    }

    /// `assigned -> accepted`, guarded on the assigned driver. Records the
    /// approach leg the driver will ride to reach the pickup.
    pub fn accept(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        approach_km: f64,
        approach_fee: f64,
    ) -> Result<Trip, AppError> {
        let mut trip = self.store.load_trip(trip_id)?;
        Self::check_transition(&trip, TripStatus::Assigned, driver_id, "accept")?;

        trip.status = TripStatus::Accepted;
        trip.accepted_at.get_or_insert_with(Utc::now);
        trip.approach_km = Some(approach_km);
        trip.approach_fee = Some(approach_fee);
        self.store.save_trip(&trip, TripStatus::Assigned)?;

        info!(trip_id = %trip_id, driver_id = %driver_id, approach_km, "trip accepted");
        self.emit(&trip, TripEventKind::Accepted);
        Ok(trip)
    }

    /// `accepted -> started`, guarded on the assigned driver.
    pub fn start(&self, trip_id: Uuid, driver_id: Uuid) -> Result<Trip, AppError> {
        let mut trip = self.store.load_trip(trip_id)?;
        Self::check_transition(&trip, TripStatus::Accepted, driver_id, "start")?;

        trip.status = TripStatus::Started;
        trip.started_at.get_or_insert_with(Utc::now);
        self.store.save_trip(&trip, TripStatus::Accepted)?;

        info!(trip_id = %trip_id, driver_id = %driver_id, "trip started");
        self.emit(&trip, TripEventKind::Started);
        Ok(trip)
    }

    /// `started -> completed`, guarded on the assigned driver.
    pub fn complete(&self, trip_id: Uuid, driver_id: Uuid) -> Result<Trip, AppError> {
        let mut trip = self.store.load_trip(trip_id)?;
        Self::check_transition(&trip, TripStatus::Started, driver_id, "complete")?;

        trip.status = TripStatus::Completed;
        trip.completed_at.get_or_insert_with(Utc::now);
        self.store.save_trip(&trip, TripStatus::Started)?;

        info!(trip_id = %trip_id, driver_id = %driver_id, "trip completed");
        self.emit(&trip, TripEventKind::Completed);
        Ok(trip)
    }

    /// Any non-terminal status -> `cancelled`. Clears the driver link and
    /// records the reason; terminal statuses are absorbing.
    pub fn cancel(&self, trip_id: Uuid, reason: &str) -> Result<Trip, AppError> {
        let mut trip = self.store.load_trip(trip_id)?;

        if trip.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "cannot cancel trip {trip_id} in status {:?}",
                trip.status
            )));
        }

        let expected = trip.status;
        trip.status = TripStatus::Cancelled;
        trip.driver_id = None;
        trip.cancelled_at.get_or_insert_with(Utc::now);
        trip.cancel_reason = Some(reason.to_string());
        self.store.save_trip(&trip, expected)?;

        info!(trip_id = %trip_id, reason, "trip cancelled");
        self.emit(&trip, TripEventKind::Cancelled);
        Ok(trip)
    }

    fn check_transition(
        trip: &Trip,
        expected: TripStatus,
        driver_id: Uuid,
        action: &str,
    ) -> Result<(), AppError> {
        if trip.status != expected {
            return Err(AppError::Conflict(format!(
                "cannot {action} trip {} in status {:?}",
                trip.id, trip.status
            )));
        }

        if trip.driver_id != Some(driver_id) {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is not assigned to trip {}",
                trip.id
            )));
        }

        Ok(())
    }

    fn emit(&self, trip: &Trip, kind: TripEventKind) {
        let _ = self.events.send(TripEvent {
            trip_id: trip.id,
            driver_id: trip.driver_id,
            kind,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::TripLifecycle;
    use crate::error::AppError;
    use crate::models::driver::Coordinate;
    use crate::models::trip::{Trip, TripStatus};
    use crate::store::InMemoryStore;

    fn lifecycle() -> TripLifecycle {
        let (events, _) = broadcast::channel(16);
        TripLifecycle::new(Arc::new(InMemoryStore::new()), events)
    }

    fn new_trip(lifecycle: &TripLifecycle) -> Trip {
        lifecycle
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
            .unwrap()
    }

    #[test]
    fn happy_path_walks_every_status() {
        let lc = lifecycle();
        let trip = new_trip(&lc);
        let driver = Uuid::new_v4();

        let trip = lc.assign(trip.id, driver).unwrap();
        assert_eq!(trip.status, TripStatus::Assigned);
        assert_eq!(trip.driver_id, Some(driver));
        assert!(trip.assigned_at.is_some());

        let trip = lc.accept(trip.id, driver, 1.2, 0.6).unwrap();
        assert_eq!(trip.status, TripStatus::Accepted);
        assert_eq!(trip.approach_km, Some(1.2));
        assert_eq!(trip.approach_fee, Some(0.6));

        let trip = lc.start(trip.id, driver).unwrap();
        assert_eq!(trip.status, TripStatus::Started);

        let trip = lc.complete(trip.id, driver).unwrap();
        assert_eq!(trip.status, TripStatus::Completed);
        assert_eq!(trip.driver_id, Some(driver));
        assert!(trip.completed_at.is_some());
    }

    #[test]
    fn accept_requires_assigned_status() {
        let lc = lifecycle();
        let trip = new_trip(&lc);

        let err = lc.accept(trip.id, Uuid::new_v4(), 1.0, 0.5).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn accept_requires_the_assigned_driver() {
        let lc = lifecycle();
        let trip = new_trip(&lc);
        let driver = Uuid::new_v4();
        lc.assign(trip.id, driver).unwrap();

        let err = lc.accept(trip.id, Uuid::new_v4(), 1.0, 0.5).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn reassignment_swaps_driver_and_keeps_first_assigned_at() {
        let lc = lifecycle();
        let trip = new_trip(&lc);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let assigned = lc.assign(trip.id, first).unwrap();
        let first_assigned_at = assigned.assigned_at;

        let reassigned = lc.assign(trip.id, second).unwrap();
        assert_eq!(reassigned.status, TripStatus::Assigned);
        assert_eq!(reassigned.driver_id, Some(second));
        assert_eq!(reassigned.assigned_at, first_assigned_at);
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        let lc = lifecycle();
        let trip = new_trip(&lc);

        lc.cancel(trip.id, "rider changed their mind").unwrap();

        let err = lc.cancel(trip.id, "again").unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = lc.assign(trip.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn completed_trip_cannot_be_cancelled() {
        let lc = lifecycle();
        let trip = new_trip(&lc);
        let driver = Uuid::new_v4();

        lc.assign(trip.id, driver).unwrap();
        lc.accept(trip.id, driver, 1.0, 0.5).unwrap();
        lc.start(trip.id, driver).unwrap();
        lc.complete(trip.id, driver).unwrap();

        let err = lc.cancel(trip.id, "too late").unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn cancel_clears_the_driver_link_and_records_the_reason() {
        let lc = lifecycle();
        let trip = new_trip(&lc);
        lc.assign(trip.id, Uuid::new_v4()).unwrap();

        let cancelled = lc.cancel(trip.id, "no available drivers").unwrap();
        assert_eq!(cancelled.status, TripStatus::Cancelled);
        assert_eq!(cancelled.driver_id, None);
        assert_eq!(
            cancelled.cancel_reason.as_deref(),
            Some("no available drivers")
        );
        assert!(cancelled.cancelled_at.is_some());
    }
}
