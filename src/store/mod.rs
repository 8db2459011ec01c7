use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::geo::haversine_km;
use crate::models::driver::{
    AccountStatus, Coordinate, Driver, DriverCandidate, OperationalStatus,
};
use crate::models::trip::{Trip, TripStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trip {0} not found")]
    TripNotFound(Uuid),

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("trip {trip_id} status is {found:?}, expected {expected:?}")]
    StatusConflict {
        trip_id: Uuid,
        expected: TripStatus,
        found: TripStatus,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for trips and driver records. Trip writes carry
/// compare-and-swap semantics on status: the write is rejected if the
/// status changed since the caller loaded the trip.
pub trait RecordStore: Send + Sync {
    fn trip_count(&self) -> usize;
    fn driver_count(&self) -> usize;

    fn insert_trip(&self, trip: Trip) -> Result<(), StoreError>;
    fn load_trip(&self, id: Uuid) -> Result<Trip, StoreError>;
    fn save_trip(&self, trip: &Trip, expected: TripStatus) -> Result<(), StoreError>;

    fn insert_driver(&self, driver: Driver) -> Result<(), StoreError>;
    fn load_driver(&self, id: Uuid) -> Result<Driver, StoreError>;
    fn list_drivers(&self) -> Vec<Driver>;
    fn set_driver_location(&self, id: Uuid, location: Coordinate) -> Result<Driver, StoreError>;
    fn set_driver_operational(
        &self,
        id: Uuid,
        status: OperationalStatus,
    ) -> Result<Driver, StoreError>;

    /// Online + verified drivers within `within_km` of `pickup`, in driver
    /// registration order. Registration order is what makes distance ties
    /// deterministic for the dispatcher.
    fn eligible_drivers(
        &self,
        pickup: &Coordinate,
        within_km: f64,
    ) -> Result<Vec<DriverCandidate>, StoreError>;
    fn driver_coordinate(&self, id: Uuid) -> Result<Coordinate, StoreError>;
}

struct StoredDriver {
    seq: u64,
    driver: Driver,
}

/// Process-memory store. A real deployment would put a database behind the
/// `RecordStore` trait; the dispatch core never notices the difference.
pub struct InMemoryStore {
    trips: DashMap<Uuid, Trip>,
    drivers: DashMap<Uuid, StoredDriver>,
    driver_seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            trips: DashMap::new(),
            drivers: DashMap::new(),
            driver_seq: AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for InMemoryStore {
    fn trip_count(&self) -> usize {
        self.trips.len()
    }

    fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    fn insert_trip(&self, trip: Trip) -> Result<(), StoreError> {
        self.trips.insert(trip.id, trip);
        Ok(())
    }

    fn load_trip(&self, id: Uuid) -> Result<Trip, StoreError> {
        self.trips
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::TripNotFound(id))
    }

    fn save_trip(&self, trip: &Trip, expected: TripStatus) -> Result<(), StoreError> {
        let mut entry = self
            .trips
            .get_mut(&trip.id)
            .ok_or(StoreError::TripNotFound(trip.id))?;

        if entry.status != expected {
            return Err(StoreError::StatusConflict {
                trip_id: trip.id,
                expected,
                found: entry.status,
            });
        }

        *entry = trip.clone();
        Ok(())
    }

    fn insert_driver(&self, driver: Driver) -> Result<(), StoreError> {
        let seq = self.driver_seq.fetch_add(1, Ordering::Relaxed);
        self.drivers.insert(driver.id, StoredDriver { seq, driver });
        Ok(())
    }

    fn load_driver(&self, id: Uuid) -> Result<Driver, StoreError> {
        self.drivers
            .get(&id)
            .map(|entry| entry.value().driver.clone())
            .ok_or(StoreError::DriverNotFound(id))
    }

    fn list_drivers(&self) -> Vec<Driver> {
        let mut stored: Vec<(u64, Driver)> = self
            .drivers
            .iter()
            .map(|entry| (entry.value().seq, entry.value().driver.clone()))
            .collect();
        stored.sort_by_key(|(seq, _)| *seq);
        stored.into_iter().map(|(_, driver)| driver).collect()
    }

    fn set_driver_location(&self, id: Uuid, location: Coordinate) -> Result<Driver, StoreError> {
        let mut entry = self
            .drivers
            .get_mut(&id)
            .ok_or(StoreError::DriverNotFound(id))?;
        entry.driver.location = location;
        entry.driver.updated_at = Utc::now();
        Ok(entry.driver.clone())
    }

    fn set_driver_operational(
        &self,
        id: Uuid,
        status: OperationalStatus,
    ) -> Result<Driver, StoreError> {
        let mut entry = self
            .drivers
            .get_mut(&id)
            .ok_or(StoreError::DriverNotFound(id))?;
        entry.driver.operational = status;
        entry.driver.updated_at = Utc::now();
        Ok(entry.driver.clone())
    }

    fn eligible_drivers(
        &self,
        pickup: &Coordinate,
        within_km: f64,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        let mut stored: Vec<(u64, DriverCandidate)> = self
            .drivers
            .iter()
            .filter_map(|entry| {
                let StoredDriver { seq, driver } = entry.value();
                let eligible = driver.operational == OperationalStatus::Online
                    && driver.account == AccountStatus::Verified
                    && haversine_km(&driver.location, pickup) <= within_km;

                eligible.then(|| {
                    (
                        *seq,
                        DriverCandidate {
                            id: driver.id,
                            location: driver.location,
                        },
                    )
                })
            })
            .collect();

        stored.sort_by_key(|(seq, _)| *seq);
        Ok(stored.into_iter().map(|(_, candidate)| candidate).collect())
    }

    fn driver_coordinate(&self, id: Uuid) -> Result<Coordinate, StoreError> {
        self.drivers
            .get(&id)
            .map(|entry| entry.value().driver.location)
            .ok_or(StoreError::DriverNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{InMemoryStore, RecordStore, StoreError};
    use crate::models::driver::{AccountStatus, Coordinate, Driver, OperationalStatus};
    use crate::models::trip::{Trip, TripStatus};

    fn trip(status: TripStatus) -> Trip {
        Trip {
            id: Uuid::new_v4(),
            rider_id: Uuid::new_v4(),
            driver_id: None,
            pickup: Coordinate {
                lat: 36.80,
                lng: 10.18,
            },
            pickup_address: None,
            destination: Coordinate {
                lat: 36.85,
                lng: 10.20,
            },
            destination_address: None,
            estimated_km: 5.0,
            estimated_fare: 6.0,
            approach_km: None,
            approach_fee: None,
            status,
            requested_at: Utc::now(),
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
        }
    }

    fn driver(lat: f64, lng: f64) -> Driver {
        Driver {
            id: Uuid::new_v4(),
            name: "test-driver".to_string(),
            location: Coordinate { lat, lng },
            operational: OperationalStatus::Online,
            account: AccountStatus::Verified,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn save_trip_rejects_stale_status() {
        let store = InMemoryStore::new();
        let mut t = trip(TripStatus::Requested);
        store.insert_trip(t.clone()).unwrap();

        t.status = TripStatus::Cancelled;
        store.save_trip(&t, TripStatus::Requested).unwrap();

        // A writer that loaded the trip as Requested must now lose.
        let mut stale = t.clone();
        stale.status = TripStatus::Assigned;
        let err = store.save_trip(&stale, TripStatus::Requested).unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));
    }

    #[test]
    fn eligible_drivers_filters_status_and_radius() {
        let store = InMemoryStore::new();
        let pickup = Coordinate {
            lat: 36.80,
            lng: 10.18,
        };

        let near = driver(36.81, 10.18);
        let mut offline = driver(36.81, 10.19);
        offline.operational = OperationalStatus::Offline;
        let mut banned = driver(36.80, 10.19);
        banned.account = AccountStatus::Banned;
        let far = driver(38.0, 12.0);

        for d in [&near, &offline, &banned, &far] {
            store.insert_driver(d.clone()).unwrap();
        }

        let candidates = store.eligible_drivers(&pickup, 10.0).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, near.id);
    }

    #[test]
    fn eligible_drivers_preserves_registration_order() {
        let store = InMemoryStore::new();
        let pickup = Coordinate {
            lat: 36.80,
            lng: 10.18,
        };

        let first = driver(36.80, 10.18);
        let second = driver(36.80, 10.18);
        store.insert_driver(first.clone()).unwrap();
        store.insert_driver(second.clone()).unwrap();

        let candidates = store.eligible_drivers(&pickup, 10.0).unwrap();
        assert_eq!(candidates[0].id, first.id);
        assert_eq!(candidates[1].id, second.id);
    }
}
