use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::Coordinate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TripStatus {
    Requested,
    Assigned,
    Accepted,
    Started,
    Completed,
    Cancelled,
}

impl TripStatus {
    /// Terminal statuses are absorbing: no further transition may leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup: Coordinate,
    pub pickup_address: Option<String>,
    pub destination: Coordinate,
    pub destination_address: Option<String>,
    pub estimated_km: f64,
    pub estimated_fare: f64,
    pub approach_km: Option<f64>,
    pub approach_fee: Option<f64>,
    pub status: TripStatus,
    pub requested_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TripEventKind {
    Requested,
    DriverAssigned,
    Accepted,
    Started,
    Completed,
    Cancelled,
}

/// Broadcast to rider-facing and operational observers on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct TripEvent {
    pub trip_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub kind: TripEventKind,
    pub at: DateTime<Utc>,
}
