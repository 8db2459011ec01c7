use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationalStatus {
    Offline,
    Online,
    OnTrip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccountStatus {
    Locked,
    Verified,
    Banned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub location: Coordinate,
    pub operational: OperationalStatus,
    pub account: AccountStatus,
    pub updated_at: DateTime<Utc>,
}

/// Read model the dispatcher ranks; only online + verified drivers ever
/// become candidates.
#[derive(Debug, Clone, Serialize)]
pub struct DriverCandidate {
    pub id: Uuid,
    pub location: Coordinate,
}
