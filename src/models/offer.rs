use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::driver::Coordinate;
use crate::models::trip::Trip;

/// Trip proposal pushed to exactly one driver over their delivery channel.
#[derive(Debug, Clone, Serialize)]
pub struct OfferPayload {
    pub trip_id: Uuid,
    pub pickup: Coordinate,
    pub pickup_address: Option<String>,
    pub destination: Coordinate,
    pub destination_address: Option<String>,
    pub estimated_km: f64,
    pub estimated_fare: f64,
    pub expires_in_ms: u64,
    pub offered_at: DateTime<Utc>,
}

impl OfferPayload {
    pub fn for_trip(trip: &Trip, expires_in_ms: u64) -> Self {
        Self {
            trip_id: trip.id,
            pickup: trip.pickup,
            pickup_address: trip.pickup_address.clone(),
            destination: trip.destination,
            destination_address: trip.destination_address.clone(),
            estimated_km: trip.estimated_km,
            estimated_fare: trip.estimated_fare,
            expires_in_ms,
            offered_at: Utc::now(),
        }
    }
}

/// Messages sent server-to-driver over the WebSocket delivery channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    Offer(OfferPayload),
    OfferClosed { trip_id: Uuid, reason: String },
}
