use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::engine::dispatch::DispatchJob;
use crate::engine::queue::enqueue_dispatch;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::driver::{Coordinate, OperationalStatus};
use crate::models::trip::{Trip, TripStatus};
use crate::state::AppState;
use crate::store::RecordStore;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/trips", post(request_trip))
        .route("/trips/:id", get(get_trip))
        .route("/trips/:id/cancel", post(cancel_trip))
        .route("/trips/:id/start", post(start_trip))
        .route("/trips/:id/complete", post(complete_trip))
}

#[derive(Deserialize)]
pub struct RequestTripBody {
    pub rider_id: Uuid,
    pub pickup: Coordinate,
    pub pickup_address: Option<String>,
    pub destination: Coordinate,
    pub destination_address: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelTripBody {
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct DriverActionBody {
    pub driver_id: Uuid,
}

async fn request_trip(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RequestTripBody>,
) -> Result<Json<Trip>, AppError> {
    validate_coordinate(&payload.pickup, "pickup")?;
    validate_coordinate(&payload.destination, "destination")?;

    let estimated_km = haversine_km(&payload.pickup, &payload.destination);
    let estimated_fare = estimated_km * state.rates.trip_rate_per_km();

    let trip = state.lifecycle.create(
        payload.rider_id,
        payload.pickup,
        payload.pickup_address,
        payload.destination,
        payload.destination_address,
        estimated_km,
        estimated_fare,
    )?;

    enqueue_dispatch(
        &state.dispatch_tx,
        &state.metrics,
        DispatchJob {
            trip_id: trip.id,
            excluded: Vec::new(),
        },
    )
    .await?;

    Ok(Json(trip))
}

async fn get_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Trip>, AppError> {
    Ok(Json(state.store.load_trip(id)?))
}

async fn cancel_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelTripBody>,
) -> Result<Json<Trip>, AppError> {
    let before = state.store.load_trip(id)?;
    let reason = payload.reason.unwrap_or_else(|| "cancelled by rider".to_string());

    let cancelled = state.lifecycle.cancel(id, &reason)?;

    // If a driver was still deciding, close their offer; a late accept now
    // loses the status race and sees "no longer valid".
    if before.status == TripStatus::Assigned {
        if let Some(driver_id) = before.driver_id {
            state.coordinator.revoke(driver_id, id, "trip cancelled");
        }
    }

    Ok(Json(cancelled))
}

async fn start_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverActionBody>,
) -> Result<Json<Trip>, AppError> {
    Ok(Json(state.lifecycle.start(id, payload.driver_id)?))
}

async fn complete_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverActionBody>,
) -> Result<Json<Trip>, AppError> {
    let trip = state.lifecycle.complete(id, payload.driver_id)?;

    if let Err(err) = state
        .store
        .set_driver_operational(payload.driver_id, OperationalStatus::Online)
    {
        warn!(driver_id = %payload.driver_id, error = %err, "failed to mark driver back online");
    }

    Ok(Json(trip))
}

fn validate_coordinate(point: &Coordinate, field: &str) -> Result<(), AppError> {
    if !(-90.0..=90.0).contains(&point.lat) || !(-180.0..=180.0).contains(&point.lng) {
        return Err(AppError::BadRequest(format!(
            "{field} is not a valid coordinate"
        )));
    }
    Ok(())
}
