use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::engine::dispatch::{NearbyDriver, nearby_drivers};
use crate::error::AppError;
use crate::models::driver::{AccountStatus, Coordinate, Driver, OperationalStatus};
use crate::models::trip::Trip;
use crate::state::AppState;
use crate::store::RecordStore;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/nearby", get(get_nearby_drivers))
        .route("/drivers/:id/location", patch(update_driver_location))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/offers/accept", post(accept_offer))
        .route("/offers/reject", post(reject_offer))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub name: String,
    pub location: Coordinate,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: Coordinate,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub operational: OperationalStatus,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct OfferResponseRequest {
    pub driver_id: Uuid,
    pub trip_id: Uuid,
    pub reason: Option<String>,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let driver = Driver {
        id: Uuid::new_v4(),
        name: payload.name,
        location: payload.location,
        operational: OperationalStatus::Online,
        account: AccountStatus::Verified,
        updated_at: Utc::now(),
    };

    state.store.insert_driver(driver.clone())?;
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    Json(state.store.list_drivers())
}

async fn get_nearby_drivers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, AppError> {
    let position = Coordinate {
        lat: query.lat,
        lng: query.lng,
    };
    Ok(Json(nearby_drivers(&state, &position)?))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.store.set_driver_location(id, payload.location)?))
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(
        state.store.set_driver_operational(id, payload.operational)?,
    ))
}

/// Driver response ingress: the only two entry points a driver-facing API
/// needs besides the delivery channel itself.
async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OfferResponseRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .coordinator
        .accept(payload.driver_id, payload.trip_id)
        .await?;
    Ok(Json(trip))
}

async fn reject_offer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OfferResponseRequest>,
) -> Result<Json<Value>, AppError> {
    let reason = payload.reason.unwrap_or_else(|| "declined".to_string());
    state
        .coordinator
        .reject(payload.driver_id, payload.trip_id, &reason)
        .await?;

    Ok(Json(json!({
        "trip_id": payload.trip_id,
        "driver_id": payload.driver_id,
        "resolution": "rejected"
    })))
}
