use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// A transition or offer resolution lost a race; the state already moved on.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Accept/reject referenced a driver/trip pair with no matching pending offer.
    #[error("offer for trip {trip_id} is no longer valid for driver {driver_id}")]
    OfferMismatch { driver_id: Uuid, trip_id: Uuid },

    #[error("no drivers available")]
    NoDriversAvailable,

    /// Invariant violation: a driver may hold at most one outstanding offer.
    #[error("driver {0} already has a pending offer")]
    AlreadyPending(Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TripNotFound(id) => AppError::NotFound(format!("trip {id} not found")),
            StoreError::DriverNotFound(id) => AppError::NotFound(format!("driver {id} not found")),
            StoreError::StatusConflict {
                trip_id,
                expected,
                found,
            } => AppError::Conflict(format!(
                "trip {trip_id} status is {found:?}, expected {expected:?}"
            )),
            StoreError::Unavailable(msg) => AppError::Internal(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::OfferMismatch { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::NoDriversAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no drivers available".to_string(),
            ),
            AppError::AlreadyPending(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
