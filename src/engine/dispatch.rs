use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::queue::enqueue_dispatch;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::driver::{Coordinate, DriverCandidate};
use crate::models::trip::Trip;
use crate::state::AppState;
use crate::store::RecordStore;

pub const NO_DRIVERS_REASON: &str = "no available drivers";

/// One unit of dispatch work. The exclusion set lives for the trip's
/// dispatch cycle only: it travels through the queue and the pending offer,
/// and dies with the trip's final outcome.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub trip_id: Uuid,
    pub excluded: Vec<Uuid>,
}

enum DispatchOutcome {
    Assigned(Uuid),
    NoDrivers,
    Skipped,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Assigned(_) => "assigned",
            DispatchOutcome::NoDrivers => "no_drivers",
            DispatchOutcome::Skipped => "skipped",
        }
    }
}

/// Consumes dispatch jobs until the queue closes. Rejections and timeouts
/// come back through the same queue with a grown exclusion set, so retry
/// depth is bounded by the number of eligible drivers, not by stack.
pub async fn run_dispatch_engine(state: Arc<AppState>, mut jobs_rx: mpsc::Receiver<DispatchJob>) {
    info!("dispatch engine started");

    while let Some(job) = jobs_rx.recv().await {
        state.metrics.jobs_in_queue.dec();

        let start = Instant::now();
        match dispatch_trip(&state, job).await {
            Ok(outcome) => {
                state
                    .metrics
                    .dispatch_total
                    .with_label_values(&[outcome.label()])
                    .inc();
                debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    outcome = outcome.label(),
                    "dispatch attempt finished"
                );
            }
            Err(err) => {
                state
                    .metrics
                    .dispatch_total
                    .with_label_values(&["error"])
                    .inc();
                error!(error = %err, "failed to dispatch trip");
            }
        }
    }

    warn!("dispatch engine stopped: queue channel closed");
}

async fn dispatch_trip(state: &Arc<AppState>, job: DispatchJob) -> Result<DispatchOutcome, AppError> {
    let trip = state.store.load_trip(job.trip_id)?;

    if trip.status.is_terminal() {
        debug!(trip_id = %trip.id, status = ?trip.status, "skipping dispatch for settled trip");
        return Ok(DispatchOutcome::Skipped);
    }

    let Some((driver_id, distance_km)) = select_driver(state, &trip, &job.excluded)? else {
        match state.lifecycle.cancel(trip.id, NO_DRIVERS_REASON) {
            Ok(_) => info!(trip_id = %trip.id, "no eligible drivers; trip cancelled"),
            Err(AppError::Conflict(_)) => {
                debug!(trip_id = %trip.id, "trip settled before no-driver cancellation");
            }
            Err(err) => return Err(err),
        }
        return Ok(DispatchOutcome::NoDrivers);
    };

    let trip = match state.lifecycle.assign(trip.id, driver_id) {
        Ok(trip) => trip,
        Err(AppError::Conflict(_)) => {
            // A rider cancellation slipped in between the load and the assign.
            debug!(trip_id = %trip.id, "trip settled before assignment");
            return Ok(DispatchOutcome::Skipped);
        }
        Err(err) => return Err(err),
    };

    info!(
        trip_id = %trip.id,
        driver_id = %driver_id,
        distance_km,
        attempt = job.excluded.len() + 1,
        "driver selected"
    );

    match state
        .coordinator
        .clone()
        .offer(driver_id, &trip, job.excluded.clone())
        .await
    {
        Ok(()) => Ok(DispatchOutcome::Assigned(driver_id)),
        Err(AppError::AlreadyPending(_)) => {
            // Invariant violation, already logged by the coordinator. Keep
            // the trip live by retrying without the colliding driver.
            let mut excluded = job.excluded;
            excluded.push(driver_id);
            enqueue_dispatch(
                &state.dispatch_tx,
                &state.metrics,
                DispatchJob {
                    trip_id: trip.id,
                    excluded,
                },
            )
            .await?;
            Ok(DispatchOutcome::Skipped)
        }
        Err(err) => Err(err),
    }
}

/// Candidate query plus the per-dispatch filters the store cannot know
/// about: reachability, the trip's exclusion set, and the one-offer-per-
/// driver guard.
fn select_driver(
    state: &AppState,
    trip: &Trip,
    excluded: &[Uuid],
) -> Result<Option<(Uuid, f64)>, AppError> {
    let radius_km = state.config.search_radius_km;

    let all = match state.store.eligible_drivers(&trip.pickup, radius_km) {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(trip_id = %trip.id, error = %err, "eligible-driver query failed; retrying once");
            state.store.eligible_drivers(&trip.pickup, radius_km)?
        }
    };

    let candidates: Vec<DriverCandidate> = all
        .into_iter()
        .filter(|candidate| !excluded.contains(&candidate.id))
        .filter(|candidate| state.registry.is_reachable(candidate.id))
        .filter(|candidate| !state.coordinator.has_pending(candidate.id))
        .collect();

    Ok(nearest_candidate(&candidates, &trip.pickup).map(|(candidate, km)| (candidate.id, km)))
}

/// Minimum-distance candidate; ties resolve to the first candidate in input
/// order, which keeps selection deterministic for a fixed candidate list.
pub fn nearest_candidate<'a>(
    candidates: &'a [DriverCandidate],
    pickup: &Coordinate,
) -> Option<(&'a DriverCandidate, f64)> {
    candidates
        .iter()
        .map(|candidate| (candidate, haversine_km(&candidate.location, pickup)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyDriver {
    pub id: Uuid,
    pub location: Coordinate,
    pub distance_km: f64,
}

/// Rider-facing read of reachable drivers around a position. Smaller radius
/// and a hard result cap; never consulted by dispatch itself.
pub fn nearby_drivers(state: &AppState, position: &Coordinate) -> Result<Vec<NearbyDriver>, AppError> {
    let mut found: Vec<NearbyDriver> = state
        .store
        .eligible_drivers(position, state.config.nearby_radius_km)?
        .into_iter()
        .filter(|candidate| state.registry.is_reachable(candidate.id))
        .map(|candidate| NearbyDriver {
            id: candidate.id,
            distance_km: haversine_km(&candidate.location, position),
            location: candidate.location,
        })
        .collect();

    found.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    found.truncate(state.config.nearby_limit);
    Ok(found)
}
