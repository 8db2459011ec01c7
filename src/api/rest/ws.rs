use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::store::RecordStore;

/// Per-driver delivery channel. Connecting marks the driver reachable;
/// the socket closing (either side) marks them unreachable and resolves
/// any offer they still held.
pub async fn driver_ws_handler(
    ws: WebSocketUpgrade,
    Path(driver_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    state.store.load_driver(driver_id)?;
    Ok(ws.on_upgrade(move |socket| handle_driver_socket(socket, state, driver_id)))
}

async fn handle_driver_socket(socket: WebSocket, state: Arc<AppState>, driver_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.ws.register(driver_id, tx);
    state.on_connect(driver_id);
    info!(driver_id = %driver_id, "driver channel connected");

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Offer responses come in through the REST ingress; inbound socket
    // traffic is drained only to notice the close.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.ws.unregister(driver_id);
    state.on_disconnect(driver_id).await;
    info!(driver_id = %driver_id, "driver channel disconnected");
}

/// Read-only stream of trip lifecycle events for rider apps and operators.
pub async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.trip_events_tx.subscribe());

    info!("event stream client connected");

    let send_task = tokio::spawn(async move {
        while let Some(next) = events.next().await {
            // A lagged subscriber just misses events; the stream goes on.
            let Ok(event) = next else {
                continue;
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize trip event");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("event stream client disconnected");
}
