use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::models::offer::{DriverMessage, OfferPayload};

/// How offer traffic reaches a driver's device. The coordinator only cares
/// whether delivery succeeded; the bytes are someone else's problem.
pub trait DeliveryTransport: Send + Sync {
    /// Push an offer to the driver. Returns false when the driver has no
    /// live channel or the channel is already closed.
    fn send_offer(&self, driver_id: Uuid, payload: &OfferPayload) -> bool;

    /// Tell a driver their outstanding offer is no longer on the table.
    fn send_offer_closed(&self, driver_id: Uuid, trip_id: Uuid, reason: &str);
}

/// WebSocket-backed transport: one outbound channel per connected driver,
/// registered by the socket handler for the connection's lifetime.
pub struct WsTransport {
    sessions: DashMap<Uuid, mpsc::UnboundedSender<String>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, driver_id: Uuid, tx: mpsc::UnboundedSender<String>) {
        self.sessions.insert(driver_id, tx);
    }

    pub fn unregister(&self, driver_id: Uuid) {
        self.sessions.remove(&driver_id);
    }

    fn send(&self, driver_id: Uuid, message: &DriverMessage) -> bool {
        let Some(tx) = self.sessions.get(&driver_id) else {
            return false;
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(err) => {
                warn!(driver_id = %driver_id, error = %err, "failed to serialize driver message");
                return false;
            }
        };

        tx.send(json).is_ok()
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTransport for WsTransport {
    fn send_offer(&self, driver_id: Uuid, payload: &OfferPayload) -> bool {
        self.send(driver_id, &DriverMessage::Offer(payload.clone()))
    }

    fn send_offer_closed(&self, driver_id: Uuid, trip_id: Uuid, reason: &str) {
        let _ = self.send(
            driver_id,
            &DriverMessage::OfferClosed {
                trip_id,
                reason: reason.to_string(),
            },
        );
    }
}
