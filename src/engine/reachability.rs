use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Which drivers currently hold a live delivery channel. Pure process
/// memory: a restart clears it and drivers reconnect on their own.
pub struct ReachabilityRegistry {
    channels: DashMap<Uuid, DateTime<Utc>>,
}

impl ReachabilityRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Idempotent: reconnecting while already connected is a no-op success.
    pub fn connect(&self, driver_id: Uuid) {
        let newly_connected = !self.channels.contains_key(&driver_id);
        self.channels.entry(driver_id).or_insert_with(Utc::now);
        if newly_connected {
            debug!(driver_id = %driver_id, "driver channel connected");
        }
    }

    /// Returns whether the driver was connected. The caller is responsible
    /// for resolving any pending offer the driver still held.
    pub fn disconnect(&self, driver_id: Uuid) -> bool {
        let was_connected = self.channels.remove(&driver_id).is_some();
        if was_connected {
            debug!(driver_id = %driver_id, "driver channel disconnected");
        }
        was_connected
    }

    pub fn is_reachable(&self, driver_id: Uuid) -> bool {
        self.channels.contains_key(&driver_id)
    }

    pub fn connected_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ReachabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
