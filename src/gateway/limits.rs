//! Connection admission limits.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GatewayError;

/// Global and per-owner connection caps. Permits release on drop.
pub struct ConnectionLimiter {
    global: Arc<Semaphore>,
    per_owner: DashMap<String, Arc<Semaphore>>,
    max_connections: usize,
    max_per_owner: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize, max_per_owner: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_connections)),
            per_owner: DashMap::new(),
            max_connections,
            max_per_owner,
        }
    }

    /// Reserve a global slot. Checked before the WebSocket upgrade.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        Arc::clone(&self.global)
            .try_acquire_owned()
            .map_err(|_| GatewayError::Overload {
                limit: "connections",
                max: self.max_connections,
            })
    }

    /// Reserve a slot for an authenticated owner.
    pub fn try_acquire_owner(&self, owner_id: &str) -> Result<OwnedSemaphorePermit, GatewayError> {
        let semaphore = Arc::clone(
            self.per_owner
                .entry(owner_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_owner)))
                .value(),
        );
        semaphore
            .try_acquire_owned()
            .map_err(|_| GatewayError::Overload {
                limit: "connections_per_owner",
                max: self.max_per_owner,
            })
    }

    /// Connections currently holding a global slot.
    pub fn active(&self) -> usize {
        self.max_connections - self.global.available_permits()
    }
}
