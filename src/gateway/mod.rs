//! Realtime gateway: WebSocket termination, auth, rooms and backlog replay.
//!
//! Gateways never write job state. They read the store for replay and gap
//! fills and otherwise only consume broker topics.

pub mod auth;
pub mod limits;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};

use crate::broker::BrokerBridge;
use crate::config::GatewayConfig;
use crate::store::Database;

pub use auth::{Authenticator, TokenAuthenticator};
pub use limits::ConnectionLimiter;
pub use protocol::{ClientMessage, Room, ServerMessage};
pub use rooms::RoomRegistry;
pub use session::Session;

/// Shared state for every gateway connection.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<dyn Database>,
    pub registry: Arc<RoomRegistry>,
    pub limiter: Arc<ConnectionLimiter>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Arc<GatewayConfig>,
}

impl GatewayState {
    pub fn new(
        store: Arc<dyn Database>,
        broker: Arc<BrokerBridge>,
        auth: Arc<dyn Authenticator>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(RoomRegistry::new(broker)),
            limiter: Arc::new(ConnectionLimiter::new(
                config.max_connections,
                config.max_connections_per_owner,
            )),
            auth,
            config: Arc::new(config),
        }
    }
}

/// Build the gateway router (`/ws`).
pub fn gateway_routes(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
