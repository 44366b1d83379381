//! Service wiring shared by the binary and the integration tests.

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::api::{ApiState, api_routes};
use crate::broker::{BrokerBridge, Transport};
use crate::config::ServiceConfig;
use crate::gateway::{Authenticator, GatewayState, TokenAuthenticator, gateway_routes};
use crate::jobs::{JobManager, spawn_crash_sweep};
use crate::store::Database;
use crate::worker::WorkerRuntime;

/// Running service components.
pub struct Services {
    pub manager: Arc<JobManager>,
    pub runtime: Arc<WorkerRuntime>,
    pub gateway: GatewayState,
    pub sweep: JoinHandle<()>,
}

impl Services {
    /// Connect the broker and start the crash sweep.
    pub async fn start(
        config: &ServiceConfig,
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let broker = Arc::new(BrokerBridge::new(transport, config.broker.backoff));
        broker.start().await;

        let manager = Arc::new(JobManager::new(
            Arc::clone(&db),
            Arc::clone(&broker),
            config.jobs.clone(),
        ));
        let sweep = spawn_crash_sweep(Arc::clone(&manager), config.jobs.sweep_interval);
        let runtime = Arc::new(WorkerRuntime::new(
            Arc::clone(&manager),
            config.runtime.clone(),
        ));

        let auth: Arc<dyn Authenticator> =
            Arc::new(TokenAuthenticator::new(config.gateway.tokens.clone()));
        let gateway = GatewayState::new(db, broker, auth, config.gateway.clone());

        Self {
            manager,
            runtime,
            gateway,
            sweep,
        }
    }

    /// Job control API plus the realtime gateway.
    pub fn router(&self) -> Router {
        api_routes(ApiState {
            manager: Arc::clone(&self.manager),
            runtime: Arc::clone(&self.runtime),
        })
        .merge(gateway_routes(self.gateway.clone()))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.sweep.abort();
    }
}
