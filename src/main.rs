use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use job_relay::app::Services;
use job_relay::broker::{MemoryTransport, Transport};
use job_relay::config::{BrokerKind, ServiceConfig};
use job_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive so the file writer flushes on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("job-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API:     http://0.0.0.0:{}/api/jobs", config.port);
    eprintln!("   Gateway: ws://0.0.0.0:{}/ws", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Broker ───────────────────────────────────────────────────────────
    let transport = build_transport(&config.broker.kind)?;
    eprintln!("   Broker:   {}", transport.name());

    if config.gateway.tokens.is_empty() {
        tracing::warn!("JOB_RELAY_TOKENS is empty, every WebSocket connection will be rejected");
    }

    let services = Services::start(&config, db, transport).await;
    let app = services.router();

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "job-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("job-relay stopped");
    Ok(())
}

fn init_tracing(config: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "job-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}

fn build_transport(kind: &BrokerKind) -> anyhow::Result<Arc<dyn Transport>> {
    match kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryTransport::new())),
        #[cfg(feature = "nats")]
        BrokerKind::Nats { url } => Ok(Arc::new(job_relay::broker::NatsTransport::new(url.clone()))),
        #[cfg(not(feature = "nats"))]
        BrokerKind::Nats { url } => {
            anyhow::bail!("broker {url} requires building with the `nats` feature")
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
