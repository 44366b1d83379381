//! Background crash sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error};

use crate::jobs::manager::JobManager;

/// Run `sweep_crashed` every `interval` until the handle is aborted.
pub fn spawn_crash_sweep(
    manager: Arc<JobManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match manager.sweep_crashed(Utc::now()).await {
                Ok(crashed) if crashed.is_empty() => debug!("Crash sweep found nothing"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Crash sweep failed"),
            }
        }
    })
}
