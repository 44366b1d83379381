//! Per-attempt handle a job handler uses to report back to the job manager.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

use crate::broker::Topic;
use crate::error::JobError;
use crate::jobs::{Checkpoint, Event, EventKind, Job, JobManager, JobState};

/// Everything a handler needs for one attempt of one job.
///
/// Every write is fenced to the attempt the context was created for, so a
/// handler that outlives its attempt (crash then resume elsewhere) gets
/// `StaleAttempt` instead of interleaving with the new one.
pub struct WorkerContext {
    manager: Arc<JobManager>,
    job: Job,
    resumed_from: Option<Checkpoint>,
    cancelled: watch::Receiver<bool>,
    watcher: JoinHandle<()>,
}

impl WorkerContext {
    /// Build a context and start watching for cancellation.
    ///
    /// The job topic delivers a cancel as it happens. The store is re-read
    /// every `poll_every` as well, since live publishes are skipped while the
    /// broker is down.
    pub(crate) async fn start(
        manager: Arc<JobManager>,
        job: Job,
        resumed_from: Option<Checkpoint>,
        poll_every: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut events = manager.broker().subscribe(Topic::Job(job.id)).await;

        // A cancel that landed before the subscription never reaches the stream.
        let already_cancelled = is_cancelled_in_store(&manager, job.id).await;
        if already_cancelled {
            let _ = tx.send(true);
        }

        let job_id = job.id;
        let store = Arc::clone(&manager);
        let watcher = tokio::spawn(async move {
            if already_cancelled {
                return;
            }
            let mut poll = tokio::time::interval(poll_every.max(Duration::from_millis(10)));
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll.tick().await;

            let mut live = true;
            loop {
                let cancelled = tokio::select! {
                    next = events.next(), if live => match next {
                        Some(event) => event.kind == EventKind::Cancelled,
                        None => {
                            live = false;
                            false
                        }
                    },
                    _ = poll.tick() => is_cancelled_in_store(&store, job_id).await,
                };
                if cancelled {
                    debug!(job_id = %job_id, "Cancellation observed");
                    let _ = tx.send(true);
                    break;
                }
            }
        });

        Self {
            manager,
            job,
            resumed_from,
            cancelled: rx,
            watcher,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.job.params
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    /// Checkpoint this attempt resumes from, if any.
    pub fn resumed_from(&self) -> Option<&Checkpoint> {
        self.resumed_from.as_ref()
    }

    pub async fn progress(&self, progress: u8, step: &str) -> Result<Event, JobError> {
        self.emit(
            EventKind::Progress,
            json!({ "progress": progress, "step": step }),
        )
        .await
    }

    pub async fn log(&self, message: &str) -> Result<Event, JobError> {
        self.emit(EventKind::Log, json!({ "message": message })).await
    }

    /// Append a producer event (progress, chunk, log or decision).
    pub async fn emit(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event, JobError> {
        self.manager
            .append_for_attempt(self.job.id, self.job.attempt, kind, payload)
            .await
    }

    pub async fn checkpoint(
        &self,
        progress: u8,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<Checkpoint, JobError> {
        self.manager
            .checkpoint_for_attempt(self.job.id, self.job.attempt, progress, step, payload)
            .await
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the job has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Watcher gone without a cancel: never resolves.
            std::future::pending::<()>().await;
        }
    }
}

async fn is_cancelled_in_store(manager: &JobManager, job_id: Uuid) -> bool {
    matches!(
        manager.status(job_id).await,
        Ok(current) if current.state == JobState::Cancelled
    )
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
