//! In-process worker runtime: runs registered handlers as job attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{JobError, WorkerError};
use crate::jobs::{Checkpoint, Job, JobManager, JobState, Resumed};
use crate::worker::context::WorkerContext;

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

/// Work for one job type. The runtime owns the lifecycle around it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &WorkerContext) -> WorkerOutcome;
}

pub struct WorkerRuntime {
    manager: Arc<JobManager>,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    slots: Arc<Semaphore>,
    cancel_poll: Duration,
}

impl WorkerRuntime {
    pub fn new(manager: Arc<JobManager>, config: RuntimeConfig) -> Self {
        Self {
            manager,
            handlers: DashMap::new(),
            slots: Arc::new(Semaphore::new(config.max_parallel_jobs.max(1))),
            cancel_poll: config.cancel_poll_interval,
        }
    }

    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        info!(job_type = %job_type, "Job handler registered");
        self.handlers.insert(job_type, handler);
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Free attempt slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Queue a Created job and start an attempt once a slot frees up.
    ///
    /// The job moves to Running (and its attempt counter is bumped) only
    /// when the attempt actually starts.
    pub async fn dispatch(self: &Arc<Self>, job_id: Uuid) -> Result<JoinHandle<()>, WorkerError> {
        let job = self.manager.status(job_id).await?;
        let handler = self.handler_for(&job)?;

        let job = match job.state {
            JobState::Created => {
                self.manager
                    .transition(job_id, JobState::Queued, Some("dispatched".to_string()))
                    .await?
            }
            JobState::Queued => job,
            state => {
                return Err(JobError::InvalidTransition {
                    id: job_id,
                    state,
                    target: JobState::Queued,
                }
                .into());
            }
        };

        debug!(job_id = %job_id, job_type = %job.job_type, "Job queued for attempt");
        let runtime = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let Ok(_permit) = runtime.acquire_slot().await else {
                return;
            };
            let job = match runtime
                .manager
                .transition(job_id, JobState::Running, None)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    // Cancelled while waiting for a slot, most likely.
                    debug!(job_id = %job_id, error = %e, "Queued job did not start");
                    return;
                }
            };
            runtime.run_attempt(handler, job, None).await;
        }))
    }

    /// Resume a Crashed job and, when a handler is registered for its type,
    /// start the new attempt from the checkpoint.
    ///
    /// A local resume waits for a free slot before the job re-enters
    /// Running, so the new attempt starts as soon as it is recorded.
    pub async fn resume(
        self: &Arc<Self>,
        job_id: Uuid,
    ) -> Result<(Resumed, Option<JoinHandle<()>>), WorkerError> {
        let job = self.manager.status(job_id).await?;
        let Some(handler) = self.lookup(&job.job_type) else {
            let resumed = self.manager.resume(job_id).await?;
            debug!(job_id = %job_id, job_type = %job.job_type, "No local handler, resume left to external worker");
            return Ok((resumed, None));
        };

        let permit = self.acquire_slot().await?;
        let resumed = self.manager.resume(job_id).await?;

        let runtime = Arc::clone(self);
        let job = resumed.job.clone();
        let checkpoint = resumed.checkpoint.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            runtime.run_attempt(handler, job, Some(checkpoint)).await;
        });
        Ok((resumed, Some(handle)))
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, WorkerError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)
    }

    fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(job_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn handler_for(&self, job: &Job) -> Result<Arc<dyn JobHandler>, WorkerError> {
        self.lookup(&job.job_type)
            .ok_or_else(|| WorkerError::NoHandler {
                job_type: job.job_type.clone(),
            })
    }

    /// Run one attempt to its outcome and record it.
    ///
    /// A handler that panics leaves the job Running; the crash sweep picks
    /// it up once it goes quiet.
    async fn run_attempt(
        &self,
        handler: Arc<dyn JobHandler>,
        job: Job,
        checkpoint: Option<Checkpoint>,
    ) {
        let job_id = job.id;
        let attempt = job.attempt;
        info!(job_id = %job_id, attempt, job_type = %job.job_type, resumed = checkpoint.is_some(), "Attempt started");

        let ctx =
            WorkerContext::start(Arc::clone(&self.manager), job, checkpoint, self.cancel_poll)
                .await;
        let outcome = handler.run(&ctx).await;
        drop(ctx);

        let result = match &outcome {
            WorkerOutcome::Completed(value) => {
                self.manager
                    .complete_attempt(job_id, attempt, value.clone())
                    .await
            }
            WorkerOutcome::Failed(reason) => {
                self.manager.fail_attempt(job_id, attempt, reason).await
            }
        };

        match result {
            Ok(job) => info!(job_id = %job_id, attempt, state = %job.state, "Attempt finished"),
            Err(JobError::InvalidTransition { state, .. }) if state.is_terminal() => {
                debug!(job_id = %job_id, attempt, state = %state, "Job already finished, outcome dropped");
            }
            Err(e @ JobError::StaleAttempt { .. }) => {
                warn!(job_id = %job_id, attempt, error = %e, "Superseded attempt finished");
            }
            Err(e) => error!(job_id = %job_id, attempt, error = %e, "Failed to record attempt outcome"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;
    use crate::broker::{BackoffPolicy, BrokerBridge, MemoryTransport, Transport};
    use crate::config::JobConfig;
    use crate::jobs::EventKind;
    use crate::store::LibSqlBackend;

    async fn setup(max_parallel_jobs: usize) -> (Arc<JobManager>, Arc<WorkerRuntime>) {
        let (manager, runtime, _) = setup_with_transport(max_parallel_jobs).await;
        (manager, runtime)
    }

    async fn setup_with_transport(
        max_parallel_jobs: usize,
    ) -> (Arc<JobManager>, Arc<WorkerRuntime>, Arc<MemoryTransport>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let broker = Arc::new(BrokerBridge::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            BackoffPolicy::default(),
        ));
        broker.start().await;
        let manager = Arc::new(JobManager::new(db, broker, JobConfig::default()));
        let runtime = Arc::new(WorkerRuntime::new(
            Arc::clone(&manager),
            RuntimeConfig {
                max_parallel_jobs,
                cancel_poll_interval: Duration::from_millis(50),
            },
        ));
        (manager, runtime, transport)
    }

    struct Steps;

    #[async_trait]
    impl JobHandler for Steps {
        async fn run(&self, ctx: &WorkerContext) -> WorkerOutcome {
            let start = ctx.resumed_from().map(|c| c.progress).unwrap_or(0);
            for progress in [start + 10, start + 20] {
                if let Err(e) = ctx.progress(progress, "working").await {
                    return WorkerOutcome::Failed(e.to_string());
                }
            }
            if let Err(e) = ctx.checkpoint(start + 20, "saved", json!({"n": 1})).await {
                return WorkerOutcome::Failed(e.to_string());
            }
            WorkerOutcome::Completed(json!({"from": start}))
        }
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn run(&self, _ctx: &WorkerContext) -> WorkerOutcome {
            WorkerOutcome::Failed("boom".into())
        }
    }

    /// Blocks until cancelled, then tries to write.
    struct WaitsForCancel {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for WaitsForCancel {
        async fn run(&self, ctx: &WorkerContext) -> WorkerOutcome {
            self.started.notify_one();
            ctx.cancelled().await;
            assert!(ctx.is_cancelled());
            match ctx.log("after cancel").await {
                Err(JobError::JobTerminal { .. }) => WorkerOutcome::Failed("stopped".into()),
                other => panic!("write after cancel should be rejected: {other:?}"),
            }
        }
    }

    /// Holds its slot until released.
    struct Gate {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for Gate {
        async fn run(&self, _ctx: &WorkerContext) -> WorkerOutcome {
            self.release.notified().await;
            WorkerOutcome::Completed(json!(null))
        }
    }

    #[tokio::test]
    async fn dispatch_runs_handler_to_completion() {
        let (manager, runtime) = setup(2).await;
        runtime.register("steps", Arc::new(Steps));
        let job = manager.create_job("alice", "steps", json!({})).await.unwrap();

        let handle = runtime.dispatch(job.id).await.unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let done = manager.status(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempt, 1);
        assert_eq!(done.progress, 20);

        let kinds: Vec<_> = manager
            .events(job.id, 0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Progress,
                EventKind::Progress,
                EventKind::Completed
            ]
        );
    }

    #[tokio::test]
    async fn failed_outcome_fails_job() {
        let (manager, runtime) = setup(1).await;
        runtime.register("bad", Arc::new(Failing));
        let job = manager.create_job("alice", "bad", json!({})).await.unwrap();

        let handle = runtime.dispatch(job.id).await.unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(manager.status(job.id).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn dispatch_without_handler_is_rejected() {
        let (manager, runtime) = setup(1).await;
        let job = manager.create_job("alice", "unknown", json!({})).await.unwrap();

        let err = runtime.dispatch(job.id).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoHandler { .. }));
        assert_eq!(manager.status(job.id).await.unwrap().state, JobState::Created);
    }

    #[tokio::test]
    async fn cancellation_reaches_running_handler() {
        let (manager, runtime) = setup(1).await;
        let started = Arc::new(Notify::new());
        runtime.register(
            "waits",
            Arc::new(WaitsForCancel {
                started: Arc::clone(&started),
            }),
        );
        let job = manager.create_job("alice", "waits", json!({})).await.unwrap();

        let handle = runtime.dispatch(job.id).await.unwrap();
        timeout(Duration::from_secs(2), started.notified()).await.unwrap();
        manager.cancel(job.id, Some("user".into())).await.unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        // The failed outcome is dropped; cancel stays the terminal state.
        assert_eq!(manager.status(job.id).await.unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_during_broker_outage_still_stops_handler() {
        let (manager, runtime, transport) = setup_with_transport(1).await;
        let started = Arc::new(Notify::new());
        runtime.register(
            "waits",
            Arc::new(WaitsForCancel {
                started: Arc::clone(&started),
            }),
        );
        let job = manager.create_job("alice", "waits", json!({})).await.unwrap();

        let handle = runtime.dispatch(job.id).await.unwrap();
        timeout(Duration::from_secs(2), started.notified()).await.unwrap();

        // The cancelled event never reaches the live stream.
        transport.set_available(false);
        manager.cancel(job.id, None).await.unwrap();
        assert!(!manager.broker().is_connected());

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(manager.status(job.id).await.unwrap().state, JobState::Cancelled);
        assert_eq!(runtime.available_slots(), 1);
    }

    #[tokio::test]
    async fn resume_waits_for_a_slot_before_running() {
        let (manager, runtime) = setup(1).await;
        let release = Arc::new(Notify::new());
        runtime.register(
            "gate",
            Arc::new(Gate {
                release: Arc::clone(&release),
            }),
        );
        runtime.register("steps", Arc::new(Steps));

        let crashed = manager.create_job("alice", "steps", json!({})).await.unwrap();
        manager.transition(crashed.id, JobState::Queued, None).await.unwrap();
        manager.transition(crashed.id, JobState::Running, None).await.unwrap();
        manager
            .checkpoint(crashed.id, 40, "Reading", json!({}))
            .await
            .unwrap();
        manager
            .sweep_crashed(Utc::now() + chrono::Duration::minutes(6))
            .await
            .unwrap();

        let busy = manager.create_job("alice", "gate", json!({})).await.unwrap();
        let busy_handle = runtime.dispatch(busy.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.available_slots(), 0);

        let resuming = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.resume(crashed.id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still crashed: nothing could run it yet.
        assert_eq!(manager.status(crashed.id).await.unwrap().state, JobState::Crashed);

        release.notify_one();
        let (resumed, handle) = timeout(Duration::from_secs(2), resuming)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resumed.job.attempt, 2);
        timeout(Duration::from_secs(2), async {
            busy_handle.await.unwrap();
            handle.unwrap().await.unwrap();
        })
        .await
        .unwrap();
        assert_eq!(manager.status(crashed.id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn resume_starts_new_attempt_from_checkpoint() {
        let (manager, runtime) = setup(1).await;
        runtime.register("steps", Arc::new(Steps));
        let job = manager.create_job("alice", "steps", json!({})).await.unwrap();
        manager.transition(job.id, JobState::Queued, None).await.unwrap();
        manager.transition(job.id, JobState::Running, None).await.unwrap();
        manager
            .checkpoint(job.id, 50, "Analyzing sources", json!({"cursor": 3}))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::minutes(6);
        assert_eq!(manager.sweep_crashed(later).await.unwrap(), vec![job.id]);

        let (resumed, handle) = runtime.resume(job.id).await.unwrap();
        assert_eq!(resumed.job.attempt, 2);
        timeout(Duration::from_secs(2), handle.unwrap())
            .await
            .unwrap()
            .unwrap();

        let done = manager.status(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 70);
        assert_eq!(done.attempt, 2);
    }

    #[tokio::test]
    async fn resume_without_handler_only_transitions() {
        let (manager, runtime) = setup(1).await;
        let job = manager.create_job("alice", "external", json!({})).await.unwrap();
        manager.transition(job.id, JobState::Queued, None).await.unwrap();
        manager.transition(job.id, JobState::Running, None).await.unwrap();
        manager.checkpoint(job.id, 30, "s", json!({})).await.unwrap();
        manager
            .sweep_crashed(Utc::now() + chrono::Duration::minutes(6))
            .await
            .unwrap();

        let (resumed, handle) = runtime.resume(job.id).await.unwrap();
        assert!(handle.is_none());
        assert_eq!(resumed.job.state, JobState::Running);
    }

    #[tokio::test]
    async fn slots_bound_parallel_attempts() {
        let (manager, runtime) = setup(1).await;
        let release = Arc::new(Notify::new());
        runtime.register(
            "gate",
            Arc::new(Gate {
                release: Arc::clone(&release),
            }),
        );
        let first = manager.create_job("alice", "gate", json!({})).await.unwrap();
        let second = manager.create_job("alice", "gate", json!({})).await.unwrap();

        let h1 = runtime.dispatch(first.id).await.unwrap();
        let h2 = runtime.dispatch(second.id).await.unwrap();

        // Only one attempt can hold the single slot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let states = (
            manager.status(first.id).await.unwrap().state,
            manager.status(second.id).await.unwrap().state,
        );
        assert!(
            matches!(
                states,
                (JobState::Running, JobState::Queued) | (JobState::Queued, JobState::Running)
            ),
            "unexpected states {states:?}"
        );

        release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();
        timeout(Duration::from_secs(2), async {
            h1.await.unwrap();
            h2.await.unwrap();
        })
        .await
        .unwrap();

        assert_eq!(manager.status(first.id).await.unwrap().state, JobState::Completed);
        assert_eq!(manager.status(second.id).await.unwrap().state, JobState::Completed);
        assert_eq!(runtime.available_slots(), 1);
    }
}
