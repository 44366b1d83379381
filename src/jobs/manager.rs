//! Job manager: the only writer of job state and the event log.
//!
//! Every mutation of a job runs under that job's lock: load the row,
//! validate against the transition table, commit the event, row, checkpoint
//! and audit record in one transaction, then publish to the broker.
//! Unrelated jobs never contend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::BrokerBridge;
use crate::config::JobConfig;
use crate::error::{DatabaseError, JobError};
use crate::jobs::event::{Event, EventKind, validate_payload};
use crate::jobs::model::{Actor, Checkpoint, Job, JobState, StateTransition};
use crate::store::{Database, JobWrite, NewEvent};

/// Outcome of a successful resume.
#[derive(Debug, Clone)]
pub struct Resumed {
    pub job: Job,
    pub checkpoint: Checkpoint,
    /// The `resumed` event appended to the log.
    pub event: Event,
}

pub struct JobManager {
    db: Arc<dyn Database>,
    broker: Arc<BrokerBridge>,
    config: JobConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl JobManager {
    pub fn new(db: Arc<dyn Database>, broker: Arc<BrokerBridge>, config: JobConfig) -> Self {
        Self {
            db,
            broker,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<BrokerBridge> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.db
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn status(&self, id: Uuid) -> Result<Job, JobError> {
        self.load(id).await
    }

    pub async fn list_jobs(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>, JobError> {
        Ok(self.db.list_jobs_for_owner(owner_id, limit).await?)
    }

    pub async fn events(
        &self,
        id: Uuid,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Event>, JobError> {
        self.load(id).await?;
        Ok(self.db.read_events(id, after_sequence, limit).await?)
    }

    pub async fn transitions(&self, id: Uuid) -> Result<Vec<StateTransition>, JobError> {
        self.load(id).await?;
        Ok(self.db.list_transitions(id).await?)
    }

    pub async fn latest_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>, JobError> {
        Ok(self.db.latest_checkpoint(id).await?)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn create_job(
        &self,
        owner_id: &str,
        job_type: &str,
        params: serde_json::Value,
    ) -> Result<Job, JobError> {
        validate_owner_id(owner_id)?;
        let job = Job::new(owner_id, job_type, params);
        self.db.insert_job(&job).await?;
        info!(job_id = %job.id, owner_id, job_type, "Job created");
        Ok(job)
    }

    /// Take a producer edge. Terminal targets also append their lifecycle event.
    pub async fn transition(
        &self,
        id: Uuid,
        target: JobState,
        reason: Option<String>,
    ) -> Result<Job, JobError> {
        if target.is_terminal() {
            let payload = json!({ "reason": reason });
            return self.finish(id, None, target, payload, reason).await;
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self.load(id).await?;
        if !job.state.can_transition_to(target, Actor::Producer) {
            return Err(JobError::InvalidTransition {
                id,
                state: job.state,
                target,
            });
        }

        let from = job.state;
        let now = Utc::now();
        job.apply(target, now);
        let audit = audit_record(&job, from, Actor::Producer, reason, now);
        self.db
            .commit(JobWrite::new(&job).transition(&audit))
            .await?;

        info!(job_id = %id, from = %from, to = %target, attempt = job.attempt, "Job transitioned");
        Ok(job)
    }

    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<Job, JobError> {
        let payload = json!({ "reason": reason });
        self.finish(id, None, JobState::Cancelled, payload, reason)
            .await
    }

    pub async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<Job, JobError> {
        self.finish(id, None, JobState::Completed, json!({ "result": result }), None)
            .await
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<Job, JobError> {
        self.finish(
            id,
            None,
            JobState::Failed,
            json!({ "error": error }),
            Some(error.to_string()),
        )
        .await
    }

    /// `complete` fenced to a worker attempt.
    pub async fn complete_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        result: serde_json::Value,
    ) -> Result<Job, JobError> {
        self.finish(
            id,
            Some(attempt),
            JobState::Completed,
            json!({ "result": result }),
            None,
        )
        .await
    }

    /// `fail` fenced to a worker attempt.
    pub async fn fail_attempt(&self, id: Uuid, attempt: u32, error: &str) -> Result<Job, JobError> {
        self.finish(
            id,
            Some(attempt),
            JobState::Failed,
            json!({ "error": error }),
            Some(error.to_string()),
        )
        .await
    }

    // ── Events & checkpoints ────────────────────────────────────────

    /// Append a producer event (progress, chunk, log or decision).
    pub async fn append_event(
        &self,
        id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event, JobError> {
        self.append_producer(id, None, kind, payload).await
    }

    /// `append_event` rejected with `StaleAttempt` unless `attempt` is current.
    pub async fn append_for_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event, JobError> {
        self.append_producer(id, Some(attempt), kind, payload).await
    }

    /// Record a resumable snapshot. Job state is unchanged.
    pub async fn checkpoint(
        &self,
        id: Uuid,
        progress: u8,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<Checkpoint, JobError> {
        self.checkpoint_inner(id, None, progress, step, payload).await
    }

    pub async fn checkpoint_for_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        progress: u8,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<Checkpoint, JobError> {
        self.checkpoint_inner(id, Some(attempt), progress, step, payload)
            .await
    }

    // ── Crash detection & resume ────────────────────────────────────

    /// Mark Running jobs silent since before `now - crash_threshold` as Crashed.
    ///
    /// Returns the ids that were transitioned. Safe to call repeatedly.
    pub async fn sweep_crashed(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, JobError> {
        let threshold = chrono::Duration::from_std(self.config.crash_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let candidates = self.db.list_inactive_jobs(JobState::Running, cutoff).await?;
        let mut crashed = Vec::new();

        for candidate in candidates {
            match self.mark_crashed(candidate.id, cutoff).await {
                Ok(true) => crashed.push(candidate.id),
                Ok(false) => {}
                Err(e) => warn!(job_id = %candidate.id, error = %e, "Crash sweep failed for job"),
            }
        }

        if !crashed.is_empty() {
            info!(count = crashed.len(), "Crash sweep marked jobs as crashed");
        }
        Ok(crashed)
    }

    /// Resume a Crashed job from its latest checkpoint.
    pub async fn resume(&self, id: Uuid) -> Result<Resumed, JobError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self.load(id).await?;
        if !job.state.can_transition_to(JobState::Running, Actor::Resume) {
            return Err(JobError::InvalidTransition {
                id,
                state: job.state,
                target: JobState::Running,
            });
        }

        let checkpoint = self
            .db
            .latest_checkpoint(id)
            .await?
            .ok_or(JobError::NoCheckpointAvailable { id })?;

        let from = job.state;
        let now = Utc::now();
        job.apply(JobState::Running, now);

        let payload = json!({
            "checkpoint_sequence": checkpoint.sequence,
            "progress": checkpoint.progress,
            "step": checkpoint.step,
            "payload": checkpoint.payload,
            "attempt": job.attempt,
        });
        let reason = format!("resumed from checkpoint {}", checkpoint.sequence);
        let event = self
            .append_locked(
                &mut job,
                EventKind::Resumed,
                payload,
                now,
                Some((from, Actor::Resume, Some(reason))),
            )
            .await?;

        info!(
            job_id = %id,
            checkpoint = checkpoint.sequence,
            sequence = event.sequence,
            attempt = job.attempt,
            "Job resumed"
        );
        Ok(Resumed {
            job,
            checkpoint,
            event,
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id).or_default().value())
    }

    /// Drop the lock entry for a finished job when nobody else holds it.
    fn prune_lock(&self, id: Uuid) {
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn load(&self, id: Uuid) -> Result<Job, JobError> {
        self.db
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })
    }

    /// Apply an event's progress fields to `job`, commit the event, the row
    /// and the optional audit record together, then publish. The caller
    /// holds the job lock and has already applied any state change.
    async fn append_locked(
        &self,
        job: &mut Job,
        kind: EventKind,
        payload: serde_json::Value,
        at: DateTime<Utc>,
        moved: Option<(JobState, Actor, Option<String>)>,
    ) -> Result<Event, JobError> {
        let update = validate_payload(kind, &payload)?;
        job.touch(at);
        if let Some(progress) = update.progress {
            job.progress = progress;
        }
        if let Some(step) = update.step {
            job.current_step = Some(step);
        }

        let audit = moved.map(|(from, actor, reason)| audit_record(job, from, actor, reason, at));
        let mut write = JobWrite::new(job).event(NewEvent {
            kind,
            payload: &payload,
            timestamp: at,
        });
        if let Some(audit) = &audit {
            write = write.transition(audit);
        }
        let event = self.db.commit(write).await?.ok_or_else(|| {
            DatabaseError::Query(format!("commit for job {} returned no event", job.id))
        })?;

        debug!(job_id = %job.id, sequence = event.sequence, kind = %kind, "Event appended");
        self.broker.publish(&event, &job.owner_id).await;
        Ok(event)
    }

    fn check_writable(job: &Job, attempt: Option<u32>) -> Result<(), JobError> {
        if job.state.is_terminal() {
            return Err(JobError::JobTerminal {
                id: job.id,
                state: job.state,
            });
        }
        if let Some(attempt) = attempt.filter(|a| *a != job.attempt) {
            return Err(JobError::StaleAttempt {
                id: job.id,
                attempt,
                current: job.attempt,
            });
        }
        if !job.state.accepts_events() {
            return Err(JobError::NotAccepting {
                id: job.id,
                state: job.state,
            });
        }
        Ok(())
    }

    async fn append_producer(
        &self,
        id: Uuid,
        attempt: Option<u32>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event, JobError> {
        if !kind.is_producer_kind() {
            return Err(JobError::InvalidEvent {
                reason: format!("{kind} events are written by the job manager"),
            });
        }
        validate_payload(kind, &payload)?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self.load(id).await?;
        Self::check_writable(&job, attempt)?;
        self.append_locked(&mut job, kind, payload, Utc::now(), None)
            .await
    }

    async fn checkpoint_inner(
        &self,
        id: Uuid,
        attempt: Option<u32>,
        progress: u8,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<Checkpoint, JobError> {
        if progress > 100 {
            return Err(JobError::InvalidEvent {
                reason: format!("progress must be in 0..=100, got {progress}"),
            });
        }
        let size = serde_json::to_vec(&payload)
            .map_err(|e| JobError::InvalidEvent {
                reason: format!("checkpoint payload is not serializable: {e}"),
            })?
            .len();
        if size > self.config.max_checkpoint_bytes {
            return Err(JobError::CheckpointTooLarge {
                size,
                max: self.config.max_checkpoint_bytes,
            });
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self.load(id).await?;
        Self::check_writable(&job, attempt)?;

        // The snapshot covers everything up to the last event; it takes no
        // sequence of its own.
        let sequence = self.db.last_sequence(id).await?;
        let now = Utc::now();
        let checkpoint = Checkpoint {
            job_id: id,
            sequence,
            progress,
            step: step.to_string(),
            payload,
            created_at: now,
        };

        job.touch(now);
        job.progress = progress;
        job.current_step = Some(checkpoint.step.clone());
        self.db
            .commit(JobWrite::new(&job).checkpoint(&checkpoint))
            .await?;

        info!(job_id = %id, sequence, progress, step, size_bytes = size, "Checkpoint recorded");
        Ok(checkpoint)
    }

    async fn finish(
        &self,
        id: Uuid,
        attempt: Option<u32>,
        target: JobState,
        payload: serde_json::Value,
        reason: Option<String>,
    ) -> Result<Job, JobError> {
        let kind = match target {
            JobState::Completed => EventKind::Completed,
            JobState::Failed => EventKind::Failed,
            JobState::Cancelled => EventKind::Cancelled,
            other => {
                return Err(JobError::InvalidTransition {
                    id,
                    state: other,
                    target,
                });
            }
        };

        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let mut job = self.load(id).await?;
        if let Some(attempt) = attempt.filter(|a| *a != job.attempt) {
            return Err(JobError::StaleAttempt {
                id,
                attempt,
                current: job.attempt,
            });
        }
        if !job.state.can_transition_to(target, Actor::Producer) {
            return Err(JobError::InvalidTransition {
                id,
                state: job.state,
                target,
            });
        }

        let from = job.state;
        let now = Utc::now();
        job.apply(target, now);
        self.append_locked(
            &mut job,
            kind,
            payload,
            now,
            Some((from, Actor::Producer, reason)),
        )
        .await?;

        info!(job_id = %id, from = %from, to = %target, "Job finished");

        drop(guard);
        drop(lock);
        self.prune_lock(id);
        Ok(job)
    }

    /// Re-check one sweep candidate under its lock. Returns whether it crashed.
    async fn mark_crashed(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<bool, JobError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self.load(id).await?;
        if job.state != JobState::Running || job.last_activity_at >= cutoff {
            return Ok(false);
        }

        let last_activity = job.last_activity_at;
        let now = Utc::now();
        job.apply(JobState::Crashed, now);
        let payload = json!({
            "last_activity_at": last_activity,
            "attempt": job.attempt,
            "threshold_secs": self.config.crash_threshold.as_secs(),
        });
        self.append_locked(
            &mut job,
            EventKind::Crashed,
            payload,
            now,
            Some((
                JobState::Running,
                Actor::System,
                Some("no activity within crash threshold".to_string()),
            )),
        )
        .await?;

        warn!(job_id = %id, attempt = job.attempt, last_activity = %last_activity, "Job marked crashed");
        Ok(true)
    }
}

fn audit_record(
    job: &Job,
    from: JobState,
    actor: Actor,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> StateTransition {
    StateTransition {
        job_id: job.id,
        from,
        to: job.state,
        actor,
        reason,
        at,
    }
}

/// Owner ids become broker subjects and room names.
fn validate_owner_id(owner_id: &str) -> Result<(), JobError> {
    let reason = if owner_id.is_empty() {
        Some("must not be empty")
    } else if owner_id.len() > MAX_OWNER_ID_LEN {
        Some("is too long")
    } else if !owner_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@'))
    {
        Some("may only contain ASCII letters, digits, '-', '_' and '@'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(JobError::InvalidOwner {
            owner_id: owner_id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

const MAX_OWNER_ID_LEN: usize = 128;
