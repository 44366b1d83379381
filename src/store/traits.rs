//! Store traits: the job table and the append-only event log.
//!
//! The job manager is the only writer of both. The gateway reads through
//! the same traits and never mutates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::event::{Event, EventKind};
use crate::jobs::model::{Checkpoint, Job, JobState, StateTransition};

/// Job, checkpoint and transition persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Overwrite the mutable columns of a job row.
    async fn update_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// List jobs for an owner, newest first.
    async fn list_jobs_for_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs in `state` whose last activity is strictly before `before`.
    async fn list_inactive_jobs(
        &self,
        state: JobState,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Append an audit record of a state change.
    async fn record_transition(&self, transition: &StateTransition) -> Result<(), DatabaseError>;

    /// All recorded transitions for a job, oldest first.
    async fn list_transitions(&self, job_id: Uuid) -> Result<Vec<StateTransition>, DatabaseError>;

    /// Store a checkpoint taken at `checkpoint.sequence`, replacing any
    /// earlier checkpoint at the same sequence.
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError>;
}

/// Append-only, per-job ordered event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, stamping the next gapless sequence for the job.
    async fn append_event(
        &self,
        job_id: Uuid,
        kind: EventKind,
        payload: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Event, DatabaseError>;

    /// Events with sequence greater than `after_sequence`, ascending, at most `limit`.
    async fn read_events(
        &self,
        job_id: Uuid,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Event>, DatabaseError>;

    /// Highest persisted sequence for the job, 0 when it has no events.
    async fn last_sequence(&self, job_id: Uuid) -> Result<u64, DatabaseError>;

    /// The checkpoint with the highest sequence, if any.
    async fn latest_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, DatabaseError>;
}

/// An event to append as part of a [`JobWrite`].
#[derive(Debug, Clone, Copy)]
pub struct NewEvent<'a> {
    pub kind: EventKind,
    pub payload: &'a serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Every row touched by one job mutation. Applied all-or-nothing.
#[derive(Debug, Clone, Copy)]
pub struct JobWrite<'a> {
    pub job: &'a Job,
    pub event: Option<NewEvent<'a>>,
    pub checkpoint: Option<&'a Checkpoint>,
    pub transition: Option<&'a StateTransition>,
}

impl<'a> JobWrite<'a> {
    pub fn new(job: &'a Job) -> Self {
        Self {
            job,
            event: None,
            checkpoint: None,
            transition: None,
        }
    }

    pub fn event(mut self, event: NewEvent<'a>) -> Self {
        self.event = Some(event);
        self
    }

    pub fn checkpoint(mut self, checkpoint: &'a Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn transition(mut self, transition: &'a StateTransition) -> Self {
        self.transition = Some(transition);
        self
    }
}

/// Everything a single backend provides.
#[async_trait]
pub trait Database: JobStore + EventStore {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Persist one job mutation in a single transaction: the event (if
    /// any), the job row, the checkpoint and the transition record.
    /// Returns the appended event.
    async fn commit(&self, write: JobWrite<'_>) -> Result<Option<Event>, DatabaseError>;
}
